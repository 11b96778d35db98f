/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the client request and the log node, and their associated methods.

use borsh::{BorshDeserialize, BorshSerialize};

use super::{
    certificates::QuorumCertificate,
    data_types::{ClientId, NodeId, Operation, Timestamp, ViewNumber},
};

/// Operation carried by the no-op requests a leader synthesizes when no client traffic arrives.
pub const NOOP_OPERATION: &str = "noop";

/// Operation carried by the placeholder nodes that fill view gaps in the parent chain.
pub const DUMMY_OPERATION: &str = "dummy";

/// A command submitted by a client, or synthesized by a leader.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ClientRequest {
    pub operation: Operation,
    pub timestamp: Timestamp,
    pub client_id: ClientId,
}

impl ClientRequest {
    pub fn new(operation: impl Into<Operation>, timestamp: Timestamp, client_id: ClientId) -> Self {
        Self {
            operation: operation.into(),
            timestamp,
            client_id,
        }
    }

    /// The request a leader proposes to keep the chain moving when it has nothing else to propose.
    pub fn noop() -> Self {
        Self::new(NOOP_OPERATION, Timestamp::synthetic(), ClientId::default())
    }

    /// The request carried by placeholder nodes.
    pub fn dummy() -> Self {
        Self::new(DUMMY_OPERATION, Timestamp::synthetic(), ClientId::default())
    }

    /// Whether a reply is owed to a client once this request is executed.
    pub fn expects_reply(&self) -> bool {
        !self.timestamp.is_synthetic()
    }
}

/// An entry of the replicated log.
///
/// Log nodes form a tree through their `parent` links, rooted implicitly at the genesis QC. The
/// `justify` QC certifies an earlier node and is what the commit rule follows.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct LogNode {
    pub id: NodeId,
    pub parent: NodeId,
    pub view: ViewNumber,
    pub request: ClientRequest,
    pub justify: QuorumCertificate,
}

impl LogNode {
    /// Create a node proposed in `view`. Its id is [derived](NodeId::derive) from `view` and the
    /// request's operation.
    pub fn new(
        view: ViewNumber,
        parent: NodeId,
        request: ClientRequest,
        justify: QuorumCertificate,
    ) -> LogNode {
        LogNode {
            id: NodeId::derive(view, &request.operation),
            parent,
            view,
            request,
            justify,
        }
    }

    /// Create a placeholder node for a view in which nothing was certified.
    pub fn placeholder(view: ViewNumber, parent: NodeId) -> LogNode {
        LogNode::new(view, parent, ClientRequest::dummy(), QuorumCertificate::genesis_qc())
    }

    /// Checks that `id` is consistent with `view` and the request's operation.
    pub fn is_well_formed(&self) -> bool {
        self.id == NodeId::derive(self.view, &self.request.operation)
    }
}
