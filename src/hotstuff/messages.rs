/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for structured messages that are sent between replicas, and from replicas to clients,
//! as part of the [HotStuff](crate::hotstuff::implementation::HotStuff) protocol.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    certificates::QuorumCertificate,
    crypto_primitives::Keypair,
    data_types::{NodeId, Operation, ReplicaId, SignatureBytes, Timestamp, ViewNumber},
    node::LogNode,
};

/// Whether a [`VoteMessage`] travels from a leader to the replicas, or from a replica to the next
/// leader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum MsgKind {
    /// Leader → replicas. Carries the proposed node.
    Proposal,

    /// Replica → next leader. Carries either the node voted for, or (after a view timeout) only the
    /// sender's generic QC.
    Vote,
}

/// The single message type exchanged between replicas.
///
/// Depending on [`kind`](Self::kind) and on which of `node`/`carried_qc` is present, a `VoteMessage`
/// is one of:
/// 1. A **proposal**: `kind == Proposal`, `node` is the proposed node.
/// 2. A **vote**: `kind == Vote`, `node` is the node voted for.
/// 3. A **new-view message**: `kind == Vote`, `node` is absent and `carried_qc` holds the sender's
///    generic QC at the time its view timed out.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct VoteMessage {
    pub sender: ReplicaId,
    pub view: ViewNumber,
    pub kind: MsgKind,
    pub node: Option<LogNode>,
    pub carried_qc: Option<QuorumCertificate>,
    pub signature: Option<SignatureBytes>,
}

impl VoteMessage {
    pub fn proposal(sender: ReplicaId, view: ViewNumber, node: LogNode) -> VoteMessage {
        VoteMessage {
            sender,
            view,
            kind: MsgKind::Proposal,
            node: Some(node),
            carried_qc: None,
            signature: None,
        }
    }

    pub fn vote(sender: ReplicaId, view: ViewNumber, node: LogNode) -> VoteMessage {
        VoteMessage {
            sender,
            view,
            kind: MsgKind::Vote,
            node: Some(node),
            carried_qc: None,
            signature: None,
        }
    }

    pub fn new_view(sender: ReplicaId, view: ViewNumber, generic_qc: QuorumCertificate) -> VoteMessage {
        VoteMessage {
            sender,
            view,
            kind: MsgKind::Vote,
            node: None,
            carried_qc: Some(generic_qc),
            signature: None,
        }
    }

    pub fn is_vote(&self) -> bool {
        self.kind == MsgKind::Vote
    }

    /// The id of the node this message proposes or votes for, if any.
    pub fn node_id(&self) -> Option<NodeId> {
        self.node.as_ref().map(|node| node.id)
    }

    /// The bytes a signature on this message is computed over: the view, the id of the carried node
    /// (genesis id if none), and the carried QC (genesis QC if none).
    pub fn signing_bytes(&self) -> Vec<u8> {
        let carried_qc = self.carried_qc.unwrap_or_default();
        let mut bytes = Vec::with_capacity(8 + 32 + 8 + 32);
        bytes.extend_from_slice(&self.view.to_le_bytes());
        bytes.extend_from_slice(&self.node_id().unwrap_or(NodeId::genesis()).bytes());
        bytes.extend_from_slice(&carried_qc.view.to_le_bytes());
        bytes.extend_from_slice(&carried_qc.node_id.bytes());
        bytes
    }

    /// Attach a signature over [`signing_bytes`](Self::signing_bytes) made with `keypair`.
    pub(crate) fn signed(mut self, keypair: &Keypair) -> VoteMessage {
        self.signature = Some(keypair.sign(&self.signing_bytes()));
        self
    }
}

/// A replica's answer to a client once the client's request has been executed.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Reply {
    pub view: ViewNumber,
    pub timestamp: Timestamp,
    pub replica_id: ReplicaId,
    pub result: Operation,
}
