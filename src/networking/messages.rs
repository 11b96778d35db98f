/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Exhaustive enumerations of every peer and every message variant that travels over the [`Network`].
//!
//! [`Network`]: super::network::Network

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    hotstuff::messages::{Reply, VoteMessage},
    types::{
        data_types::{ClientId, ReplicaId},
        node::ClientRequest,
    },
};

/// Address of a participant: either a replica or a client, each identified by its ordinal index in
/// the static replica or client list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub enum Peer {
    Replica(ReplicaId),
    Client(ClientId),
}

impl Display for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Replica(id) => write!(f, "replica-{}", id),
            Peer::Client(id) => write!(f, "client-{}", id),
        }
    }
}

/// All message variants.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Message {
    /// Client → replicas.
    Request(ClientRequest),

    /// Replica → replica. Proposals, votes, and new-view messages.
    Msg(VoteMessage),

    /// Replica → client.
    Reply(Reply),
}

impl Message {
    /// Name of the remote procedure this message invokes on its recipient.
    pub fn method(&self) -> &'static str {
        match self {
            Message::Request(_) => "HotStuff.Request",
            Message::Msg(_) => "HotStuff.Msg",
            Message::Reply(_) => "Client.Reply",
        }
    }
}

impl From<ClientRequest> for Message {
    fn from(value: ClientRequest) -> Self {
        Message::Request(value)
    }
}

impl From<VoteMessage> for Message {
    fn from(value: VoteMessage) -> Self {
        Message::Msg(value)
    }
}

impl From<Reply> for Message {
    fn from(value: Reply) -> Self {
        Message::Reply(value)
    }
}
