/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Fault injection for protocol testing.
//!
//! [`FaultyNetwork`] wraps any [`Network`] and, depending on the [`FaultMode`] currently stored in its
//! [`FaultSwitch`], passes outbound messages through untouched, drops them, or rewrites them before
//! they reach the wrapped network:
//! - Proposals and votes have their node replaced by a well-formed node for the operation
//!   [`FAKE_OPERATION`], with a fabricated parent and justify. The fake node never expects a reply.
//! - New-view messages have their carried QC pointed at a fabricated node.
//! - Client replies have their result replaced by [`FAKE_OPERATION`].
//!
//! Only what *other* parties observe is affected. Messages a replica addresses to itself, and
//! everything it receives, pass through untouched, so its own state stays honest.

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, PoisonError},
};

use rand::seq::SliceRandom;

use crate::{
    hotstuff::messages::{Reply, VoteMessage},
    types::{
        certificates::QuorumCertificate,
        data_types::{max_faulty, ClientId, NodeId, Operation, ReplicaId, Timestamp, ViewNumber},
        node::{ClientRequest, LogNode},
    },
};

use super::{
    messages::{Message, Peer},
    network::Network,
};

/// Operation carried by the nodes and replies a malicious replica fabricates.
pub const FAKE_OPERATION: &str = "fakeop";

/// How a [`FaultyNetwork`] treats outbound messages.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum FaultMode {
    /// Pass every message through.
    #[default]
    Normal,

    /// Drop every outbound message.
    Crashed,

    /// Rewrite every outbound message addressed to someone else.
    Malicious,

    /// Rewrite outbound messages addressed to `victims` only, pass everything else through.
    PartialMalicious { victims: BTreeSet<Peer> },
}

impl FaultMode {
    /// Partial malice towards `max_faulty(num_replicas)` replicas picked at random among all replicas
    /// except `me`.
    pub fn partial_malicious_random(num_replicas: usize, me: ReplicaId) -> FaultMode {
        let candidates: Vec<Peer> = (0..num_replicas as u32)
            .map(ReplicaId::new)
            .filter(|id| *id != me)
            .map(Peer::Replica)
            .collect();
        let victims = candidates
            .choose_multiple(&mut rand::thread_rng(), max_faulty(num_replicas))
            .copied()
            .collect();
        FaultMode::PartialMalicious { victims }
    }

    fn rewrites_for(&self, peer: &Peer) -> bool {
        match self {
            FaultMode::Malicious => true,
            FaultMode::PartialMalicious { victims } => victims.contains(peer),
            FaultMode::Normal | FaultMode::Crashed => false,
        }
    }
}

/// Shared, switchable [`FaultMode`]. Clones refer to the same mode.
#[derive(Clone, Default)]
pub struct FaultSwitch(Arc<Mutex<FaultMode>>);

impl FaultSwitch {
    pub fn new(mode: FaultMode) -> Self {
        Self(Arc::new(Mutex::new(mode)))
    }

    pub fn set(&self, mode: FaultMode) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = mode;
    }

    pub fn mode(&self) -> FaultMode {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// A [`Network`] decorator that injects the faults selected through a [`FaultSwitch`].
#[derive(Clone)]
pub struct FaultyNetwork<N: Network> {
    inner: N,
    me: Peer,
    switch: FaultSwitch,
}

impl<N: Network> FaultyNetwork<N> {
    pub fn new(inner: N, me: Peer, switch: FaultSwitch) -> Self {
        Self { inner, me, switch }
    }

    pub fn switch(&self) -> &FaultSwitch {
        &self.switch
    }
}

impl<N: Network> Network for FaultyNetwork<N> {
    fn send(&mut self, peer: Peer, message: Message) {
        if peer == self.me {
            return self.inner.send(peer, message);
        }

        let mode = self.switch.mode();
        if mode == FaultMode::Crashed {
            return;
        }
        if mode.rewrites_for(&peer) {
            self.inner.send(peer, corrupt(message))
        } else {
            self.inner.send(peer, message)
        }
    }

    fn recv(&mut self) -> Option<(Peer, Message)> {
        self.inner.recv()
    }
}

/// Fabricate the message a malicious replica sends in place of `message`.
fn corrupt(message: Message) -> Message {
    match message {
        Message::Msg(vote_message) => Message::Msg(corrupt_vote_message(vote_message)),
        Message::Reply(reply) => Message::Reply(Reply {
            result: Operation::from(FAKE_OPERATION),
            ..reply
        }),
        request @ Message::Request(_) => request,
    }
}

fn corrupt_vote_message(mut vote_message: VoteMessage) -> VoteMessage {
    vote_message.node = vote_message.node.map(|node| fake_node(&node));
    vote_message.carried_qc = vote_message
        .carried_qc
        .map(|qc| QuorumCertificate::new(qc.view, fake_node_id(qc.view)));
    vote_message
}

/// A well-formed node in `node.view` that forks off a fabricated parent.
fn fake_node(node: &LogNode) -> LogNode {
    let parent_view = ViewNumber::new(node.view.int().saturating_sub(1));
    let parent = fake_node_id(parent_view);
    LogNode::new(
        node.view,
        parent,
        ClientRequest::new(FAKE_OPERATION, Timestamp::synthetic(), ClientId::default()),
        QuorumCertificate::new(node.justify.view, parent),
    )
}

fn fake_node_id(view: ViewNumber) -> NodeId {
    NodeId::derive(view, &Operation::from(FAKE_OPERATION))
}
