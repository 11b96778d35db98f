/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the events that replicas and clients emit, for event handling and logging.
//!
//! An event for a given action indicates that the action has been completed.
//!
//! Handlers for these events can be registered on the [`ReplicaSpec`](crate::replica::ReplicaSpec)
//! and [`ClientSpec`](crate::client::ClientSpec) builders. They run on a dedicated
//! [event bus](crate::event_bus) thread, never on the thread that emitted the event.

use std::{
    sync::mpsc::Sender,
    time::{Duration, SystemTime},
};

use crate::{
    client::AcceptedResult,
    hotstuff::messages::{Reply, VoteMessage},
    networking::messages::Peer,
    types::{
        certificates::QuorumCertificate,
        data_types::{NodeId, ReplicaId, ViewNumber},
        node::{ClientRequest, LogNode},
    },
};

/// Enumerates all events.
pub enum Event {
    // Events that change a replica's state.
    InsertNode(InsertNodeEvent),
    ExecuteRequest(ExecuteRequestEvent),
    UpdateGenericQC(UpdateGenericQCEvent),
    UpdateLockedQC(UpdateLockedQCEvent),

    // Events that involve sending a replica message.
    Propose(ProposeEvent),
    Vote(VoteEvent),
    NewView(NewViewEvent),

    // Events that involve receiving a message.
    ReceiveRequest(ReceiveRequestEvent),
    ReceiveProposal(ReceiveProposalEvent),
    ReceiveVote(ReceiveVoteEvent),

    // View controller events.
    StartView(StartViewEvent),
    ViewTimeout(ViewTimeoutEvent),
    CollectQC(CollectQCEvent),

    // Client events.
    SubmitRequest(SubmitRequestEvent),
    ReceiveReply(ReceiveReplyEvent),
    AcceptResult(AcceptResultEvent),
}

impl Event {
    /// Send the event to the event bus, if there is one. A closed bus is ignored.
    pub(crate) fn publish(self, event_publisher: &Option<Sender<Event>>) {
        if let Some(event_publisher) = event_publisher {
            let _ = event_publisher.send(self);
        }
    }
}

/// A node was inserted into the replica's node tree: a node it created as leader (including
/// placeholders), a node it received in a proposal, or a node it certified.
pub struct InsertNodeEvent {
    pub timestamp: SystemTime,
    pub node: LogNode,
}

/// The request in a committed node was executed.
pub struct ExecuteRequestEvent {
    pub timestamp: SystemTime,
    pub node: NodeId,
    pub view: ViewNumber,
    pub request: ClientRequest,
}

pub struct UpdateGenericQCEvent {
    pub timestamp: SystemTime,
    pub generic_qc: QuorumCertificate,
}

pub struct UpdateLockedQCEvent {
    pub timestamp: SystemTime,
    pub locked_qc: QuorumCertificate,
}

pub struct ProposeEvent {
    pub timestamp: SystemTime,
    pub proposal: VoteMessage,
}

pub struct VoteEvent {
    pub timestamp: SystemTime,
    pub vote: VoteMessage,
}

/// The replica's view timed out and it sent a new-view message to the next leader.
pub struct NewViewEvent {
    pub timestamp: SystemTime,
    pub new_view: VoteMessage,
}

pub struct ReceiveRequestEvent {
    pub timestamp: SystemTime,
    pub origin: Peer,
    pub request: ClientRequest,
}

pub struct ReceiveProposalEvent {
    pub timestamp: SystemTime,
    pub origin: ReplicaId,
    pub proposal: VoteMessage,
}

/// The next leader accepted a vote or new-view message into its vote collector.
pub struct ReceiveVoteEvent {
    pub timestamp: SystemTime,
    pub origin: ReplicaId,
    pub vote: VoteMessage,
}

pub struct StartViewEvent {
    pub timestamp: SystemTime,
    pub leader: ReplicaId,
    pub view: ViewNumber,
}

pub struct ViewTimeoutEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub timeout: Duration,
}

pub struct CollectQCEvent {
    pub timestamp: SystemTime,
    pub quorum_certificate: QuorumCertificate,
}

pub struct SubmitRequestEvent {
    pub timestamp: SystemTime,
    pub request: ClientRequest,
}

pub struct ReceiveReplyEvent {
    pub timestamp: SystemTime,
    pub origin: Peer,
    pub reply: Reply,
}

pub struct AcceptResultEvent {
    pub timestamp: SystemTime,
    pub accepted: AcceptedResult,
}
