/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the replica's
//! [config](crate::replica::Configuration) or the client's
//! [config](crate::client::ClientConfiguration).
//!
//! This crate logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [ReceiveProposal](crate::events::ReceiveProposalEvent) is printed:
//!
//! ```text
//! ReceiveProposal, 1701329264, 2, 5, Id5u7f6, op-A
//! ```
//!
//! In the snippet:
//! - The third value is the id of the replica that sent the proposal.
//! - The fourth value is the view the proposal was made in.
//! - The fifth value is the first seven characters of the Base64 encoding of the proposed node's id.
//! - The sixth value is the operation in the proposed node.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::{
    events::*,
    hotstuff::messages::VoteMessage,
    types::{certificates::QuorumCertificate, data_types::NodeId},
};

// Names of each event in PascalCase for printing:
pub const INSERT_NODE: &str = "InsertNode";
pub const EXECUTE_REQUEST: &str = "ExecuteRequest";
pub const UPDATE_GENERIC_QC: &str = "UpdateGenericQC";
pub const UPDATE_LOCKED_QC: &str = "UpdateLockedQC";

pub const PROPOSE: &str = "Propose";
pub const VOTE: &str = "Vote";
pub const NEW_VIEW: &str = "NewView";

pub const RECEIVE_REQUEST: &str = "ReceiveRequest";
pub const RECEIVE_PROPOSAL: &str = "ReceiveProposal";
pub const RECEIVE_VOTE: &str = "ReceiveVote";

pub const START_VIEW: &str = "StartView";
pub const VIEW_TIMEOUT: &str = "ViewTimeout";
pub const COLLECT_QC: &str = "CollectQC";

pub const SUBMIT_REQUEST: &str = "SubmitRequest";
pub const RECEIVE_REPLY: &str = "ReceiveReply";
pub const ACCEPT_RESULT: &str = "AcceptResult";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for InsertNodeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |insert_node_event: &InsertNodeEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                INSERT_NODE,
                secs_since_unix_epoch(insert_node_event.timestamp),
                node_id_info(&insert_node_event.node.id),
                insert_node_event.node.view,
                insert_node_event.node.request.operation
            )
        };
        Box::new(logger)
    }
}

impl Logger for ExecuteRequestEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |execute_request_event: &ExecuteRequestEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}, {}",
                EXECUTE_REQUEST,
                secs_since_unix_epoch(execute_request_event.timestamp),
                node_id_info(&execute_request_event.node),
                execute_request_event.view,
                execute_request_event.request.client_id,
                execute_request_event.request.timestamp,
                execute_request_event.request.operation
            )
        };
        Box::new(logger)
    }
}

impl Logger for UpdateGenericQCEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |update_generic_qc_event: &UpdateGenericQCEvent| {
            log::info!(
                "{}, {}, {}",
                UPDATE_GENERIC_QC,
                secs_since_unix_epoch(update_generic_qc_event.timestamp),
                qc_info(&update_generic_qc_event.generic_qc)
            )
        };
        Box::new(logger)
    }
}

impl Logger for UpdateLockedQCEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |update_locked_qc_event: &UpdateLockedQCEvent| {
            log::info!(
                "{}, {}, {}",
                UPDATE_LOCKED_QC,
                secs_since_unix_epoch(update_locked_qc_event.timestamp),
                qc_info(&update_locked_qc_event.locked_qc)
            )
        };
        Box::new(logger)
    }
}

impl Logger for ProposeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |propose_event: &ProposeEvent| {
            log::info!(
                "{}, {}, {}",
                PROPOSE,
                secs_since_unix_epoch(propose_event.timestamp),
                vote_message_info(&propose_event.proposal)
            )
        };
        Box::new(logger)
    }
}

impl Logger for VoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |vote_event: &VoteEvent| {
            log::info!(
                "{}, {}, {}",
                VOTE,
                secs_since_unix_epoch(vote_event.timestamp),
                vote_message_info(&vote_event.vote)
            )
        };
        Box::new(logger)
    }
}

impl Logger for NewViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |new_view_event: &NewViewEvent| {
            log::info!(
                "{}, {}, {}, {}",
                NEW_VIEW,
                secs_since_unix_epoch(new_view_event.timestamp),
                new_view_event.new_view.view,
                qc_info(&new_view_event.new_view.carried_qc.unwrap_or_default())
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveRequestEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_request_event: &ReceiveRequestEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_REQUEST,
                secs_since_unix_epoch(receive_request_event.timestamp),
                receive_request_event.origin,
                receive_request_event.request.timestamp,
                receive_request_event.request.operation
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveProposalEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_proposal_event: &ReceiveProposalEvent| {
            log::info!(
                "{}, {}, {}, {}",
                RECEIVE_PROPOSAL,
                secs_since_unix_epoch(receive_proposal_event.timestamp),
                receive_proposal_event.origin,
                vote_message_info(&receive_proposal_event.proposal)
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveVoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_vote_event: &ReceiveVoteEvent| {
            log::info!(
                "{}, {}, {}, {}",
                RECEIVE_VOTE,
                secs_since_unix_epoch(receive_vote_event.timestamp),
                receive_vote_event.origin,
                vote_message_info(&receive_vote_event.vote)
            )
        };
        Box::new(logger)
    }
}

impl Logger for StartViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |start_view_event: &StartViewEvent| {
            log::info!(
                "{}, {}, {}, {}",
                START_VIEW,
                secs_since_unix_epoch(start_view_event.timestamp),
                start_view_event.view,
                start_view_event.leader
            )
        };
        Box::new(logger)
    }
}

impl Logger for ViewTimeoutEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |view_timeout_event: &ViewTimeoutEvent| {
            log::info!(
                "{}, {}, {}, {}",
                VIEW_TIMEOUT,
                secs_since_unix_epoch(view_timeout_event.timestamp),
                view_timeout_event.view,
                view_timeout_event.timeout.as_millis()
            )
        };
        Box::new(logger)
    }
}

impl Logger for CollectQCEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |collect_qc_event: &CollectQCEvent| {
            log::info!(
                "{}, {}, {}",
                COLLECT_QC,
                secs_since_unix_epoch(collect_qc_event.timestamp),
                qc_info(&collect_qc_event.quorum_certificate)
            )
        };
        Box::new(logger)
    }
}

impl Logger for SubmitRequestEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |submit_request_event: &SubmitRequestEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                SUBMIT_REQUEST,
                secs_since_unix_epoch(submit_request_event.timestamp),
                submit_request_event.request.client_id,
                submit_request_event.request.timestamp,
                submit_request_event.request.operation
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveReplyEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_reply_event: &ReceiveReplyEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECEIVE_REPLY,
                secs_since_unix_epoch(receive_reply_event.timestamp),
                receive_reply_event.origin,
                receive_reply_event.reply.view,
                receive_reply_event.reply.timestamp,
                receive_reply_event.reply.result
            )
        };
        Box::new(logger)
    }
}

impl Logger for AcceptResultEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |accept_result_event: &AcceptResultEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                ACCEPT_RESULT,
                secs_since_unix_epoch(accept_result_event.timestamp),
                accept_result_event.accepted.timestamp,
                accept_result_event.accepted.operation,
                accept_result_event.accepted.result
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn node_id_info(node_id: &NodeId) -> String {
    first_seven_base64_chars(&node_id.bytes())
}

fn qc_info(qc: &QuorumCertificate) -> String {
    format!("{}, {}", qc.view, node_id_info(&qc.node_id))
}

fn vote_message_info(msg: &VoteMessage) -> String {
    match &msg.node {
        Some(node) => format!(
            "{}, {}, {}",
            msg.view,
            node_id_info(&node.id),
            node.request.operation
        ),
        None => format!("{}, -, -", msg.view),
    }
}

// Events are always emitted after the Unix Epoch. A clock set before it is logged as 0.
fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}
