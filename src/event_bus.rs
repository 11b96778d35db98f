/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The event bus thread, which receives [events](crate::events) from replica and client threads and
//! invokes the handlers registered for them.
//!
//! Handlers come from two sources:
//! 1. The default [loggers](crate::logging), registered when `log_events` is set in the
//!    configuration.
//! 2. User handlers, registered through the `on_*` setters of
//!    [`ReplicaSpec`](crate::replica::ReplicaSpec) and [`ClientSpec`](crate::client::ClientSpec).

use std::{
    sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError},
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{events::*, logging::Logger};

/// Pointer to a handler closure, parametrised by the argument (for our use-case, the event type).
pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

// How long the event bus blocks waiting for an event before checking for a shutdown signal again.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Stores the handlers to be invoked for each event type, in the order they were registered.
#[derive(Default)]
pub(crate) struct EventHandlers {
    pub(crate) insert_node_handlers: Vec<HandlerPtr<InsertNodeEvent>>,
    pub(crate) execute_request_handlers: Vec<HandlerPtr<ExecuteRequestEvent>>,
    pub(crate) update_generic_qc_handlers: Vec<HandlerPtr<UpdateGenericQCEvent>>,
    pub(crate) update_locked_qc_handlers: Vec<HandlerPtr<UpdateLockedQCEvent>>,

    pub(crate) propose_handlers: Vec<HandlerPtr<ProposeEvent>>,
    pub(crate) vote_handlers: Vec<HandlerPtr<VoteEvent>>,
    pub(crate) new_view_handlers: Vec<HandlerPtr<NewViewEvent>>,

    pub(crate) receive_request_handlers: Vec<HandlerPtr<ReceiveRequestEvent>>,
    pub(crate) receive_proposal_handlers: Vec<HandlerPtr<ReceiveProposalEvent>>,
    pub(crate) receive_vote_handlers: Vec<HandlerPtr<ReceiveVoteEvent>>,

    pub(crate) start_view_handlers: Vec<HandlerPtr<StartViewEvent>>,
    pub(crate) view_timeout_handlers: Vec<HandlerPtr<ViewTimeoutEvent>>,
    pub(crate) collect_qc_handlers: Vec<HandlerPtr<CollectQCEvent>>,

    pub(crate) submit_request_handlers: Vec<HandlerPtr<SubmitRequestEvent>>,
    pub(crate) receive_reply_handlers: Vec<HandlerPtr<ReceiveReplyEvent>>,
    pub(crate) accept_result_handlers: Vec<HandlerPtr<AcceptResultEvent>>,
}

/// Registers the default logger for an event type if logging is enabled, then the user-defined
/// handler if there is one.
fn handlers<T: Logger>(log_events: bool, user_handler: Option<HandlerPtr<T>>) -> Vec<HandlerPtr<T>> {
    let mut handlers = Vec::new();
    if log_events {
        handlers.push(T::get_logger());
    }
    handlers.extend(user_handler);
    handlers
}

impl EventHandlers {
    /// Create the handler set of a replica.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        log_events: bool,
        insert_node_handler: Option<HandlerPtr<InsertNodeEvent>>,
        execute_request_handler: Option<HandlerPtr<ExecuteRequestEvent>>,
        update_generic_qc_handler: Option<HandlerPtr<UpdateGenericQCEvent>>,
        update_locked_qc_handler: Option<HandlerPtr<UpdateLockedQCEvent>>,
        propose_handler: Option<HandlerPtr<ProposeEvent>>,
        vote_handler: Option<HandlerPtr<VoteEvent>>,
        new_view_handler: Option<HandlerPtr<NewViewEvent>>,
        receive_request_handler: Option<HandlerPtr<ReceiveRequestEvent>>,
        receive_proposal_handler: Option<HandlerPtr<ReceiveProposalEvent>>,
        receive_vote_handler: Option<HandlerPtr<ReceiveVoteEvent>>,
        start_view_handler: Option<HandlerPtr<StartViewEvent>>,
        view_timeout_handler: Option<HandlerPtr<ViewTimeoutEvent>>,
        collect_qc_handler: Option<HandlerPtr<CollectQCEvent>>,
    ) -> EventHandlers {
        EventHandlers {
            insert_node_handlers: handlers(log_events, insert_node_handler),
            execute_request_handlers: handlers(log_events, execute_request_handler),
            update_generic_qc_handlers: handlers(log_events, update_generic_qc_handler),
            update_locked_qc_handlers: handlers(log_events, update_locked_qc_handler),
            propose_handlers: handlers(log_events, propose_handler),
            vote_handlers: handlers(log_events, vote_handler),
            new_view_handlers: handlers(log_events, new_view_handler),
            receive_request_handlers: handlers(log_events, receive_request_handler),
            receive_proposal_handlers: handlers(log_events, receive_proposal_handler),
            receive_vote_handlers: handlers(log_events, receive_vote_handler),
            start_view_handlers: handlers(log_events, start_view_handler),
            view_timeout_handlers: handlers(log_events, view_timeout_handler),
            collect_qc_handlers: handlers(log_events, collect_qc_handler),
            ..Default::default()
        }
    }

    /// Create the handler set of a client.
    pub(crate) fn for_client(
        log_events: bool,
        submit_request_handler: Option<HandlerPtr<SubmitRequestEvent>>,
        receive_reply_handler: Option<HandlerPtr<ReceiveReplyEvent>>,
        accept_result_handler: Option<HandlerPtr<AcceptResultEvent>>,
    ) -> EventHandlers {
        EventHandlers {
            submit_request_handlers: handlers(log_events, submit_request_handler),
            receive_reply_handlers: handlers(log_events, receive_reply_handler),
            accept_result_handlers: handlers(log_events, accept_result_handler),
            ..Default::default()
        }
    }

    /// Whether no handler at all is registered, in which case no event bus needs to be started.
    pub(crate) fn is_empty(&self) -> bool {
        self.insert_node_handlers.is_empty()
            && self.execute_request_handlers.is_empty()
            && self.update_generic_qc_handlers.is_empty()
            && self.update_locked_qc_handlers.is_empty()
            && self.propose_handlers.is_empty()
            && self.vote_handlers.is_empty()
            && self.new_view_handlers.is_empty()
            && self.receive_request_handlers.is_empty()
            && self.receive_proposal_handlers.is_empty()
            && self.receive_vote_handlers.is_empty()
            && self.start_view_handlers.is_empty()
            && self.view_timeout_handlers.is_empty()
            && self.collect_qc_handlers.is_empty()
            && self.submit_request_handlers.is_empty()
            && self.receive_reply_handlers.is_empty()
            && self.accept_result_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::InsertNode(insert_node_event) => self
                .insert_node_handlers
                .iter()
                .for_each(|handler| handler(&insert_node_event)),

            Event::ExecuteRequest(execute_request_event) => self
                .execute_request_handlers
                .iter()
                .for_each(|handler| handler(&execute_request_event)),

            Event::UpdateGenericQC(update_generic_qc_event) => self
                .update_generic_qc_handlers
                .iter()
                .for_each(|handler| handler(&update_generic_qc_event)),

            Event::UpdateLockedQC(update_locked_qc_event) => self
                .update_locked_qc_handlers
                .iter()
                .for_each(|handler| handler(&update_locked_qc_event)),

            Event::Propose(propose_event) => self
                .propose_handlers
                .iter()
                .for_each(|handler| handler(&propose_event)),

            Event::Vote(vote_event) => self
                .vote_handlers
                .iter()
                .for_each(|handler| handler(&vote_event)),

            Event::NewView(new_view_event) => self
                .new_view_handlers
                .iter()
                .for_each(|handler| handler(&new_view_event)),

            Event::ReceiveRequest(receive_request_event) => self
                .receive_request_handlers
                .iter()
                .for_each(|handler| handler(&receive_request_event)),

            Event::ReceiveProposal(receive_proposal_event) => self
                .receive_proposal_handlers
                .iter()
                .for_each(|handler| handler(&receive_proposal_event)),

            Event::ReceiveVote(receive_vote_event) => self
                .receive_vote_handlers
                .iter()
                .for_each(|handler| handler(&receive_vote_event)),

            Event::StartView(start_view_event) => self
                .start_view_handlers
                .iter()
                .for_each(|handler| handler(&start_view_event)),

            Event::ViewTimeout(view_timeout_event) => self
                .view_timeout_handlers
                .iter()
                .for_each(|handler| handler(&view_timeout_event)),

            Event::CollectQC(collect_qc_event) => self
                .collect_qc_handlers
                .iter()
                .for_each(|handler| handler(&collect_qc_event)),

            Event::SubmitRequest(submit_request_event) => self
                .submit_request_handlers
                .iter()
                .for_each(|handler| handler(&submit_request_event)),

            Event::ReceiveReply(receive_reply_event) => self
                .receive_reply_handlers
                .iter()
                .for_each(|handler| handler(&receive_reply_event)),

            Event::AcceptResult(accept_result_event) => self
                .accept_result_handlers
                .iter()
                .for_each(|handler| handler(&accept_result_event)),
        }
    }
}

/// Start the event bus thread, which polls `event_subscriber` for events and fires the matching
/// handlers until it is signalled to shut down, or every event publisher is gone.
pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                log::error!("Event bus thread disconnected from main thread");
                return;
            }
        }

        match event_subscriber.recv_timeout(POLL_INTERVAL) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{mpsc, Arc, Mutex},
        time::SystemTime,
    };

    use super::*;
    use crate::types::data_types::{ReplicaId, ViewNumber};

    fn start_view(view: u64) -> Event {
        Event::StartView(StartViewEvent {
            timestamp: SystemTime::now(),
            leader: ReplicaId::new(0),
            view: ViewNumber::new(view),
        })
    }

    #[test]
    fn handlers_without_logging_or_user_handlers_are_empty() {
        let handlers = EventHandlers::new(
            false, None, None, None, None, None, None, None, None, None, None, None, None, None,
        );
        assert!(handlers.is_empty());
        assert!(!EventHandlers::for_client(true, None, None, None).is_empty());
    }

    #[test]
    fn event_bus_fires_user_handlers_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_handler = seen.clone();
        let handler: HandlerPtr<StartViewEvent> = Box::new(move |event: &StartViewEvent| {
            seen_by_handler.lock().unwrap().push(event.view)
        });
        let handlers = EventHandlers::new(
            false,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            Some(handler),
            None,
            None,
        );

        let (publisher, subscriber) = mpsc::channel();
        let (shutdown, shutdown_receiver) = mpsc::channel();
        let event_bus = start_event_bus(handlers, subscriber, shutdown_receiver);

        start_view(1).publish(&Some(publisher.clone()));
        start_view(2).publish(&Some(publisher.clone()));
        drop(publisher);
        event_bus.join().unwrap();
        drop(shutdown);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![ViewNumber::new(1), ViewNumber::new(2)]
        );
    }
}
