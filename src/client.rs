/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build and run a client that submits requests to the replica set and accepts results by
//! quorum.
//!
//! A client broadcasts each request to every replica, then waits for replies. Any single replica may
//! be faulty and reply with anything, so a result is only accepted once strictly more than `f`
//! replicas reported the same result for the same request. Accepted results are delivered once, in
//! acceptance order, through [`Client::results`].
//!
//! ## Starting a client
//!
//! ```ignore
//! let client =
//!     ClientSpec::builder()
//!     .network(network)
//!     .configuration(
//!         ClientConfiguration::builder()
//!         .me(ClientId::new(0))
//!         .num_replicas(4)
//!         .log_events(true)
//!         .build()
//!     )
//!     .on_accept_result(accept_result_handler)
//!     .build()
//!     .start()?;
//!
//! let timestamp = client.submit("op-A");
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, SystemTime},
};

use typed_builder::TypedBuilder;

use crate::{
    algorithm::lock,
    event_bus::{start_event_bus, EventHandlers, HandlerPtr},
    events::{AcceptResultEvent, Event, ReceiveReplyEvent, SubmitRequestEvent},
    hotstuff::messages::Reply,
    networking::{
        messages::{Message, Peer},
        network::Network,
        receiving::start_polling,
        sending::SenderHandle,
    },
    replica::ConfigurationError,
    types::{
        data_types::{max_faulty, ClientId, Operation, ReplicaId, Timestamp},
        node::ClientRequest,
    },
};

/// A result the client accepted for one of its requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcceptedResult {
    pub timestamp: Timestamp,
    pub operation: Operation,
    pub result: Operation,
}

/// Collects replies per outstanding request, and decides when a result can be accepted.
pub(crate) struct ReplyAggregator {
    f: usize,
    outstanding: HashMap<Timestamp, OutstandingRequest>,
}

struct OutstandingRequest {
    operation: Operation,
    replies: BTreeMap<ReplicaId, Operation>,
}

impl ReplyAggregator {
    pub(crate) fn new(num_replicas: usize) -> Self {
        Self {
            f: max_faulty(num_replicas),
            outstanding: HashMap::new(),
        }
    }

    /// Start collecting replies for the request with `timestamp`.
    pub(crate) fn open(&mut self, timestamp: Timestamp, operation: Operation) {
        self.outstanding.insert(
            timestamp,
            OutstandingRequest {
                operation,
                replies: BTreeMap::new(),
            },
        );
    }

    /// Record `reply`. A later reply from the same replica replaces its earlier one.
    ///
    /// Returns `false` if no request with the reply's timestamp is outstanding, either because it was
    /// never submitted or because a result was already accepted for it.
    pub(crate) fn on_reply(&mut self, reply: &Reply) -> bool {
        match self.outstanding.get_mut(&reply.timestamp) {
            Some(request) => {
                request
                    .replies
                    .insert(reply.replica_id, reply.result.clone());
                true
            }
            None => false,
        }
    }

    /// Accept a result for the request with `timestamp` if strictly more than `f` replicas reported
    /// it, and stop collecting replies for the request.
    pub(crate) fn try_accept(&mut self, timestamp: Timestamp) -> Option<AcceptedResult> {
        let request = self.outstanding.get(&timestamp)?;
        if request.replies.len() <= self.f {
            return None;
        }

        let mut matching: HashMap<&Operation, usize> = HashMap::new();
        let mut accepted = None;
        for result in request.replies.values() {
            let count = matching.entry(result).or_default();
            *count += 1;
            if *count > self.f {
                accepted = Some(result.clone());
                break;
            }
        }

        let result = accepted?;
        let request = self.outstanding.remove(&timestamp)?;
        Some(AcceptedResult {
            timestamp,
            operation: request.operation,
            result,
        })
    }

    pub(crate) fn num_outstanding(&self) -> usize {
        self.outstanding.len()
    }
}

/// Stores the user-defined parameters required to start a client.
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [ClientConfiguration]. On the builder call the following methods to construct a valid [ClientConfiguration].

    Required:
    - `.me(...)`
    - `.num_replicas(...)`
    - `.log_events(...)`
"))]
pub struct ClientConfiguration {
    #[builder(setter(doc = "Set the client's index in the static client list. Required."))]
    pub me: ClientId,
    #[builder(setter(doc = "Set the number of replicas in the replica set. Required."))]
    pub num_replicas: usize,
    #[builder(setter(doc = "Enable logging? Required."))]
    pub log_events: bool,
}

/// Stores all necessary parameters and trait implementations required to run a [Client].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [ClientSpec]. On the builder call the following methods to construct a valid [ClientSpec].

    Required:
    - `.network(...)`
    - `.configuration(...)`

    Optional:
    - `.on_submit_request(...)`
    - `.on_receive_reply(...)`
    - `.on_accept_result(...)`
"))]
pub struct ClientSpec<N: Network + 'static> {
    // Required parameters
    #[builder(setter(doc = "Set the implementation of peer-to-peer networking. The argument must implement the [Network](crate::networking::network::Network) trait. Required."))]
    network: N,
    #[builder(setter(doc = "Set the [configuration](ClientConfiguration) of the client. Required."))]
    configuration: ClientConfiguration,
    // Optional parameters
    #[builder(default, setter(transform = |handler: impl Fn(&SubmitRequestEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<SubmitRequestEvent>),
    doc = "Register a handler closure to be invoked after the client broadcasts a request. Optional."))]
    on_submit_request: Option<HandlerPtr<SubmitRequestEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveReplyEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveReplyEvent>),
    doc = "Register a handler closure to be invoked after the client receives a reply from a replica. Optional."))]
    on_receive_reply: Option<HandlerPtr<ReceiveReplyEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&AcceptResultEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<AcceptResultEvent>),
    doc = "Register a handler closure to be invoked after the client accepts a result. Optional."))]
    on_accept_result: Option<HandlerPtr<AcceptResultEvent>>,
}

impl<N: Network + 'static> ClientSpec<N> {
    /// Starts all threads and channels associated with running a client, and returns the handles to
    /// them in a [Client] struct.
    pub fn start(self) -> Result<Client<N>, ConfigurationError> {
        let config = self.configuration;
        if config.num_replicas == 0 {
            return Err(ConfigurationError::NoReplicas);
        }

        let event_handlers = EventHandlers::for_client(
            config.log_events,
            self.on_submit_request,
            self.on_receive_reply,
            self.on_accept_result,
        );
        let (event_publisher, event_bus_and_shutdown) = if event_handlers.is_empty() {
            (None, None)
        } else {
            let (event_publisher, event_subscriber) = mpsc::channel();
            let (event_bus_shutdown, event_bus_shutdown_receiver) = mpsc::channel();
            let event_bus =
                start_event_bus(event_handlers, event_subscriber, event_bus_shutdown_receiver);
            (Some(event_publisher), Some((event_bus, event_bus_shutdown)))
        };
        let (event_bus, event_bus_shutdown) = event_bus_and_shutdown.unzip();

        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let (poller, msg_receiver) = start_polling(self.network.clone(), poller_shutdown_receiver);

        let aggregator = Arc::new(Mutex::new(ReplyAggregator::new(config.num_replicas)));
        let (results_sender, results) = mpsc::channel();
        let (reply_handler_shutdown, reply_handler_shutdown_receiver) = mpsc::channel();
        let reply_handler = start_reply_handler(
            aggregator.clone(),
            msg_receiver,
            results_sender,
            event_publisher.clone(),
            reply_handler_shutdown_receiver,
        );

        Ok(Client {
            me: config.me,
            next_timestamp: Timestamp::new(1),
            sender_handle: SenderHandle::new(self.network, config.num_replicas),
            aggregator,
            results,
            event_publisher,
            poller: Some(poller),
            poller_shutdown,
            reply_handler: Some(reply_handler),
            reply_handler_shutdown,
            event_bus,
            event_bus_shutdown,
        })
    }
}

// How long the reply handler blocks waiting for a message before checking for a shutdown signal again.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

fn start_reply_handler(
    aggregator: Arc<Mutex<ReplyAggregator>>,
    msg_receiver: Receiver<(Peer, Message)>,
    results: Sender<AcceptedResult>,
    event_publisher: Option<Sender<Event>>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                log::error!("Reply handler thread disconnected from main thread");
                return;
            }
        }

        let (origin, reply) = match msg_receiver.recv_timeout(POLL_INTERVAL) {
            Ok((origin, Message::Reply(reply))) => (origin, reply),
            Ok((origin, msg)) => {
                log::debug!("{} from {} ignored: clients only take replies", msg.method(), origin);
                continue;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };

        Event::ReceiveReply(ReceiveReplyEvent {
            timestamp: SystemTime::now(),
            origin,
            reply: reply.clone(),
        })
        .publish(&event_publisher);

        let accepted = {
            let mut aggregator = lock(&aggregator);
            if aggregator.on_reply(&reply) {
                aggregator.try_accept(reply.timestamp)
            } else {
                None
            }
        };

        if let Some(accepted) = accepted {
            Event::AcceptResult(AcceptResultEvent {
                timestamp: SystemTime::now(),
                accepted: accepted.clone(),
            })
            .publish(&event_publisher);
            let _ = results.send(accepted);
        }
    })
}

/// A handle to the background threads of a client. When this value is dropped, all background
/// threads are gracefully shut down.
pub struct Client<N: Network + 'static> {
    me: ClientId,
    next_timestamp: Timestamp,
    sender_handle: SenderHandle<N>,
    aggregator: Arc<Mutex<ReplyAggregator>>,
    results: Receiver<AcceptedResult>,
    event_publisher: Option<Sender<Event>>,
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
    reply_handler: Option<JoinHandle<()>>,
    reply_handler_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl<N: Network + 'static> Client<N> {
    /// Broadcast a request for `operation` to every replica, and return the timestamp it was stamped
    /// with. Timestamps start at 1 and increase by one per request.
    pub fn submit(&mut self, operation: impl Into<Operation>) -> Timestamp {
        let timestamp = self.next_timestamp;
        self.next_timestamp = Timestamp::new(timestamp.int() + 1);

        let request = ClientRequest::new(operation, timestamp, self.me);
        lock(&self.aggregator).open(timestamp, request.operation.clone());
        self.sender_handle.broadcast(request.clone());

        Event::SubmitRequest(SubmitRequestEvent {
            timestamp: SystemTime::now(),
            request,
        })
        .publish(&self.event_publisher);

        timestamp
    }

    /// Results accepted so far, in the order they were accepted. Each result is delivered once.
    pub fn results(&self) -> &Receiver<AcceptedResult> {
        &self.results
    }

    /// Number of submitted requests for which no result has been accepted yet.
    pub fn num_outstanding(&self) -> usize {
        lock(&self.aggregator).num_outstanding()
    }
}

impl<N: Network + 'static> Drop for Client<N> {
    fn drop(&mut self) {
        // The reply handler receives from the poller, so the poller is shut down last.

        if let Some(event_bus_shutdown) = &self.event_bus_shutdown {
            let _ = event_bus_shutdown.send(());
        }
        if let Some(event_bus) = self.event_bus.take() {
            let _ = event_bus.join();
        }

        let _ = self.reply_handler_shutdown.send(());
        if let Some(reply_handler) = self.reply_handler.take() {
            let _ = reply_handler.join();
        }

        let _ = self.poller_shutdown.send(());
        if let Some(poller) = self.poller.take() {
            let _ = poller.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::data_types::ViewNumber;

    fn reply(replica: u32, timestamp: u64, result: &str) -> Reply {
        Reply {
            view: ViewNumber::new(4),
            timestamp: Timestamp::new(timestamp),
            replica_id: ReplicaId::new(replica),
            result: Operation::from(result),
        }
    }

    fn aggregator_with_request() -> ReplyAggregator {
        let mut aggregator = ReplyAggregator::new(4);
        aggregator.open(Timestamp::new(1), Operation::from("op-A"));
        aggregator
    }

    #[test]
    fn one_reply_never_accepts() {
        let mut aggregator = aggregator_with_request();
        assert!(aggregator.on_reply(&reply(0, 1, "op-A")));
        assert_eq!(aggregator.try_accept(Timestamp::new(1)), None);

        // The same replica replying again still counts once.
        assert!(aggregator.on_reply(&reply(0, 1, "op-A")));
        assert_eq!(aggregator.try_accept(Timestamp::new(1)), None);
    }

    #[test]
    fn two_matching_replies_accept_and_close_the_request() {
        let mut aggregator = aggregator_with_request();
        aggregator.on_reply(&reply(0, 1, "op-A"));
        aggregator.on_reply(&reply(3, 1, "op-A"));
        assert_eq!(
            aggregator.try_accept(Timestamp::new(1)),
            Some(AcceptedResult {
                timestamp: Timestamp::new(1),
                operation: Operation::from("op-A"),
                result: Operation::from("op-A"),
            })
        );
        assert_eq!(aggregator.num_outstanding(), 0);

        // A late third reply is ignored.
        assert!(!aggregator.on_reply(&reply(2, 1, "op-A")));
        assert_eq!(aggregator.try_accept(Timestamp::new(1)), None);
    }

    #[test]
    fn conflicting_results_wait_for_a_majority() {
        let mut aggregator = aggregator_with_request();
        aggregator.on_reply(&reply(1, 1, "fakeop"));
        aggregator.on_reply(&reply(2, 1, "op-A"));
        assert_eq!(aggregator.try_accept(Timestamp::new(1)), None);

        aggregator.on_reply(&reply(3, 1, "op-A"));
        let accepted = aggregator.try_accept(Timestamp::new(1)).unwrap();
        assert_eq!(accepted.result, Operation::from("op-A"));
    }

    #[test]
    fn replies_for_unknown_requests_are_ignored() {
        let mut aggregator = aggregator_with_request();
        assert!(!aggregator.on_reply(&reply(0, 7, "op-A")));
        assert_eq!(aggregator.try_accept(Timestamp::new(7)), None);
        assert_eq!(aggregator.num_outstanding(), 1);
    }
}
