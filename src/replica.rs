/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build and run a replica.
//!
//! A replica is one of the `n` processes that together replicate a log of client requests. Replicas are
//! identified by their ordinal index in the static replica list, a [`ReplicaId`], and tolerate up to
//! `f = (n - 1) / 3` faulty members.
//!
//! The key components of this module are:
//! - The builder-pattern interface to construct a [specification of the replica](ReplicaSpec) with:
//!   1. `ReplicaSpec::builder` to construct a `ReplicaSpecBuilder`,
//!   2. The setters of the `ReplicaSpecBuilder`, and
//!   3. The `ReplicaSpecBuilder::build` method to construct a [ReplicaSpec],
//! - The function to [start](ReplicaSpec::start) a [Replica] given its specification,
//! - [The type](Replica) which keeps the replica alive, and lets the library user inspect it.
//!
//! ## Starting a replica
//!
//! ```ignore
//! let replica =
//!     ReplicaSpec::builder()
//!     .network(network)
//!     .configuration(configuration)
//!     .on_execute_request(execute_request_handler)
//!     .build()
//!     .start()?;
//! ```
//!
//! ### Required setters
//!
//! - `.network(...)`
//! - `.configuration(...)`
//!
//! ### Optional setters
//!
//! `.verifier(...)` replaces the default [`CountingVerifier`] with another
//! [`CertificateVerifier`]. The other optional setters register user-defined event handlers for
//! events from [crate::events]:
//! - `.on_insert_node(...)`
//! - `.on_execute_request(...)`
//! - `.on_update_generic_qc(...)`
//! - `.on_update_locked_qc(...)`
//! - `.on_propose(...)`
//! - `.on_vote(...)`
//! - `.on_new_view(...)`
//! - `.on_receive_request(...)`
//! - `.on_receive_proposal(...)`
//! - `.on_receive_vote(...)`
//! - `.on_start_view(...)`
//! - `.on_view_timeout(...)`
//! - `.on_collect_qc(...)`
//!
//! The replica's [configuration](Configuration) can also be defined using the builder pattern, for
//! example:
//!
//! ```ignore
//! let configuration =
//!     Configuration::builder()
//!     .me(ReplicaId::new(0))
//!     .num_replicas(4)
//!     .view_timeout(Duration::from_secs(10))
//!     .noop_delay(Duration::from_secs(2))
//!     .log_events(true)
//!     .build()
//! ```

use std::{
    error::Error,
    fmt::{self, Display, Formatter},
    sync::{
        mpsc::{self, Sender},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

use ed25519_dalek::SigningKey;
use typed_builder::TypedBuilder;

use crate::{
    algorithm::{lock, Algorithm},
    event_bus::*,
    events::*,
    hotstuff::implementation::{HotStuff, HotStuffConfiguration},
    networking::{
        faulty::{FaultMode, FaultSwitch, FaultyNetwork},
        messages::Peer,
        network::Network,
        receiving::start_polling,
        sending::SenderHandle,
    },
    pacemaker::implementation::PacemakerConfiguration,
    types::{
        certificates::{CertificateVerifier, CountingVerifier, QuorumCertificate},
        crypto_primitives::Keypair,
        data_types::{ReplicaId, ViewNumber},
        node::{ClientRequest, LogNode},
    },
};

/// Stores the user-defined parameters required to start the replica, that is:
/// 1. The replica's index in the static replica list.
/// 2. The number of replicas in the replica set.
/// 3. The view timeout, after which a replica that made no progress gives up on the current view.
/// 4. The no-op delay, after which the leader of a view proposes a no-op if no client request arrived.
/// 5. An optional [signing key](ed25519_dalek::SigningKey) to sign votes and new-view messages with.
/// 6. The fault mode the replica starts in. Only useful for testing.
/// 7. The "Log Events" flag, if set to "true" then logs should be printed.
///
/// ## Timers
///
/// `noop_delay` must be strictly shorter than `view_timeout`, or leaders without client traffic would
/// never propose before the view times out.
///
/// ## Log Events
///
/// The replica logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
/// printed onto a terminal or to a file, set up a [logging
/// implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.me(...)`
    - `.num_replicas(...)`
    - `.log_events(...)`

    Optional:
    - `.view_timeout(...)`
    - `.noop_delay(...)`
    - `.signing_key(...)`
    - `.fault_mode(...)`
"))]
pub struct Configuration {
    #[builder(setter(doc = "Set the replica's index in the static replica list. Required."))]
    pub me: ReplicaId,
    #[builder(setter(doc = "Set the number of replicas in the replica set. Required."))]
    pub num_replicas: usize,
    #[builder(default = Duration::from_secs(10), setter(doc = "Set how long the replica waits for progress in a view before moving to the next. Defaults to 10 seconds."))]
    pub view_timeout: Duration,
    #[builder(default = Duration::from_secs(2), setter(doc = "Set how long the leader of a view waits for a client request before proposing a no-op. Defaults to 2 seconds."))]
    pub noop_delay: Duration,
    #[builder(default, setter(strip_option, doc = "Set the key used to sign votes and new-view messages. Messages are sent unsigned by default."))]
    pub signing_key: Option<SigningKey>,
    #[builder(default, setter(doc = "Set the fault mode the replica starts in. Defaults to [FaultMode::Normal]."))]
    pub fault_mode: FaultMode,
    #[builder(setter(doc = "Enable logging? Required."))]
    pub log_events: bool,
}

impl Configuration {
    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.num_replicas == 0 {
            return Err(ConfigurationError::NoReplicas);
        }
        if self.me.index() >= self.num_replicas {
            return Err(ConfigurationError::UnknownReplica {
                me: self.me,
                num_replicas: self.num_replicas,
            });
        }
        if self.noop_delay >= self.view_timeout {
            return Err(ConfigurationError::NoopDelayNotShorterThanViewTimeout {
                noop_delay: self.noop_delay,
                view_timeout: self.view_timeout,
            });
        }
        Ok(())
    }
}

impl Configuration {
    /// Split into the parts the engine and the pacemaker are configured with.
    fn split(self) -> (HotStuffConfiguration, PacemakerConfiguration) {
        let hotstuff_config = HotStuffConfiguration {
            me: self.me,
            num_replicas: self.num_replicas,
            keypair: self.signing_key.map(Keypair::new),
        };
        let pacemaker_config = PacemakerConfiguration {
            num_replicas: self.num_replicas,
            view_timeout: self.view_timeout,
            noop_delay: self.noop_delay,
        };
        (hotstuff_config, pacemaker_config)
    }
}

/// Why a replica or a client could not be started.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigurationError {
    /// The replica set is empty.
    NoReplicas,

    /// `me` is not an index into the replica list.
    UnknownReplica { me: ReplicaId, num_replicas: usize },

    /// The no-op delay would never fire before the view timeout.
    NoopDelayNotShorterThanViewTimeout {
        noop_delay: Duration,
        view_timeout: Duration,
    },
}

impl Display for ConfigurationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConfigurationError::NoReplicas => write!(f, "the replica set must not be empty"),
            ConfigurationError::UnknownReplica { me, num_replicas } => write!(
                f,
                "replica {} is not in a replica set of {} replicas",
                me, num_replicas
            ),
            ConfigurationError::NoopDelayNotShorterThanViewTimeout {
                noop_delay,
                view_timeout,
            } => write!(
                f,
                "noop delay {:?} must be shorter than view timeout {:?}",
                noop_delay, view_timeout
            ),
        }
    }
}

impl Error for ConfigurationError {}

/// A snapshot of the consensus state of a replica.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaInfo {
    pub id: ReplicaId,
    pub n: usize,
    pub f: usize,
    pub view: ViewNumber,
    pub generic_qc: QuorumCertificate,
    pub locked_qc: QuorumCertificate,
}

/// Stores all necessary parameters and trait implementations required to run the [Replica].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [ReplicaSpec]. On the builder call the following methods to construct a valid [ReplicaSpec].

    Required:
    - `.network(...)`
    - `.configuration(...)`

    Optional:
    - `.verifier(...)`
    - `.on_insert_node(...)`
    - `.on_execute_request(...)`
    - `.on_update_generic_qc(...)`
    - `.on_update_locked_qc(...)`
    - `.on_propose(...)`
    - `.on_vote(...)`
    - `.on_new_view(...)`
    - `.on_receive_request(...)`
    - `.on_receive_proposal(...)`
    - `.on_receive_vote(...)`
    - `.on_start_view(...)`
    - `.on_view_timeout(...)`
    - `.on_collect_qc(...)`
"))]
pub struct ReplicaSpec<N: Network + 'static> {
    // Required parameters
    #[builder(setter(doc = "Set the implementation of peer-to-peer networking. The argument must implement the [Network](crate::networking::network::Network) trait. Required."))]
    network: N,
    #[builder(setter(doc = "Set the [configuration](Configuration), which contains the necessary parameters to run a replica. Required."))]
    configuration: Configuration,
    // Optional parameters
    #[builder(default = Box::new(CountingVerifier), setter(transform = |verifier: impl CertificateVerifier + 'static| Box::new(verifier) as Box<dyn CertificateVerifier>,
    doc = "Set the [CertificateVerifier] that decides which votes count towards a quorum certificate. Defaults to [CountingVerifier]."))]
    verifier: Box<dyn CertificateVerifier>,
    #[builder(default, setter(transform = |handler: impl Fn(&InsertNodeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<InsertNodeEvent>),
    doc = "Register a handler closure to be invoked after a node is inserted into the replica's node tree. Optional."))]
    on_insert_node: Option<HandlerPtr<InsertNodeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ExecuteRequestEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ExecuteRequestEvent>),
    doc = "Register a handler closure to be invoked after the replica executes a decided request. Optional."))]
    on_execute_request: Option<HandlerPtr<ExecuteRequestEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&UpdateGenericQCEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<UpdateGenericQCEvent>),
    doc = "Register a handler closure to be invoked after the replica updates its generic QC. Optional."))]
    on_update_generic_qc: Option<HandlerPtr<UpdateGenericQCEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&UpdateLockedQCEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<UpdateLockedQCEvent>),
    doc = "Register a handler closure to be invoked after the replica updates its locked QC. Optional."))]
    on_update_locked_qc: Option<HandlerPtr<UpdateLockedQCEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ProposeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ProposeEvent>),
    doc = "Register a handler closure to be invoked after the replica broadcasts a proposal. Optional."))]
    on_propose: Option<HandlerPtr<ProposeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&VoteEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<VoteEvent>),
    doc = "Register a handler closure to be invoked after the replica sends a vote. Optional."))]
    on_vote: Option<HandlerPtr<VoteEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&NewViewEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<NewViewEvent>),
    doc = "Register a handler closure to be invoked after the replica sends a new-view message to the next leader. Optional."))]
    on_new_view: Option<HandlerPtr<NewViewEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveRequestEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveRequestEvent>),
    doc = "Register a handler closure to be invoked after the replica receives a client request. Optional."))]
    on_receive_request: Option<HandlerPtr<ReceiveRequestEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveProposalEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveProposalEvent>),
    doc = "Register a handler closure to be invoked after the replica receives a proposal. Optional."))]
    on_receive_proposal: Option<HandlerPtr<ReceiveProposalEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveVoteEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveVoteEvent>),
    doc = "Register a handler closure to be invoked after the replica receives a vote. Optional."))]
    on_receive_vote: Option<HandlerPtr<ReceiveVoteEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StartViewEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StartViewEvent>),
    doc = "Register a handler closure to be invoked after the replica enters a new view. Optional."))]
    on_start_view: Option<HandlerPtr<StartViewEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ViewTimeoutEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ViewTimeoutEvent>),
    doc = "Register a handler closure to be invoked after the replica's view times out. Optional."))]
    on_view_timeout: Option<HandlerPtr<ViewTimeoutEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CollectQCEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CollectQCEvent>),
    doc = "Register a handler closure to be invoked after the replica collects a new quorum certificate. Optional."))]
    on_collect_qc: Option<HandlerPtr<CollectQCEvent>>,
}

impl<N: Network + 'static> ReplicaSpec<N> {
    /// Starts all threads and channels associated with running a replica, and returns the handles to
    /// them in a [Replica] struct.
    ///
    /// Fails without starting anything if the [Configuration] is invalid.
    pub fn start(self) -> Result<Replica<N>, ConfigurationError> {
        self.configuration.validate()?;

        let me = self.configuration.me;
        let log_events = self.configuration.log_events;
        let fault_switch = FaultSwitch::new(self.configuration.fault_mode.clone());
        let (hotstuff_config, pacemaker_config) = self.configuration.split();
        let num_replicas = hotstuff_config.num_replicas;

        let network = FaultyNetwork::new(self.network, Peer::Replica(me), fault_switch.clone());

        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let (poller, msg_receiver) = start_polling(network.clone(), poller_shutdown_receiver);

        let event_handlers = EventHandlers::new(
            log_events,
            self.on_insert_node,
            self.on_execute_request,
            self.on_update_generic_qc,
            self.on_update_locked_qc,
            self.on_propose,
            self.on_vote,
            self.on_new_view,
            self.on_receive_request,
            self.on_receive_proposal,
            self.on_receive_vote,
            self.on_start_view,
            self.on_view_timeout,
            self.on_collect_qc,
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

        let hotstuff = Arc::new(Mutex::new(HotStuff::new(
            hotstuff_config,
            pacemaker_config,
            self.verifier,
            SenderHandle::new(network, num_replicas),
            event_publisher,
        )));

        let (algorithm_shutdown, algorithm_shutdown_receiver) = mpsc::channel();
        let algorithm = Algorithm::new(
            hotstuff.clone(),
            msg_receiver,
            algorithm_shutdown_receiver,
        )
        .start();

        Ok(Replica {
            me,
            hotstuff,
            fault_switch,
            poller: Some(poller),
            poller_shutdown,
            algorithm: Some(algorithm),
            algorithm_shutdown,
            event_bus,
            event_bus_shutdown,
        })
    }
}

/// A handle to the background threads of a replica. When this value is dropped, all background
/// threads are gracefully shut down.
pub struct Replica<N: Network + 'static> {
    me: ReplicaId,
    hotstuff: Arc<Mutex<HotStuff<FaultyNetwork<N>>>>,
    fault_switch: FaultSwitch,
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
    algorithm: Option<JoinHandle<()>>,
    algorithm_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl<N: Network + 'static> Replica<N> {
    pub fn id(&self) -> ReplicaId {
        self.me
    }

    /// Take a snapshot of the replica's current view and watermarks.
    pub fn info(&self) -> ReplicaInfo {
        lock(&self.hotstuff).info()
    }

    /// The last `k` nodes the replica proposed or accepted, oldest first.
    pub fn recent_nodes(&self, k: usize) -> Vec<LogNode> {
        lock(&self.hotstuff).recent_nodes(k)
    }

    /// Change how the replica treats the messages it sends from now on.
    pub fn set_fault_mode(&self, mode: FaultMode) {
        log::info!("replica {} switches to fault mode {:?}", self.me, mode);
        self.fault_switch.set(mode)
    }

    pub fn fault_mode(&self) -> FaultMode {
        self.fault_switch.mode()
    }

    /// Hand `request` to the replica as if it had arrived from the network. Only the leader of the
    /// current view acts on it.
    pub fn submit(&self, request: ClientRequest) {
        lock(&self.hotstuff).on_receive_request(Peer::Replica(self.me), request)
    }
}

impl<N: Network + 'static> Drop for Replica<N> {
    fn drop(&mut self) {
        // The algorithm thread receives messages from the poller, so the poller is shut down last.

        if let Some(event_bus_shutdown) = &self.event_bus_shutdown {
            let _ = event_bus_shutdown.send(());
        }
        if let Some(event_bus) = self.event_bus.take() {
            let _ = event_bus.join();
        }

        let _ = self.algorithm_shutdown.send(());
        if let Some(algorithm) = self.algorithm.take() {
            let _ = algorithm.join();
        }

        let _ = self.poller_shutdown.send(());
        if let Some(poller) = self.poller.take() {
            let _ = poller.join();
        }
    }
}
