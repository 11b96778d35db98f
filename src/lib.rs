/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A Byzantine fault tolerant replicated log, built on chained HotStuff.
//!
//! A fixed set of `n` [replicas](replica) agree on a single, totally ordered log of client requests,
//! despite up to `f = (n - 1) / 3` of them behaving arbitrarily. [Clients](client) broadcast requests
//! to every replica, and accept a result once more than `f` replicas agree on it.
//!
//! ## Components
//!
//! - [`hotstuff`]: the consensus core. Proposes, votes on, and executes log nodes.
//! - [`pacemaker`]: views, leader rotation, and the timers that keep replicas moving.
//! - [`networking`]: the pluggable [`Network`](networking::network::Network) trait, and a
//!   [fault-injecting decorator](networking::faulty) for testing.
//! - [`replica`] and [`client`]: builders that start the threads of a replica or a client.
//! - [`events`]: everything replicas and clients report to user-registered handlers.
//!
//! Executing a request returns its operation unchanged as the result.

pub mod types;

pub mod hotstuff;

pub mod pacemaker;

pub mod networking;

pub mod replica;

pub mod client;

pub mod events;

pub(crate) mod node_tree;

pub(crate) mod algorithm;

pub(crate) mod event_bus;

pub(crate) mod logging;
