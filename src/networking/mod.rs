/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable networking.
//!
//! Replicas and clients talk to each other exclusively through an implementation of the
//! [`Network`](network::Network) trait supplied by the library user. Every participant is addressed
//! by a [`Peer`](messages::Peer): its ordinal index in the static replica or client list.
//!
//! Sends are fire-and-forget. A participant never waits for a response to a message it sent; if the
//! message warrants one, the response arrives later as an independent inbound message.

pub mod network;

pub mod messages;

pub mod faulty;

pub(crate) mod receiving;

pub(crate) mod sending;
