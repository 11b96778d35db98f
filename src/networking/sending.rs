/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions and types for sending messages to the network.

use crate::types::data_types::ReplicaId;

use super::{
    messages::{Message, Peer},
    network::Network,
};

/// Handle for sending and broadcasting messages to the [`Network`].
///
/// It can be used to send or broadcast instances of any type that implement the [`Into<Message>`]
/// trait.
#[derive(Clone)]
pub(crate) struct SenderHandle<N: Network> {
    network: N,
    num_replicas: usize,
}

impl<N: Network> SenderHandle<N> {
    pub(crate) fn new(network: N, num_replicas: usize) -> Self {
        Self {
            network,
            num_replicas,
        }
    }

    pub(crate) fn send<S: Into<Message>>(&mut self, peer: Peer, msg: S) {
        self.network.send(peer, msg.into())
    }

    /// Send `msg` to every replica in the replica set, the sender included, one
    /// [`send`](Network::send) per replica.
    pub(crate) fn broadcast<S: Into<Message>>(&mut self, msg: S) {
        let msg = msg.into();
        for id in 0..self.num_replicas {
            self.network
                .send(Peer::Replica(ReplicaId::new(id as u32)), msg.clone())
        }
    }
}
