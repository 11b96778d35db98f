/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use std::{
    collections::HashMap,
    sync::{
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
};

use borsh::{BorshDeserialize, BorshSerialize};
use chained_hotstuff::{
    networking::{
        messages::{Message, Peer},
        network::Network,
    },
    types::data_types::{ClientId, ReplicaId},
};

/// A mock network stub which passes messages from and to threads using channels.
///
/// Messages travel as borsh-encoded bytes, so every message is serialized and deserialized exactly as
/// it would be over a real transport.
#[derive(Clone)]
pub(crate) struct NetworkStub {
    me: Peer,
    all_peers: HashMap<Peer, Sender<(Peer, Vec<u8>)>>,
    inbox: Arc<Mutex<Receiver<(Peer, Vec<u8>)>>>,
}

impl Network for NetworkStub {
    fn send(&mut self, peer: Peer, message: Message) {
        if let Some(peer) = self.all_peers.get(&peer) {
            let bytes = message.try_to_vec().unwrap();
            let _ = peer.send((self.me, bytes));
        }
    }

    fn recv(&mut self) -> Option<(Peer, Message)> {
        match self.inbox.lock().unwrap().try_recv() {
            Ok((origin, bytes)) => Some((origin, Message::try_from_slice(&bytes).unwrap())),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => None,
        }
    }
}

/// Connect `num_replicas` replicas and `num_clients` clients to each other. Returns the stubs of the
/// replicas and of the clients, each in order of their ids.
pub(crate) fn mock_network(
    num_replicas: usize,
    num_clients: usize,
) -> (Vec<NetworkStub>, Vec<NetworkStub>) {
    let replicas = (0..num_replicas as u32).map(|id| Peer::Replica(ReplicaId::new(id)));
    let clients = (0..num_clients as u32).map(|id| Peer::Client(ClientId::new(id)));

    let mut all_peers = HashMap::new();
    let peer_and_inboxes: Vec<(Peer, Receiver<(Peer, Vec<u8>)>)> = replicas
        .chain(clients)
        .map(|peer| {
            let (sender, receiver) = mpsc::channel();
            all_peers.insert(peer, sender);

            (peer, receiver)
        })
        .collect();

    let mut stubs: Vec<NetworkStub> = peer_and_inboxes
        .into_iter()
        .map(|(me, inbox)| NetworkStub {
            me,
            all_peers: all_peers.clone(),
            inbox: Arc::new(Mutex::new(inbox)),
        })
        .collect();
    let client_stubs = stubs.split_off(num_replicas);

    (stubs, client_stubs)
}
