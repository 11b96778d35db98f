/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions for receiving messages from the network.

use std::{
    sync::mpsc::{self, Receiver, TryRecvError},
    thread::{self, JoinHandle},
};

use super::{
    messages::{Message, Peer},
    network::Network,
};

/// Spawn the poller thread, which polls the [`Network`] for messages and forwards them, together with
/// their origin, into the returned receiver.
///
/// The poller exits when it receives a shutdown signal, or when the receiving end of the returned
/// channel has been dropped.
pub(crate) fn start_polling<N: Network + 'static>(
    mut network: N,
    shutdown_signal: Receiver<()>,
) -> (JoinHandle<()>, Receiver<(Peer, Message)>) {
    let (to_msg_receiver, msg_receiver) = mpsc::channel();

    let poller_thread = thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                log::error!("Poller thread disconnected from main thread");
                return;
            }
        }

        if let Some((origin, msg)) = network.recv() {
            if to_msg_receiver.send((origin, msg)).is_err() {
                return;
            }
        } else {
            thread::yield_now()
        }
    });

    (poller_thread, msg_receiver)
}
