/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The algorithm thread, the driving force of a replica.
//!
//! The algorithm thread feeds everything that happens to the replica into its
//! [`HotStuff`](crate::hotstuff::implementation::HotStuff) engine, one thing at a time:
//! 1. The passage of time, by [ticking](crate::hotstuff::implementation::HotStuff::tick) the engine so
//!    that the timers its pacemaker armed can expire.
//! 2. Messages forwarded by the [poller thread](crate::networking::receiving::start_polling).
//!
//! Each is handled under the replica lock, which the [`Replica`](crate::replica::Replica) handle also
//! takes for its inspection methods. Nothing the engine does while holding the lock waits on the
//! network.

use std::{
    sync::{
        mpsc::{Receiver, RecvTimeoutError, TryRecvError},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{
    hotstuff::implementation::HotStuff,
    networking::{
        messages::{Message, Peer},
        network::Network,
    },
};

// Upper bound on how late a timer expires while the thread is blocked on messages.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

pub(crate) struct Algorithm<N: Network> {
    hotstuff: Arc<Mutex<HotStuff<N>>>,
    msg_receiver: Receiver<(Peer, Message)>,
    shutdown_signal: Receiver<()>,
}

impl<N: Network + 'static> Algorithm<N> {
    pub(crate) fn new(
        hotstuff: Arc<Mutex<HotStuff<N>>>,
        msg_receiver: Receiver<(Peer, Message)>,
        shutdown_signal: Receiver<()>,
    ) -> Self {
        Self {
            hotstuff,
            msg_receiver,
            shutdown_signal,
        }
    }

    /// Start the algorithm thread. The engine enters view 1 on the new thread.
    pub(crate) fn start(self) -> JoinHandle<()> {
        thread::spawn(move || self.execute())
    }

    fn execute(self) {
        lock(&self.hotstuff).start();

        loop {
            match self.shutdown_signal.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    log::error!("Algorithm thread disconnected from main thread");
                    return;
                }
            }

            lock(&self.hotstuff).tick();

            match self.msg_receiver.recv_timeout(POLL_INTERVAL) {
                Ok((origin, msg)) => self.on_receive(origin, msg),
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => {
                    log::error!("Algorithm thread disconnected from the poller");
                    return;
                }
            }
        }
    }

    fn on_receive(&self, origin: Peer, msg: Message) {
        let method = msg.method();
        match msg {
            Message::Request(request) => lock(&self.hotstuff).on_receive_request(origin, request),
            Message::Msg(msg) => {
                if let Err(rejection) = lock(&self.hotstuff).on_receive_msg(msg) {
                    log::debug!("{} from {} rejected: {}", method, origin, rejection)
                }
            }
            Message::Reply(_) => log::debug!("{} from {} ignored: replicas take no replies", method, origin),
        }
    }
}

/// Lock `mutex`, recovering the guard if a thread panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
