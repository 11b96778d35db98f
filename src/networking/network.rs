/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`Network`] trait: the transport capability replicas and clients are built on.

use super::messages::{Message, Peer};

/// A best-effort, point-to-point transport between replicas and clients.
///
/// Implementations need not guarantee ordering or delivery, and may reconnect to unreachable peers
/// lazily. The protocol tolerates delayed, lost, duplicated, and reordered messages, and recovers from
/// unreachable peers through view timeouts rather than retries.
pub trait Network: Clone + Send {
    /// Send a message to the specified peer without blocking.
    fn send(&mut self, peer: Peer, message: Message);

    /// Receive a message from any peer. Returns immediately with a `None` if no message is available
    /// now.
    fn recv(&mut self) -> Option<(Peer, Message)>;
}
