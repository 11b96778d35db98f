/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Subprotocol for committing client requests.
//!
//! ## Chained HotStuff
//!
//! Every view, the leader proposes one [`LogNode`](crate::types::node::LogNode) that extends the node
//! certified by its generic QC and is justified by that QC. Because each proposal carries the QC of
//! the previous one, one round of voting per view serves as a different phase for each of the last
//! three nodes on the chain:
//!
//! 1. The leader of view `v` broadcasts a proposal to all replicas, itself included.
//! 2. Each replica stores the proposed node, votes for it if it is [safe](invariants::safe_node) and
//!    it has not voted in `v` yet, and sends the vote to the leader of `v + 1`.
//! 3. The leader of `v + 1` collects votes until a node has a quorum, makes the QC for it its
//!    generic QC, and enters `v + 1`.
//! 4. Delivering the proposal of `v + 1` [walks the chain](invariants::walk_chain) of justify pointers:
//!    the node of `v` is now pre-committed (generic QC), its parent is locked (locked QC), and its
//!    grandparent is decided and executed, together with any ancestor not executed yet.
//!
//! A decision therefore needs proposals from four consecutive views whose nodes are direct children
//! of one another. A view whose leader is faulty breaks the chain, and the next leader has to start a
//! new one on top of the highest QC it knows.
//!
//! ## Message types
//!
//! Replicas only ever exchange one message type, [`VoteMessage`](messages::VoteMessage). Whether it is
//! a proposal, a vote, or a new-view message depends on its kind and on what it carries.

pub mod messages;

pub(crate) mod types;

pub(crate) mod invariants;

pub(crate) mod implementation;

pub use implementation::Rejection;
