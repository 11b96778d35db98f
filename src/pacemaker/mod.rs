/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! View synchronization and leader selection.
//!
//! # Views and leaders
//!
//! Consensus proceeds in numbered views. Every replica starts in view 1, and the leader of view `v` is
//! replica `v mod N`. A replica's view only ever increases.
//!
//! # Leaving a view
//!
//! A replica leaves its current view `v` in one of three ways:
//! 1. It is the leader of `v + 1` and collects a quorum certificate from the votes sent in `v`.
//! 2. It receives a proposal from the legitimate leader of some view higher than `v`, and jumps
//!    straight to that view.
//! 3. Its **view timer** fires. It then sends a new-view message carrying its generic QC to the leader
//!    of `v + 1`, and moves to `v + 1` on its own.
//!
//! The first two are fast; the view timer is the fallback that keeps a replica moving when the leader
//! of its view is faulty or unreachable.
//!
//! # The no-op timer
//!
//! The leader of a view also arms a **no-op timer**, shorter than the view timer. If it has not
//! proposed by the time the no-op timer fires, it proposes a synthesized no-op request, so the chain
//! keeps growing (and older requests keep getting committed) while no client traffic arrives.
//!
//! Both timers are armed on entering a view and disarmed on leaving it. They are deadlines checked by
//! the algorithm thread under the replica lock, so a timer of a view the replica has already left can
//! never fire.

pub mod implementation;
