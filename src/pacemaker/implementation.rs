/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The view controller: current view, leader election, and the view/no-op timer pair.
//!
//! Main type: [`Pacemaker`].

use std::time::{Duration, Instant};

use crate::types::data_types::{ReplicaId, ViewNumber};

/// Select the leader of `view` in a replica set of size `num_replicas`, round-robin.
///
/// # Panics
///
/// `num_replicas` must be non-zero. [`Configuration`](crate::replica::Configuration)s with zero
/// replicas are rejected when a replica starts.
pub fn select_leader(view: ViewNumber, num_replicas: usize) -> ReplicaId {
    ReplicaId::new((view.int() % num_replicas as u64) as u32)
}

/// Which of the two per-view timers fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutKind {
    /// The replica heard nothing that moved it out of the view in time.
    View,

    /// The leader of the view has waited long enough for client traffic.
    Noop,
}

/// Notification that a timer armed in `view` fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeout {
    pub view: ViewNumber,
    pub kind: TimeoutKind,
}

#[derive(Clone, Copy)]
pub(crate) struct PacemakerConfiguration {
    pub(crate) num_replicas: usize,
    pub(crate) view_timeout: Duration,
    pub(crate) noop_delay: Duration,
}

/// Owns the current view and the deadlines of the timers armed for it.
///
/// Timers are plain deadlines. Nothing fires on its own: the algorithm thread
/// [ticks](crate::hotstuff::implementation::HotStuff::tick) the engine on every iteration of its loop,
/// which asks the pacemaker for [expired](Pacemaker::expired) timers.
pub(crate) struct Pacemaker {
    config: PacemakerConfiguration,
    view: ViewNumber,
    view_deadline: Option<Instant>,
    noop_deadline: Option<Instant>,
}

impl Pacemaker {
    /// Create a pacemaker sitting in the genesis view, with no timers armed.
    pub(crate) fn new(config: PacemakerConfiguration) -> Self {
        Self {
            config,
            view: ViewNumber::init(),
            view_deadline: None,
            noop_deadline: None,
        }
    }

    pub(crate) fn view(&self) -> ViewNumber {
        self.view
    }

    pub(crate) fn view_timeout(&self) -> Duration {
        self.config.view_timeout
    }

    pub(crate) fn leader(&self, view: ViewNumber) -> ReplicaId {
        select_leader(view, self.config.num_replicas)
    }

    /// The leader of the view after the current one, i.e., the replica that collects votes sent in the
    /// current view.
    pub(crate) fn next_leader(&self) -> ReplicaId {
        self.leader(self.view + 1)
    }

    /// Move into `view`, disarming every timer armed for the view being left.
    ///
    /// Returns `false` and changes nothing if `view` is not strictly higher than the current view.
    pub(crate) fn enter_view(&mut self, view: ViewNumber) -> bool {
        if view <= self.view {
            return false;
        }
        self.view_deadline = None;
        self.noop_deadline = None;
        self.view = view;
        true
    }

    pub(crate) fn arm_view_timer(&mut self) {
        self.view_deadline = Some(Instant::now() + self.config.view_timeout);
    }

    pub(crate) fn arm_noop_timer(&mut self) {
        self.noop_deadline = Some(Instant::now() + self.config.noop_delay);
    }

    pub(crate) fn cancel_noop_timer(&mut self) {
        self.noop_deadline = None;
    }

    /// Disarm and return a timer of the current view whose deadline is not after `now`. The no-op
    /// timer is returned first when both have expired.
    pub(crate) fn expired(&mut self, now: Instant) -> Option<Timeout> {
        let kind = if self.noop_deadline.is_some_and(|deadline| deadline <= now) {
            self.noop_deadline = None;
            TimeoutKind::Noop
        } else if self.view_deadline.is_some_and(|deadline| deadline <= now) {
            self.view_deadline = None;
            TimeoutKind::View
        } else {
            return None;
        };
        Some(Timeout {
            view: self.view,
            kind,
        })
    }
}
