/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of types specific to the HotStuff protocol.

use std::{
    collections::{BTreeMap, HashMap},
    mem,
};

use crate::types::{
    certificates::{CertificateVerifier, QuorumCertificate},
    data_types::{NodeId, ReplicaId},
    node::LogNode,
};

use super::messages::VoteMessage;

/// Helps the next leader form a [`QuorumCertificate`] out of the votes and new-view messages sent to
/// it in the current view.
///
/// At most one message is kept per sender: a later message from the same sender replaces the earlier
/// one.
#[derive(Default)]
pub(crate) struct VoteCollector {
    votes: BTreeMap<ReplicaId, VoteMessage>,
}

impl VoteCollector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&mut self, vote: VoteMessage) {
        self.votes.insert(vote.sender, vote);
    }

    pub(crate) fn len(&self) -> usize {
        self.votes.len()
    }

    /// Try to certify a node with the messages collected so far.
    ///
    /// Nothing is certified until messages from at least `n - f` distinct replicas have been collected.
    /// From then on, the first node whose matching votes `verifier` considers a quorum is certified
    /// in the view it was proposed in. New-view messages count towards the `n - f` total but never
    /// towards any node.
    pub(crate) fn try_aggregate(
        &self,
        n: usize,
        f: usize,
        verifier: &dyn CertificateVerifier,
    ) -> Option<(QuorumCertificate, &LogNode)> {
        if self.votes.len() < n.saturating_sub(f) {
            return None;
        }

        let mut matching_votes: HashMap<NodeId, usize> = HashMap::new();
        for node in self.votes.values().filter_map(|vote| vote.node.as_ref()) {
            let count = matching_votes.entry(node.id).or_default();
            *count += 1;
            if verifier.is_quorum(*count, n, f) {
                return Some((QuorumCertificate::new(node.view, node.id), node));
            }
        }
        None
    }

    /// Empty the collector, returning everything it held.
    pub(crate) fn take(&mut self) -> Vec<VoteMessage> {
        mem::take(&mut self.votes).into_values().collect()
    }
}
