/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Quorum certificates, and the [`CertificateVerifier`] trait that decides which votes count towards
//! one.
//!
//! A [`QuorumCertificate`] in this crate carries no cryptographic proof of its own: it asserts that a
//! Byzantine quorum voted for `node_id` in `view`, and replicas trust QCs formed by their own
//! [`VoteCollector`](crate::hotstuff::types::VoteCollector). What makes a set of votes a quorum is
//! delegated to a pluggable `CertificateVerifier`:
//! - [`CountingVerifier`] (the default) admits every vote and certifies by plain counting.
//! - [`SignatureVerifier`] admits only votes carrying a valid Ed25519 signature from their sender.
//!
//! A threshold-signature scheme can be substituted by implementing `CertificateVerifier` without
//! touching the consensus core.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::hotstuff::messages::VoteMessage;

use super::{
    crypto_primitives::{Signature, Verifier, VerifyingKey},
    data_types::{NodeId, ViewNumber},
};

/// Assertion that a Byzantine quorum voted for node `node_id` in view `view`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct QuorumCertificate {
    pub view: ViewNumber,
    pub node_id: NodeId,
}

impl QuorumCertificate {
    pub const fn new(view: ViewNumber, node_id: NodeId) -> Self {
        Self { view, node_id }
    }

    /// The QC every log tree is implicitly rooted at. It is also the "empty" QC that justifies
    /// placeholder nodes.
    pub const fn genesis_qc() -> QuorumCertificate {
        QuorumCertificate {
            view: ViewNumber::init(),
            node_id: NodeId::genesis(),
        }
    }

    pub fn is_genesis_qc(&self) -> bool {
        *self == Self::genesis_qc()
    }
}

impl Default for QuorumCertificate {
    fn default() -> Self {
        Self::genesis_qc()
    }
}

/// Decides which votes are admissible and how many matching votes certify a node.
pub trait CertificateVerifier: Send {
    /// Whether `vote` may be counted at all.
    fn verify_vote(&self, vote: &VoteMessage) -> bool;

    /// Whether `matching_votes` votes for the same node, in a replica set of `n` replicas tolerating
    /// `f` faults, certify that node.
    fn is_quorum(&self, matching_votes: usize, n: usize, f: usize) -> bool;
}

/// Admits every vote, and certifies a node once strictly more than `f` votes match.
#[derive(Clone, Copy, Debug, Default)]
pub struct CountingVerifier;

impl CertificateVerifier for CountingVerifier {
    fn verify_vote(&self, _vote: &VoteMessage) -> bool {
        true
    }

    fn is_quorum(&self, matching_votes: usize, _n: usize, f: usize) -> bool {
        matching_votes > f
    }
}

/// Admits a vote only if it carries a valid Ed25519 signature made by the replica it claims to come
/// from. Certification is by counting, exactly like [`CountingVerifier`].
#[derive(Clone)]
pub struct SignatureVerifier {
    verifying_keys: Vec<VerifyingKey>,
}

impl SignatureVerifier {
    /// `verifying_keys[i]` must be the verifying key of the replica with id `i`.
    pub fn new(verifying_keys: Vec<VerifyingKey>) -> Self {
        Self { verifying_keys }
    }
}

impl CertificateVerifier for SignatureVerifier {
    fn verify_vote(&self, vote: &VoteMessage) -> bool {
        let (Some(verifying_key), Some(signature)) =
            (self.verifying_keys.get(vote.sender.index()), vote.signature)
        else {
            return false;
        };
        let signature = Signature::from_bytes(&signature.bytes());
        verifying_key
            .verify(&vote.signing_bytes(), &signature)
            .is_ok()
    }

    fn is_quorum(&self, matching_votes: usize, n: usize, f: usize) -> bool {
        CountingVerifier.is_quorum(matching_votes, n, f)
    }
}
