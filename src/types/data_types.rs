/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store bytes or numbers, and do not have any major "active" behavior.

use std::{
    fmt::{self, Debug, Display, Formatter},
    ops::{Add, AddAssign},
};

use borsh::{BorshDeserialize, BorshSerialize};

use super::crypto_primitives::{CryptoHasher, Digest};

/// Number of a view. Every view has exactly one designated leader.
///
/// View 0 is the view of the genesis QC. Replicas enter view 1 on start-up and only ever move
/// forward from there.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BorshSerialize, BorshDeserialize,
)]
pub struct ViewNumber(u64);

impl ViewNumber {
    /// Create a new `ViewNumber` with an `int` value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// The view of the genesis QC.
    pub const fn init() -> Self {
        Self(0)
    }

    /// The last view. It has no successor, so no replica ever votes or proposes in it.
    pub const fn max() -> Self {
        Self(u64::MAX)
    }

    /// Get the `u64` value of this `ViewNumber`.
    pub const fn int(&self) -> u64 {
        self.0
    }

    pub fn to_le_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl Display for ViewNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// View numbers arrive over the network, so additions saturate at [`ViewNumber::max`] rather than
/// overflow.
impl Add<u64> for ViewNumber {
    type Output = ViewNumber;
    fn add(self, rhs: u64) -> Self::Output {
        ViewNumber(self.0.saturating_add(rhs))
    }
}

impl AddAssign<u64> for ViewNumber {
    fn add_assign(&mut self, rhs: u64) {
        self.0 = self.0.saturating_add(rhs)
    }
}

/// Ordinal index of a replica in the static replica list.
///
/// The index doubles as the replica's protocol identity: it decides which views the replica leads
/// and is attached to every vote the replica sends.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize,
)]
pub struct ReplicaId(u32);

impl ReplicaId {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }

    /// Position of this replica in the replica list.
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl Display for ReplicaId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Ordinal index of a client in the static client list.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BorshSerialize, BorshDeserialize,
)]
pub struct ClientId(u32);

impl ClientId {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Logical id of a client request.
///
/// Clients stamp their requests with strictly increasing timestamps starting at 1, and match replies
/// against outstanding requests by timestamp. Timestamp 0 marks requests synthesized by replicas
/// themselves (no-ops and placeholders); those are never replied to.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BorshSerialize, BorshDeserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// The timestamp carried by replica-synthesized requests.
    pub const fn synthetic() -> Self {
        Self(0)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }

    pub const fn is_synthetic(&self) -> bool {
        self.0 == 0
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Opaque client command. Replicas never interpret it; "executing" an operation means returning it
/// verbatim as the result.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BorshSerialize, BorshDeserialize)]
pub struct Operation(Vec<u8>);

impl Operation {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<&str> for Operation {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for Operation {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl From<Vec<u8>> for Operation {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl Debug for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Operation({:?})", String::from_utf8_lossy(&self.0))
    }
}

/// 32-byte identifier of a [`LogNode`](super::node::LogNode).
///
/// # Derivation
///
/// A node id is the SHA256 hash of the node's view number (little-endian), a single space, and the
/// bytes of the node's operation. The parent of the node is *not* part of the hash, so two nodes
/// proposed in the same view for the same operation share an id and occupy the same slot in the
/// [`NodeTree`](crate::node_tree::NodeTree).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The id that the genesis QC points to. No node in the tree ever has this id.
    pub const fn genesis() -> Self {
        Self([0u8; 32])
    }

    pub fn is_genesis(&self) -> bool {
        *self == Self::genesis()
    }

    /// Compute the id of a node proposed in `view` for `operation`.
    pub fn derive(view: ViewNumber, operation: &Operation) -> Self {
        let mut hasher = CryptoHasher::new();
        hasher.update(view.to_le_bytes());
        hasher.update(b" ");
        hasher.update(operation.bytes());
        Self(hasher.finalize().into())
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Ed25519 digital signature over a vote.
#[derive(Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    pub(crate) fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }
}

impl Debug for SignatureBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "SignatureBytes(..)")
    }
}

/// Maximum number of Byzantine replicas tolerated by a replica set of size `n`, i.e. ⌊(n-1)/3⌋.
pub const fn max_faulty(n: usize) -> usize {
    n.saturating_sub(1) / 3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_depends_only_on_view_and_operation() {
        let op = Operation::from("op-A");
        assert_eq!(
            NodeId::derive(ViewNumber::new(3), &op),
            NodeId::derive(ViewNumber::new(3), &Operation::from("op-A"))
        );
        assert_ne!(
            NodeId::derive(ViewNumber::new(3), &op),
            NodeId::derive(ViewNumber::new(4), &op)
        );
        assert_ne!(
            NodeId::derive(ViewNumber::new(3), &op),
            NodeId::derive(ViewNumber::new(3), &Operation::from("op-B"))
        );
        assert!(!NodeId::derive(ViewNumber::new(1), &op).is_genesis());
    }

    #[test]
    fn max_faulty_matches_byzantine_bound() {
        assert_eq!(max_faulty(1), 0);
        assert_eq!(max_faulty(3), 0);
        assert_eq!(max_faulty(4), 1);
        assert_eq!(max_faulty(6), 1);
        assert_eq!(max_faulty(7), 2);
        assert_eq!(max_faulty(10), 3);
    }

    #[test]
    fn view_arithmetic_saturates() {
        assert_eq!(ViewNumber::new(4) + 1, ViewNumber::new(5));
        assert_eq!(ViewNumber::max() + 1, ViewNumber::max());

        let mut view = ViewNumber::new(u64::MAX - 1);
        view += 3;
        assert_eq!(view, ViewNumber::max());
    }
}
