/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The safety rule and the commit rule of chained HotStuff, as pure functions over the
//! [`NodeTree`] and the replica's two watermark QCs.
//!
//! # Safety rule
//!
//! [`safe_node`] decides **whether** a replica may vote for a node. A replica votes for `node` only
//! if either:
//! 1. `node` extends the node certified by the replica's `locked_qc` (safety), or
//! 2. `node.justify` is newer than `locked_qc` (liveness): a quorum has moved on past the lock, so
//!    the lock can no longer protect a conflicting commit.
//!
//! # Commit rule
//!
//! [`walk_chain`] decides **what** a node causes to happen when it is delivered. Starting at the
//! delivered node, it follows `justify` pointers back three times:
//!
//! ```text
//! node ──justify──▶ precommit ──justify──▶ commit ──justify──▶ decide
//! ```
//!
//! Each step only counts if the node the pointer comes from is a direct child (by `parent`) of the
//! node it points to:
//! - If `node.parent == precommit.id`, `node.justify` becomes the new generic QC.
//! - If additionally `precommit.parent == commit.id`, `precommit.justify` becomes the new locked QC.
//! - If additionally `commit.parent == decide.id`, `decide` is committed and executed.
//!
//! A missing ancestor or a broken parent link stops the walk at that step. This happens routinely
//! around view changes and is not an error.

use crate::{
    node_tree::NodeTree,
    types::{certificates::QuorumCertificate, node::LogNode},
};

/// Whether it is safe for a replica locked on `locked_qc` to vote for `node`, justified by `qc`.
///
/// The "extends" half of the rule walks `node`'s stored ancestry. A parent link that points at
/// `locked_qc.node_id` counts even when the locked node itself is not stored, which is always the
/// case for the genesis QC.
pub(crate) fn safe_node(
    node: &LogNode,
    qc: &QuorumCertificate,
    locked_qc: &QuorumCertificate,
    node_tree: &NodeTree,
) -> bool {
    let extends_locked = node.parent == locked_qc.node_id
        || node_tree
            .branch(node.parent)
            .any(|ancestor| ancestor.parent == locked_qc.node_id);

    extends_locked || qc.view > locked_qc.view
}

/// The state updates that delivering a node triggers, as computed by [`walk_chain`].
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ChainWalk<'a> {
    pub(crate) generic_qc: Option<QuorumCertificate>,
    pub(crate) locked_qc: Option<QuorumCertificate>,
    pub(crate) decided: Option<&'a LogNode>,
}

/// Compute the generic QC, locked QC, and decided node that delivering `node` yields.
///
/// Each field is only set if the one before it is. The caller is responsible for discarding QCs that
/// are not newer than the ones it already holds.
pub(crate) fn walk_chain<'a>(node: &LogNode, node_tree: &'a NodeTree) -> ChainWalk<'a> {
    let mut walk = ChainWalk::default();

    let Some(precommit) = node_tree.get(&node.justify.node_id) else {
        return walk;
    };
    if node.parent != precommit.id {
        return walk;
    }
    walk.generic_qc = Some(node.justify);

    let Some(commit) = node_tree.get(&precommit.justify.node_id) else {
        return walk;
    };
    if precommit.parent != commit.id {
        return walk;
    }
    walk.locked_qc = Some(precommit.justify);

    let Some(decide) = node_tree.get(&commit.justify.node_id) else {
        return walk;
    };
    if commit.parent == decide.id {
        walk.decided = Some(decide);
    }
    walk
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        data_types::{ClientId, NodeId, Timestamp, ViewNumber},
        node::ClientRequest,
    };

    fn request(op: &str) -> ClientRequest {
        ClientRequest::new(op, Timestamp::new(1), ClientId::new(0))
    }

    /// Build a direct chain of nodes in views 1, 2, ..., each justified by a QC for its parent.
    fn chain(node_tree: &mut NodeTree, ops: &[&str]) -> Vec<LogNode> {
        let mut nodes: Vec<LogNode> = Vec::new();
        for (i, op) in ops.iter().enumerate() {
            let justify = nodes
                .last()
                .map(|parent| QuorumCertificate::new(parent.view, parent.id))
                .unwrap_or_default();
            let (_, leaf) = node_tree.create_leaf(
                ViewNumber::new(i as u64 + 1),
                justify.node_id,
                request(op),
                justify,
            );
            nodes.push(leaf);
        }
        nodes
    }

    fn qc_for(node: &LogNode) -> QuorumCertificate {
        QuorumCertificate::new(node.view, node.id)
    }

    #[test]
    fn every_node_extending_genesis_is_safe_under_genesis_lock() {
        let mut tree = NodeTree::new();
        let nodes = chain(&mut tree, &["a", "b", "c"]);
        let genesis = QuorumCertificate::genesis_qc();
        for node in &nodes {
            assert!(safe_node(node, &node.justify, &genesis, &tree));
        }
    }

    #[test]
    fn node_extending_locked_branch_is_safe() {
        let mut tree = NodeTree::new();
        let nodes = chain(&mut tree, &["a", "b", "c", "d"]);
        let locked = qc_for(&nodes[1]);

        // d extends b through c, even though d's justify is not newer than the lock.
        let stale_justify = qc_for(&nodes[0]);
        assert!(safe_node(&nodes[3], &stale_justify, &locked, &tree));
    }

    #[test]
    fn conflicting_node_needs_newer_justify() {
        let mut tree = NodeTree::new();
        let nodes = chain(&mut tree, &["a", "b", "c"]);
        let locked = qc_for(&nodes[2]);

        // A fork off `a`, proposed in view 5.
        let (_, fork) = tree.create_leaf(
            ViewNumber::new(5),
            nodes[0].id,
            request("fork"),
            qc_for(&nodes[0]),
        );
        assert!(!safe_node(&fork, &fork.justify, &locked, &tree));

        let newer = QuorumCertificate::new(ViewNumber::new(4), NodeId::genesis());
        assert!(safe_node(&fork, &newer, &locked, &tree));
    }

    #[test]
    fn parent_equal_to_unstored_locked_node_is_safe() {
        let tree = NodeTree::new();
        let locked_id = NodeId::derive(ViewNumber::new(3), &"gone".into());
        let locked = QuorumCertificate::new(ViewNumber::new(3), locked_id);
        let node = LogNode::new(ViewNumber::new(4), locked_id, request("x"), locked);
        assert!(safe_node(&node, &QuorumCertificate::genesis_qc(), &locked, &tree));
    }

    #[test]
    fn walk_chain_advances_one_phase_per_link() {
        let mut tree = NodeTree::new();
        let nodes = chain(&mut tree, &["a", "b", "c", "d"]);

        // a is justified by the genesis QC, which names no stored node.
        assert_eq!(walk_chain(&nodes[0], &tree), ChainWalk::default());

        let walk = walk_chain(&nodes[1], &tree);
        assert_eq!(walk.generic_qc, Some(qc_for(&nodes[0])));
        assert_eq!(walk.locked_qc, None);

        let walk = walk_chain(&nodes[2], &tree);
        assert_eq!(walk.generic_qc, Some(qc_for(&nodes[1])));
        assert_eq!(walk.locked_qc, Some(qc_for(&nodes[0])));
        assert_eq!(walk.decided, None);

        let walk = walk_chain(&nodes[3], &tree);
        assert_eq!(walk.generic_qc, Some(qc_for(&nodes[2])));
        assert_eq!(walk.locked_qc, Some(qc_for(&nodes[1])));
        assert_eq!(walk.decided, Some(&nodes[0]));
    }

    #[test]
    fn view_gap_breaks_the_chain() {
        let mut tree = NodeTree::new();
        let nodes = chain(&mut tree, &["a", "b"]);

        // Leader of view 4 extends b, with a placeholder filling view 3.
        let (placeholders, leaf) =
            tree.create_leaf(ViewNumber::new(4), nodes[1].id, request("c"), qc_for(&nodes[1]));
        assert_eq!(placeholders.len(), 1);

        assert_eq!(walk_chain(&leaf, &tree), ChainWalk::default());
    }
}
