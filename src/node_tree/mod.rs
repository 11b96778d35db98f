/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The in-memory log of a replica.
//!
//! # The Node Tree
//!
//! The Node Tree is an append-only, content-addressed map from [`NodeId`] to [`LogNode`]. Its edges
//! are the nodes' `parent` links, and it is rooted implicitly at the
//! [genesis QC](QuorumCertificate::genesis_qc): the first nodes ever proposed have the genesis id as
//! their parent, but no node with that id is ever stored.
//!
//! Nodes are never mutated once inserted. Because node ids are derived from the view and the
//! operation only, inserting a second node with the same id replaces the first; see
//! [`NodeId`](crate::types::data_types::NodeId#derivation).
//!
//! # Gap filling
//!
//! When a leader extends a parent whose view is more than one behind the current view, it first
//! [chains placeholder nodes](NodeTree::create_leaf) for every skipped view, so that the parent chain
//! of every leaf covers every view between the leaf and its certified ancestor. At most
//! [`MAX_PLACEHOLDERS`] are chained in front of one leaf.
//!
//! # Persistence
//!
//! The tree lives only in memory and is lost when the process exits.

use std::collections::HashMap;

use crate::types::{
    certificates::QuorumCertificate,
    data_types::{NodeId, Operation, ViewNumber},
    node::{ClientRequest, LogNode, DUMMY_OPERATION},
};

/// Most placeholders chained in front of a single leaf. A leaf whose parent is further behind extends
/// the parent directly.
pub const MAX_PLACEHOLDERS: u64 = 256;

/// Content-addressed store of all log nodes known to a replica.
#[derive(Default)]
pub struct NodeTree {
    nodes: HashMap<NodeId, LogNode>,
    last: Option<NodeId>,
}

impl NodeTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new leaf proposed in `cur_view` that extends `parent` and is justified by `justify`,
    /// and insert it.
    ///
    /// If `parent` is stored and its view is more than one behind `cur_view`, a placeholder node is
    /// first inserted for each skipped view, each one justified by the genesis QC and each one the
    /// parent of the next. The leaf then extends the last placeholder. The genesis id counts as a
    /// parent in view 0. A parent that is not stored, or that would need more than
    /// [`MAX_PLACEHOLDERS`], is extended directly.
    ///
    /// Returns the placeholders that were inserted (lowest view first), and the leaf.
    pub fn create_leaf(
        &mut self,
        cur_view: ViewNumber,
        parent: NodeId,
        request: ClientRequest,
        justify: QuorumCertificate,
    ) -> (Vec<LogNode>, LogNode) {
        let placeholders = match self.view_of(&parent) {
            Some(parent_view) => placeholder_chain(parent, parent_view, cur_view),
            None => Vec::new(),
        };
        for placeholder in &placeholders {
            self.insert(placeholder.clone());
        }

        let parent = placeholders.last().map_or(parent, |placeholder| placeholder.id);
        let leaf = LogNode::new(cur_view, parent, request, justify);
        self.insert(leaf.clone());
        (placeholders, leaf)
    }

    /// Rebuild and insert the placeholders that the leader who proposed `node` inserted before creating
    /// it, if they are missing.
    ///
    /// Leaders only send the leaf, but the placeholders are fully determined by the leaf's view and
    /// its justify (whose node is the parent the leader extended). Nothing is built unless
    /// `node.parent` is the placeholder of the view right before `node`, and the gap is one a leader
    /// would have filled. The placeholders are only inserted if the rebuilt chain ends at
    /// `node.parent`. Returns the placeholders that were inserted.
    pub fn restore_placeholders(&mut self, node: &LogNode) -> Vec<LogNode> {
        if self.contains(&node.parent) {
            return Vec::new();
        }
        let Some(last_gap_view) = node.view.int().checked_sub(1) else {
            return Vec::new();
        };
        let last_placeholder = NodeId::derive(
            ViewNumber::new(last_gap_view),
            &Operation::from(DUMMY_OPERATION),
        );
        if last_placeholder != node.parent {
            return Vec::new();
        }
        let base = node.justify.node_id;
        let Some(base_view) = self.view_of(&base) else {
            return Vec::new();
        };

        let placeholders = placeholder_chain(base, base_view, node.view);
        if placeholders.last().map(|placeholder| placeholder.id) != Some(node.parent) {
            return Vec::new();
        }
        for placeholder in &placeholders {
            self.insert(placeholder.clone());
        }
        placeholders
    }

    /// Insert `node`, replacing any node with the same id.
    pub fn insert(&mut self, node: LogNode) {
        self.nodes.insert(node.id, node);
    }

    pub fn get(&self, id: &NodeId) -> Option<&LogNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// The view of the node with id `id`. The genesis id counts as a node in view 0.
    fn view_of(&self, id: &NodeId) -> Option<ViewNumber> {
        if id.is_genesis() {
            Some(ViewNumber::init())
        } else {
            self.get(id).map(|node| node.view)
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Remember `id` as the most recently created or received node.
    pub fn record_last(&mut self, id: NodeId) {
        self.last = Some(id);
    }

    /// The most recently recorded node, if it is stored.
    pub fn last(&self) -> Option<&LogNode> {
        self.last.as_ref().and_then(|id| self.get(id))
    }

    /// Iterate over the stored nodes on the branch ending at `tip`: `tip` itself, then its parent,
    /// and so on, stopping at the first id that is not stored.
    pub fn branch(&self, tip: NodeId) -> Branch<'_> {
        Branch {
            tree: self,
            next: Some(tip),
            remaining: self.nodes.len(),
        }
    }

    /// Up to `k` nodes on the branch ending at the [last](Self::last) node, newest first.
    pub fn recent(&self, k: usize) -> Vec<LogNode> {
        match self.last {
            Some(last) => self.branch(last).take(k).cloned().collect(),
            None => Vec::new(),
        }
    }
}

/// Placeholders for every view strictly between `parent_view` and `view`, the first one extending
/// `parent` and each following one extending the one before. Empty if there are more than
/// [`MAX_PLACEHOLDERS`] such views.
fn placeholder_chain(parent: NodeId, parent_view: ViewNumber, view: ViewNumber) -> Vec<LogNode> {
    let gap = view.int().saturating_sub(parent_view.int()).saturating_sub(1);
    if gap > MAX_PLACEHOLDERS {
        return Vec::new();
    }
    let mut placeholders: Vec<LogNode> = Vec::with_capacity(gap as usize);
    let mut gap_view = parent_view + 1;
    while gap_view < view {
        let parent = placeholders.last().map_or(parent, |placeholder| placeholder.id);
        placeholders.push(LogNode::placeholder(gap_view, parent));
        gap_view += 1;
    }
    placeholders
}

/// Iterator returned by [`NodeTree::branch`].
///
/// Ids only depend on view and operation, so a Byzantine leader can make parent links loop back on
/// themselves. The walk is therefore capped at the number of stored nodes.
pub struct Branch<'a> {
    tree: &'a NodeTree,
    next: Option<NodeId>,
    remaining: usize,
}

impl<'a> Iterator for Branch<'a> {
    type Item = &'a LogNode;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let node = self.tree.get(&self.next?)?;
        self.remaining -= 1;
        self.next = Some(node.parent);
        Some(node)
    }
}
