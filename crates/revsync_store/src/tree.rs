//! Per-document revision trees.
//!
//! A tree is an append-only arena of nodes keyed by revision ID. Parent links
//! are revision IDs, not indices, so nodes never borrow each other. Nodes are
//! never modified after insertion; only an explicit purge rebuilds the arena.

use revsync_protocol::{AttachmentRef, Properties, RevId, Revision};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// A node of a revision tree.
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionNode {
    /// Revision ID.
    pub rev_id: RevId,
    /// Parent revision ID.
    pub parent: Option<RevId>,
    /// Tombstone marker.
    pub deleted: bool,
    /// Local sequence; 0 for stubs.
    pub sequence: u64,
    /// Body, or `None` for a stub standing in for known-but-unfetched history.
    pub body: Option<Properties>,
    /// Attachments referenced by this revision.
    pub attachments: Vec<AttachmentRef>,
}

impl RevisionNode {
    /// Builds a node from a revision.
    pub fn from_revision(revision: &Revision) -> Self {
        Self {
            rev_id: revision.rev_id.clone(),
            parent: revision.parent.clone(),
            deleted: revision.deleted,
            sequence: revision.sequence,
            body: Some(revision.properties.clone()),
            attachments: revision.attachments.clone(),
        }
    }

    fn stub(rev_id: RevId, parent: Option<RevId>) -> Self {
        Self {
            rev_id,
            parent,
            deleted: false,
            sequence: 0,
            body: None,
            attachments: Vec::new(),
        }
    }

    /// Returns true if this node has no body.
    pub fn is_stub(&self) -> bool {
        self.body.is_none()
    }

    /// Materializes the node as a revision of `doc_id`.
    pub fn to_revision(&self, doc_id: &str) -> Revision {
        let mut revision = Revision::new(doc_id, self.rev_id.clone(), self.parent.clone())
            .with_deleted(self.deleted)
            .with_attachments(self.attachments.clone());
        if let Some(body) = &self.body {
            revision.properties = body.clone();
        }
        revision.sequence = self.sequence;
        revision
    }
}

/// Winner ordering among leaves: live before deleted, then by revision ID.
fn leaf_rank(a: &RevisionNode, b: &RevisionNode) -> Ordering {
    (!a.deleted)
        .cmp(&!b.deleted)
        .then_with(|| a.rev_id.cmp(&b.rev_id))
}

/// The revision tree of one document.
#[derive(Debug, Clone, Default)]
pub struct RevisionTree {
    nodes: Vec<RevisionNode>,
    index: HashMap<RevId, usize>,
    children: Vec<usize>,
}

impl RevisionTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of nodes, stubs included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the tree has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns true if the revision is in the tree, as a stub or in full.
    pub fn contains(&self, rev_id: &RevId) -> bool {
        self.index.contains_key(rev_id)
    }

    /// Returns a node by revision ID.
    pub fn get(&self, rev_id: &RevId) -> Option<&RevisionNode> {
        self.index.get(rev_id).map(|&i| &self.nodes[i])
    }

    /// Returns true if the revision exists and has no children.
    pub fn is_leaf(&self, rev_id: &RevId) -> bool {
        self.index
            .get(rev_id)
            .is_some_and(|&i| self.children[i] == 0)
    }

    /// Iterates over the leaf nodes.
    pub fn leaves(&self) -> impl Iterator<Item = &RevisionNode> {
        self.nodes
            .iter()
            .zip(&self.children)
            .filter(|(node, &children)| children == 0 && !node.is_stub())
            .map(|(node, _)| node)
    }

    /// Iterates over leaves that are not tombstones.
    pub fn live_leaves(&self) -> impl Iterator<Item = &RevisionNode> {
        self.leaves().filter(|node| !node.deleted)
    }

    /// Returns the current revision.
    ///
    /// Live leaves win over tombstones; among equals the higher generation
    /// wins, then the lexicographically greater digest.
    pub fn winner(&self) -> Option<&RevisionNode> {
        self.leaves().max_by(|a, b| leaf_rank(a, b))
    }

    /// Returns the live leaves other than the winner, best first.
    pub fn conflicting_leaves(&self) -> Vec<&RevisionNode> {
        let winner = self.winner().map(|w| w.rev_id.clone());
        let mut others: Vec<&RevisionNode> = self
            .live_leaves()
            .filter(|node| Some(&node.rev_id) != winner.as_ref())
            .collect();
        others.sort_by(|a, b| leaf_rank(b, a));
        others
    }

    /// Returns true if more than one leaf is live.
    pub fn is_conflicted(&self) -> bool {
        self.live_leaves().nth(1).is_some()
    }

    /// Returns the ancestry of a revision, newest first, starting with itself.
    pub fn history(&self, rev_id: &RevId) -> Vec<RevId> {
        let mut history = Vec::new();
        let mut cursor = self.get(rev_id);
        while let Some(node) = cursor {
            history.push(node.rev_id.clone());
            cursor = node.parent.as_ref().and_then(|p| self.get(p));
        }
        history
    }

    /// Returns the nearest revision both arguments descend from.
    pub fn common_ancestor(&self, a: &RevId, b: &RevId) -> Option<RevId> {
        let ancestors: HashSet<RevId> = self.history(a).into_iter().collect();
        self.history(b)
            .into_iter()
            .find(|rev_id| ancestors.contains(rev_id))
    }

    /// Appends a node. The parent, if any, must already be present.
    pub fn insert(&mut self, node: RevisionNode) -> bool {
        if self.contains(&node.rev_id) {
            return false;
        }
        if let Some(parent) = &node.parent {
            match self.index.get(parent) {
                Some(&p) => self.children[p] += 1,
                None => return false,
            }
        }
        self.index.insert(node.rev_id.clone(), self.nodes.len());
        self.nodes.push(node);
        self.children.push(0);
        true
    }

    /// Appends a node together with any ancestors it names that are missing.
    ///
    /// `history` lists the node's ancestry newest first, starting with the
    /// node itself. Unknown ancestors become stubs. Returns the number of
    /// stubs created.
    pub fn insert_with_history(&mut self, mut node: RevisionNode, history: &[RevId]) -> usize {
        let mut stubs = 0;
        for i in (1..history.len()).rev() {
            if !self.contains(&history[i]) {
                let parent = history.get(i + 1).cloned();
                if self.insert(RevisionNode::stub(history[i].clone(), parent)) {
                    stubs += 1;
                }
            }
        }
        node.parent = history.get(1).cloned();
        self.insert(node);
        stubs
    }

    /// Returns `rev_id` and its descendants if every descendant is a
    /// tombstone, i.e. the revision is a leaf or a closed branch.
    fn closed_branch(&self, rev_id: &RevId) -> Option<Vec<RevId>> {
        let root = self.get(rev_id)?;
        let mut members: HashSet<&RevId> = HashSet::from([&root.rev_id]);
        // Parents always precede their children in the arena.
        for node in &self.nodes {
            let Some(parent) = &node.parent else {
                continue;
            };
            if members.contains(parent) && !members.contains(&node.rev_id) {
                if !node.deleted {
                    return None;
                }
                members.insert(&node.rev_id);
            }
        }
        Some(members.into_iter().cloned().collect())
    }

    /// Removes the named revisions, then any stubs left without descendants.
    ///
    /// A named revision is removed only if it is a leaf or everything below
    /// it is a tombstone, in which case the tombstones go with it. Returns
    /// the full revisions removed.
    pub fn purge(&mut self, rev_ids: &[RevId]) -> Vec<RevId> {
        let mut doomed: HashSet<RevId> = HashSet::new();
        for rev_id in rev_ids {
            if let Some(branch) = self.closed_branch(rev_id) {
                doomed.extend(branch);
            }
        }
        let purged: Vec<RevId> = self
            .nodes
            .iter()
            .filter(|n| doomed.contains(&n.rev_id) && !n.is_stub())
            .map(|n| n.rev_id.clone())
            .collect();
        if doomed.is_empty() {
            return purged;
        }

        let mut children = self.children.clone();
        let mut frontier: Vec<RevId> = doomed.iter().cloned().collect();
        while let Some(rev_id) = frontier.pop() {
            let Some(parent) = self.get(&rev_id).and_then(|n| n.parent.clone()) else {
                continue;
            };
            if let Some(&p) = self.index.get(&parent) {
                children[p] -= 1;
                if children[p] == 0 && self.nodes[p].is_stub() && doomed.insert(parent.clone()) {
                    frontier.push(parent);
                }
            }
        }

        let kept: Vec<RevisionNode> = std::mem::take(&mut self.nodes)
            .into_iter()
            .filter(|n| !doomed.contains(&n.rev_id))
            .collect();
        *self = Self::new();
        for node in kept {
            self.insert(node);
        }
        purged
    }

    /// Iterates over all nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &RevisionNode> {
        self.nodes.iter()
    }
}
