//! Partially-Materialized Token Tree
//!
//! The store owns the prompt and every node fetched so far. It knows nothing
//! about navigation or fetching: callers hand it wire nodes and it merges them
//! append-only, keeping these invariants:
//!
//! 1. Sibling order is the order the backend first returned; merges only append
//! 2. Ids are unique within a sibling list; repeated ids are dropped
//! 3. `cumulative_probability = parent.cumulative_probability * probability`,
//!    with the prompt itself counting as 1.0
//! 4. `children: None` means "not fetched", `Some(vec![])` means "fetched, empty"
//!
//! Lookups never fail. A level that is not loaded reads as an empty slice and a
//! node that is not loaded reads as `None`; partial loading is the steady state.

use crate::backend::WireNode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

/// Backend token identifier
pub type TokenId = u32;

// ============================================================================
// Core Types
// ============================================================================

/// One candidate continuation with its conditional and cumulative probability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub id: TokenId,
    pub text: String,
    pub probability: f64,
    pub cumulative_probability: f64,
    /// `None` until the backend has been asked for this node's children
    pub children: Option<Vec<TreeNode>>,
}

impl TreeNode {
    fn from_wire(wire: WireNode, parent_cumulative: f64) -> Self {
        let mut node = TreeNode {
            id: wire.id,
            cumulative_probability: parent_cumulative * wire.probability,
            probability: wire.probability,
            text: wire.text,
            children: None,
        };
        if let Some(nested) = wire.children {
            let cumulative = node.cumulative_probability;
            merge_level(node.children.get_or_insert_with(Vec::new), nested, cumulative);
        }
        node
    }

    pub fn is_loaded(&self) -> bool {
        self.children.is_some()
    }

    /// Number of loaded children (0 when not fetched)
    pub fn loaded_children(&self) -> usize {
        self.children.as_ref().map_or(0, Vec::len)
    }

    pub fn children(&self) -> &[TreeNode] {
        self.children.as_deref().unwrap_or(&[])
    }
}

/// The session tree: prompt plus the root level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    /// Prompt as the user typed it (sent on root growth)
    pub prompt: String,
    /// Prompt as the backend formatted it (sent on depth expansion)
    pub prompt_text: String,
    pub roots: Vec<TreeNode>,
}

/// One step of a path: the sibling index chosen and the id found there
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathSegment {
    pub index: usize,
    pub id: TokenId,
}

/// Sequence of chosen siblings from the root to a position
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Path {
    segments: Vec<PathSegment>,
}

impl Path {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn last(&self) -> Option<&PathSegment> {
        self.segments.last()
    }

    pub fn push(&mut self, segment: PathSegment) {
        self.segments.push(segment);
    }

    pub fn pop(&mut self) -> Option<PathSegment> {
        self.segments.pop()
    }

    pub fn ids(&self) -> Vec<TokenId> {
        self.segments.iter().map(|s| s.id).collect()
    }

    pub fn key(&self) -> PathKey {
        PathKey(self.ids())
    }
}

impl From<Vec<PathSegment>> for Path {
    fn from(segments: Vec<PathSegment>) -> Self {
        Self { segments }
    }
}

/// Ordered node ids along a path; the wire form is comma-joined (`"12,7,301"`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PathKey(Vec<TokenId>);

impl PathKey {
    pub fn new(ids: Vec<TokenId>) -> Self {
        Self(ids)
    }

    pub fn ids(&self) -> &[TokenId] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, id: TokenId) -> PathKey {
        let mut ids = self.0.clone();
        ids.push(id);
        PathKey(ids)
    }

    /// Split into (parent ids, own id); `None` for the empty key
    pub fn split_last(&self) -> Option<(&[TokenId], TokenId)> {
        self.0.split_last().map(|(last, parent)| (parent, *last))
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, id) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{id}")?;
        }
        Ok(())
    }
}

impl FromStr for PathKey {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Ok(PathKey::default());
        }
        s.split(',')
            .map(|part| part.trim().parse::<TokenId>())
            .collect::<Result<Vec<_>, _>>()
            .map(PathKey)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("tree already initialized for prompt {prompt:?}")]
    AlreadyInitialized { prompt: String },
}

// ============================================================================
// Tree Store
// ============================================================================

/// Owner of the partially loaded tree for one exploration session
#[derive(Debug, Default)]
pub struct TreeStore {
    tree: Option<Tree>,
}

impl TreeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the root state. Returns the number of roots kept.
    pub fn initialize(
        &mut self,
        prompt: &str,
        prompt_text: &str,
        roots: Vec<WireNode>,
    ) -> Result<usize, StoreError> {
        if let Some(tree) = &self.tree {
            return Err(StoreError::AlreadyInitialized {
                prompt: tree.prompt.clone(),
            });
        }

        let mut level = Vec::with_capacity(roots.len());
        merge_level(&mut level, roots, 1.0);
        let width = level.len();
        self.tree = Some(Tree {
            prompt: prompt.to_string(),
            prompt_text: prompt_text.to_string(),
            roots: level,
        });
        Ok(width)
    }

    /// Discard the tree so a new prompt can be started
    pub fn reset(&mut self) -> Option<Tree> {
        self.tree.take()
    }

    pub fn is_initialized(&self) -> bool {
        self.tree.is_some()
    }

    pub fn tree(&self) -> Option<&Tree> {
        self.tree.as_ref()
    }

    pub fn prompt(&self) -> Option<&str> {
        self.tree.as_ref().map(|t| t.prompt.as_str())
    }

    pub fn prompt_text(&self) -> Option<&str> {
        self.tree.as_ref().map(|t| t.prompt_text.as_str())
    }

    pub fn roots(&self) -> &[TreeNode] {
        self.tree.as_ref().map_or(&[], |t| t.roots.as_slice())
    }

    // ========================================================================
    // Merges
    // ========================================================================

    /// Append unseen root ids. Returns the root count after the merge.
    pub fn merge_roots(&mut self, incoming: Vec<WireNode>) -> usize {
        match self.tree.as_mut() {
            Some(tree) => {
                merge_level(&mut tree.roots, incoming, 1.0);
                tree.roots.len()
            }
            None => 0,
        }
    }

    /// Append unseen ids to the children of the node at `parent ++ [node_id]`,
    /// setting the list when it was never fetched. Returns the merged list,
    /// empty when the node is not in the tree.
    pub fn merge_children(
        &mut self,
        parent: &[TokenId],
        node_id: TokenId,
        incoming: Vec<WireNode>,
    ) -> &[TreeNode] {
        let mut ids = parent.to_vec();
        ids.push(node_id);
        match self.node_by_ids_mut(&ids) {
            Some(node) => {
                let cumulative = node.cumulative_probability;
                let children = node.children.get_or_insert_with(Vec::new);
                merge_level(children, incoming, cumulative);
                children.as_slice()
            }
            None => &[],
        }
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// The level whose parent is the node at `path` (the roots for an empty path)
    pub fn level_at(&self, path: &Path) -> &[TreeNode] {
        if path.is_root() {
            return self.roots();
        }
        self.node(path).map_or(&[], TreeNode::children)
    }

    /// The level holding the node at `path`, itself included (the roots for
    /// an empty path)
    pub fn siblings_of(&self, path: &Path) -> &[TreeNode] {
        let mut parent = path.clone();
        parent.pop();
        self.level_at(&parent)
    }

    /// The node at the full path
    pub fn node(&self, path: &Path) -> Option<&TreeNode> {
        let mut level = self.roots();
        let mut found = None;
        for segment in path.segments() {
            let node = level
                .get(segment.index)
                .filter(|n| n.id == segment.id)
                .or_else(|| level.iter().find(|n| n.id == segment.id))?;
            level = node.children();
            found = Some(node);
        }
        found
    }

    /// The node addressed by a sequence of ids from the root
    pub fn node_by_ids(&self, ids: &[TokenId]) -> Option<&TreeNode> {
        let mut level = self.roots();
        let mut found = None;
        for id in ids {
            let node = level.iter().find(|n| n.id == *id)?;
            level = node.children();
            found = Some(node);
        }
        found
    }

    /// Children of the node addressed by `ids` (the roots for no ids)
    pub fn level_by_ids(&self, ids: &[TokenId]) -> &[TreeNode] {
        if ids.is_empty() {
            return self.roots();
        }
        self.node_by_ids(ids).map_or(&[], TreeNode::children)
    }

    fn node_by_ids_mut(&mut self, ids: &[TokenId]) -> Option<&mut TreeNode> {
        let (first, rest) = ids.split_first()?;
        let tree = self.tree.as_mut()?;
        let mut node = tree.roots.iter_mut().find(|n| n.id == *first)?;
        for id in rest {
            node = node.children.as_mut()?.iter_mut().find(|n| n.id == *id)?;
        }
        Some(node)
    }
}

/// Append-only merge of one sibling list. Existing ids keep their position;
/// nested children they carry are merged one level down with the same rules.
fn merge_level(level: &mut Vec<TreeNode>, incoming: Vec<WireNode>, parent_cumulative: f64) {
    for wire in incoming {
        if !wire.probability.is_finite() || !(0.0..=1.0).contains(&wire.probability) {
            tracing::warn!(
                token_id = wire.id,
                probability = wire.probability,
                "dropping node with out-of-range probability"
            );
            continue;
        }

        match level.iter_mut().find(|n| n.id == wire.id) {
            Some(existing) => {
                if let Some(nested) = wire.children {
                    let cumulative = existing.cumulative_probability;
                    merge_level(
                        existing.children.get_or_insert_with(Vec::new),
                        nested,
                        cumulative,
                    );
                }
            }
            None => level.push(TreeNode::from_wire(wire, parent_cumulative)),
        }
    }
}
