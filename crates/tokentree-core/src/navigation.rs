//! Navigation Controller: cursor state machine over the partially loaded tree
//!
//! The controller is either `Idle` or `AwaitingData`. Moves inside the loaded
//! width complete immediately. Moves past it (and descents into unloaded
//! nodes) block on one fetch through the coordinator, then re-read the store:
//! the cursor only moves if the data actually arrived. A move that cannot be
//! satisfied returns `Transition::Blocked` and leaves the state untouched.
//!
//! Every change is published as a `NavigationSnapshot` on a watch channel so
//! background work can re-read the current position after each await.

use crate::backend::ExpandTarget;
use crate::config::ExplorerConfig;
use crate::fetch::{FetchCoordinator, SharedStore};
use crate::tree::{Path, PathSegment, TokenId, TreeNode};
use serde::Serialize;
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NavPhase {
    Idle,
    AwaitingData,
}

/// Cursor position: the level is addressed by `path`, the entry by `index`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NavigationState {
    pub path: Path,
    pub index: usize,
    /// Always `index / page_width`
    pub page: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NavigationSnapshot {
    pub state: NavigationState,
    pub phase: NavPhase,
}

/// Outcome of a navigation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Transition {
    /// Session just started at the first root
    Started,
    /// Index changed within the same page
    Moved,
    /// Index changed and crossed into another page
    PageChanged { from: usize, to: usize },
    Descended,
    Ascended,
    /// The request could not be satisfied; nothing changed
    Blocked,
}

impl Transition {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Transition::Blocked)
    }
}

/// Position at a level before descending out of it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SavedPosition {
    index: usize,
    page: usize,
}

pub struct NavigationController {
    config: ExplorerConfig,
    fetch: Arc<FetchCoordinator>,
    state: NavigationState,
    phase: NavPhase,
    saved: Vec<SavedPosition>,
    published: watch::Sender<NavigationSnapshot>,
}

impl NavigationController {
    pub fn new(config: ExplorerConfig, fetch: Arc<FetchCoordinator>) -> Self {
        let state = NavigationState::default();
        let (published, _) = watch::channel(NavigationSnapshot {
            state: state.clone(),
            phase: NavPhase::Idle,
        });
        Self {
            config,
            fetch,
            state,
            phase: NavPhase::Idle,
            saved: Vec::new(),
            published,
        }
    }

    pub fn config(&self) -> &ExplorerConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedStore {
        self.fetch.store()
    }

    pub fn state(&self) -> &NavigationState {
        &self.state
    }

    pub fn phase(&self) -> NavPhase {
        self.phase
    }

    pub fn snapshot(&self) -> NavigationSnapshot {
        NavigationSnapshot {
            state: self.state.clone(),
            phase: self.phase,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<NavigationSnapshot> {
        self.published.subscribe()
    }

    fn publish(&self) {
        self.published.send_replace(self.snapshot());
    }

    fn set_phase(&mut self, phase: NavPhase) {
        self.phase = phase;
        self.publish();
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Move the cursor to `index` on the current level, growing the level
    /// first when `index` lies beyond what is loaded.
    pub async fn select_index(&mut self, index: usize) -> Transition {
        if index < self.loaded_width() {
            return self.move_to(index);
        }

        let Some(width) = self.config.width_for_index(index) else {
            tracing::debug!(index, "navigation blocked: index out of range");
            return Transition::Blocked;
        };
        self.set_phase(NavPhase::AwaitingData);
        if self.state.path.is_root() {
            self.fetch.ensure_root_width(width).await;
        } else if let Some(target) = ExpandTarget::from_key(&self.state.path.key()) {
            self.fetch.ensure_children(vec![target], width).await;
        }
        self.set_phase(NavPhase::Idle);

        let loaded = self.loaded_width();
        if index < loaded {
            self.move_to(index)
        } else {
            tracing::debug!(index, loaded, "navigation blocked: level has no more entries");
            Transition::Blocked
        }
    }

    pub async fn advance(&mut self) -> Transition {
        self.select_index(self.state.index + 1).await
    }

    pub async fn retreat(&mut self) -> Transition {
        match self.state.index.checked_sub(1) {
            Some(index) => self.select_index(index).await,
            None => Transition::Blocked,
        }
    }

    /// Step into the children of the node under the cursor, fetching them
    /// first if they were never loaded.
    pub async fn descend(&mut self) -> Transition {
        let (id, has_children) = {
            let store = self.fetch.store().read();
            match store.level_at(&self.state.path).get(self.state.index) {
                Some(node) => (node.id, node.loaded_children() > 0),
                None => return Transition::Blocked,
            }
        };

        let mut child_path = self.state.path.clone();
        child_path.push(PathSegment {
            index: self.state.index,
            id,
        });

        if !has_children {
            self.set_phase(NavPhase::AwaitingData);
            let target = ExpandTarget::new(self.state.path.ids(), id);
            self.fetch
                .ensure_children(vec![target], self.config.children_target())
                .await;
            self.set_phase(NavPhase::Idle);

            let loaded = self
                .fetch
                .store()
                .read()
                .node(&child_path)
                .map_or(0, TreeNode::loaded_children);
            if loaded == 0 {
                tracing::debug!(key = %child_path.key(), "descend blocked: no children available");
                return Transition::Blocked;
            }
        }

        self.saved.push(SavedPosition {
            index: self.state.index,
            page: self.state.page,
        });
        self.state = NavigationState {
            path: child_path,
            index: 0,
            page: 0,
        };
        self.publish();
        Transition::Descended
    }

    /// Return to the parent level at the position held before the descent
    pub fn ascend(&mut self) -> Transition {
        let Some(segment) = self.state.path.pop() else {
            return Transition::Blocked;
        };
        let restored = self.saved.pop().unwrap_or(SavedPosition {
            index: segment.index,
            page: self.config.page_of(segment.index),
        });
        self.state.index = restored.index;
        self.state.page = restored.page;
        self.publish();
        Transition::Ascended
    }

    fn move_to(&mut self, index: usize) -> Transition {
        let from = self.state.page;
        let to = self.config.page_of(index);
        self.state.index = index;
        self.state.page = to;
        self.publish();
        if from == to {
            Transition::Moved
        } else {
            Transition::PageChanged { from, to }
        }
    }

    // ========================================================================
    // Read Views
    // ========================================================================

    /// Width of the current level: the tracked root width at the root level,
    /// the loaded sibling count below it
    pub fn loaded_width(&self) -> usize {
        if self.state.path.is_root() {
            self.fetch.root_width()
        } else {
            self.fetch.store().read().level_at(&self.state.path).len()
        }
    }

    /// Indices shown for the current page: the page plus its separator entry
    pub fn visible_range(&self) -> Range<usize> {
        let start = self.state.page * self.config.page_width;
        let end = (start + self.config.children_target()).min(self.loaded_width());
        start..end.max(start)
    }

    pub fn current_level(&self) -> Vec<TreeNode> {
        self.fetch.store().read().level_at(&self.state.path).to_vec()
    }

    pub fn visible_nodes(&self) -> Vec<TreeNode> {
        let range = self.visible_range();
        let store = self.fetch.store().read();
        let level = store.level_at(&self.state.path);
        level
            .get(range.start..range.end.min(level.len()))
            .map(<[TreeNode]>::to_vec)
            .unwrap_or_default()
    }

    pub fn current_node(&self) -> Option<TreeNode> {
        self.fetch
            .store()
            .read()
            .level_at(&self.state.path)
            .get(self.state.index)
            .cloned()
    }

    /// Token ids from the root through the node under the cursor
    pub fn token_ids(&self) -> Vec<TokenId> {
        let mut ids = self.state.path.ids();
        if let Some(node) = self.current_node() {
            ids.push(node.id);
        }
        ids
    }

    /// Backend-formatted prompt followed by every token text down to the cursor
    pub fn full_text(&self) -> String {
        let store = self.fetch.store().read();
        let mut text = store.prompt_text().unwrap_or_default().to_string();
        let mut path = Path::root();
        for segment in self.state.path.segments() {
            path.push(*segment);
            if let Some(node) = store.node(&path) {
                text.push_str(&node.text);
            }
        }
        if let Some(node) = store.level_at(&self.state.path).get(self.state.index) {
            text.push_str(&node.text);
        }
        text
    }
}
