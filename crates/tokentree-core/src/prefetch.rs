//! Speculative background loading
//!
//! Runs after the controller settles. Three kinds of work:
//!
//! 1. **Depth lookahead**: for the visible page, walk each node's first-child
//!    chain `lookahead_depth` levels deep, one batched fetch per depth
//! 2. **Page lookahead**: grow the level to cover the next page, then apply
//!    depth lookahead to that page too
//! 3. **Neighbor batch**: children for the cursor and its neighbors, collected
//!    over a debounce window so a held key produces one fetch per burst
//!
//! Everything goes through the fetch coordinator, so background and foreground
//! requests deduplicate against each other. Failures stay inside the
//! coordinator; nothing here reports errors.

use crate::backend::ExpandTarget;
use crate::config::ExplorerConfig;
use crate::fetch::FetchCoordinator;
use crate::navigation::{NavPhase, NavigationSnapshot, NavigationState, Transition};
use crate::tree::{PathKey, TreeNode};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::hash::Hash;
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};

// ============================================================================
// Coalescer
// ============================================================================

/// Pending-item accumulator with a resettable deadline.
///
/// Each contribution bumps a generation counter. A waiter that wakes after
/// the window only flushes if no newer contribution arrived meanwhile, so
/// the last waiter of a burst takes everything the burst collected.
pub struct Coalescer<T> {
    inner: Mutex<CoalescerState<T>>,
}

struct CoalescerState<T> {
    generation: u64,
    pending: Vec<T>,
    seen: HashSet<T>,
}

impl<T: Clone + Eq + Hash> Coalescer<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CoalescerState {
                generation: 0,
                pending: Vec::new(),
                seen: HashSet::new(),
            }),
        }
    }

    /// Add items and return the generation that now owns the flush
    pub fn contribute(&self, items: impl IntoIterator<Item = T>) -> u64 {
        let mut state = self.inner.lock();
        for item in items {
            if state.seen.insert(item.clone()) {
                state.pending.push(item);
            }
        }
        state.generation += 1;
        state.generation
    }

    /// Drain the pending items if `generation` is still the latest
    pub fn take_if_current(&self, generation: u64) -> Option<Vec<T>> {
        let mut state = self.inner.lock();
        if state.generation != generation || state.pending.is_empty() {
            return None;
        }
        state.seen.clear();
        Some(std::mem::take(&mut state.pending))
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

impl<T: Clone + Eq + Hash> Default for Coalescer<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Worker
// ============================================================================

/// The part of the prefetcher that background tasks capture
#[derive(Clone)]
struct PrefetchWorker {
    config: ExplorerConfig,
    fetch: Arc<FetchCoordinator>,
    nav: watch::Receiver<NavigationSnapshot>,
    neighbors: Arc<Coalescer<PathKey>>,
}

impl PrefetchWorker {
    fn page_range(&self, page: usize) -> Range<usize> {
        let start = page * self.config.page_width;
        start..start + self.config.children_target()
    }

    /// Batched first-child chains below `range` of the level under `parent`
    async fn depth_lookahead(&self, parent: &PathKey, range: Range<usize>) {
        let mut frontier: Vec<ExpandTarget> = {
            let store = self.fetch.store().read();
            let level = store.level_by_ids(parent.ids());
            let end = range.end.min(level.len());
            level
                .get(range.start.min(end)..end)
                .unwrap_or_default()
                .iter()
                .map(|node| ExpandTarget::new(parent.ids().to_vec(), node.id))
                .collect()
        };

        for _ in 0..self.config.lookahead_depth {
            if frontier.is_empty() {
                break;
            }
            self.fetch
                .ensure_children(frontier.clone(), self.config.children_target())
                .await;

            frontier = {
                let store = self.fetch.store().read();
                frontier
                    .iter()
                    .filter_map(|target| {
                        let key = target.key();
                        let first = store
                            .node_by_ids(key.ids())
                            .and_then(|node| node.children().first())
                            .map(|child: &TreeNode| child.id)?;
                        Some(ExpandTarget::new(key.ids().to_vec(), first))
                    })
                    .collect()
            };
        }
    }

    /// Grow the level under `parent` to hold `page + 1`, then look below it
    async fn page_lookahead(&self, parent: PathKey, page: usize) {
        let Some((next, width)) = page.checked_add(1).and_then(|next| {
            let first = next.checked_mul(self.config.page_width)?;
            Some((next, self.config.width_for_index(first)?))
        }) else {
            return;
        };
        match ExpandTarget::from_key(&parent) {
            None => {
                self.fetch.ensure_root_width(width).await;
            }
            Some(target) => {
                self.fetch.ensure_children(vec![target], width).await;
            }
        }
        tracing::debug!(key = %parent, page = next, "page lookahead settled");
        self.depth_lookahead(&parent, self.page_range(next)).await;
    }

    /// Contribute the neighborhood of `state`; the last task of a burst
    /// fetches everything and then previews below the cursor as it is now.
    async fn neighbor_batch(&self, state: NavigationState) {
        let keys: Vec<PathKey> = {
            let store = self.fetch.store().read();
            let level = store.level_at(&state.path);
            let start = state.index.saturating_sub(self.config.neighbors_before);
            let end = (state.index + self.config.neighbors_after + 1).min(level.len());
            let parent = state.path.key();
            level
                .get(start.min(end)..end)
                .unwrap_or_default()
                .iter()
                .map(|node| parent.child(node.id))
                .collect()
        };
        let generation = self.neighbors.contribute(keys);

        tokio::time::sleep(self.config.debounce()).await;
        let Some(batch) = self.neighbors.take_if_current(generation) else {
            return;
        };

        let targets: Vec<ExpandTarget> = batch.iter().filter_map(ExpandTarget::from_key).collect();
        tracing::debug!(nodes = targets.len(), "flushing neighbor batch");
        self.fetch
            .ensure_children(targets, self.config.children_target())
            .await;

        let snapshot = self.nav.borrow().clone();
        if snapshot.phase == NavPhase::Idle {
            let index = snapshot.state.index;
            self.depth_lookahead(&snapshot.state.path.key(), index..index + 1)
                .await;
        }
    }
}

// ============================================================================
// Prefetcher
// ============================================================================

/// Returns whether the task panicked; aborted tasks are expected
fn report_finished(result: Result<(), JoinError>) -> bool {
    match result {
        Err(err) if err.is_panic() => {
            tracing::warn!(error = %err, "prefetch task panicked");
            true
        }
        _ => false,
    }
}

/// Owner of the supervised background tasks; dropping it aborts them
pub struct Prefetcher {
    worker: PrefetchWorker,
    tasks: JoinSet<()>,
}

impl Prefetcher {
    pub fn new(
        config: ExplorerConfig,
        fetch: Arc<FetchCoordinator>,
        nav: watch::Receiver<NavigationSnapshot>,
    ) -> Self {
        Self {
            worker: PrefetchWorker {
                config,
                fetch,
                nav,
                neighbors: Arc::new(Coalescer::new()),
            },
            tasks: JoinSet::new(),
        }
    }

    /// Schedule background work for a transition the controller settled on.
    /// Must be called from within a Tokio runtime.
    pub fn on_settled(&mut self, transition: Transition, state: &NavigationState) {
        while let Some(result) = self.tasks.try_join_next() {
            report_finished(result);
        }

        if transition.is_blocked() {
            return;
        }

        let config = &self.worker.config;
        let new_page = matches!(
            transition,
            Transition::Started
                | Transition::Descended
                | Transition::Ascended
                | Transition::PageChanged { .. }
        );
        let near_end =
            state.index % config.page_width >= config.page_width.saturating_sub(config.page_end_margin);
        let parent = state.path.key();

        if new_page {
            let worker = self.worker.clone();
            let parent = parent.clone();
            let page = state.page;
            self.tasks.spawn(async move {
                worker.depth_lookahead(&parent, worker.page_range(page)).await;
            });
        }

        if new_page || near_end {
            let worker = self.worker.clone();
            let page = state.page;
            self.tasks.spawn(async move {
                worker.page_lookahead(parent, page).await;
            });
        }

        let worker = self.worker.clone();
        let state = state.clone();
        self.tasks.spawn(async move {
            worker.neighbor_batch(state).await;
        });
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every scheduled task to finish
    pub async fn wait_idle(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            report_finished(result);
        }
    }

    pub fn shutdown(&mut self) {
        self.tasks.abort_all();
    }
}
