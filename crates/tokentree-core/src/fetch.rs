//! Fetch Coordinator: deduplicated, batched loads into the tree store
//!
//! Every outbound request is keyed: one key per node whose children are being
//! fetched, plus a single `Root` key for root-width growth. The in-flight
//! ledger is the only concurrency control in the crate:
//!
//! 1. A key is inserted before its request is issued
//! 2. A caller that finds its key in flight waits on the owner's completion
//!    signal instead of issuing a second request
//! 3. The key is removed only after the response (success or failure) has been
//!    merged, by a guard that also wakes every waiter
//!
//! So at most one root-width request and at most one children request per node
//! are outstanding at any time. Transport failures stop here: they are logged,
//! counted, and leave the affected nodes unloaded for a later attempt.
//!
//! Requested widths are upper bounds. Responses are truncated to the requested
//! width, and a response shorter than asked marks its key exhausted so it is
//! not re-requested for a larger width during the session.

use crate::backend::{
    ExpandDepthRequest, ExpandTarget, InitialTreeRequest, TreeBackend, WireNode,
};
use crate::session::SessionError;
use crate::tree::{PathKey, TreeStore};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Tree store shared between the controller, the coordinator and prefetch tasks
pub type SharedStore = Arc<RwLock<TreeStore>>;

// ============================================================================
// Keys and Bookkeeping
// ============================================================================

/// Identity of an outbound request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FetchKey {
    /// Root-width growth
    Root,
    /// Children of the node at this path-key
    Children(PathKey),
}

impl fmt::Display for FetchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchKey::Root => f.write_str("<root>"),
            FetchKey::Children(key) => write!(f, "{key}"),
        }
    }
}

/// Snapshot of coordinator activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FetchStats {
    /// InitialTree calls issued (initial load and root growth)
    pub root_requests: usize,
    /// ExpandDepth calls issued
    pub expand_requests: usize,
    /// Calls that failed at the transport
    pub failures: usize,
    /// Requests that joined an in-flight fetch instead of issuing one
    pub deduplicated: usize,
}

#[derive(Default)]
struct Counters {
    root_requests: AtomicUsize,
    expand_requests: AtomicUsize,
    failures: AtomicUsize,
    deduplicated: AtomicUsize,
}

struct InFlight {
    /// Width the owner asked for
    width: usize,
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct Ledger {
    in_flight: HashMap<FetchKey, InFlight>,
    exhausted: HashSet<FetchKey>,
}

/// Clears the owner's keys and wakes waiters, on success, failure or drop
struct InFlightGuard<'a> {
    coordinator: &'a FetchCoordinator,
    keys: Vec<FetchKey>,
    done: watch::Sender<bool>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        {
            let mut ledger = self.coordinator.ledger.lock();
            for key in &self.keys {
                ledger.in_flight.remove(key);
            }
        }
        self.done.send_replace(true);
    }
}

async fn wait_settled(mut done: watch::Receiver<bool>) {
    // A dropped sender also means the fetch is over.
    let _ = done.wait_for(|finished| *finished).await;
}

fn truncate_nodes(nodes: &mut Vec<WireNode>, width: usize) {
    nodes.truncate(width);
    for node in nodes.iter_mut() {
        if let Some(children) = node.children.as_mut() {
            truncate_nodes(children, width);
        }
    }
}

// ============================================================================
// Fetch Coordinator
// ============================================================================

pub struct FetchCoordinator {
    backend: Arc<dyn TreeBackend>,
    store: SharedStore,
    ledger: Mutex<Ledger>,
    /// Root width tracked from what the backend actually returned
    root_width: AtomicUsize,
    counters: Counters,
}

impl FetchCoordinator {
    pub fn new(backend: Arc<dyn TreeBackend>, store: SharedStore) -> Self {
        let root_width = store.read().roots().len();
        Self {
            backend,
            store,
            ledger: Mutex::new(Ledger::default()),
            root_width: AtomicUsize::new(root_width),
            counters: Counters::default(),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Loaded width of the root level; never decreases
    pub fn root_width(&self) -> usize {
        self.root_width.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> FetchStats {
        FetchStats {
            root_requests: self.counters.root_requests.load(Ordering::SeqCst),
            expand_requests: self.counters.expand_requests.load(Ordering::SeqCst),
            failures: self.counters.failures.load(Ordering::SeqCst),
            deduplicated: self.counters.deduplicated.load(Ordering::SeqCst),
        }
    }

    pub fn is_in_flight(&self, key: &FetchKey) -> bool {
        self.ledger.lock().in_flight.contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.ledger.lock().in_flight.len()
    }

    /// Whether the backend already returned fewer entries than asked for `key`
    pub fn is_exhausted(&self, key: &FetchKey) -> bool {
        self.ledger.lock().exhausted.contains(key)
    }

    // ========================================================================
    // Initial Load
    // ========================================================================

    /// Fetch the first `n` layers of up to `k` roots and initialize the store.
    ///
    /// Unlike the `ensure_*` operations this one reports failure: a session
    /// cannot exist without its roots.
    pub async fn load_initial(
        &self,
        prompt: &str,
        k: usize,
        n: usize,
    ) -> Result<usize, SessionError> {
        self.counters.root_requests.fetch_add(1, Ordering::SeqCst);
        let response = self
            .backend
            .initial_tree(InitialTreeRequest {
                prompt: prompt.to_string(),
                k,
                n,
            })
            .await
            .map_err(|e| {
                self.counters.failures.fetch_add(1, Ordering::SeqCst);
                e
            })?;

        let prompt_text = response.prompt.clone();
        let mut roots = response.into_roots();
        let returned = roots.len();
        if returned == 0 {
            return Err(SessionError::EmptyTree {
                prompt: prompt.to_string(),
            });
        }
        truncate_nodes(&mut roots, k);

        let width = self.store.write().initialize(prompt, &prompt_text, roots)?;
        self.root_width.fetch_max(width, Ordering::SeqCst);
        if returned < k {
            self.ledger.lock().exhausted.insert(FetchKey::Root);
        }

        tracing::info!(prompt = %prompt, requested = k, layers = n, width, "initial tree loaded");
        Ok(width)
    }

    // ========================================================================
    // Root Width
    // ========================================================================

    /// Grow the root level to at least `min_width` entries.
    ///
    /// Concurrent callers share one outbound request. Returns the tracked root
    /// width afterwards, which may be smaller than `min_width` when the backend
    /// has no more tokens or the request failed.
    pub async fn ensure_root_width(&self, min_width: usize) -> usize {
        loop {
            let claim = {
                let mut ledger = self.ledger.lock();
                let current = self.root_width();
                if current >= min_width {
                    return current;
                }
                if ledger.exhausted.contains(&FetchKey::Root) {
                    tracing::debug!(current, wanted = min_width, "root level exhausted");
                    return current;
                }
                match ledger.in_flight.get(&FetchKey::Root) {
                    Some(entry) => Err((entry.width, entry.done.clone())),
                    None => {
                        let (tx, rx) = watch::channel(false);
                        ledger.in_flight.insert(
                            FetchKey::Root,
                            InFlight {
                                width: min_width,
                                done: rx,
                            },
                        );
                        Ok(tx)
                    }
                }
            };

            match claim {
                Ok(done) => {
                    let _guard = InFlightGuard {
                        coordinator: self,
                        keys: vec![FetchKey::Root],
                        done,
                    };
                    self.grow_roots(min_width).await;
                    return self.root_width();
                }
                Err((pending_width, done)) => {
                    self.counters.deduplicated.fetch_add(1, Ordering::SeqCst);
                    wait_settled(done).await;
                    if pending_width >= min_width {
                        // The shared request covered this caller; its outcome is ours.
                        return self.root_width();
                    }
                }
            }
        }
    }

    async fn grow_roots(&self, min_width: usize) {
        let Some(prompt) = self.store.read().prompt().map(str::to_string) else {
            return;
        };

        self.counters.root_requests.fetch_add(1, Ordering::SeqCst);
        let result = self
            .backend
            .initial_tree(InitialTreeRequest {
                prompt,
                k: min_width,
                n: 1,
            })
            .await;

        match result {
            Ok(response) => {
                let mut roots = response.into_roots();
                let returned = roots.len();
                truncate_nodes(&mut roots, min_width);

                let width = self.store.write().merge_roots(roots);
                let previous = self.root_width.fetch_max(width, Ordering::SeqCst);
                if returned < min_width {
                    self.ledger.lock().exhausted.insert(FetchKey::Root);
                }
                tracing::info!(
                    requested = min_width,
                    returned,
                    previous,
                    width = previous.max(width),
                    "root width grown"
                );
            }
            Err(err) => {
                self.counters.failures.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(error = %err, requested = min_width, "root width growth failed");
            }
        }
    }

    // ========================================================================
    // Children
    // ========================================================================

    /// Make sure each target has at least `min_width` loaded children.
    ///
    /// Targets that are already wide enough, exhausted, or not in the tree are
    /// skipped. Targets already in flight are not re-issued; this call waits
    /// for them, and claims them again afterwards when the in-flight request
    /// asked for fewer than `min_width`. Everything else goes out as one
    /// batched request.
    pub async fn ensure_children(&self, targets: Vec<ExpandTarget>, min_width: usize) {
        if min_width == 0 {
            return;
        }

        let mut pending = targets;
        while !pending.is_empty() {
            let (tx, rx) = watch::channel(false);
            let mut issue = Vec::new();
            let mut waits = Vec::new();
            {
                let store = self.store.read();
                let mut ledger = self.ledger.lock();
                let mut seen = HashSet::new();

                for target in std::mem::take(&mut pending) {
                    let path_key = target.key();
                    let key = FetchKey::Children(path_key.clone());
                    if !seen.insert(key.clone()) || ledger.exhausted.contains(&key) {
                        continue;
                    }
                    let Some(node) = store.node_by_ids(path_key.ids()) else {
                        tracing::debug!(key = %path_key, "skipping children fetch for node not in tree");
                        continue;
                    };
                    if node.loaded_children() >= min_width {
                        continue;
                    }
                    if let Some(entry) = ledger.in_flight.get(&key) {
                        self.counters.deduplicated.fetch_add(1, Ordering::SeqCst);
                        waits.push((entry.width, entry.done.clone(), target));
                        continue;
                    }

                    ledger.in_flight.insert(
                        key.clone(),
                        InFlight {
                            width: min_width,
                            done: rx.clone(),
                        },
                    );
                    issue.push((key, target));
                }
            }

            if !issue.is_empty() {
                let (keys, batch): (Vec<_>, Vec<_>) = issue.into_iter().unzip();
                let _guard = InFlightGuard {
                    coordinator: self,
                    keys,
                    done: tx,
                };
                self.expand(batch, min_width).await;
            }

            for (pending_width, done, target) in waits {
                wait_settled(done).await;
                if pending_width < min_width {
                    // Narrower than needed; re-checked against the store next round.
                    pending.push(target);
                }
            }
        }
    }

    async fn expand(&self, batch: Vec<ExpandTarget>, min_width: usize) {
        let Some(prompt) = self.store.read().prompt_text().map(str::to_string) else {
            return;
        };

        self.counters.expand_requests.fetch_add(1, Ordering::SeqCst);
        let result = self
            .backend
            .expand_depth(ExpandDepthRequest {
                prompt,
                nodes: batch.clone(),
                k: min_width,
            })
            .await;

        let mut response = match result {
            Ok(response) => response,
            Err(err) => {
                self.counters.failures.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(error = %err, nodes = batch.len(), "expand-depth failed");
                return;
            }
        };

        let mut exhausted = Vec::new();
        {
            let mut store = self.store.write();
            for target in &batch {
                let key = target.key();
                let Some(mut children) = response.take_children(&key) else {
                    // Not returned is not the same as empty: leave it unloaded.
                    tracing::debug!(key = %key, "backend omitted requested node");
                    continue;
                };
                let returned = children.len();
                truncate_nodes(&mut children, min_width);
                let width = store
                    .merge_children(&target.path, target.node_id, children)
                    .len();
                if returned < min_width {
                    exhausted.push(FetchKey::Children(key.clone()));
                }
                tracing::debug!(key = %key, returned, width, "children merged");
            }
        }

        if !exhausted.is_empty() {
            self.ledger.lock().exhausted.extend(exhausted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        ExpandDepthResponse, InitialTreeResponse, MockBackend, TransportError,
    };
    use async_trait::async_trait;
    use std::time::Duration;

    async fn coordinator_with(backend: Arc<dyn TreeBackend>, k: usize, n: usize) -> FetchCoordinator {
        let store: SharedStore = Arc::new(RwLock::new(TreeStore::new()));
        let fetch = FetchCoordinator::new(backend, store);
        fetch.load_initial("hello", k, n).await.unwrap();
        fetch
    }

    #[tokio::test]
    async fn test_concurrent_root_growth_shares_one_request() {
        let backend = Arc::new(MockBackend::new(50, 5).with_latency(Duration::from_millis(20)));
        let fetch = coordinator_with(backend.clone(), 6, 1).await;

        let (a, b) = tokio::join!(fetch.ensure_root_width(11), fetch.ensure_root_width(11));
        assert_eq!((a, b), (11, 11));
        assert_eq!(backend.initial_calls(), 2);
        assert_eq!(fetch.stats().deduplicated, 1);
        assert_eq!(fetch.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_wider_waiter_issues_after_narrower_owner() {
        let backend = Arc::new(MockBackend::new(50, 5).with_latency(Duration::from_millis(20)));
        let fetch = coordinator_with(backend.clone(), 6, 1).await;

        let (a, b) = tokio::join!(fetch.ensure_root_width(11), fetch.ensure_root_width(16));
        assert_eq!(a, 11);
        assert_eq!(b, 16);
        // initial, the 11-wide growth, then the 16-wide one strictly after it
        assert_eq!(backend.initial_calls(), 3);
    }

    #[tokio::test]
    async fn test_short_root_response_adopted_and_exhausted() {
        let backend = Arc::new(MockBackend::new(8, 5));
        let fetch = coordinator_with(backend.clone(), 6, 1).await;

        assert_eq!(fetch.ensure_root_width(11).await, 8);
        assert!(fetch.is_exhausted(&FetchKey::Root));
        assert_eq!(fetch.ensure_root_width(16).await, 8);
        assert_eq!(backend.initial_calls(), 2);
    }

    #[tokio::test]
    async fn test_wider_children_waiter_reissues_after_narrower_owner() {
        let backend = Arc::new(MockBackend::new(50, 50).with_latency(Duration::from_millis(20)));
        let fetch = coordinator_with(backend.clone(), 6, 1).await;
        let target = ExpandTarget::new(vec![], 1);

        tokio::join!(
            fetch.ensure_children(vec![target.clone()], 11),
            fetch.ensure_children(vec![target.clone()], 16),
        );
        assert_eq!(
            fetch.store().read().node_by_ids(&[1]).unwrap().loaded_children(),
            16
        );
        let widths: Vec<_> = backend.expand_requests().iter().map(|req| req.k).collect();
        assert_eq!(widths, vec![11, 16]);
        assert_eq!(fetch.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_response_truncated() {
        let backend = Arc::new(MockBackend::new(50, 50).with_oversize(3));
        let fetch = coordinator_with(backend.clone(), 6, 1).await;
        assert_eq!(fetch.root_width(), 6);

        fetch
            .ensure_children(vec![ExpandTarget::new(vec![], 1)], 6)
            .await;
        let store = fetch.store().read();
        assert_eq!(store.node_by_ids(&[1]).unwrap().loaded_children(), 6);
    }

    #[tokio::test]
    async fn test_failure_clears_in_flight_and_allows_retry() {
        let backend = Arc::new(MockBackend::new(50, 5));
        let fetch = coordinator_with(backend.clone(), 6, 1).await;

        backend.set_failing(true);
        fetch
            .ensure_children(vec![ExpandTarget::new(vec![], 2)], 6)
            .await;
        assert_eq!(fetch.in_flight_count(), 0);
        assert_eq!(fetch.stats().failures, 1);
        assert!(fetch.store().read().node_by_ids(&[2]).unwrap().children.is_none());
        assert!(!fetch.is_exhausted(&FetchKey::Children(PathKey::new(vec![2]))));

        backend.set_failing(false);
        fetch
            .ensure_children(vec![ExpandTarget::new(vec![], 2)], 6)
            .await;
        assert_eq!(
            fetch.store().read().node_by_ids(&[2]).unwrap().loaded_children(),
            5
        );
        assert_eq!(backend.expand_calls(), 2);
    }

    #[tokio::test]
    async fn test_satisfied_and_unknown_targets_skip_network() {
        let backend = Arc::new(MockBackend::new(50, 8));
        let fetch = coordinator_with(backend.clone(), 6, 2).await;

        // n = 2 already loaded six children under each root
        fetch
            .ensure_children(
                vec![ExpandTarget::new(vec![], 1), ExpandTarget::new(vec![], 99)],
                6,
            )
            .await;
        assert_eq!(backend.expand_calls(), 0);
    }

    /// Backend that answers ExpandDepth for nothing, or with explicit empties
    struct SparseBackend {
        explicit_empty: bool,
    }

    #[async_trait]
    impl TreeBackend for SparseBackend {
        async fn initial_tree(
            &self,
            request: InitialTreeRequest,
        ) -> Result<InitialTreeResponse, TransportError> {
            MockBackend::new(10, 10).initial_tree(request).await
        }

        async fn expand_depth(
            &self,
            request: ExpandDepthRequest,
        ) -> Result<ExpandDepthResponse, TransportError> {
            let mut response = ExpandDepthResponse::default();
            if self.explicit_empty {
                for node in &request.nodes {
                    response.children_map.insert(node.key().to_string(), vec![]);
                }
            }
            Ok(response)
        }
    }

    #[tokio::test]
    async fn test_omitted_node_stays_unloaded() {
        let fetch =
            coordinator_with(Arc::new(SparseBackend { explicit_empty: false }), 6, 1).await;
        fetch
            .ensure_children(vec![ExpandTarget::new(vec![], 3)], 6)
            .await;
        let store = fetch.store().read();
        assert!(store.node_by_ids(&[3]).unwrap().children.is_none());
        assert!(!fetch.is_exhausted(&FetchKey::Children(PathKey::new(vec![3]))));
    }

    #[tokio::test]
    async fn test_explicit_empty_marks_loaded_and_exhausted() {
        let fetch =
            coordinator_with(Arc::new(SparseBackend { explicit_empty: true }), 6, 1).await;
        fetch
            .ensure_children(vec![ExpandTarget::new(vec![], 3)], 6)
            .await;
        assert_eq!(
            fetch.store().read().node_by_ids(&[3]).unwrap().children,
            Some(vec![])
        );
        assert!(fetch.is_exhausted(&FetchKey::Children(PathKey::new(vec![3]))));
    }

    #[tokio::test]
    async fn test_empty_initial_tree_is_an_error() {
        let store: SharedStore = Arc::new(RwLock::new(TreeStore::new()));
        let fetch = FetchCoordinator::new(Arc::new(MockBackend::new(0, 0)), store);
        let err = fetch.load_initial("void", 6, 1).await.unwrap_err();
        assert!(matches!(err, SessionError::EmptyTree { .. }));
    }
}
