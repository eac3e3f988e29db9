//! Navigation scenarios against the mock backend
//!
//! The controller is driven directly (no prefetcher) so every backend call
//! observed here was caused by the navigation step under test.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokentree_core::*;

const LATENCY: Duration = Duration::from_millis(20);

async fn controller(
    backend: Arc<MockBackend>,
    config: ExplorerConfig,
) -> NavigationController {
    let store: SharedStore = Arc::new(RwLock::new(TreeStore::new()));
    let fetch = Arc::new(FetchCoordinator::new(backend, store));
    fetch
        .load_initial("hello", config.children_target(), config.initial_depth)
        .await
        .unwrap();
    NavigationController::new(config, fetch)
}

/// State published while the controller waits for data
async fn observe_awaiting(
    mut rx: tokio::sync::watch::Receiver<NavigationSnapshot>,
) -> NavigationState {
    rx.wait_for(|s| s.phase == NavPhase::AwaitingData)
        .await
        .unwrap()
        .state
        .clone()
}

// ============================================================================
// Scenario A: initial fetch
// ============================================================================

#[tokio::test]
async fn test_initial_fetch_requests_separator_and_tracks_width() {
    let backend = Arc::new(MockBackend::new(50, 6));
    let store: SharedStore = Arc::new(RwLock::new(TreeStore::new()));
    let fetch = FetchCoordinator::new(backend.clone(), store);
    let config = ExplorerConfig::default();

    let width = fetch
        .load_initial("hello", config.children_target(), config.initial_depth)
        .await
        .unwrap();

    assert_eq!(width, 6);
    assert_eq!(fetch.root_width(), 6);
    let request = &backend.initial_requests()[0];
    assert_eq!(request.prompt, "hello");
    assert_eq!((request.k, request.n), (6, 4));

    // four layers pre-populated below the first root
    let store = fetch.store().read();
    assert!(store.node_by_ids(&[1, 1, 1]).unwrap().is_loaded());
    assert!(!store.node_by_ids(&[1, 1, 1, 1]).unwrap().is_loaded());
}

// ============================================================================
// Scenario B: advancing past the loaded width
// ============================================================================

#[tokio::test]
async fn test_advance_past_loaded_width_waits_for_one_growth() {
    let backend = Arc::new(MockBackend::new(50, 6).with_latency(LATENCY));
    let mut nav = controller(backend.clone(), ExplorerConfig::default()).await;
    nav.select_index(5).await;
    assert_eq!(nav.loaded_width(), 6);

    let rx = nav.subscribe();
    let (transition, during) = tokio::join!(nav.advance(), observe_awaiting(rx));

    assert_eq!(during.index, 5);
    assert_eq!(transition, Transition::PageChanged { from: 0, to: 1 });
    assert_eq!(nav.state().index, 6);
    assert_eq!(nav.state().page, 1);
    assert_eq!(backend.initial_calls(), 2);

    let growth = &backend.initial_requests()[1];
    assert_eq!(growth.prompt, "hello");
    assert_eq!((growth.k, growth.n), (11, 1));
    assert_eq!(nav.loaded_width(), 11);
}

#[tokio::test]
async fn test_advance_past_exhausted_level_stays_put() {
    let backend = Arc::new(MockBackend::new(6, 6));
    let mut nav = controller(backend.clone(), ExplorerConfig::default()).await;
    nav.select_index(5).await;

    assert_eq!(nav.advance().await, Transition::Blocked);
    assert_eq!(nav.state().index, 5);
    assert_eq!(nav.phase(), NavPhase::Idle);
    assert_eq!(backend.initial_calls(), 2);

    // the short answer is remembered
    assert_eq!(nav.advance().await, Transition::Blocked);
    assert_eq!(backend.initial_calls(), 2);
}

#[tokio::test]
async fn test_child_level_grows_through_expand_depth() {
    let backend = Arc::new(MockBackend::new(50, 50));
    let mut nav = controller(backend.clone(), ExplorerConfig::default().with_initial_depth(2)).await;
    nav.descend().await;
    assert_eq!(nav.loaded_width(), 6);

    assert_eq!(
        nav.select_index(6).await,
        Transition::PageChanged { from: 0, to: 1 }
    );
    let request = backend.expand_requests().pop().unwrap();
    assert_eq!(request.k, 11);
    assert_eq!(request.nodes, vec![ExpandTarget::new(vec![], 1)]);
    assert_eq!(request.prompt, MockBackend::formatted_prompt("hello"));
}

// ============================================================================
// Scenario D: descending into an unloaded node
// ============================================================================

#[tokio::test]
async fn test_descend_blocks_until_children_arrive() {
    let backend = Arc::new(MockBackend::new(50, 6).with_latency(LATENCY));
    let mut nav = controller(backend.clone(), ExplorerConfig::default().with_initial_depth(1)).await;
    nav.select_index(2).await;
    assert!(nav.current_node().unwrap().children.is_none());

    let rx = nav.subscribe();
    let (transition, during) = tokio::join!(nav.descend(), observe_awaiting(rx));

    assert!(during.path.is_root());
    assert_eq!(transition, Transition::Descended);
    assert_eq!(nav.state().path.len(), 1);
    assert_eq!(nav.state().path.last(), Some(&PathSegment { index: 2, id: 3 }));
    assert_eq!((nav.state().index, nav.state().page), (0, 0));
    assert_eq!(backend.expand_calls(), 1);
    assert_eq!(nav.current_level().len(), 6);
}

#[tokio::test]
async fn test_descend_into_leaf_is_blocked() {
    let backend = Arc::new(MockBackend::new(50, 0));
    let mut nav = controller(backend, ExplorerConfig::default().with_initial_depth(1)).await;

    assert_eq!(nav.descend().await, Transition::Blocked);
    assert!(nav.state().path.is_root());
}

#[tokio::test]
async fn test_failed_descend_retries_on_next_attempt() {
    let backend = Arc::new(MockBackend::new(50, 6));
    let mut nav = controller(backend.clone(), ExplorerConfig::default().with_initial_depth(1)).await;

    backend.set_failing(true);
    assert_eq!(nav.descend().await, Transition::Blocked);

    backend.set_failing(false);
    assert_eq!(nav.descend().await, Transition::Descended);
    assert_eq!(backend.expand_calls(), 2);
}

// ============================================================================
// Scenario E: ascending restores the saved position
// ============================================================================

#[tokio::test]
async fn test_ascend_restores_position_before_descent() {
    let backend = Arc::new(MockBackend::new(50, 50));
    let mut nav = controller(backend, ExplorerConfig::default().with_initial_depth(2)).await;

    nav.select_index(7).await;
    assert_eq!((nav.state().index, nav.state().page), (7, 1));

    assert_eq!(nav.descend().await, Transition::Descended);
    nav.select_index(3).await;
    assert_eq!(nav.descend().await, Transition::Descended);
    assert_eq!(nav.state().path.ids(), vec![8, 4]);

    assert_eq!(nav.ascend(), Transition::Ascended);
    assert_eq!((nav.state().index, nav.state().page), (3, 0));
    assert_eq!(nav.ascend(), Transition::Ascended);
    assert_eq!((nav.state().index, nav.state().page), (7, 1));
    assert!(nav.state().path.is_root());
    assert_eq!(nav.current_node().map(|n| n.id), Some(8));
}
