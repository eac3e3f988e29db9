//! Exploration session: one prompt, one tree, one cursor
//!
//! The session owns every piece of per-prompt state. Starting a new prompt
//! means building a new session; `shutdown` (or drop) aborts outstanding
//! background work and releases the tree.

use crate::backend::{TransportError, TreeBackend};
use crate::config::{ConfigError, ExplorerConfig};
use crate::fetch::{FetchCoordinator, FetchStats, SharedStore};
use crate::navigation::{
    NavigationController, NavigationSnapshot, NavigationState, Transition,
};
use crate::prefetch::Prefetcher;
use crate::tree::{StoreError, TokenId, Tree, TreeNode, TreeStore};
use parking_lot::RwLock;
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Prompt must not be empty")]
    EmptyPrompt,

    #[error("Backend returned no tokens for prompt {prompt:?}")]
    EmptyTree { prompt: String },

    #[error("Initial tree fetch failed: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub struct ExplorationSession {
    config: ExplorerConfig,
    fetch: Arc<FetchCoordinator>,
    nav: NavigationController,
    prefetch: Prefetcher,
}

impl ExplorationSession {
    /// Fetch the initial tree for `prompt` and settle on its first root.
    ///
    /// Requests `k + 1` roots `n` layers deep, then schedules the start-up
    /// prefetch (page 0 chains and page 1).
    pub async fn start(
        backend: Arc<dyn TreeBackend>,
        prompt: &str,
        config: ExplorerConfig,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        if prompt.trim().is_empty() {
            return Err(SessionError::EmptyPrompt);
        }

        let store: SharedStore = Arc::new(RwLock::new(TreeStore::new()));
        let fetch = Arc::new(FetchCoordinator::new(backend, store));
        let width = fetch
            .load_initial(prompt, config.children_target(), config.initial_depth)
            .await?;

        let nav = NavigationController::new(config.clone(), fetch.clone());
        let prefetch = Prefetcher::new(config.clone(), fetch.clone(), nav.subscribe());
        let mut session = Self {
            config,
            fetch,
            nav,
            prefetch,
        };
        session.settle(Transition::Started);

        tracing::info!(
            prompt = %prompt,
            width,
            page_width = session.config.page_width,
            "exploration session started"
        );
        Ok(session)
    }

    fn settle(&mut self, transition: Transition) -> Transition {
        self.prefetch.on_settled(transition, self.nav.state());
        transition
    }

    // ========================================================================
    // Navigation
    // ========================================================================

    pub async fn select_index(&mut self, index: usize) -> Transition {
        let transition = self.nav.select_index(index).await;
        self.settle(transition)
    }

    pub async fn advance(&mut self) -> Transition {
        let transition = self.nav.advance().await;
        self.settle(transition)
    }

    pub async fn retreat(&mut self) -> Transition {
        let transition = self.nav.retreat().await;
        self.settle(transition)
    }

    pub async fn descend(&mut self) -> Transition {
        let transition = self.nav.descend().await;
        self.settle(transition)
    }

    pub async fn ascend(&mut self) -> Transition {
        let transition = self.nav.ascend();
        self.settle(transition)
    }

    // ========================================================================
    // Read Views
    // ========================================================================

    pub fn config(&self) -> &ExplorerConfig {
        &self.config
    }

    pub fn navigation(&self) -> &NavigationController {
        &self.nav
    }

    pub fn state(&self) -> &NavigationState {
        self.nav.state()
    }

    pub fn snapshot(&self) -> NavigationSnapshot {
        self.nav.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<NavigationSnapshot> {
        self.nav.subscribe()
    }

    pub fn store(&self) -> &SharedStore {
        self.fetch.store()
    }

    pub fn stats(&self) -> FetchStats {
        self.fetch.stats()
    }

    pub fn root_width(&self) -> usize {
        self.fetch.root_width()
    }

    pub fn loaded_width(&self) -> usize {
        self.nav.loaded_width()
    }

    pub fn visible_range(&self) -> Range<usize> {
        self.nav.visible_range()
    }

    pub fn visible_nodes(&self) -> Vec<TreeNode> {
        self.nav.visible_nodes()
    }

    pub fn current_level(&self) -> Vec<TreeNode> {
        self.nav.current_level()
    }

    pub fn current_node(&self) -> Option<TreeNode> {
        self.nav.current_node()
    }

    pub fn token_ids(&self) -> Vec<TokenId> {
        self.nav.token_ids()
    }

    pub fn full_text(&self) -> String {
        self.nav.full_text()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Let scheduled background work finish
    pub async fn wait_for_prefetch(&mut self) {
        self.prefetch.wait_idle().await;
    }

    pub fn pending_prefetch(&self) -> usize {
        self.prefetch.pending_tasks()
    }

    /// Abort background work and hand back the tree as it was loaded
    pub fn shutdown(mut self) -> Option<Tree> {
        self.prefetch.shutdown();
        let stats = self.fetch.stats();
        tracing::info!(
            root_requests = stats.root_requests,
            expand_requests = stats.expand_requests,
            failures = stats.failures,
            deduplicated = stats.deduplicated,
            "exploration session closed"
        );
        self.fetch.store().write().reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;

    #[tokio::test]
    async fn test_start_requests_separator_entry() {
        let backend = Arc::new(MockBackend::new(50, 6));
        let session = ExplorationSession::start(backend.clone(), "hello", ExplorerConfig::default())
            .await
            .unwrap();
        let first = &backend.initial_requests()[0];
        assert_eq!((first.k, first.n), (6, 4));
        assert_eq!(session.state(), &NavigationState::default());
    }

    #[tokio::test]
    async fn test_blank_prompt_rejected() {
        let backend = Arc::new(MockBackend::new(50, 6));
        let err = ExplorationSession::start(backend.clone(), "  ", ExplorerConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::EmptyPrompt));
        assert_eq!(backend.initial_calls(), 0);
    }

    #[tokio::test]
    async fn test_transport_failure_surfaces_on_start() {
        let backend = Arc::new(MockBackend::new(50, 6));
        backend.set_failing(true);
        let err = ExplorationSession::start(backend, "hello", ExplorerConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::Transport(TransportError::Network(_))));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let backend = Arc::new(MockBackend::new(50, 6));
        let config = ExplorerConfig::default().with_page_width(0);
        let err = ExplorationSession::start(backend, "hello", config)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::Config(_)));
    }

    #[tokio::test]
    async fn test_shutdown_returns_tree() {
        let backend = Arc::new(MockBackend::new(50, 6));
        let session = ExplorationSession::start(backend, "hello", ExplorerConfig::default())
            .await
            .unwrap();
        let tree = session.shutdown().unwrap();
        assert_eq!(tree.prompt, "hello");
        assert_eq!(tree.prompt_text, MockBackend::formatted_prompt("hello"));
    }
}
