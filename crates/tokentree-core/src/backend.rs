//! Generation Backend Contract
//!
//! The backend computes probabilities; this crate only caches what it returns.
//! Two calls exist:
//!
//! - **InitialTree**: up to `k` root nodes, each pre-populated `n` layers deep
//!   (the roots count as the first layer)
//! - **ExpandDepth**: up to `k` children for each requested node, keyed by the
//!   comma-joined path-key of that node
//!
//! Either call may return fewer nodes than asked for. Cumulative probability is
//! never trusted from the wire; the tree store recomputes it.

use crate::tree::{PathKey, TokenId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

// ============================================================================
// Wire Types
// ============================================================================

/// Node as the backend sends it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireNode {
    #[serde(rename = "token_id", alias = "id")]
    pub id: TokenId,
    #[serde(rename = "token_str", alias = "text", default)]
    pub text: String,
    pub probability: f64,
    /// Pre-populated layers (InitialTree only); `null` means not fetched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<WireNode>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialTreeRequest {
    pub prompt: String,
    pub k: usize,
    pub n: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialTreeResponse {
    /// Prompt as formatted by the backend
    pub prompt: String,
    #[serde(default)]
    pub children: Option<Vec<WireNode>>,
}

impl InitialTreeResponse {
    pub fn into_roots(self) -> Vec<WireNode> {
        self.children.unwrap_or_default()
    }
}

/// A node whose children are wanted: ids of its ancestors plus its own id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExpandTarget {
    pub path: Vec<TokenId>,
    #[serde(rename = "token_id", alias = "nodeId")]
    pub node_id: TokenId,
}

impl ExpandTarget {
    pub fn new(path: Vec<TokenId>, node_id: TokenId) -> Self {
        Self { path, node_id }
    }

    /// Target for the node a non-empty key addresses
    pub fn from_key(key: &PathKey) -> Option<Self> {
        key.split_last()
            .map(|(parent, id)| Self::new(parent.to_vec(), id))
    }

    pub fn key(&self) -> PathKey {
        PathKey::new(self.path.clone()).child(self.node_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandDepthRequest {
    pub prompt: String,
    pub nodes: Vec<ExpandTarget>,
    pub k: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpandDepthResponse {
    #[serde(alias = "childrenMap")]
    pub children_map: HashMap<String, Vec<WireNode>>,
}

impl ExpandDepthResponse {
    /// Remove and return the children listed for `key`.
    ///
    /// Keys are matched by their parsed ids, so `"3, 9"` and `"3,9"` agree.
    pub fn take_children(&mut self, key: &PathKey) -> Option<Vec<WireNode>> {
        if let Some(children) = self.children_map.remove(&key.to_string()) {
            return Some(children);
        }
        let raw = self
            .children_map
            .keys()
            .find(|raw| raw.parse::<PathKey>().ok().as_ref() == Some(key))
            .cloned()?;
        self.children_map.remove(&raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Backend returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

// ============================================================================
// Backend Trait
// ============================================================================

/// Interface to the token-generation backend
#[async_trait]
pub trait TreeBackend: Send + Sync {
    /// Build the first layers of the tree for a prompt
    async fn initial_tree(
        &self,
        request: InitialTreeRequest,
    ) -> Result<InitialTreeResponse, TransportError>;

    /// Fetch one more layer below each requested node
    async fn expand_depth(
        &self,
        request: ExpandDepthRequest,
    ) -> Result<ExpandDepthResponse, TransportError>;
}

// ============================================================================
// Mock Backend
// ============================================================================

/// Synthetic backend for tests and offline use.
///
/// Every level holds tokens `1..=width` with probabilities `0.5, 0.25, ...`,
/// so results are deterministic and already probability-descending. Roots are
/// capped at `root_width`, every deeper level at `child_width`.
pub struct MockBackend {
    root_width: usize,
    child_width: usize,
    latency: Duration,
    oversize: usize,
    failing: AtomicBool,
    initial_calls: AtomicUsize,
    expand_calls: AtomicUsize,
    initial_log: Mutex<Vec<InitialTreeRequest>>,
    expand_log: Mutex<Vec<ExpandDepthRequest>>,
}

impl MockBackend {
    pub fn new(root_width: usize, child_width: usize) -> Self {
        Self {
            root_width,
            child_width,
            latency: Duration::ZERO,
            oversize: 0,
            failing: AtomicBool::new(false),
            initial_calls: AtomicUsize::new(0),
            expand_calls: AtomicUsize::new(0),
            initial_log: Mutex::new(Vec::new()),
            expand_log: Mutex::new(Vec::new()),
        }
    }

    /// Delay every call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Return `extra` more nodes per level than were asked for
    pub fn with_oversize(mut self, extra: usize) -> Self {
        self.oversize = extra;
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn initial_calls(&self) -> usize {
        self.initial_calls.load(Ordering::SeqCst)
    }

    pub fn expand_calls(&self) -> usize {
        self.expand_calls.load(Ordering::SeqCst)
    }

    pub fn initial_requests(&self) -> Vec<InitialTreeRequest> {
        self.initial_log.lock().clone()
    }

    pub fn expand_requests(&self) -> Vec<ExpandDepthRequest> {
        self.expand_log.lock().clone()
    }

    /// Expand calls that asked for the node at `key`
    pub fn expand_calls_for(&self, key: &PathKey) -> usize {
        self.expand_log
            .lock()
            .iter()
            .filter(|req| req.nodes.iter().any(|n| &n.key() == key))
            .count()
    }

    pub fn formatted_prompt(prompt: &str) -> String {
        format!("<|ConversationStart|><|Them|>{prompt}<|Me|>")
    }

    fn level(&self, depth: usize, k: usize, layers: usize) -> Vec<WireNode> {
        let limit = if depth == 0 {
            self.root_width
        } else {
            self.child_width
        };
        let count = k.min(limit) + self.oversize;
        (0..count)
            .map(|rank| WireNode {
                id: rank as TokenId + 1,
                text: format!("d{depth}t{}", rank + 1),
                probability: 0.5f64.powi(rank as i32 + 1),
                children: (layers > 1).then(|| self.level(depth + 1, k, layers - 1)),
            })
            .collect()
    }

    async fn simulate_latency(&self) -> Result<(), TransportError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Network("mock backend offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TreeBackend for MockBackend {
    async fn initial_tree(
        &self,
        request: InitialTreeRequest,
    ) -> Result<InitialTreeResponse, TransportError> {
        self.initial_calls.fetch_add(1, Ordering::SeqCst);
        self.initial_log.lock().push(request.clone());
        self.simulate_latency().await?;

        let roots = self.level(0, request.k, request.n);
        Ok(InitialTreeResponse {
            prompt: Self::formatted_prompt(&request.prompt),
            children: (!roots.is_empty()).then_some(roots),
        })
    }

    async fn expand_depth(
        &self,
        request: ExpandDepthRequest,
    ) -> Result<ExpandDepthResponse, TransportError> {
        self.expand_calls.fetch_add(1, Ordering::SeqCst);
        self.expand_log.lock().push(request.clone());
        self.simulate_latency().await?;

        let children_map = request
            .nodes
            .iter()
            .map(|target| {
                let depth = target.path.len() + 1;
                (target.key().to_string(), self.level(depth, request.k, 1))
            })
            .collect();
        Ok(ExpandDepthResponse { children_map })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_node_accepts_server_fields() {
        let json = r#"{
            "token_id": 464,
            "token_str": " The",
            "probability": 0.25,
            "cumulative_prob": 0.25,
            "depth": 0,
            "children": null
        }"#;
        let node: WireNode = serde_json::from_str(json).unwrap();
        assert_eq!(node.id, 464);
        assert_eq!(node.text, " The");
        assert!(node.children.is_none());
    }

    #[test]
    fn test_expand_request_serializes_token_id() {
        let request = ExpandDepthRequest {
            prompt: "p".to_string(),
            nodes: vec![ExpandTarget {
                path: vec![1, 2],
                node_id: 3,
            }],
            k: 6,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["nodes"][0]["token_id"], 3);
        assert_eq!(value["nodes"][0]["path"], serde_json::json!([1, 2]));
    }

    #[test]
    fn test_take_children_tolerates_spacing() {
        let mut response: ExpandDepthResponse =
            serde_json::from_str(r#"{"children_map": {"3, 9": []}}"#).unwrap();
        let key = PathKey::new(vec![3, 9]);
        assert_eq!(response.take_children(&key), Some(vec![]));
        assert_eq!(response.take_children(&key), None);
    }

    #[test]
    fn test_null_root_list_reads_empty() {
        let response: InitialTreeResponse =
            serde_json::from_str(r#"{"prompt": "x", "children": null}"#).unwrap();
        assert!(response.into_roots().is_empty());
    }

    #[tokio::test]
    async fn test_mock_respects_width_and_layers() {
        let backend = MockBackend::new(3, 2);
        let response = backend
            .initial_tree(InitialTreeRequest {
                prompt: "hello".to_string(),
                k: 5,
                n: 2,
            })
            .await
            .unwrap();
        assert_eq!(response.prompt, MockBackend::formatted_prompt("hello"));
        let roots = response.into_roots();
        assert_eq!(roots.len(), 3);
        assert_eq!(roots[0].children.as_ref().map(Vec::len), Some(2));
        assert!(roots[0].children.as_ref().unwrap()[0].children.is_none());
    }

    #[tokio::test]
    async fn test_mock_failure_still_counts() {
        let backend = MockBackend::new(3, 2);
        backend.set_failing(true);
        let err = backend
            .expand_depth(ExpandDepthRequest {
                prompt: "p".to_string(),
                nodes: vec![],
                k: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Network(_)));
        assert_eq!(backend.expand_calls(), 1);
    }
}
