//! Tokentree Core: Incremental Token-Tree Cache and Pagination Navigator
//!
//! Explores the tree of likely continuations of a prompt without ever holding
//! (or fetching) more of it than the next few visible layers need.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      EXPLORATION SESSION                         │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  gap   ┌──────────────────┐   ┌─────────────┐  │
//! │  │  Navigation  │───────►│ FetchCoordinator │──►│ TreeBackend │  │
//! │  │  Controller  │        │ (in-flight keys) │◄──│ (HTTP/mock) │  │
//! │  └──────┬───────┘        └────────┬─────────┘   └─────────────┘  │
//! │         │ settled           merge │    ▲                         │
//! │         ▼                         ▼    │ lookahead               │
//! │  ┌──────────────┐  reads   ┌───────────┴──┐                      │
//! │  │  Prefetcher  │─────────►│  TreeStore   │                      │
//! │  │  (JoinSet)   │          │ (append-only)│                      │
//! │  └──────────────┘          └──────────────┘                      │
//! │                                                                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//! - Merges only append unseen ids; sibling order is the backend's order
//! - At most one outbound request per node key (and one for root growth)
//! - Navigation never fails: an unsatisfiable move leaves the cursor in place
//! - Background prefetch is best-effort and never surfaces errors
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokentree_core::{ExplorationSession, ExplorerConfig, HttpBackend, HttpConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = Arc::new(HttpBackend::new(HttpConfig::new("http://localhost:5000"))?);
//! let mut session = ExplorationSession::start(backend, "Once upon", ExplorerConfig::default()).await?;
//! session.advance().await;
//! session.descend().await;
//! println!("{}", session.full_text());
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod fetch;
#[cfg(feature = "http")]
pub mod http;
pub mod navigation;
pub mod prefetch;
pub mod session;
pub mod tree;

pub use backend::{
    ExpandDepthRequest, ExpandDepthResponse, ExpandTarget, InitialTreeRequest,
    InitialTreeResponse, MockBackend, TransportError, TreeBackend, WireNode,
};
pub use config::{ConfigError, ExplorerConfig, HttpConfig};
pub use fetch::{FetchCoordinator, FetchKey, FetchStats, SharedStore};
#[cfg(feature = "http")]
pub use http::HttpBackend;
pub use navigation::{
    NavPhase, NavigationController, NavigationSnapshot, NavigationState, Transition,
};
pub use prefetch::{Coalescer, Prefetcher};
pub use session::{ExplorationSession, SessionError};
pub use tree::{Path, PathKey, PathSegment, StoreError, TokenId, Tree, TreeNode, TreeStore};
