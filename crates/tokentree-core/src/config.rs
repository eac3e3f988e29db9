//! Explorer and transport configuration
//!
//! Defaults match the reference client: five in-policy tokens per page, four
//! pre-populated layers, a four-level lookahead and a 50ms coalescing window.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing configuration: set {0}")]
    Missing(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Explorer Configuration
// ============================================================================

/// Per-session navigation and prefetch policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplorerConfig {
    /// Policy boundary k: in-policy tokens per level, and the page width
    pub page_width: usize,
    /// Layers pre-populated by the initial fetch (n)
    pub initial_depth: usize,
    /// Levels walked by depth lookahead along each first-child chain
    pub lookahead_depth: usize,
    /// Coalescing window for neighbor loads
    pub debounce_ms: u64,
    /// Neighbors left of the cursor that get children loaded
    pub neighbors_before: usize,
    /// Neighbors right of the cursor that get children loaded
    pub neighbors_after: usize,
    /// Preload the next page once the cursor is this close to the page end
    pub page_end_margin: usize,
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            page_width: 5,
            initial_depth: 4,
            lookahead_depth: 4,
            debounce_ms: 50,
            neighbors_before: 1,
            neighbors_after: 2,
            page_end_margin: 2,
        }
    }
}

impl ExplorerConfig {
    pub fn with_page_width(mut self, k: usize) -> Self {
        self.page_width = k;
        self
    }

    pub fn with_initial_depth(mut self, n: usize) -> Self {
        self.initial_depth = n;
        self
    }

    /// Load from `TOKENTREE_*` environment variables over the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(k) = env_parse("TOKENTREE_PAGE_WIDTH")? {
            config.page_width = k;
        }
        if let Some(n) = env_parse("TOKENTREE_INITIAL_DEPTH")? {
            config.initial_depth = n;
        }
        if let Some(depth) = env_parse("TOKENTREE_LOOKAHEAD_DEPTH")? {
            config.lookahead_depth = depth;
        }
        if let Some(ms) = env_parse("TOKENTREE_DEBOUNCE_MS")? {
            config.debounce_ms = ms;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_width == 0 {
            return Err(ConfigError::Invalid("page_width must be at least 1".to_string()));
        }
        if self.initial_depth == 0 {
            return Err(ConfigError::Invalid(
                "initial_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Children wanted per node: the k in-policy entries plus the separator
    pub fn children_target(&self) -> usize {
        self.page_width + 1
    }

    /// Entries needed to show the page holding `index` plus its separator;
    /// `None` when that width is not representable
    pub fn width_for_index(&self, index: usize) -> Option<usize> {
        (index / self.page_width + 1)
            .checked_mul(self.page_width)?
            .checked_add(1)
    }

    pub fn page_of(&self, index: usize) -> usize {
        index / self.page_width
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

// ============================================================================
// HTTP Transport Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl HttpConfig {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout_secs: 60,
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Load from `TOKENTREE_BACKEND_URL` and `TOKENTREE_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = std::env::var("TOKENTREE_BACKEND_URL")
            .map_err(|_| ConfigError::Missing("TOKENTREE_BACKEND_URL"))?;
        let mut config = Self::new(&url);
        if let Some(secs) = env_parse("TOKENTREE_TIMEOUT_SECS")? {
            config.timeout_secs = secs;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.base_url)
            .map_err(|e| ConfigError::Invalid(format!("base_url {:?}: {e}", self.base_url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "base_url must be http(s), got {}",
                url.scheme()
            )));
        }
        Ok(())
    }

    pub fn endpoint(&self, route: &str) -> String {
        format!("{}/{}", self.base_url, route.trim_start_matches('/'))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn env_parse<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("{name}={raw:?} is not a number"))),
        Err(_) => Ok(None),
    }
}
