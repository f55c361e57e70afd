use crate::error::{IndexerError, Result};
use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// Indexer node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Directory (or manifest file) of the project to index
    pub project_path: PathBuf,
    /// Blocks per fetch/schedule round
    pub batch_size: usize,
    /// Handler execution ceiling
    pub timeout: Duration,
    /// Store entities in the `public` schema instead of a per-indexer one
    pub local_mode: bool,
    /// Overrides the endpoint declared in the manifest
    pub network_endpoint: Option<String>,
    /// External network index service (GraphQL)
    pub network_indexer: Option<String>,
    /// Maximum rows returned by `Store::get_by_field`
    pub query_limit: usize,
    /// Interval between finalized/best head polls
    pub head_poll_interval: Duration,
    /// Attempts per block batch before the fetcher gives up
    pub fetch_retries: u32,
    /// Include handler inputs in handler errors
    pub debug: bool,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|s| matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

impl NodeConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            project_path: env::var("PROJECT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            batch_size: env_or("BATCH_SIZE", 100),
            timeout: Duration::from_secs(env_or("HANDLER_TIMEOUT", 900)),
            local_mode: env_flag("LOCAL_MODE"),
            network_endpoint: env::var("NETWORK_ENDPOINT").ok(),
            network_indexer: env::var("NETWORK_INDEXER").ok(),
            query_limit: env_or("QUERY_LIMIT", 100),
            head_poll_interval: Duration::from_secs(env_or("HEAD_POLL_INTERVAL", 5)),
            fetch_retries: env_or("FETCH_RETRIES", 3),
            debug: env_flag("DEBUG"),
        }
    }

    pub fn new(project_path: impl Into<PathBuf>) -> Self {
        Self {
            project_path: project_path.into(),
            batch_size: 100,
            timeout: Duration::from_secs(900),
            local_mode: false,
            network_endpoint: None,
            network_indexer: None,
            query_limit: 100,
            head_poll_interval: Duration::from_secs(5),
            fetch_retries: 3,
            debug: false,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_head_poll_interval(mut self, interval: Duration) -> Self {
        self.head_poll_interval = interval;
        self
    }

    /// Capacity of both pipeline queues.
    pub fn queue_capacity(&self) -> usize {
        self.batch_size * 3
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(IndexerError::Config("BATCH_SIZE must be positive".into()));
        }
        if self.timeout.is_zero() {
            return Err(IndexerError::Config("HANDLER_TIMEOUT must be positive".into()));
        }
        if self.query_limit == 0 {
            return Err(IndexerError::Config("QUERY_LIMIT must be positive".into()));
        }
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
