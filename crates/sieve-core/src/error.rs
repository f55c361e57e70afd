use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("Chain error: {0}")]
    Chain(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Handler {handler} failed at block {height}: {reason}")]
    Handler {
        handler: String,
        height: u64,
        reason: String,
        /// Serialized handler input, only captured in debug mode.
        input: Option<String>,
    },

    #[error("Handler {handler} timed out after {timeout_secs}s at block {height}")]
    HandlerTimeout {
        handler: String,
        height: u64,
        timeout_secs: u64,
    },

    #[error("Network genesis mismatch: expected {expected}, chain reports {actual}")]
    NetworkMismatch { expected: String, actual: String },

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Mapping entry not found: {0}")]
    MappingNotFound(String),

    #[error("Datasource processor error: {0}")]
    DatasourceProcessor(String),

    #[error("No data source matches spec name {0}")]
    NoDataSources(String),

    #[error("Network index error: {0}")]
    NetworkIndex(String),

    #[error("Block {height} dispatched after block {previous}")]
    OutOfOrder { previous: u64, height: u64 },
}

impl IndexerError {
    /// Height and handler of a failed handler invocation, if this error came from one.
    pub fn handler_context(&self) -> Option<(&str, u64)> {
        match self {
            Self::Handler {
                handler, height, ..
            }
            | Self::HandlerTimeout {
                handler, height, ..
            } => Some((handler.as_str(), *height)),
            _ => None,
        }
    }
}

impl From<serde_yaml::Error> for IndexerError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Manifest(e.to_string())
    }
}

impl From<reqwest::Error> for IndexerError {
    fn from(e: reqwest::Error) -> Self {
        Self::NetworkIndex(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, IndexerError>;
