use sieve_core::IndexerError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database connection error: {0}")]
    Connection(#[from] tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Invalid schema name: {0}")]
    InvalidSchemaName(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Indexer not found: {0}")]
    IndexerNotFound(String),

    #[error("Data inconsistency: {0}")]
    DataInconsistency(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<DbError> for IndexerError {
    fn from(e: DbError) -> Self {
        IndexerError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converts_to_storage_error() {
        let err: IndexerError = DbError::IndexerNotFound("balances".into()).into();
        assert!(matches!(err, IndexerError::Storage(ref msg) if msg == "Indexer not found: balances"));
    }
}
