use crate::{
    config::DbConfig,
    error::{DbError, Result},
};
use deadpool_postgres::{Client, Manager, ManagerConfig, Pool, RecyclingMethod};
use std::time::Duration;
use tokio_postgres::{types::ToSql, NoTls, Row};
use tracing::{debug, info, warn};

/// Database connection pool wrapper
#[derive(Clone)]
pub struct ConnectionPool {
    pool: Pool,
}

impl ConnectionPool {
    /// Create a new connection pool from configuration
    pub async fn new(config: &DbConfig) -> Result<Self> {
        let pg_config = config
            .dsn
            .parse::<tokio_postgres::Config>()
            .map_err(|e| DbError::Configuration(format!("Invalid DSN: {}", e)))?;

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let mgr = Manager::from_config(pg_config, NoTls, mgr_config);

        let pool = Pool::builder(mgr)
            .max_size(config.max_connections as usize)
            .create_timeout(Some(Duration::from_secs(config.connection_timeout_secs)))
            .wait_timeout(Some(Duration::from_secs(config.connection_timeout_secs)))
            .recycle_timeout(Some(Duration::from_secs(config.recycle_timeout_secs)))
            .build()
            .map_err(|_| DbError::Configuration("Failed to create pool".into()))?;

        // Test the connection
        let _ = pool.get().await?;
        info!(
            "Database connection pool initialized with {} max connections",
            config.max_connections
        );

        Ok(Self { pool })
    }

    /// Get a connection from the pool
    pub async fn get(&self) -> Result<DbConnection> {
        let client = self.pool.get().await?;
        Ok(DbConnection { client })
    }
}

/// Wrapper around a pooled database connection
pub struct DbConnection {
    client: Client,
}

impl DbConnection {
    /// Execute a statement
    pub async fn execute(&self, statement: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        debug!("Executing: {}", statement);
        self.client
            .execute(statement, params)
            .await
            .map_err(Into::into)
    }

    /// Execute a batch of statements
    pub async fn batch_execute(&self, statements: &str) -> Result<()> {
        debug!("Batch executing: {} bytes", statements.len());
        self.client
            .batch_execute(statements)
            .await
            .map_err(Into::into)
    }

    /// Query and return a single row
    pub async fn query_one(&self, statement: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Row> {
        debug!("Querying one: {}", statement);
        self.client
            .query_one(statement, params)
            .await
            .map_err(Into::into)
    }

    /// Query and return an optional single row
    pub async fn query_opt(
        &self,
        statement: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<Row>> {
        debug!("Querying optional: {}", statement);
        self.client
            .query_opt(statement, params)
            .await
            .map_err(Into::into)
    }

    /// Start a transaction that owns this connection until commit or rollback.
    pub async fn into_transaction(self) -> Result<TransactionWrapper> {
        self.client.batch_execute("BEGIN").await?;
        Ok(TransactionWrapper {
            client: Some(self.client),
        })
    }
}

/// Transaction holding its pooled connection.
///
/// Dropped without `commit` or `rollback`, the connection is detached from the
/// pool and closed, so the server aborts the open transaction.
pub struct TransactionWrapper {
    client: Option<Client>,
}

impl TransactionWrapper {
    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| DbError::Transaction("transaction already finished".into()))
    }

    /// Execute a statement
    pub async fn execute(&self, statement: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        self.client()?
            .execute(statement, params)
            .await
            .map_err(Into::into)
    }

    /// Query and return rows
    pub async fn query(&self, statement: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>> {
        self.client()?
            .query(statement, params)
            .await
            .map_err(Into::into)
    }

    /// Query and return an optional single row
    pub async fn query_opt(
        &self,
        statement: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<Row>> {
        self.client()?
            .query_opt(statement, params)
            .await
            .map_err(Into::into)
    }

    async fn finish(mut self, statement: &str) -> Result<()> {
        let client = self
            .client
            .take()
            .ok_or_else(|| DbError::Transaction("transaction already finished".into()))?;
        match client.batch_execute(statement).await {
            Ok(()) => Ok(()),
            Err(e) => {
                drop(Client::take(client));
                Err(e.into())
            }
        }
    }

    /// Commit the transaction
    pub async fn commit(self) -> Result<()> {
        self.finish("COMMIT").await
    }

    /// Rollback the transaction
    pub async fn rollback(self) -> Result<()> {
        self.finish("ROLLBACK").await
    }
}

impl Drop for TransactionWrapper {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            warn!("Transaction dropped while open, discarding its connection");
            drop(Client::take(client));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_dsn_rejected() {
        let err = ConnectionPool::new(&DbConfig::new("host=localhost port=notaport"))
            .await
            .err()
            .map(|e| e.to_string());
        assert!(err.is_some_and(|e| e.starts_with("Configuration error")));
    }
}
