use crate::{
    connection::{ConnectionPool, TransactionWrapper},
    error::DbError,
    schema::{self, SchemaManager, INDEXERS_TABLE, SCHEMA_SEQUENCE},
};
use async_trait::async_trait;
use serde_json::Value;
use sieve_core::{
    BlockHeight, IndexerCheckpoint, NetworkMeta, Result, Storage, StorageTransaction,
    StoreOperation, LOCAL_SCHEMA,
};
use tokio_postgres::Row;
use tracing::{debug, info};

fn to_db_height(height: BlockHeight) -> std::result::Result<i64, DbError> {
    i64::try_from(height)
        .map_err(|_| DbError::DataInconsistency(format!("height {} out of range", height)))
}

fn checkpoint_from_row(row: &Row) -> std::result::Result<IndexerCheckpoint, DbError> {
    let next: i64 = row.get("next_block_height");
    Ok(IndexerCheckpoint {
        name: row.get("name"),
        db_schema: row.get("db_schema"),
        next_block_height: u64::try_from(next).map_err(|_| {
            DbError::DataInconsistency(format!("negative next_block_height {}", next))
        })?,
        network: row.get("network"),
        network_genesis_hash: row.get("network_genesis"),
    })
}

/// Name of the schema a new indexer gets.
pub fn allocate_schema_name(local_mode: bool, seq: i64) -> String {
    if local_mode {
        LOCAL_SCHEMA.to_string()
    } else {
        format!("indexer_{}", seq)
    }
}

/// PostgreSQL storage backend.
#[derive(Clone)]
pub struct PgStorage {
    pool: ConnectionPool,
}

impl PgStorage {
    /// Wraps `pool`, creating the indexer registry if missing.
    pub async fn new(pool: ConnectionPool) -> Result<Self> {
        let conn = pool.get().await?;
        schema::initialize_registry(&conn).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn load_checkpoint(&self, name: &str) -> Result<Option<IndexerCheckpoint>> {
        let conn = self.pool.get().await?;
        let sql = format!(
            "SELECT name, db_schema, next_block_height, network, network_genesis
             FROM {INDEXERS_TABLE} WHERE name = $1"
        );
        let row = conn.query_opt(&sql, &[&name]).await?;
        Ok(row.as_ref().map(checkpoint_from_row).transpose()?)
    }

    async fn create_checkpoint(
        &self,
        name: &str,
        next_block_height: BlockHeight,
        local_mode: bool,
        network: &NetworkMeta,
    ) -> Result<IndexerCheckpoint> {
        let conn = self.pool.get().await?;
        let seq = if local_mode {
            0
        } else {
            let row = conn
                .query_one(&format!("SELECT nextval('{SCHEMA_SEQUENCE}')"), &[])
                .await?;
            row.get::<_, i64>(0)
        };
        let db_schema = allocate_schema_name(local_mode, seq);

        let sql = format!(
            "INSERT INTO {INDEXERS_TABLE} (name, db_schema, next_block_height, network, network_genesis)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING name, db_schema, next_block_height, network, network_genesis"
        );
        let row = conn
            .query_one(
                &sql,
                &[
                    &name,
                    &db_schema,
                    &to_db_height(next_block_height)?,
                    &network.chain,
                    &network.genesis_hash,
                ],
            )
            .await?;
        info!(name, schema = %db_schema, "Created indexer record");
        Ok(checkpoint_from_row(&row)?)
    }

    async fn update_checkpoint_network(&self, name: &str, network: &NetworkMeta) -> Result<()> {
        let conn = self.pool.get().await?;
        let sql = format!(
            "UPDATE {INDEXERS_TABLE}
             SET network = COALESCE(network, $2),
                 network_genesis = COALESCE(network_genesis, $3),
                 updated_at = NOW()
             WHERE name = $1"
        );
        let updated = conn
            .execute(&sql, &[&name, &network.chain, &network.genesis_hash])
            .await?;
        if updated == 0 {
            return Err(DbError::IndexerNotFound(name.to_string()).into());
        }
        Ok(())
    }

    async fn prepare_schema(&self, schema: &str) -> Result<()> {
        let conn = self.pool.get().await?;
        SchemaManager::new(schema)?.initialize(&conn).await?;
        Ok(())
    }

    async fn begin(&self, checkpoint: &IndexerCheckpoint) -> Result<Box<dyn StorageTransaction>> {
        let schema = SchemaManager::new(checkpoint.db_schema.as_str())?;
        let tx = self.pool.get().await?.into_transaction().await?;
        debug!(schema = %checkpoint.db_schema, "Opened transaction");
        Ok(Box::new(PgTransaction {
            tx,
            indexer: checkpoint.name.clone(),
            metadata_table: schema.metadata_table(),
            entities_table: schema.entities_table(),
        }))
    }
}

/// One block's worth of writes against an indexer schema.
pub struct PgTransaction {
    tx: TransactionWrapper,
    indexer: String,
    metadata_table: String,
    entities_table: String,
}

impl PgTransaction {
    fn upsert_entity_sql(&self) -> String {
        format!(
            "INSERT INTO {} (entity, id, data) VALUES ($1, $2, $3)
             ON CONFLICT (entity, id) DO UPDATE SET data = EXCLUDED.data, updated_at = NOW()",
            self.entities_table
        )
    }

    fn find_entities_sql(&self) -> String {
        format!(
            "SELECT data FROM {} WHERE entity = $1 AND data @> jsonb_build_object($2::text, $3::jsonb)
             ORDER BY id LIMIT $4",
            self.entities_table
        )
    }
}

#[async_trait]
impl StorageTransaction for PgTransaction {
    async fn get_entity(&mut self, entity: &str, id: &str) -> Result<Option<Value>> {
        let sql = format!(
            "SELECT data FROM {} WHERE entity = $1 AND id = $2",
            self.entities_table
        );
        let row = self.tx.query_opt(&sql, &[&entity, &id]).await?;
        Ok(row.map(|r| r.get(0)))
    }

    async fn find_entities(
        &mut self,
        entity: &str,
        field: &str,
        value: &Value,
        limit: usize,
    ) -> Result<Vec<Value>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .tx
            .query(&self.find_entities_sql(), &[&entity, &field, value, &limit])
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn apply(&mut self, operations: &[StoreOperation]) -> Result<()> {
        let upsert = self.upsert_entity_sql();
        let delete = format!(
            "DELETE FROM {} WHERE entity = $1 AND id = $2",
            self.entities_table
        );
        for op in operations {
            match op {
                StoreOperation::Set { entity, id, data } => {
                    self.tx.execute(&upsert, &[entity, id, data]).await?;
                }
                StoreOperation::Remove { entity, id } => {
                    self.tx.execute(&delete, &[entity, id]).await?;
                }
            }
        }
        Ok(())
    }

    async fn get_metadata(&mut self, key: &str) -> Result<Option<Value>> {
        let sql = format!("SELECT value FROM {} WHERE key = $1", self.metadata_table);
        let row = self.tx.query_opt(&sql, &[&key]).await?;
        Ok(row.map(|r| r.get(0)))
    }

    async fn upsert_metadata(&mut self, key: &str, value: &Value) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()",
            self.metadata_table
        );
        self.tx.execute(&sql, &[&key, value]).await?;
        Ok(())
    }

    async fn insert_metadata_if_absent(&mut self, key: &str, value: &Value) -> Result<bool> {
        let sql = format!(
            "INSERT INTO {} (key, value) VALUES ($1, $2) ON CONFLICT (key) DO NOTHING",
            self.metadata_table
        );
        Ok(self.tx.execute(&sql, &[&key, value]).await? == 1)
    }

    async fn save_next_block_height(&mut self, height: BlockHeight) -> Result<()> {
        let sql = format!(
            "UPDATE {INDEXERS_TABLE} SET next_block_height = $2, updated_at = NOW() WHERE name = $1"
        );
        let updated = self
            .tx
            .execute(&sql, &[&self.indexer, &to_db_height(height)?])
            .await?;
        if updated == 0 {
            return Err(DbError::IndexerNotFound(self.indexer.clone()).into());
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        Ok(self.tx.commit().await?)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(self.tx.rollback().await?)
    }
}
