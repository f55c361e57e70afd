use super::{IndexerCheckpoint, Storage, StorageTransaction, LOCAL_SCHEMA};
use crate::{
    error::{IndexerError, Result},
    store::StoreOperation,
    types::{BlockHeight, NetworkMeta},
};
use async_trait::async_trait;
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

#[derive(Debug, Clone, Default)]
struct SchemaState {
    metadata: BTreeMap<String, Value>,
    entities: BTreeMap<(String, String), Value>,
}

#[derive(Debug, Default)]
struct State {
    checkpoints: HashMap<String, IndexerCheckpoint>,
    schemas: HashMap<String, SchemaState>,
    schema_seq: u64,
    commits: u64,
    rollbacks: u64,
}

/// In-process storage backend.
///
/// Transactions work on a snapshot of their schema and publish it on commit.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<State>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn entity(&self, schema: &str, entity: &str, id: &str) -> Option<Value> {
        self.lock()
            .schemas
            .get(schema)
            .and_then(|s| s.entities.get(&(entity.to_string(), id.to_string())))
            .cloned()
    }

    pub fn entity_count(&self, schema: &str) -> usize {
        self.lock()
            .schemas
            .get(schema)
            .map_or(0, |s| s.entities.len())
    }

    pub fn metadata(&self, schema: &str, key: &str) -> Option<Value> {
        self.lock()
            .schemas
            .get(schema)
            .and_then(|s| s.metadata.get(key))
            .cloned()
    }

    pub fn commits(&self) -> u64 {
        self.lock().commits
    }

    pub fn rollbacks(&self) -> u64 {
        self.lock().rollbacks
    }

    /// Inserts a checkpoint as if written by an earlier run.
    pub fn seed_checkpoint(&self, checkpoint: IndexerCheckpoint) {
        self.lock()
            .checkpoints
            .insert(checkpoint.name.clone(), checkpoint);
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load_checkpoint(&self, name: &str) -> Result<Option<IndexerCheckpoint>> {
        Ok(self.lock().checkpoints.get(name).cloned())
    }

    async fn create_checkpoint(
        &self,
        name: &str,
        next_block_height: BlockHeight,
        local_mode: bool,
        network: &NetworkMeta,
    ) -> Result<IndexerCheckpoint> {
        let mut state = self.lock();
        if state.checkpoints.contains_key(name) {
            return Err(IndexerError::Storage(format!(
                "indexer {} already exists",
                name
            )));
        }
        let db_schema = if local_mode {
            LOCAL_SCHEMA.to_string()
        } else {
            state.schema_seq += 1;
            format!("indexer_{}", state.schema_seq)
        };
        let checkpoint = IndexerCheckpoint {
            name: name.to_string(),
            db_schema,
            next_block_height,
            network: Some(network.chain.clone()),
            network_genesis_hash: Some(network.genesis_hash.clone()),
        };
        state
            .checkpoints
            .insert(name.to_string(), checkpoint.clone());
        Ok(checkpoint)
    }

    async fn update_checkpoint_network(&self, name: &str, network: &NetworkMeta) -> Result<()> {
        let mut state = self.lock();
        let checkpoint = state
            .checkpoints
            .get_mut(name)
            .ok_or_else(|| IndexerError::Storage(format!("indexer {} not found", name)))?;
        checkpoint.network.get_or_insert_with(|| network.chain.clone());
        checkpoint
            .network_genesis_hash
            .get_or_insert_with(|| network.genesis_hash.clone());
        Ok(())
    }

    async fn prepare_schema(&self, schema: &str) -> Result<()> {
        self.lock().schemas.entry(schema.to_string()).or_default();
        Ok(())
    }

    async fn begin(&self, checkpoint: &IndexerCheckpoint) -> Result<Box<dyn StorageTransaction>> {
        let state = self.lock();
        let stored = state
            .checkpoints
            .get(&checkpoint.name)
            .cloned()
            .ok_or_else(|| {
                IndexerError::Storage(format!("indexer {} not found", checkpoint.name))
            })?;
        let schema = state
            .schemas
            .get(&stored.db_schema)
            .cloned()
            .unwrap_or_default();
        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            checkpoint: stored,
            schema,
        }))
    }
}

struct MemoryTransaction {
    state: Arc<Mutex<State>>,
    checkpoint: IndexerCheckpoint,
    schema: SchemaState,
}

#[async_trait]
impl StorageTransaction for MemoryTransaction {
    async fn get_entity(&mut self, entity: &str, id: &str) -> Result<Option<Value>> {
        Ok(self
            .schema
            .entities
            .get(&(entity.to_string(), id.to_string()))
            .cloned())
    }

    async fn find_entities(
        &mut self,
        entity: &str,
        field: &str,
        value: &Value,
        limit: usize,
    ) -> Result<Vec<Value>> {
        Ok(self
            .schema
            .entities
            .iter()
            .filter(|((e, _), data)| e == entity && data.get(field) == Some(value))
            .map(|(_, data)| data.clone())
            .take(limit)
            .collect())
    }

    async fn apply(&mut self, operations: &[StoreOperation]) -> Result<()> {
        for op in operations {
            match op {
                StoreOperation::Set { entity, id, data } => {
                    self.schema
                        .entities
                        .insert((entity.clone(), id.clone()), data.clone());
                }
                StoreOperation::Remove { entity, id } => {
                    self.schema.entities.remove(&(entity.clone(), id.clone()));
                }
            }
        }
        Ok(())
    }

    async fn get_metadata(&mut self, key: &str) -> Result<Option<Value>> {
        Ok(self.schema.metadata.get(key).cloned())
    }

    async fn upsert_metadata(&mut self, key: &str, value: &Value) -> Result<()> {
        self.schema.metadata.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn insert_metadata_if_absent(&mut self, key: &str, value: &Value) -> Result<bool> {
        if self.schema.metadata.contains_key(key) {
            return Ok(false);
        }
        self.schema.metadata.insert(key.to_string(), value.clone());
        Ok(true)
    }

    async fn save_next_block_height(&mut self, height: BlockHeight) -> Result<()> {
        self.checkpoint.next_block_height = height;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        let mut state = this.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .schemas
            .insert(this.checkpoint.db_schema.clone(), this.schema);
        state
            .checkpoints
            .insert(this.checkpoint.name.clone(), this.checkpoint);
        state.commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.rollbacks += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MetadataKey;
    use serde_json::json;

    fn network() -> NetworkMeta {
        NetworkMeta {
            chain: "Development".into(),
            spec_name: "node".into(),
            genesis_hash: "0xaa".into(),
        }
    }

    #[tokio::test]
    async fn test_schema_allocation() {
        let storage = MemoryStorage::new();
        let a = storage.create_checkpoint("a", 1, false, &network()).await.unwrap();
        let b = storage.create_checkpoint("b", 1, false, &network()).await.unwrap();
        let local = storage.create_checkpoint("c", 1, true, &network()).await.unwrap();

        assert_eq!(a.db_schema, "indexer_1");
        assert_eq!(b.db_schema, "indexer_2");
        assert_eq!(local.db_schema, LOCAL_SCHEMA);
        assert!(storage.create_checkpoint("a", 1, false, &network()).await.is_err());
    }

    #[tokio::test]
    async fn test_write_once_metadata() {
        let storage = MemoryStorage::new();
        let checkpoint = storage.create_checkpoint("a", 1, true, &network()).await.unwrap();

        let mut tx = storage.begin(&checkpoint).await.unwrap();
        tx.write_metadata(MetadataKey::BlockOffset, json!(4)).await.unwrap();
        tx.write_metadata(MetadataKey::BlockOffset, json!(99)).await.unwrap();
        tx.write_metadata(MetadataKey::SpecName, json!("old")).await.unwrap();
        tx.write_metadata(MetadataKey::SpecName, json!("new")).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(storage.metadata(LOCAL_SCHEMA, "blockOffset"), Some(json!(4)));
        assert_eq!(storage.metadata(LOCAL_SCHEMA, "specName"), Some(json!("new")));
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let storage = MemoryStorage::new();
        let checkpoint = storage.create_checkpoint("a", 1, true, &network()).await.unwrap();

        let mut tx = storage.begin(&checkpoint).await.unwrap();
        tx.apply(&[StoreOperation::Set {
            entity: "Transfer".into(),
            id: "1".into(),
            data: json!({ "id": "1" }),
        }])
        .await
        .unwrap();
        tx.save_next_block_height(2).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(storage.entity_count(LOCAL_SCHEMA), 0);
        let stored = storage.load_checkpoint("a").await.unwrap().unwrap();
        assert_eq!(stored.next_block_height, 1);
        assert_eq!(storage.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_update_network_keeps_existing() {
        let storage = MemoryStorage::new();
        storage.seed_checkpoint(IndexerCheckpoint {
            name: "a".into(),
            db_schema: "indexer_1".into(),
            next_block_height: 10,
            network: None,
            network_genesis_hash: Some("0xaa".into()),
        });
        storage
            .update_checkpoint_network("a", &network())
            .await
            .unwrap();
        let stored = storage.load_checkpoint("a").await.unwrap().unwrap();
        assert_eq!(stored.network.as_deref(), Some("Development"));
        assert_eq!(stored.network_genesis_hash.as_deref(), Some("0xaa"));
    }
}
