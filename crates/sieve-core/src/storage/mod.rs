//! Storage boundary shared by the processor and the indexer manager.

mod memory;

pub use memory::MemoryStorage;

use crate::{
    error::Result,
    store::StoreOperation,
    types::{BlockHeight, NetworkMeta},
};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

/// Schema used for every indexer in local mode.
pub const LOCAL_SCHEMA: &str = "public";

/// Persistent progress record of one indexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexerCheckpoint {
    pub name: String,
    pub db_schema: String,
    pub next_block_height: BlockHeight,
    /// Chain name, written once.
    pub network: Option<String>,
    /// Genesis hash, written once.
    pub network_genesis_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataKey {
    BlockOffset,
    Chain,
    SpecName,
    GenesisHash,
    LastProcessedHeight,
    LastProcessedTimestamp,
}

impl MetadataKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BlockOffset => "blockOffset",
            Self::Chain => "chain",
            Self::SpecName => "specName",
            Self::GenesisHash => "genesisHash",
            Self::LastProcessedHeight => "lastProcessedHeight",
            Self::LastProcessedTimestamp => "lastProcessedTimestamp",
        }
    }

    /// Keys that keep their first stored value.
    pub fn is_write_once(&self) -> bool {
        matches!(self, Self::BlockOffset | Self::GenesisHash)
    }
}

impl fmt::Display for MetadataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn load_checkpoint(&self, name: &str) -> Result<Option<IndexerCheckpoint>>;

    /// Registers a new indexer, allocating its schema.
    async fn create_checkpoint(
        &self,
        name: &str,
        next_block_height: BlockHeight,
        local_mode: bool,
        network: &NetworkMeta,
    ) -> Result<IndexerCheckpoint>;

    /// Fills in network identity on a checkpoint created without it.
    async fn update_checkpoint_network(&self, name: &str, network: &NetworkMeta) -> Result<()>;

    /// Creates the metadata and entity tables of `schema` if missing.
    async fn prepare_schema(&self, schema: &str) -> Result<()>;

    async fn begin(&self, checkpoint: &IndexerCheckpoint) -> Result<Box<dyn StorageTransaction>>;
}

/// One open storage transaction. Dropping it without `commit` discards its writes.
#[async_trait]
pub trait StorageTransaction: Send {
    async fn get_entity(&mut self, entity: &str, id: &str) -> Result<Option<Value>>;

    /// Entities whose `field` equals `value`, at most `limit` of them.
    async fn find_entities(
        &mut self,
        entity: &str,
        field: &str,
        value: &Value,
        limit: usize,
    ) -> Result<Vec<Value>>;

    async fn apply(&mut self, operations: &[StoreOperation]) -> Result<()>;

    async fn get_metadata(&mut self, key: &str) -> Result<Option<Value>>;

    async fn upsert_metadata(&mut self, key: &str, value: &Value) -> Result<()>;

    /// Returns whether the value was inserted.
    async fn insert_metadata_if_absent(&mut self, key: &str, value: &Value) -> Result<bool>;

    async fn save_next_block_height(&mut self, height: BlockHeight) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;

    /// Writes a metadata key, leaving write-once keys untouched once set.
    async fn write_metadata(&mut self, key: MetadataKey, value: Value) -> Result<()> {
        if key.is_write_once() {
            self.insert_metadata_if_absent(key.as_str(), &value).await?;
            Ok(())
        } else {
            self.upsert_metadata(key.as_str(), &value).await
        }
    }
}
