use crate::{
    error::Result,
    types::{BlockContent, BlockHash, BlockHeight, NetworkMeta},
};
use async_trait::async_trait;
use std::sync::Arc;

/// Connection to a Substrate node.
///
/// Transient network errors are returned to the caller, which owns the retry policy.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Identity of the connected chain, resolved at connect time.
    fn network_meta(&self) -> &NetworkMeta;

    async fn finalized_height(&self) -> Result<BlockHeight>;

    async fn best_height(&self) -> Result<BlockHeight>;

    /// Runtime spec version in effect at `height`.
    async fn runtime_version(&self, height: BlockHeight) -> Result<u32>;

    /// Fetches and decodes the given heights, preserving their order.
    ///
    /// Each block is tagged with its parent's spec version. When
    /// `spec_version_hint` is set it is used for every block instead of
    /// probing the parent version per height.
    async fn fetch_blocks_batch(
        &self,
        heights: &[BlockHeight],
        spec_version_hint: Option<u32>,
    ) -> Result<Vec<BlockContent>>;

    /// Primes the metadata cache for the runtime in effect at `height`.
    async fn prefetch_metadata(&self, height: BlockHeight) -> Result<()>;

    /// Raw storage value at `key`, read at the state of block `at`.
    async fn storage_at(&self, key: &[u8], at: BlockHash) -> Result<Option<Vec<u8>>>;
}

/// Chain state as seen by handlers, pinned to the block being processed.
#[derive(Clone)]
pub struct ChainView {
    client: Arc<dyn ChainClient>,
    block_hash: BlockHash,
    height: BlockHeight,
    spec_version: u32,
}

impl ChainView {
    pub fn new(client: Arc<dyn ChainClient>) -> Self {
        Self {
            client,
            block_hash: BlockHash::default(),
            height: 0,
            spec_version: 0,
        }
    }

    /// Moves the view to a new block. Only called between blocks.
    pub(crate) fn pin(&mut self, height: BlockHeight, hash: BlockHash, spec_version: u32) {
        self.height = height;
        self.block_hash = hash;
        self.spec_version = spec_version;
    }

    pub fn height(&self) -> BlockHeight {
        self.height
    }

    pub fn block_hash(&self) -> BlockHash {
        self.block_hash
    }

    pub fn spec_version(&self) -> u32 {
        self.spec_version
    }

    pub fn network(&self) -> &NetworkMeta {
        self.client.network_meta()
    }

    pub async fn storage(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.client.storage_at(key, self.block_hash).await
    }
}
