//! Test doubles for the chain boundary.

use crate::{
    chain::ChainClient,
    error::{IndexerError, Result},
    types::{fixtures, BlockContent, BlockHash, BlockHeight, NetworkMeta},
};
use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Mutex,
};

pub struct MockChain {
    network: NetworkMeta,
    finalized: AtomicU64,
    best: AtomicU64,
    /// (first height, spec version), sorted by height
    upgrades: Vec<(BlockHeight, u32)>,
    fetch_failures: AtomicU32,
    pub prefetches: Mutex<Vec<BlockHeight>>,
    pub fetches: Mutex<Vec<(Vec<BlockHeight>, Option<u32>)>>,
}

impl MockChain {
    pub fn network() -> NetworkMeta {
        NetworkMeta {
            chain: "Development".into(),
            spec_name: "node".into(),
            genesis_hash: format!("0x{}", "11".repeat(32)),
        }
    }

    pub fn new(finalized: BlockHeight) -> Self {
        Self {
            network: Self::network(),
            finalized: AtomicU64::new(finalized),
            best: AtomicU64::new(finalized + 2),
            upgrades: vec![(0, 1)],
            fetch_failures: AtomicU32::new(0),
            prefetches: Mutex::new(Vec::new()),
            fetches: Mutex::new(Vec::new()),
        }
    }

    pub fn with_genesis(mut self, genesis_hash: &str) -> Self {
        self.network.genesis_hash = genesis_hash.to_string();
        self
    }

    /// Runtime `version` takes effect at `height`.
    pub fn with_upgrade(mut self, height: BlockHeight, version: u32) -> Self {
        self.upgrades.push((height, version));
        self.upgrades.sort();
        self
    }

    /// The next `n` batch fetches fail.
    pub fn with_fetch_failures(self, n: u32) -> Self {
        self.fetch_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn set_finalized(&self, height: BlockHeight) {
        self.finalized.store(height, Ordering::SeqCst);
    }

    pub fn version_at(&self, height: BlockHeight) -> u32 {
        self.upgrades
            .iter()
            .rev()
            .find(|(h, _)| *h <= height)
            .map_or(1, |(_, v)| *v)
    }

    pub fn prefetched(&self) -> Vec<BlockHeight> {
        self.prefetches.lock().unwrap().clone()
    }

    pub fn fetched(&self) -> Vec<(Vec<BlockHeight>, Option<u32>)> {
        self.fetches.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChainClient for MockChain {
    fn network_meta(&self) -> &NetworkMeta {
        &self.network
    }

    async fn finalized_height(&self) -> Result<BlockHeight> {
        Ok(self.finalized.load(Ordering::SeqCst))
    }

    async fn best_height(&self) -> Result<BlockHeight> {
        Ok(self.best.load(Ordering::SeqCst))
    }

    async fn runtime_version(&self, height: BlockHeight) -> Result<u32> {
        Ok(self.version_at(height))
    }

    async fn fetch_blocks_batch(
        &self,
        heights: &[BlockHeight],
        spec_version_hint: Option<u32>,
    ) -> Result<Vec<BlockContent>> {
        self.fetches
            .lock()
            .unwrap()
            .push((heights.to_vec(), spec_version_hint));
        if self
            .fetch_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(IndexerError::Chain("connection reset".into()));
        }
        Ok(heights
            .iter()
            .map(|h| {
                let version =
                    spec_version_hint.unwrap_or_else(|| self.version_at(h.saturating_sub(1)));
                fixtures::transfer_block(*h, version)
            })
            .collect())
    }

    async fn prefetch_metadata(&self, height: BlockHeight) -> Result<()> {
        self.prefetches.lock().unwrap().push(height);
        Ok(())
    }

    async fn storage_at(&self, key: &[u8], at: BlockHash) -> Result<Option<Vec<u8>>> {
        let mut value = key.to_vec();
        value.extend_from_slice(&at.0[..8]);
        Ok(Some(value))
    }
}
