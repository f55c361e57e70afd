use crate::{
    chain::ChainClient,
    error::{IndexerError, Result},
    metrics,
    queue::BlockedQueue,
    shutdown::Shutdown,
    types::{BlockContent, BlockHeight},
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

const IDLE_DELAY: Duration = Duration::from_secs(1);
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Turns scheduled heights into decoded blocks, batch by batch.
pub struct BlockFetcher {
    chain: Arc<dyn ChainClient>,
    heights: Arc<BlockedQueue<BlockHeight>>,
    blocks: Arc<BlockedQueue<BlockContent>>,
    batch_size: usize,
    retries: u32,
    parent_spec_version: Option<u32>,
    shutdown: Shutdown,
}

impl BlockFetcher {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        heights: Arc<BlockedQueue<BlockHeight>>,
        blocks: Arc<BlockedQueue<BlockContent>>,
        batch_size: usize,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            chain,
            heights,
            blocks,
            batch_size: batch_size.max(1),
            retries: 3,
            parent_spec_version: None,
            shutdown,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries.max(1);
        self
    }

    pub fn parent_spec_version(&self) -> Option<u32> {
        self.parent_spec_version
    }

    pub async fn run(mut self) -> Result<()> {
        info!("Block fetcher started");
        let shutdown = self.shutdown.clone();
        while !shutdown.is_triggered() {
            let filled = tokio::select! {
                filled = self.fill_next() => filled?,
                _ = shutdown.wait() => break,
            };
            if !filled {
                shutdown.sleep(IDLE_DELAY).await;
            }
        }
        debug!("Block fetcher stopped");
        Ok(())
    }

    /// Fetches one batch. Returns `false` when there was nothing to take
    /// or no room to put it.
    pub async fn fill_next(&mut self) -> Result<bool> {
        let take = self.blocks.free_size().min(self.batch_size);
        if self.heights.is_empty() || take == 0 {
            return Ok(false);
        }

        let heights = self.heights.take_all(Some(take)).await;
        let Some(&last) = heights.last() else {
            return Ok(false);
        };

        let metadata_changed = self.fetch_meta(last).await?;
        let hint = if metadata_changed {
            None
        } else {
            self.parent_spec_version
        };

        let blocks = self.fetch_with_retry(&heights, hint).await?;
        debug!(
            from = heights[0],
            to = last,
            count = blocks.len(),
            "Fetched block batch"
        );
        self.blocks.put_all(blocks).await;
        metrics::set(metrics::BLOCK_QUEUE_SIZE, self.blocks.size() as u64);
        metrics::set(metrics::BLOCKNUMBER_QUEUE_SIZE, self.heights.size() as u64);
        Ok(true)
    }

    /// Prefetches metadata when the runtime at the parent of `height`
    /// differs from the last one seen. Returns whether it did.
    pub async fn fetch_meta(&mut self, height: BlockHeight) -> Result<bool> {
        let parent = height.saturating_sub(1);
        let version = self.chain.runtime_version(parent).await?;
        if self.parent_spec_version == Some(version) {
            return Ok(false);
        }
        if let Some(previous) = self.parent_spec_version {
            info!(previous, version, height, "Runtime upgrade detected");
        }
        self.chain.prefetch_metadata(height).await?;
        self.parent_spec_version = Some(version);
        Ok(true)
    }

    async fn fetch_with_retry(
        &self,
        heights: &[BlockHeight],
        hint: Option<u32>,
    ) -> Result<Vec<BlockContent>> {
        let mut attempt = 1;
        loop {
            match self.chain.fetch_blocks_batch(heights, hint).await {
                Ok(blocks) if blocks.len() == heights.len() => return Ok(blocks),
                Ok(blocks) => {
                    return Err(IndexerError::Chain(format!(
                        "requested {} blocks, node returned {}",
                        heights.len(),
                        blocks.len()
                    )))
                }
                Err(e) if attempt < self.retries => {
                    warn!(error = %e, attempt, "Block batch fetch failed, retrying");
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
