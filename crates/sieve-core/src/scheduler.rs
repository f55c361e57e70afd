use crate::{
    chain::ChainClient,
    metrics,
    network_index::{IndexerFilters, NetworkIndexService},
    queue::BlockedQueue,
    shutdown::Shutdown,
    types::{same_genesis, BlockHeight},
};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Lookahead window of one network index query.
pub const NETWORK_INDEX_MAX_QUERY_SIZE: BlockHeight = 10_000;

const IDLE_DELAY: Duration = Duration::from_secs(1);

/// Latest finalized and best heights, published by the head refreshers.
pub struct ChainHeads {
    finalized: watch::Sender<Option<BlockHeight>>,
    best: watch::Sender<Option<BlockHeight>>,
}

impl Default for ChainHeads {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainHeads {
    pub fn new() -> Self {
        Self {
            finalized: watch::channel(None).0,
            best: watch::channel(None).0,
        }
    }

    pub fn finalized(&self) -> watch::Receiver<Option<BlockHeight>> {
        self.finalized.subscribe()
    }

    pub fn best(&self) -> watch::Receiver<Option<BlockHeight>> {
        self.best.subscribe()
    }

    fn advance(sender: &watch::Sender<Option<BlockHeight>>, height: BlockHeight) -> bool {
        sender.send_if_modified(|current| {
            if current.map_or(true, |c| height > c) {
                *current = Some(height);
                true
            } else {
                false
            }
        })
    }

    /// Polls the finalized head once. Errors are logged, never returned.
    pub async fn refresh_finalized(&self, chain: &dyn ChainClient) {
        match chain.finalized_height().await {
            Ok(height) => {
                if Self::advance(&self.finalized, height) {
                    metrics::set(metrics::TARGET_BLOCK_HEIGHT, height);
                }
            }
            Err(e) => warn!(error = %e, "Failed to fetch finalized head"),
        }
    }

    /// Polls the best head once. Errors are logged, never returned.
    pub async fn refresh_best(&self, chain: &dyn ChainClient) {
        match chain.best_height().await {
            Ok(height) => {
                if Self::advance(&self.best, height) {
                    metrics::set(metrics::BEST_BLOCK_HEIGHT, height);
                }
            }
            Err(e) => warn!(error = %e, "Failed to fetch best head"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Head {
    Finalized,
    Best,
}

/// Refreshes one chain head every `interval` until shutdown.
pub async fn run_head_refresher(
    heads: Arc<ChainHeads>,
    chain: Arc<dyn ChainClient>,
    head: Head,
    interval: Duration,
    shutdown: Shutdown,
) {
    while !shutdown.is_triggered() {
        shutdown.sleep(interval).await;
        if shutdown.is_triggered() {
            break;
        }
        match head {
            Head::Finalized => heads.refresh_finalized(chain.as_ref()).await,
            Head::Best => heads.refresh_best(chain.as_ref()).await,
        }
    }
    debug!(?head, "Head refresher stopped");
}

struct FastPath {
    service: Arc<dyn NetworkIndexService>,
    filters: IndexerFilters,
}

/// Feeds the height queue with the next heights to fetch, never past the
/// finalized head.
pub struct HeightScheduler {
    heights: Arc<BlockedQueue<BlockHeight>>,
    finalized: watch::Receiver<Option<BlockHeight>>,
    batch_size: usize,
    initial_height: BlockHeight,
    latest_buffered: Option<BlockHeight>,
    genesis_hash: String,
    fast_path: Option<FastPath>,
    shutdown: Shutdown,
}

impl HeightScheduler {
    pub fn new(
        heights: Arc<BlockedQueue<BlockHeight>>,
        finalized: watch::Receiver<Option<BlockHeight>>,
        batch_size: usize,
        initial_height: BlockHeight,
        genesis_hash: impl Into<String>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            heights,
            finalized,
            batch_size: batch_size.max(1),
            initial_height,
            latest_buffered: None,
            genesis_hash: genesis_hash.into(),
            fast_path: None,
            shutdown,
        }
    }

    /// Enables the network index fast path.
    pub fn with_network_index(
        mut self,
        service: Arc<dyn NetworkIndexService>,
        filters: IndexerFilters,
    ) -> Self {
        self.fast_path = Some(FastPath { service, filters });
        self
    }

    pub fn latest_buffered_height(&self) -> Option<BlockHeight> {
        self.latest_buffered
    }

    pub fn uses_network_index(&self) -> bool {
        self.fast_path.is_some()
    }

    fn next_start(&self) -> BlockHeight {
        self.latest_buffered
            .map_or(self.initial_height, |h| h + 1)
    }

    fn set_latest_buffered(&mut self, height: BlockHeight) {
        self.latest_buffered = Some(height);
        metrics::set(metrics::BLOCKNUMBER_QUEUE_SIZE, self.heights.size() as u64);
    }

    pub async fn run(mut self) {
        info!(start = self.next_start(), "Height scheduler started");
        let shutdown = self.shutdown.clone();
        while !shutdown.is_triggered() {
            let filled = tokio::select! {
                filled = self.fill_next() => filled,
                _ = shutdown.wait() => break,
            };
            if !filled {
                shutdown.sleep(IDLE_DELAY).await;
            }
        }
        debug!("Height scheduler stopped");
    }

    /// Runs one scheduling round. Returns `false` when there was nothing to do.
    pub async fn fill_next(&mut self) -> bool {
        let start = self.next_start();
        let Some(finalized) = *self.finalized.borrow() else {
            return false;
        };
        let required = self.batch_size.min(self.heights.capacity());
        if self.heights.free_size() < required || start > finalized {
            return false;
        }

        if self.try_fast_path(start, finalized).await {
            return true;
        }

        let end = (start + self.batch_size as BlockHeight - 1).min(finalized);
        self.heights.put_all((start..=end).collect()).await;
        self.set_latest_buffered(end);
        true
    }

    async fn try_fast_path(&mut self, start: BlockHeight, finalized: BlockHeight) -> bool {
        let Some(fast_path) = &self.fast_path else {
            return false;
        };
        let query_end = start + NETWORK_INDEX_MAX_QUERY_SIZE;
        let result = match fast_path
            .service
            .query(start, query_end, self.batch_size, &fast_path.filters)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                debug!(error = %e, start, "Network index query failed, scanning sequentially");
                return false;
            }
        };

        if !same_genesis(&result.metadata.genesis_hash, &self.genesis_hash) {
            warn!(
                expected = %self.genesis_hash,
                actual = %result.metadata.genesis_hash,
                "Network index serves another chain, disabling it"
            );
            self.fast_path = None;
            return false;
        }
        if result.metadata.last_processed_height < start {
            warn!(
                indexed = result.metadata.last_processed_height,
                start, "Network index is behind the current height"
            );
            return false;
        }

        let heights: Vec<BlockHeight> = result
            .batch_blocks
            .into_iter()
            .filter(|h| *h >= start && *h <= finalized)
            .collect();

        match heights.last().copied() {
            None => {
                let skip_to = (query_end - 1)
                    .min(result.metadata.last_processed_height)
                    .min(finalized);
                debug!(start, skip_to, "No matching blocks in range");
                self.set_latest_buffered(skip_to);
            }
            Some(last) => {
                self.heights.put_all(heights).await;
                self.set_latest_buffered(last);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{IndexerError, Result},
        network_index::{NetworkIndexMetadata, NetworkIndexResult},
        testing::MockChain,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedIndex {
        responses: Mutex<Vec<Result<NetworkIndexResult>>>,
    }

    impl ScriptedIndex {
        fn new(responses: Vec<Result<NetworkIndexResult>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into_iter().rev().collect()),
            })
        }
    }

    #[async_trait]
    impl NetworkIndexService for ScriptedIndex {
        async fn query(
            &self,
            _start: BlockHeight,
            _query_end: BlockHeight,
            _batch_size: usize,
            _filters: &IndexerFilters,
        ) -> Result<NetworkIndexResult> {
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(IndexerError::NetworkIndex("exhausted".into())))
        }
    }

    fn indexed(genesis: &str, last_processed: BlockHeight, blocks: Vec<BlockHeight>) -> Result<NetworkIndexResult> {
        Ok(NetworkIndexResult {
            metadata: NetworkIndexMetadata {
                last_processed_height: last_processed,
                genesis_hash: genesis.into(),
                chain: None,
                spec_name: None,
                target_height: None,
            },
            batch_blocks: blocks,
        })
    }

    fn scheduler(
        capacity: usize,
        batch: usize,
        start: BlockHeight,
        finalized: Option<BlockHeight>,
    ) -> (HeightScheduler, Arc<BlockedQueue<BlockHeight>>, watch::Sender<Option<BlockHeight>>) {
        let queue = Arc::new(BlockedQueue::new(capacity));
        let (tx, rx) = watch::channel(finalized);
        let scheduler = HeightScheduler::new(queue.clone(), rx, batch, start, "0xgen", Shutdown::new());
        (scheduler, queue, tx)
    }

    #[tokio::test]
    async fn test_sequential_ranges() {
        let (mut scheduler, queue, _tx) = scheduler(30, 10, 5, Some(22));

        assert!(scheduler.fill_next().await);
        assert!(scheduler.fill_next().await);
        assert_eq!(scheduler.latest_buffered_height(), Some(22));
        assert!(!scheduler.fill_next().await);

        assert_eq!(queue.take_all(None).await, (5..=22).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_waits_for_finalized() {
        let (mut scheduler, queue, tx) = scheduler(30, 10, 5, None);
        assert!(!scheduler.fill_next().await);

        tx.send(Some(4)).unwrap();
        assert!(!scheduler.fill_next().await);

        tx.send(Some(7)).unwrap();
        assert!(scheduler.fill_next().await);
        assert_eq!(queue.take_all(None).await, vec![5, 6, 7]);
    }

    #[tokio::test]
    async fn test_waits_for_free_batch() {
        let (mut scheduler, queue, _tx) = scheduler(15, 10, 1, Some(100));
        assert!(scheduler.fill_next().await);
        // five free slots, less than a batch
        assert!(!scheduler.fill_next().await);
        assert_eq!(queue.size(), 10);
    }

    #[tokio::test]
    async fn test_fast_path_uses_indexed_heights() {
        let (scheduler, queue, _tx) = scheduler(30, 10, 1, Some(1_000));
        let index = ScriptedIndex::new(vec![
            indexed("0xgen", 5_000, vec![3, 40, 41]),
            indexed("0xgen", 5_000, vec![]),
        ]);
        let mut scheduler = scheduler.with_network_index(index, IndexerFilters::default());

        assert!(scheduler.fill_next().await);
        assert_eq!(queue.take_all(None).await, vec![3, 40, 41]);
        assert_eq!(scheduler.latest_buffered_height(), Some(41));

        // empty window skips up to the finalized head
        assert!(scheduler.fill_next().await);
        assert_eq!(scheduler.latest_buffered_height(), Some(1_000));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_fast_path_clamps_to_finalized() {
        let (scheduler, queue, _tx) = scheduler(30, 10, 1, Some(50));
        let index = ScriptedIndex::new(vec![indexed("0xgen", 5_000, vec![10, 49, 60])]);
        let mut scheduler = scheduler.with_network_index(index, IndexerFilters::default());

        assert!(scheduler.fill_next().await);
        assert_eq!(queue.take_all(None).await, vec![10, 49]);
        assert_eq!(scheduler.latest_buffered_height(), Some(49));
    }

    #[tokio::test]
    async fn test_genesis_mismatch_disables_fast_path() {
        let (scheduler, queue, _tx) = scheduler(30, 10, 1, Some(100));
        let index = ScriptedIndex::new(vec![
            indexed("0xother", 5_000, vec![3]),
            indexed("0xgen", 5_000, vec![50]),
        ]);
        let mut scheduler = scheduler.with_network_index(index, IndexerFilters::default());

        assert!(scheduler.fill_next().await);
        assert!(!scheduler.uses_network_index());
        assert_eq!(queue.take_all(None).await, (1..=10).collect::<Vec<_>>());

        assert!(scheduler.fill_next().await);
        assert_eq!(queue.take_all(None).await, (11..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_genesis_case_is_ignored() {
        let queue = Arc::new(BlockedQueue::new(30));
        let (_tx, rx) = watch::channel(Some(100));
        let index = ScriptedIndex::new(vec![indexed("0xABCDEF", 5_000, vec![7, 9])]);
        let mut scheduler =
            HeightScheduler::new(queue.clone(), rx, 10, 1, "0xabcdef", Shutdown::new())
                .with_network_index(index, IndexerFilters::default());

        assert!(scheduler.fill_next().await);
        assert!(scheduler.uses_network_index());
        assert_eq!(queue.take_all(None).await, vec![7, 9]);
    }

    #[tokio::test]
    async fn test_stale_index_skipped_for_one_round() {
        let (scheduler, queue, _tx) = scheduler(30, 10, 100, Some(1_000));
        let index = ScriptedIndex::new(vec![
            indexed("0xgen", 50, vec![]),
            indexed("0xgen", 5_000, vec![500]),
        ]);
        let mut scheduler = scheduler.with_network_index(index, IndexerFilters::default());

        assert!(scheduler.fill_next().await);
        assert!(scheduler.uses_network_index());
        assert_eq!(queue.take_all(None).await, (100..=109).collect::<Vec<_>>());

        assert!(scheduler.fill_next().await);
        assert_eq!(queue.take_all(None).await, vec![500]);
    }

    #[tokio::test]
    async fn test_index_error_falls_back() {
        let (scheduler, queue, _tx) = scheduler(30, 10, 1, Some(5));
        let index = ScriptedIndex::new(vec![Err(IndexerError::NetworkIndex("down".into()))]);
        let mut scheduler = scheduler.with_network_index(index, IndexerFilters::default());

        assert!(scheduler.fill_next().await);
        assert!(scheduler.uses_network_index());
        assert_eq!(queue.take_all(None).await, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_heads_only_advance() {
        let heads = ChainHeads::new();
        let chain = MockChain::new(10);
        let finalized = heads.finalized();

        heads.refresh_finalized(&chain).await;
        heads.refresh_best(&chain).await;
        assert_eq!(*finalized.borrow(), Some(10));
        assert_eq!(*heads.best().borrow(), Some(12));

        chain.set_finalized(8);
        heads.refresh_finalized(&chain).await;
        assert_eq!(*finalized.borrow(), Some(10));
    }
}
