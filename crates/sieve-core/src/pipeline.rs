use crate::{
    chain::ChainClient,
    config::NodeConfig,
    dispatcher::{BlockDispatcher, ProcessBlock},
    error::{IndexerError, Result},
    fetcher::BlockFetcher,
    network_index::{IndexerFilters, NetworkIndexService},
    queue::BlockedQueue,
    scheduler::{run_head_refresher, ChainHeads, Head, HeightScheduler},
    shutdown::Shutdown,
    types::{BlockContent, BlockHeight},
};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Wires scheduler, fetcher and dispatcher together through two bounded queues.
pub struct Pipeline {
    chain: Arc<dyn ChainClient>,
    start_height: BlockHeight,
    batch_size: usize,
    capacity: usize,
    head_poll_interval: Duration,
    fetch_retries: u32,
    network_index: Option<(Arc<dyn NetworkIndexService>, IndexerFilters)>,
    shutdown: Shutdown,
}

async fn join_quietly(name: &str, handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        warn!(task = name, error = %e, "Pipeline task panicked");
    }
}

impl Pipeline {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        config: &NodeConfig,
        start_height: BlockHeight,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            chain,
            start_height,
            batch_size: config.batch_size,
            capacity: config.queue_capacity(),
            head_poll_interval: config.head_poll_interval,
            fetch_retries: config.fetch_retries,
            network_index: None,
            shutdown,
        }
    }

    pub fn with_network_index(
        mut self,
        service: Arc<dyn NetworkIndexService>,
        filters: IndexerFilters,
    ) -> Self {
        self.network_index = Some((service, filters));
        self
    }

    /// Runs until shutdown or the first fatal error. The block being
    /// processed when shutdown fires is completed first.
    pub async fn run(self, processor: &mut dyn ProcessBlock) -> Result<()> {
        let heads = Arc::new(ChainHeads::new());
        heads.refresh_finalized(self.chain.as_ref()).await;
        heads.refresh_best(self.chain.as_ref()).await;

        let heights = Arc::new(BlockedQueue::<BlockHeight>::new(self.capacity));
        let blocks = Arc::new(BlockedQueue::<BlockContent>::new(self.capacity));

        let mut scheduler = HeightScheduler::new(
            heights.clone(),
            heads.finalized(),
            self.batch_size,
            self.start_height,
            self.chain.network_meta().genesis_hash.clone(),
            self.shutdown.clone(),
        );
        if let Some((service, filters)) = self.network_index {
            info!("Using network index to skip empty ranges");
            scheduler = scheduler.with_network_index(service, filters);
        }
        let fetcher = BlockFetcher::new(
            self.chain.clone(),
            heights,
            blocks.clone(),
            self.batch_size,
            self.shutdown.clone(),
        )
        .with_retries(self.fetch_retries);

        let refreshers = [Head::Finalized, Head::Best].map(|head| {
            tokio::spawn(run_head_refresher(
                heads.clone(),
                self.chain.clone(),
                head,
                self.head_poll_interval,
                self.shutdown.clone(),
            ))
        });
        let scheduler_task = tokio::spawn(scheduler.run());
        let fetcher_task = {
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                let result = fetcher.run().await;
                if result.is_err() {
                    shutdown.trigger();
                }
                result
            })
        };

        info!(start = self.start_height, "Indexing pipeline started");
        let dispatcher = BlockDispatcher::new(blocks, self.shutdown.clone());
        let dispatched = dispatcher.run(processor).await;
        self.shutdown.trigger();

        let fetched = match fetcher_task.await {
            Ok(result) => result,
            Err(e) => Err(IndexerError::Chain(format!("fetcher task failed: {}", e))),
        };
        join_quietly("scheduler", scheduler_task).await;
        for refresher in refreshers {
            join_quietly("head refresher", refresher).await;
        }

        dispatched?;
        fetched
    }
}
