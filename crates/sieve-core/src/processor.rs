use crate::{
    chain::{ChainClient, ChainView},
    dispatcher::ProcessBlock,
    ds_processor::{BaseHandler, DatasourceProcessor, DsProcessorRegistry},
    error::{IndexerError, Result},
    filter::{filter_events, filter_extrinsics, matches_any_block, matches_block, HandlerFilter},
    mapping::{HandlerContext, HandlerInput},
    metrics,
    project::{CustomHandlerSpec, DataSource, DataSourceKind, HandlerSpec},
    sandbox::{IndexerSandbox, SandboxService},
    storage::{IndexerCheckpoint, MetadataKey, Storage, StorageTransaction},
    store::Store,
    types::{BlockContent, BlockHeight},
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::{slice, sync::Arc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Runs the project's handlers over one block at a time, committing entity
/// changes and progress in a single storage transaction per block.
pub struct BlockProcessor {
    storage: Arc<dyn Storage>,
    checkpoint: IndexerCheckpoint,
    chain: Arc<dyn ChainClient>,
    view: ChainView,
    data_sources: Vec<DataSource>,
    sandboxes: SandboxService,
    ds_processors: DsProcessorRegistry,
    query_limit: usize,
    prev_spec_version: Option<u32>,
    processed: watch::Sender<Option<BlockHeight>>,
}

impl BlockProcessor {
    pub fn new(
        storage: Arc<dyn Storage>,
        checkpoint: IndexerCheckpoint,
        chain: Arc<dyn ChainClient>,
        data_sources: Vec<DataSource>,
        sandboxes: SandboxService,
        ds_processors: DsProcessorRegistry,
        query_limit: usize,
    ) -> Self {
        Self {
            storage,
            checkpoint,
            view: ChainView::new(chain.clone()),
            chain,
            data_sources,
            sandboxes,
            ds_processors,
            query_limit,
            prev_spec_version: None,
            processed: watch::channel(None).0,
        }
    }

    /// Height of the last committed block.
    pub fn latest_processed_height(&self) -> watch::Receiver<Option<BlockHeight>> {
        self.processed.subscribe()
    }

    pub fn next_block_height(&self) -> BlockHeight {
        self.checkpoint.next_block_height
    }

    pub async fn index_block(&mut self, content: BlockContent) -> Result<()> {
        let height = content.height();
        metrics::set(metrics::PROCESSING_BLOCK_HEIGHT, height);

        let mut tx = self.storage.begin(&self.checkpoint).await?;
        if let Err(e) = self.run_block(tx.as_mut(), &content).await {
            if let Err(rollback) = tx.rollback().await {
                warn!(height, error = %rollback, "Rollback failed");
            }
            return Err(e);
        }
        tx.commit().await?;

        self.checkpoint.next_block_height = height + 1;
        self.prev_spec_version = Some(content.block.spec_version);
        self.processed.send_replace(Some(height));
        metrics::set(metrics::PROCESSED_BLOCK_HEIGHT, height);
        debug!(height, "Block committed");
        Ok(())
    }

    async fn run_block(
        &mut self,
        tx: &mut dyn StorageTransaction,
        content: &BlockContent,
    ) -> Result<()> {
        let block = &content.block;
        if self.prev_spec_version != Some(block.spec_version) {
            if let Some(previous) = self.prev_spec_version {
                info!(
                    "Runtime upgraded from v{} to v{} at block {}",
                    previous, block.spec_version, block.height
                );
            }
            self.chain.prefetch_metadata(block.height).await?;
        }
        self.view.pin(block.height, block.hash, block.spec_version);

        let mut store = Store::new(&mut *tx, self.query_limit);
        for ds in &self.data_sources {
            if ds.start_block > block.height {
                continue;
            }
            let sandbox = self.sandboxes.get(ds)?;
            let mut ctx = HandlerContext {
                store: &mut store,
                chain: &self.view,
                data_source: ds,
            };
            match &ds.kind {
                DataSourceKind::Runtime { handlers } => {
                    for handler in handlers {
                        run_handler(&sandbox, handler, &mut ctx, content).await?;
                    }
                }
                DataSourceKind::Custom { kind, handlers, .. } => {
                    let processor = self.ds_processors.get(kind).ok_or_else(|| {
                        IndexerError::DatasourceProcessor(format!(
                            "no processor registered for kind {}",
                            kind
                        ))
                    })?;
                    for handler in handlers {
                        run_custom_handler(&sandbox, processor.as_ref(), handler, &mut ctx, content)
                            .await?;
                    }
                }
            }
        }
        let operations = store.into_operations();

        tx.apply(&operations).await?;
        tx.save_next_block_height(block.height + 1).await?;
        tx.write_metadata(MetadataKey::LastProcessedHeight, json!(block.height))
            .await?;
        tx.write_metadata(
            MetadataKey::LastProcessedTimestamp,
            json!(Utc::now().timestamp_millis()),
        )
        .await?;
        Ok(())
    }
}

async fn run_handler(
    sandbox: &IndexerSandbox,
    handler: &HandlerSpec,
    ctx: &mut HandlerContext<'_, '_>,
    content: &BlockContent,
) -> Result<()> {
    let name = handler.handler.as_str();
    match &handler.filter {
        HandlerFilter::Block(filter) => {
            if matches_block(&content.block, filter) {
                sandbox
                    .secured_exec(name, ctx, HandlerInput::Block(content))
                    .await?;
            }
        }
        HandlerFilter::Call(filter) => {
            for extrinsic in filter_extrinsics(content, slice::from_ref(filter)) {
                sandbox
                    .secured_exec(name, ctx, HandlerInput::Call { extrinsic, content })
                    .await?;
            }
        }
        HandlerFilter::Event(filter) => {
            for event in filter_events(content, slice::from_ref(filter)) {
                sandbox
                    .secured_exec(name, ctx, HandlerInput::Event { event, content })
                    .await?;
            }
        }
    }
    Ok(())
}

async fn run_custom_handler(
    sandbox: &IndexerSandbox,
    processor: &dyn DatasourceProcessor,
    handler: &CustomHandlerSpec,
    ctx: &mut HandlerContext<'_, '_>,
    content: &BlockContent,
) -> Result<()> {
    let base = processor.base_handler(&handler.kind).ok_or_else(|| {
        IndexerError::DatasourceProcessor(format!(
            "processor {} has no handler kind {}",
            processor.kind(),
            handler.kind
        ))
    })?;

    let inputs: Vec<HandlerInput<'_>> = match &base {
        BaseHandler::Block(filters) => {
            if matches_any_block(&content.block, filters) {
                vec![HandlerInput::Block(content)]
            } else {
                Vec::new()
            }
        }
        BaseHandler::Call(filters) => filter_extrinsics(content, filters)
            .map(|extrinsic| HandlerInput::Call { extrinsic, content })
            .collect(),
        BaseHandler::Event(filters) => filter_events(content, filters)
            .map(|event| HandlerInput::Event { event, content })
            .collect(),
    };

    for input in inputs {
        let Some(value) = processor.transform(&handler.kind, &input, ctx.data_source) else {
            continue;
        };
        if !processor.filter_input(&handler.kind, handler.filter.as_ref(), &value, ctx.data_source) {
            continue;
        }
        let custom = HandlerInput::Custom {
            kind: &handler.kind,
            value,
            content,
        };
        sandbox.secured_exec(&handler.handler, ctx, custom).await?;
    }
    Ok(())
}

#[async_trait]
impl ProcessBlock for BlockProcessor {
    async fn process(&mut self, content: BlockContent) -> Result<()> {
        self.index_block(content).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ds_processor::fixtures::{transfer_ds, TransferProcessor},
        filter::{CallFilter, EventFilter},
        mapping::{Mapping, MappingRegistry},
        storage::MemoryStorage,
        testing::MockChain,
        types::fixtures::transfer_block,
    };
    use serde_json::Value;
    use std::time::Duration;

    /// Records every invocation as a `Call` entity and reacts to a few handler names.
    struct Recording;

    #[async_trait]
    impl Mapping for Recording {
        async fn handle(
            &self,
            handler: &str,
            ctx: &mut HandlerContext<'_, '_>,
            input: HandlerInput<'_>,
        ) -> anyhow::Result<()> {
            let height = input.height();
            let detail = match &input {
                HandlerInput::Block(_) => json!("block"),
                HandlerInput::Call { extrinsic, .. } => json!(extrinsic.method),
                HandlerInput::Event { event, .. } => json!(event.method),
                HandlerInput::Custom { value, .. } => value.clone(),
            };
            let id = format!("{}-{}-{}", height, handler, ctx.store.pending());
            ctx.store.set(
                "Call",
                &id,
                json!({ "height": height, "handler": handler, "detail": detail }),
            );
            match handler {
                "failAt3" if height == 3 => anyhow::bail!("refusing block 3"),
                "sleepy" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
                "readStorage" => {
                    let raw = ctx.chain.storage(b"key").await?;
                    anyhow::ensure!(raw.is_some(), "missing storage");
                    Ok(())
                }
                _ => Ok(()),
            }
        }
    }

    struct Harness {
        storage: MemoryStorage,
        chain: Arc<MockChain>,
        processor: BlockProcessor,
    }

    async fn harness(data_sources: Vec<DataSource>, timeout: Duration) -> Harness {
        let storage = MemoryStorage::new();
        let chain = Arc::new(MockChain::new(100));
        let checkpoint = storage
            .create_checkpoint("test", 1, true, &MockChain::network())
            .await
            .unwrap();
        storage.prepare_schema(&checkpoint.db_schema).await.unwrap();
        let registry = MappingRegistry::new().with("main", Arc::new(Recording));
        let processor = BlockProcessor::new(
            Arc::new(storage.clone()),
            checkpoint,
            chain.clone(),
            data_sources,
            SandboxService::new(registry, timeout, false),
            DsProcessorRegistry::new().with(Arc::new(TransferProcessor)),
            100,
        );
        Harness {
            storage,
            chain,
            processor,
        }
    }

    fn calls(storage: &MemoryStorage) -> usize {
        storage.entity_count("public")
    }

    fn transfer_events() -> EventFilter {
        EventFilter {
            module: Some("balances".into()),
            method: Some("Transfer".into()),
            spec_version: None,
        }
    }

    #[tokio::test]
    async fn test_commits_entities_and_checkpoint() {
        let ds = DataSource::runtime("main", "main", 1)
            .with_handler(HandlerSpec::block("handleBlock"))
            .with_handler(HandlerSpec::event("handleTransfer", transfer_events()))
            .with_handler(HandlerSpec::call(
                "handleCall",
                CallFilter {
                    success: Some(true),
                    ..CallFilter::default()
                },
            ));
        let mut h = harness(vec![ds], Duration::from_secs(1)).await;
        let before = Utc::now().timestamp_millis();

        h.processor.index_block(transfer_block(1, 1)).await.unwrap();

        let processed_at = h
            .storage
            .metadata("public", "lastProcessedTimestamp")
            .and_then(|v| v.as_i64())
            .unwrap();
        assert!(processed_at >= before);
        // block + one transfer event + two successful calls
        assert_eq!(calls(&h.storage), 4);
        let checkpoint = h.storage.load_checkpoint("test").await.unwrap().unwrap();
        assert_eq!(checkpoint.next_block_height, 2);
        assert_eq!(h.storage.metadata("public", "lastProcessedHeight"), Some(json!(1)));
        assert_eq!(*h.processor.latest_processed_height().borrow(), Some(1));
    }

    #[tokio::test]
    async fn test_failure_rolls_back_block() {
        let ds = DataSource::runtime("main", "main", 1).with_handler(HandlerSpec::block("failAt3"));
        let mut h = harness(vec![ds], Duration::from_secs(1)).await;

        h.processor.index_block(transfer_block(1, 1)).await.unwrap();
        h.processor.index_block(transfer_block(2, 1)).await.unwrap();
        let err = h.processor.index_block(transfer_block(3, 1)).await.unwrap_err();

        assert_eq!(err.handler_context(), Some(("failAt3", 3)));
        assert_eq!(calls(&h.storage), 2);
        assert_eq!(h.storage.rollbacks(), 1);
        let checkpoint = h.storage.load_checkpoint("test").await.unwrap().unwrap();
        assert_eq!(checkpoint.next_block_height, 3);
        assert_eq!(*h.processor.latest_processed_height().borrow(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_timeout_rolls_back() {
        let ds = DataSource::runtime("main", "main", 1)
            .with_handler(HandlerSpec::block("handleBlock"))
            .with_handler(HandlerSpec::block("sleepy"));
        let mut h = harness(vec![ds], Duration::from_secs(1)).await;

        let err = h.processor.index_block(transfer_block(1, 1)).await.unwrap_err();
        assert!(matches!(err, IndexerError::HandlerTimeout { height: 1, .. }));
        assert_eq!(calls(&h.storage), 0);
        let checkpoint = h.storage.load_checkpoint("test").await.unwrap().unwrap();
        assert_eq!(checkpoint.next_block_height, 1);
    }

    #[tokio::test]
    async fn test_start_block_gates_data_source() {
        let early = DataSource::runtime("early", "main", 1).with_handler(HandlerSpec::block("a"));
        let late = DataSource::runtime("late", "main", 3).with_handler(HandlerSpec::block("b"));
        let mut h = harness(vec![early, late], Duration::from_secs(1)).await;

        h.processor.index_block(transfer_block(2, 1)).await.unwrap();
        assert_eq!(calls(&h.storage), 1);
        h.processor.index_block(transfer_block(3, 1)).await.unwrap();
        assert_eq!(calls(&h.storage), 3);
    }

    #[tokio::test]
    async fn test_prefetches_on_spec_change() {
        let ds = DataSource::runtime("main", "main", 1).with_handler(HandlerSpec::block("readStorage"));
        let mut h = harness(vec![ds], Duration::from_secs(1)).await;

        h.processor.index_block(transfer_block(1, 1)).await.unwrap();
        h.processor.index_block(transfer_block(2, 1)).await.unwrap();
        h.processor.index_block(transfer_block(3, 2)).await.unwrap();
        assert_eq!(h.chain.prefetched(), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_custom_data_source() {
        let mut h = harness(
            vec![
                transfer_ds("toAlice", Some("0x01")),
                transfer_ds("toBob", Some("0x09")),
            ],
            Duration::from_secs(1),
        )
        .await;

        h.processor.index_block(transfer_block(1, 1)).await.unwrap();
        assert_eq!(calls(&h.storage), 1);
        let stored: Value = h.storage.entity("public", "Call", "1-toAlice-0").unwrap();
        assert_eq!(stored["detail"]["to"], "0x01");
    }
}
