use crate::{
    chain::ChainClient,
    config::NodeConfig,
    ds_processor::DsProcessorRegistry,
    error::{IndexerError, Result},
    mapping::MappingRegistry,
    network_index::{IndexerFilters, NetworkIndexService},
    pipeline::Pipeline,
    processor::BlockProcessor,
    project::{DataSource, ProjectDescriptor},
    sandbox::SandboxService,
    shutdown::Shutdown,
    storage::{IndexerCheckpoint, MetadataKey, Storage},
    types::{same_genesis, BlockHeight, NetworkMeta},
};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Brings one project from manifest to a running pipeline.
pub struct IndexerManager {
    config: NodeConfig,
    project: ProjectDescriptor,
    chain: Arc<dyn ChainClient>,
    storage: Arc<dyn Storage>,
    mappings: MappingRegistry,
    ds_processors: DsProcessorRegistry,
    network_index: Option<Arc<dyn NetworkIndexService>>,
    shutdown: Shutdown,
}

impl IndexerManager {
    pub fn new(
        config: NodeConfig,
        project: ProjectDescriptor,
        chain: Arc<dyn ChainClient>,
        storage: Arc<dyn Storage>,
        mappings: MappingRegistry,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            config,
            project,
            chain,
            storage,
            mappings,
            ds_processors: DsProcessorRegistry::new(),
            network_index: None,
            shutdown,
        }
    }

    pub fn with_ds_processors(mut self, ds_processors: DsProcessorRegistry) -> Self {
        self.ds_processors = ds_processors;
        self
    }

    pub fn with_network_index(mut self, service: Arc<dyn NetworkIndexService>) -> Self {
        self.network_index = Some(service);
        self
    }

    /// Runs startup checks, then indexes until shutdown or the first fatal error.
    pub async fn start(self) -> Result<()> {
        self.config.validate()?;
        self.ds_processors
            .validate_custom_ds(&self.project.data_sources)?;

        let network = self.chain.network_meta().clone();
        if let Some(expected) = &self.project.network.genesis_hash {
            if !same_genesis(expected, &network.genesis_hash) {
                return Err(IndexerError::NetworkMismatch {
                    expected: expected.clone(),
                    actual: network.genesis_hash.clone(),
                });
            }
        }

        let start_block = self
            .project
            .min_start_block(&network.spec_name)
            .ok_or_else(|| IndexerError::NoDataSources(network.spec_name.clone()))?;
        let checkpoint = self.ensure_checkpoint(&network, start_block).await?;
        self.storage.prepare_schema(&checkpoint.db_schema).await?;
        self.ensure_metadata(&checkpoint, &network, start_block)
            .await?;

        let data_sources = self.select_data_sources(&network.spec_name)?;
        let sandboxes = SandboxService::new(self.mappings, self.config.timeout, self.config.debug);
        sandboxes.check(&data_sources)?;

        info!(
            project = %self.project.name,
            schema = %checkpoint.db_schema,
            chain = %network.chain,
            spec_name = %network.spec_name,
            next_block = checkpoint.next_block_height,
            data_sources = data_sources.len(),
            "Starting indexer"
        );

        let filters = self
            .network_index
            .as_ref()
            .and_then(|_| IndexerFilters::derive(&data_sources, &network.spec_name, &self.ds_processors));
        let mut processor = BlockProcessor::new(
            self.storage.clone(),
            checkpoint,
            self.chain.clone(),
            data_sources,
            sandboxes,
            self.ds_processors,
            self.config.query_limit,
        );

        let mut pipeline = Pipeline::new(
            self.chain,
            &self.config,
            processor.next_block_height(),
            self.shutdown,
        );
        match (self.network_index, filters) {
            (Some(service), Some(filters)) => {
                pipeline = pipeline.with_network_index(service, filters);
            }
            (Some(_), None) => {
                info!("Handlers need every block, network index disabled");
            }
            _ => {}
        }

        pipeline.run(&mut processor).await
    }

    async fn ensure_checkpoint(
        &self,
        network: &NetworkMeta,
        start_block: BlockHeight,
    ) -> Result<IndexerCheckpoint> {
        let name = &self.project.name;
        let Some(mut checkpoint) = self.storage.load_checkpoint(name).await? else {
            let checkpoint = self
                .storage
                .create_checkpoint(name, start_block, self.config.local_mode, network)
                .await?;
            info!(name = %name, schema = %checkpoint.db_schema, "Registered new indexer");
            return Ok(checkpoint);
        };

        match &checkpoint.network_genesis_hash {
            Some(stored) if !same_genesis(stored, &network.genesis_hash) => {
                return Err(IndexerError::NetworkMismatch {
                    expected: stored.clone(),
                    actual: network.genesis_hash.clone(),
                });
            }
            Some(_) => {}
            None => {
                warn!(name = %name, "Indexer has no network recorded, filling it in");
                self.storage.update_checkpoint_network(name, network).await?;
                checkpoint.network_genesis_hash = Some(network.genesis_hash.clone());
                checkpoint
                    .network
                    .get_or_insert_with(|| network.chain.clone());
            }
        }
        Ok(checkpoint)
    }

    async fn ensure_metadata(
        &self,
        checkpoint: &IndexerCheckpoint,
        network: &NetworkMeta,
        start_block: BlockHeight,
    ) -> Result<()> {
        let mut tx = self.storage.begin(checkpoint).await?;
        let written = async {
            tx.write_metadata(MetadataKey::BlockOffset, json!(start_block.saturating_sub(1)))
                .await?;
            tx.write_metadata(MetadataKey::GenesisHash, json!(network.genesis_hash))
                .await?;
            tx.write_metadata(MetadataKey::Chain, json!(network.chain))
                .await?;
            tx.write_metadata(MetadataKey::SpecName, json!(network.spec_name))
                .await
        }
        .await;
        match written {
            Ok(()) => tx.commit().await,
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    fn select_data_sources(&self, spec_name: &str) -> Result<Vec<DataSource>> {
        let mut selected = Vec::new();
        for ds in &self.project.data_sources {
            if !ds.matches_spec_name(spec_name) {
                continue;
            }
            if let Some(processor) = self.ds_processors.for_data_source(ds)? {
                if !processor.accepts(ds, spec_name) {
                    continue;
                }
            }
            selected.push(ds.clone());
        }
        if selected.is_empty() {
            return Err(IndexerError::NoDataSources(spec_name.to_string()));
        }
        Ok(selected)
    }
}
