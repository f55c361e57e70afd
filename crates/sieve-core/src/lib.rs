mod chain;
mod config;
mod dispatcher;
mod ds_processor;
mod error;
mod fetcher;
mod filter;
mod indexer;
mod mapping;
mod metrics;
mod network_index;
mod pipeline;
mod processor;
mod project;
mod queue;
mod sandbox;
mod scheduler;
mod shutdown;
mod storage;
mod store;
#[cfg(test)]
mod testing;
mod types;

pub use chain::{ChainClient, ChainView};
pub use config::NodeConfig;
pub use dispatcher::{BlockDispatcher, ProcessBlock};
pub use ds_processor::{BaseHandler, DatasourceProcessor, DsProcessorRegistry};
pub use error::{IndexerError, Result};
pub use fetcher::BlockFetcher;
pub use filter::{
    filter_events, filter_extrinsics, matches_block, matches_call, matches_event, BlockFilter,
    CallFilter, EventFilter, HandlerFilter, SpecVersionRange,
};
pub use indexer::IndexerManager;
pub use mapping::{HandlerContext, HandlerInput, Mapping, MappingRegistry};
pub use crate::metrics::describe_metrics;
pub use network_index::{
    GraphqlNetworkIndex, IndexerFilters, NetworkIndexMetadata, NetworkIndexResult,
    NetworkIndexService,
};
pub use pipeline::Pipeline;
pub use processor::BlockProcessor;
pub use project::{
    load_project, CustomHandlerSpec, DataSource, DataSourceKind, HandlerSpec, ManifestVersion,
    ProjectDescriptor, ProjectNetwork,
};
pub use queue::BlockedQueue;
pub use sandbox::{IndexerSandbox, SandboxService};
pub use scheduler::{ChainHeads, HeightScheduler};
pub use shutdown::Shutdown;
pub use storage::{
    IndexerCheckpoint, MemoryStorage, MetadataKey, Storage, StorageTransaction, LOCAL_SCHEMA,
};
pub use store::{Store, StoreOperation};
pub use types::{Block, BlockContent, BlockHash, BlockHeight, Event, Extrinsic, NetworkMeta, Phase};
