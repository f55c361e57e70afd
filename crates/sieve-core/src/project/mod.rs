mod manifest;

pub use manifest::{load_project, ManifestVersion};

use crate::filter::{BlockFilter, CallFilter, EventFilter, HandlerFilter};
use std::{collections::BTreeMap, path::PathBuf};

pub const RUNTIME_DATASOURCE: &str = "substrate/Runtime";
pub const BLOCK_HANDLER: &str = "substrate/BlockHandler";
pub const CALL_HANDLER: &str = "substrate/CallHandler";
pub const EVENT_HANDLER: &str = "substrate/EventHandler";

/// Canonical project description, independent of the manifest version it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectDescriptor {
    pub name: String,
    pub root: PathBuf,
    pub schema: String,
    pub network: ProjectNetwork,
    pub data_sources: Vec<DataSource>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProjectNetwork {
    pub endpoint: Option<String>,
    pub genesis_hash: Option<String>,
    /// GraphQL endpoint of a network index serving this chain.
    pub network_indexer: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataSource {
    pub name: String,
    pub start_block: u64,
    /// Only run against chains whose runtime reports this spec name.
    pub spec_name: Option<String>,
    /// Mapping entry point, resolved through the mapping registry.
    pub entry: String,
    pub kind: DataSourceKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataSourceKind {
    Runtime {
        handlers: Vec<HandlerSpec>,
    },
    Custom {
        kind: String,
        processor: String,
        assets: BTreeMap<String, String>,
        handlers: Vec<CustomHandlerSpec>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandlerSpec {
    pub handler: String,
    pub filter: HandlerFilter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomHandlerSpec {
    pub handler: String,
    pub kind: String,
    pub filter: Option<serde_json::Value>,
}

impl HandlerSpec {
    pub fn block(handler: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            filter: HandlerFilter::Block(BlockFilter::default()),
        }
    }

    pub fn event(handler: impl Into<String>, filter: EventFilter) -> Self {
        Self {
            handler: handler.into(),
            filter: HandlerFilter::Event(filter),
        }
    }

    pub fn call(handler: impl Into<String>, filter: CallFilter) -> Self {
        Self {
            handler: handler.into(),
            filter: HandlerFilter::Call(filter),
        }
    }
}

impl DataSource {
    pub fn runtime(name: impl Into<String>, entry: impl Into<String>, start_block: u64) -> Self {
        Self {
            name: name.into(),
            start_block,
            spec_name: None,
            entry: entry.into(),
            kind: DataSourceKind::Runtime {
                handlers: Vec::new(),
            },
        }
    }

    pub fn with_handler(mut self, spec: HandlerSpec) -> Self {
        if let DataSourceKind::Runtime { handlers } = &mut self.kind {
            handlers.push(spec);
        }
        self
    }

    pub fn with_spec_name(mut self, spec_name: impl Into<String>) -> Self {
        self.spec_name = Some(spec_name.into());
        self
    }

    /// A source without a spec name filter runs on any chain.
    pub fn matches_spec_name(&self, spec_name: &str) -> bool {
        self.spec_name.as_deref().map_or(true, |s| s == spec_name)
    }
}

impl ProjectDescriptor {
    /// Lowest start block over the sources that apply to `spec_name`.
    pub fn min_start_block(&self, spec_name: &str) -> Option<u64> {
        self.data_sources
            .iter()
            .filter(|ds| ds.matches_spec_name(spec_name))
            .map(|ds| ds.start_block)
            .min()
    }
}
