use crate::{
    chain::ChainView,
    project::DataSource,
    store::Store,
    types::{BlockContent, BlockHeight, Event, Extrinsic},
};
use async_trait::async_trait;
use serde_json::json;
use std::{collections::HashMap, sync::Arc};

/// Everything a handler may touch while processing one block.
pub struct HandlerContext<'s, 'a> {
    pub store: &'s mut Store<'a>,
    pub chain: &'s ChainView,
    pub data_source: &'s DataSource,
}

/// The decoded item a handler is invoked with.
#[derive(Debug, Clone)]
pub enum HandlerInput<'a> {
    Block(&'a BlockContent),
    Call {
        extrinsic: &'a Extrinsic,
        content: &'a BlockContent,
    },
    Event {
        event: &'a Event,
        content: &'a BlockContent,
    },
    /// Output of a custom datasource processor.
    Custom {
        kind: &'a str,
        value: serde_json::Value,
        content: &'a BlockContent,
    },
}

impl<'a> HandlerInput<'a> {
    pub fn content(&self) -> &'a BlockContent {
        match self {
            Self::Block(content)
            | Self::Call { content, .. }
            | Self::Event { content, .. }
            | Self::Custom { content, .. } => content,
        }
    }

    pub fn height(&self) -> BlockHeight {
        self.content().block.height
    }

    /// JSON rendering of the input, attached to handler errors in debug mode.
    pub fn describe(&self) -> String {
        let value = match self {
            Self::Block(content) => json!({ "block": content.block }),
            Self::Call { extrinsic, .. } => json!({ "extrinsic": extrinsic }),
            Self::Event { event, .. } => json!({ "event": event }),
            Self::Custom { kind, value, .. } => json!({ "kind": kind, "value": value }),
        };
        value.to_string()
    }
}

/// Compiled mapping code for one entry point.
#[async_trait]
pub trait Mapping: Send + Sync {
    async fn handle(
        &self,
        handler: &str,
        ctx: &mut HandlerContext<'_, '_>,
        input: HandlerInput<'_>,
    ) -> anyhow::Result<()>;
}

/// Mapping entry points by name, as referenced from data sources.
#[derive(Clone, Default)]
pub struct MappingRegistry {
    mappings: HashMap<String, Arc<dyn Mapping>>,
}

impl MappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entry: impl Into<String>, mapping: Arc<dyn Mapping>) {
        self.mappings.insert(entry.into(), mapping);
    }

    pub fn with(mut self, entry: impl Into<String>, mapping: Arc<dyn Mapping>) -> Self {
        self.register(entry, mapping);
        self
    }

    pub fn get(&self, entry: &str) -> Option<Arc<dyn Mapping>> {
        self.mappings.get(entry).cloned()
    }
}
