//! Custom data source kinds layered over the runtime handlers.

use crate::{
    error::{IndexerError, Result},
    filter::{BlockFilter, CallFilter, EventFilter},
    mapping::HandlerInput,
    project::{DataSource, DataSourceKind},
};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};

/// Runtime handler kind a custom handler is built on, with the filters that
/// preselect its inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseHandler {
    Block(Vec<BlockFilter>),
    Call(Vec<CallFilter>),
    Event(Vec<EventFilter>),
}

pub trait DatasourceProcessor: Send + Sync {
    /// Data source kind this processor handles, e.g. `substrate/Moonbeam`.
    fn kind(&self) -> &str;

    fn validate(&self, ds: &DataSource) -> Result<()>;

    /// Whether the data source applies to a chain with runtime `spec_name`.
    fn accepts(&self, ds: &DataSource, spec_name: &str) -> bool;

    fn base_handler(&self, handler_kind: &str) -> Option<BaseHandler>;

    /// Converts a runtime input into the custom handler's argument.
    /// `None` skips the input.
    fn transform(&self, handler_kind: &str, input: &HandlerInput<'_>, ds: &DataSource)
        -> Option<Value>;

    /// Applies the handler's own filter to a transformed input.
    fn filter_input(
        &self,
        handler_kind: &str,
        filter: Option<&Value>,
        input: &Value,
        ds: &DataSource,
    ) -> bool;
}

#[derive(Clone, Default)]
pub struct DsProcessorRegistry {
    processors: HashMap<String, Arc<dyn DatasourceProcessor>>,
}

impl DsProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, processor: Arc<dyn DatasourceProcessor>) {
        self.processors
            .insert(processor.kind().to_string(), processor);
    }

    pub fn with(mut self, processor: Arc<dyn DatasourceProcessor>) -> Self {
        self.register(processor);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn DatasourceProcessor>> {
        self.processors.get(kind).cloned()
    }

    /// Processor for a custom data source, failing when none is registered.
    pub fn for_data_source(&self, ds: &DataSource) -> Result<Option<Arc<dyn DatasourceProcessor>>> {
        match &ds.kind {
            DataSourceKind::Runtime { .. } => Ok(None),
            DataSourceKind::Custom { kind, .. } => self.get(kind).map(Some).ok_or_else(|| {
                IndexerError::DatasourceProcessor(format!(
                    "no processor registered for kind {} (data source {})",
                    kind, ds.name
                ))
            }),
        }
    }

    pub fn validate_custom_ds(&self, data_sources: &[DataSource]) -> Result<()> {
        for ds in data_sources {
            let DataSourceKind::Custom { handlers, .. } = &ds.kind else {
                continue;
            };
            let Some(processor) = self.for_data_source(ds)? else {
                continue;
            };
            processor.validate(ds)?;
            for handler in handlers {
                if processor.base_handler(&handler.kind).is_none() {
                    return Err(IndexerError::DatasourceProcessor(format!(
                        "processor {} has no handler kind {} (handler {})",
                        processor.kind(),
                        handler.kind,
                        handler.handler
                    )));
                }
            }
        }
        Ok(())
    }
}
