use crate::{
    error::{IndexerError, Result},
    mapping::{HandlerContext, HandlerInput, Mapping, MappingRegistry},
    project::DataSource,
};
use futures::FutureExt;
use std::{any::Any, collections::HashMap, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tracing::{debug_span, Instrument};

/// Runs one mapping entry point with a time limit, isolating panics.
pub struct IndexerSandbox {
    entry: String,
    mapping: Arc<dyn Mapping>,
    timeout: Duration,
    debug: bool,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

impl IndexerSandbox {
    pub fn new(entry: impl Into<String>, mapping: Arc<dyn Mapping>, timeout: Duration) -> Self {
        Self {
            entry: entry.into(),
            mapping,
            timeout,
            debug: false,
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Invokes `handler` once. Errors, panics and timeouts all surface as
    /// handler errors carrying the handler name and block height.
    pub async fn secured_exec(
        &self,
        handler: &str,
        ctx: &mut HandlerContext<'_, '_>,
        input: HandlerInput<'_>,
    ) -> Result<()> {
        let height = input.height();
        let captured = self.debug.then(|| input.describe());
        let span = debug_span!("handler", entry = %self.entry, handler, height);

        let run = AssertUnwindSafe(self.mapping.handle(handler, ctx, input))
            .catch_unwind()
            .instrument(span);

        match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(IndexerError::Handler {
                handler: handler.to_string(),
                height,
                reason: format!("{:#}", e),
                input: captured,
            }),
            Ok(Err(panic)) => Err(IndexerError::Handler {
                handler: handler.to_string(),
                height,
                reason: panic_message(panic),
                input: captured,
            }),
            Err(_) => Err(IndexerError::HandlerTimeout {
                handler: handler.to_string(),
                height,
                timeout_secs: self.timeout.as_secs(),
            }),
        }
    }
}

/// Sandboxes cached per mapping entry point.
pub struct SandboxService {
    registry: MappingRegistry,
    timeout: Duration,
    debug: bool,
    cache: HashMap<String, Arc<IndexerSandbox>>,
}

impl SandboxService {
    pub fn new(registry: MappingRegistry, timeout: Duration, debug: bool) -> Self {
        Self {
            registry,
            timeout,
            debug,
            cache: HashMap::new(),
        }
    }

    pub fn get(&mut self, ds: &DataSource) -> Result<Arc<IndexerSandbox>> {
        if let Some(sandbox) = self.cache.get(&ds.entry) {
            return Ok(sandbox.clone());
        }
        let mapping = self
            .registry
            .get(&ds.entry)
            .ok_or_else(|| IndexerError::MappingNotFound(ds.entry.clone()))?;
        let sandbox = Arc::new(
            IndexerSandbox::new(ds.entry.clone(), mapping, self.timeout).with_debug(self.debug),
        );
        self.cache.insert(ds.entry.clone(), sandbox.clone());
        Ok(sandbox)
    }

    /// Fails if any data source refers to an unregistered entry point.
    pub fn check(&self, data_sources: &[DataSource]) -> Result<()> {
        for ds in data_sources {
            if self.registry.get(&ds.entry).is_none() {
                return Err(IndexerError::MappingNotFound(ds.entry.clone()));
            }
        }
        Ok(())
    }
}
