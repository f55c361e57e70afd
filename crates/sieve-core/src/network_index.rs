//! Client for an external network index, used to skip block ranges that
//! contain nothing the project's handlers care about.

use crate::{
    ds_processor::{BaseHandler, DsProcessorRegistry},
    error::{IndexerError, Result},
    filter::{CallFilter, EventFilter, HandlerFilter},
    project::{DataSource, DataSourceKind},
    types::BlockHeight,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::{collections::BTreeSet, time::Duration};
use tracing::debug;

/// Event and call filters the network index is queried with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexerFilters {
    pub event_filters: Vec<EventFilter>,
    pub extrinsic_filters: Vec<CallFilter>,
}

fn push_unique<F>(list: &mut Vec<F>, filter: F, same: impl Fn(&F, &F) -> bool) {
    if !list.iter().any(|f| same(f, &filter)) {
        list.push(filter);
    }
}

impl IndexerFilters {
    /// Collects the filters of every handler that applies to `spec_name`.
    ///
    /// Returns `None` when the index cannot narrow the block range: a block
    /// handler is present, or some filter leaves module or method open.
    pub fn derive(
        data_sources: &[DataSource],
        spec_name: &str,
        ds_processors: &DsProcessorRegistry,
    ) -> Option<Self> {
        let mut filters = Self::default();

        for ds in data_sources.iter().filter(|ds| ds.matches_spec_name(spec_name)) {
            let handlers: Vec<HandlerFilter> = match &ds.kind {
                DataSourceKind::Runtime { handlers } => {
                    handlers.iter().map(|h| h.filter.clone()).collect()
                }
                DataSourceKind::Custom { kind, handlers, .. } => {
                    let processor = ds_processors.get(kind)?;
                    let mut base = Vec::new();
                    for handler in handlers {
                        match processor.base_handler(&handler.kind)? {
                            BaseHandler::Block(_) => return None,
                            BaseHandler::Call(list) if list.is_empty() => return None,
                            BaseHandler::Event(list) if list.is_empty() => return None,
                            BaseHandler::Call(list) => {
                                base.extend(list.into_iter().map(HandlerFilter::Call))
                            }
                            BaseHandler::Event(list) => {
                                base.extend(list.into_iter().map(HandlerFilter::Event))
                            }
                        }
                    }
                    base
                }
            };

            for filter in handlers {
                match filter {
                    HandlerFilter::Block(_) => return None,
                    HandlerFilter::Call(call) => {
                        if call.module.is_none() || call.method.is_none() {
                            return None;
                        }
                        push_unique(&mut filters.extrinsic_filters, call, |a, b| {
                            a.module == b.module && a.method == b.method
                        });
                    }
                    HandlerFilter::Event(event) => {
                        if event.module.is_none() || event.method.is_none() {
                            return None;
                        }
                        push_unique(&mut filters.event_filters, event, |a, b| {
                            a.module == b.module && a.method == b.method
                        });
                    }
                }
            }
        }

        Some(filters)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkIndexMetadata {
    #[serde(deserialize_with = "de_height")]
    pub last_processed_height: BlockHeight,
    pub genesis_hash: String,
    #[serde(default)]
    pub chain: Option<String>,
    #[serde(default)]
    pub spec_name: Option<String>,
    #[serde(default, deserialize_with = "de_opt_height")]
    pub target_height: Option<BlockHeight>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkIndexResult {
    pub metadata: NetworkIndexMetadata,
    /// Candidate heights, ascending and deduplicated.
    pub batch_blocks: Vec<BlockHeight>,
}

#[async_trait]
pub trait NetworkIndexService: Send + Sync {
    /// Heights in `[start, query_end)` with matching events or extrinsics.
    async fn query(
        &self,
        start: BlockHeight,
        query_end: BlockHeight,
        batch_size: usize,
        filters: &IndexerFilters,
    ) -> Result<NetworkIndexResult>;
}

fn height_of(value: &Value) -> Option<BlockHeight> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn de_height<'de, D: serde::Deserializer<'de>>(d: D) -> std::result::Result<BlockHeight, D::Error> {
    let value = Value::deserialize(d)?;
    height_of(&value).ok_or_else(|| serde::de::Error::custom("invalid block height"))
}

fn de_opt_height<'de, D: serde::Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<BlockHeight>, D::Error> {
    let value = Option::<Value>::deserialize(d)?;
    Ok(value.as_ref().and_then(height_of))
}

/// Builds the GraphQL query for one lookahead window.
pub fn build_query(
    start: BlockHeight,
    query_end: BlockHeight,
    batch_size: usize,
    filters: &IndexerFilters,
) -> String {
    let mut query = String::from(
        "_metadata { lastProcessedHeight lastProcessedTimestamp targetHeight chain specName genesisHash indexerHealthy } \
         specVersions { nodes { id blockHeight } }",
    );

    let range = format!(
        "blockHeight: {{greaterThanOrEqualTo: \"{}\", lessThan: \"{}\"}}",
        start, query_end
    );

    if !filters.event_filters.is_empty() {
        let or: Vec<String> = filters
            .event_filters
            .iter()
            .map(|f| {
                format!(
                    "{{and: [{{module: {{equalTo: \"{}\"}}}}, {{event: {{equalTo: \"{}\"}}}}]}}",
                    f.module.as_deref().unwrap_or_default(),
                    f.method.as_deref().unwrap_or_default()
                )
            })
            .collect();
        query.push_str(&format!(
            " events(filter: {{{}, or: [{}]}}, orderBy: BLOCK_HEIGHT_ASC, first: {}) {{ nodes {{ blockHeight }} }}",
            range,
            or.join(", "),
            batch_size
        ));
    }

    if !filters.extrinsic_filters.is_empty() {
        let or: Vec<String> = filters
            .extrinsic_filters
            .iter()
            .map(|f| {
                format!(
                    "{{and: [{{module: {{equalTo: \"{}\"}}}}, {{call: {{equalTo: \"{}\"}}}}]}}",
                    f.module.as_deref().unwrap_or_default(),
                    f.method.as_deref().unwrap_or_default()
                )
            })
            .collect();
        query.push_str(&format!(
            " extrinsics(filter: {{{}, or: [{}]}}, orderBy: BLOCK_HEIGHT_ASC, first: {}) {{ nodes {{ blockHeight }} }}",
            range,
            or.join(", "),
            batch_size
        ));
    }

    format!("query {{ {} }}", query)
}

fn node_heights(data: &Value, field: &str) -> Vec<BlockHeight> {
    data.get(field)
        .and_then(|v| v.get("nodes"))
        .and_then(Value::as_array)
        .map(|nodes| {
            nodes
                .iter()
                .filter_map(|n| n.get("blockHeight").and_then(height_of))
                .collect()
        })
        .unwrap_or_default()
}

/// Merges event and extrinsic heights into one sorted batch.
///
/// Each list is truncated by `first`, so heights past the smaller of the two
/// last heights may be incomplete and are dropped.
pub fn collect_batch_blocks(events: &[BlockHeight], extrinsics: &[BlockHeight]) -> Vec<BlockHeight> {
    let end = events
        .last()
        .copied()
        .unwrap_or(BlockHeight::MAX)
        .min(extrinsics.last().copied().unwrap_or(BlockHeight::MAX));

    events
        .iter()
        .chain(extrinsics)
        .copied()
        .filter(|h| *h <= end)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Parses the `data` object of a network index response.
pub fn parse_response(data: &Value) -> Result<NetworkIndexResult> {
    let metadata = data
        .get("_metadata")
        .cloned()
        .ok_or_else(|| IndexerError::NetworkIndex("response has no _metadata".into()))?;
    let metadata: NetworkIndexMetadata = serde_json::from_value(metadata)
        .map_err(|e| IndexerError::NetworkIndex(format!("invalid _metadata: {}", e)))?;

    let events = node_heights(data, "events");
    let extrinsics = node_heights(data, "extrinsics");

    Ok(NetworkIndexResult {
        metadata,
        batch_blocks: collect_batch_blocks(&events, &extrinsics),
    })
}

/// Network index served over GraphQL.
pub struct GraphqlNetworkIndex {
    client: reqwest::Client,
    url: String,
}

impl GraphqlNetworkIndex {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NetworkIndexService for GraphqlNetworkIndex {
    async fn query(
        &self,
        start: BlockHeight,
        query_end: BlockHeight,
        batch_size: usize,
        filters: &IndexerFilters,
    ) -> Result<NetworkIndexResult> {
        let query = build_query(start, query_end, batch_size, filters);
        debug!(start, query_end, "Querying network index");

        let body: Value = self
            .client
            .post(&self.url)
            .json(&json!({ "query": query }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(errors) = body.get("errors") {
            return Err(IndexerError::NetworkIndex(errors.to_string()));
        }
        let data = body
            .get("data")
            .ok_or_else(|| IndexerError::NetworkIndex("response has no data".into()))?;
        parse_response(data)
    }
}
