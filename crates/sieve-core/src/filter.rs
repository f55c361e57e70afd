//! Pure predicates selecting which blocks, extrinsics and events a handler sees.
//!
//! Every absent filter field is a wildcard. A list of filters is OR-combined
//! and an empty list matches everything.

use crate::types::{Block, BlockContent, Event, Extrinsic};
use serde::{Deserialize, Serialize};

/// Inclusive spec version bounds, either end optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpecVersionRange(pub Option<u32>, pub Option<u32>);

impl SpecVersionRange {
    pub fn contains(&self, version: u32) -> bool {
        self.0.map_or(true, |lo| version >= lo) && self.1.map_or(true, |hi| version <= hi)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_version: Option<SpecVersionRange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_version: Option<SpecVersionRange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_version: Option<SpecVersionRange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerFilter {
    Block(BlockFilter),
    Call(CallFilter),
    Event(EventFilter),
}

fn spec_matches(range: Option<&SpecVersionRange>, block: &Block) -> bool {
    range.map_or(true, |r| r.contains(block.spec_version))
}

fn field_matches(expected: Option<&String>, actual: &str) -> bool {
    expected.map_or(true, |e| e == actual)
}

pub fn matches_block(block: &Block, filter: &BlockFilter) -> bool {
    spec_matches(filter.spec_version.as_ref(), block)
}

pub fn matches_event(event: &Event, block: &Block, filter: &EventFilter) -> bool {
    spec_matches(filter.spec_version.as_ref(), block)
        && field_matches(filter.module.as_ref(), &event.module)
        && field_matches(filter.method.as_ref(), &event.method)
}

pub fn matches_call(extrinsic: &Extrinsic, block: &Block, filter: &CallFilter) -> bool {
    spec_matches(filter.spec_version.as_ref(), block)
        && field_matches(filter.module.as_ref(), &extrinsic.module)
        && field_matches(filter.method.as_ref(), &extrinsic.method)
        && filter.success.map_or(true, |s| s == extrinsic.success)
}

pub fn matches_any_block(block: &Block, filters: &[BlockFilter]) -> bool {
    filters.is_empty() || filters.iter().any(|f| matches_block(block, f))
}

pub fn filter_events<'a>(
    content: &'a BlockContent,
    filters: &'a [EventFilter],
) -> impl Iterator<Item = &'a Event> {
    content.events.iter().filter(move |e| {
        filters.is_empty() || filters.iter().any(|f| matches_event(e, &content.block, f))
    })
}

pub fn filter_extrinsics<'a>(
    content: &'a BlockContent,
    filters: &'a [CallFilter],
) -> impl Iterator<Item = &'a Extrinsic> {
    content.extrinsics.iter().filter(move |x| {
        filters.is_empty() || filters.iter().any(|f| matches_call(x, &content.block, f))
    })
}
