//! Gauge names recorded by the pipeline.
//!
//! Recording goes through the `metrics` facade; installing an exporter is up
//! to the binary embedding the indexer.

use metrics::{describe_gauge, gauge, Unit};

pub const BLOCK_QUEUE_SIZE: &str = "indexer_block_queue_size";
pub const BLOCKNUMBER_QUEUE_SIZE: &str = "indexer_blocknumber_queue_size";
pub const TARGET_BLOCK_HEIGHT: &str = "indexer_target_block_height";
pub const BEST_BLOCK_HEIGHT: &str = "indexer_best_block_height";
pub const PROCESSING_BLOCK_HEIGHT: &str = "indexer_processing_block_height";
pub const PROCESSED_BLOCK_HEIGHT: &str = "indexer_processed_block_height";

pub fn describe_metrics() {
    describe_gauge!(
        BLOCK_QUEUE_SIZE,
        Unit::Count,
        "Decoded blocks waiting to be processed."
    );
    describe_gauge!(
        BLOCKNUMBER_QUEUE_SIZE,
        Unit::Count,
        "Block heights waiting to be fetched."
    );
    describe_gauge!(
        TARGET_BLOCK_HEIGHT,
        Unit::Count,
        "Latest finalized height reported by the node."
    );
    describe_gauge!(
        BEST_BLOCK_HEIGHT,
        Unit::Count,
        "Latest best height reported by the node."
    );
    describe_gauge!(
        PROCESSING_BLOCK_HEIGHT,
        Unit::Count,
        "Height of the block currently being processed."
    );
    describe_gauge!(
        PROCESSED_BLOCK_HEIGHT,
        Unit::Count,
        "Height of the last committed block."
    );
}

pub(crate) fn set(name: &'static str, value: u64) {
    gauge!(name).set(value as f64);
}
