//! Output module for crawl metrics and statistics
//!
//! This module handles:
//! - Receiving per-URL outcome events from workers
//! - Exporting a metrics snapshot as JSON at the end of a run
//! - Printing crawl statistics from the shared store and page database

pub mod metrics;
pub mod stats;

pub use metrics::{MetricsAggregator, MetricsSink, MetricsSnapshot, OutcomeEvent};
pub use stats::{load_statistics, print_statistics, CrawlStatistics};

use thiserror::Error;

/// Errors that can occur during output operations
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Metrics lock poisoned")]
    Poisoned,
}

/// Result type for output operations
pub type OutputResult<T> = Result<T, OutputError>;
