//! Outcome events and their in-process aggregation

use crate::crawler::ErrorKind;
use crate::output::{OutputError, OutputResult};
use crate::state::Outcome;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

/// One finished pipeline iteration for a URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeEvent {
    pub url: String,
    /// HTTP status, or 0 when there was no usable response
    pub status: u16,
    pub error_kind: Option<ErrorKind>,
    pub duration_ms: u64,
    pub outcome: Outcome,
}

/// Receives outcome events from workers
pub trait MetricsSink: Send + Sync {
    fn record(&self, event: OutcomeEvent);
}

#[derive(Debug, Default)]
struct Counts {
    events: u64,
    by_status: BTreeMap<u16, u64>,
    by_error_kind: BTreeMap<String, u64>,
    by_outcome: BTreeMap<String, u64>,
    robots_blocked: u64,
    total_duration_ms: u64,
}

/// Counts events by status, error kind and outcome
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    counts: Mutex<Counts>,
}

/// Serializable view of a run's metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub pages_crawled: u64,
    pub events: u64,
    pub duration_seconds: f64,
    pub pages_per_second: f64,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub status_counts: BTreeMap<String, u64>,
    pub error_kinds: BTreeMap<String, u64>,
    pub outcomes: BTreeMap<String, u64>,
    pub robots_blocked: u64,
    pub total_fetch_ms: u64,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a snapshot for a run that started at `start` and ended at `end`
    pub fn snapshot(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> OutputResult<MetricsSnapshot> {
        let counts = self.counts.lock().map_err(|_| OutputError::Poisoned)?;

        let pages_crawled = counts
            .by_outcome
            .get(Outcome::Fetched.to_db_string())
            .copied()
            .unwrap_or(0);
        let duration_seconds = ((end - start).num_milliseconds().max(1) as f64) / 1000.0;

        Ok(MetricsSnapshot {
            pages_crawled,
            events: counts.events,
            duration_seconds,
            pages_per_second: pages_crawled as f64 / duration_seconds,
            start_ts: start,
            end_ts: end,
            status_counts: counts
                .by_status
                .iter()
                .map(|(status, count)| (status.to_string(), *count))
                .collect(),
            error_kinds: counts.by_error_kind.clone(),
            outcomes: counts.by_outcome.clone(),
            robots_blocked: counts.robots_blocked,
            total_fetch_ms: counts.total_duration_ms,
        })
    }

    /// Writes the snapshot as pretty JSON, creating parent directories
    pub fn write_json(
        &self,
        path: &Path,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> OutputResult<MetricsSnapshot> {
        let snapshot = self.snapshot(start, end)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&snapshot)?)?;
        debug!(path = %path.display(), "Wrote metrics");

        Ok(snapshot)
    }
}

impl MetricsSink for MetricsAggregator {
    fn record(&self, event: OutcomeEvent) {
        // A poisoned lock only loses metrics
        let Ok(mut counts) = self.counts.lock() else {
            return;
        };

        counts.events += 1;
        counts.total_duration_ms += event.duration_ms;
        *counts
            .by_outcome
            .entry(event.outcome.to_db_string().to_string())
            .or_insert(0) += 1;

        if event.outcome == Outcome::RobotsBlocked {
            counts.robots_blocked += 1;
            return;
        }

        // Retrying events are counted by outcome only; their URL will report again
        if event.outcome.is_terminal() {
            *counts.by_status.entry(event.status).or_insert(0) += 1;
        }
        if let Some(kind) = event.error_kind {
            *counts
                .by_error_kind
                .entry(kind.label().to_string())
                .or_insert(0) += 1;
        }
    }
}
