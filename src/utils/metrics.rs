use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::crawler::task::JobStatus;
use crate::error::ErrorKind;

/// Engine metrics collector
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    /// In-memory metrics store
    metrics: Arc<Mutex<Metrics>>,
}

/// Metrics data structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    /// Start time of the metrics collection
    pub start_time: DateTime<Utc>,

    /// Pages extracted across all jobs
    pub pages_extracted: usize,

    /// Retries performed by the retry executor, by failure kind
    pub retries: HashMap<ErrorKind, usize>,

    /// Jobs that finished in each terminal status
    pub jobs_succeeded: usize,
    pub jobs_failed: usize,
    pub jobs_paused: usize,

    /// Terminal failures by kind
    pub failures: HashMap<ErrorKind, usize>,

    /// Summed page durations in milliseconds, navigation through extraction
    pub page_duration_total_ms: u64,

    /// Pages that contributed to `page_duration_total_ms`
    pub pages_timed: usize,

    /// Current pages per second
    pub pages_per_second: f64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            start_time: Utc::now(),
            pages_extracted: 0,
            retries: HashMap::new(),
            jobs_succeeded: 0,
            jobs_failed: 0,
            jobs_paused: 0,
            failures: HashMap::new(),
            page_duration_total_ms: 0,
            pages_timed: 0,
            pages_per_second: 0.0,
        }
    }
}

impl Metrics {
    pub fn total_retries(&self) -> usize {
        self.retries.values().sum()
    }

    pub fn average_page_ms(&self) -> Option<u64> {
        if self.pages_timed == 0 {
            None
        } else {
            Some(self.page_duration_total_ms / self.pages_timed as u64)
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(Mutex::new(Metrics::default())),
        }
    }

    /// Record an extracted page
    pub async fn record_page(&self, duration_ms: u64) {
        let mut metrics = self.metrics.lock().await;

        metrics.pages_extracted += 1;
        metrics.page_duration_total_ms = metrics.page_duration_total_ms.saturating_add(duration_ms);
        metrics.pages_timed += 1;

        let elapsed_seconds = (Utc::now() - metrics.start_time).num_seconds().max(1) as f64;
        metrics.pages_per_second = metrics.pages_extracted as f64 / elapsed_seconds;
    }

    /// Record one retry of a failed operation
    pub async fn record_retry(&self, kind: ErrorKind) {
        let mut metrics = self.metrics.lock().await;
        *metrics.retries.entry(kind).or_default() += 1;
    }

    /// Record a job reaching a final status
    pub async fn record_job(&self, status: JobStatus, failure: Option<ErrorKind>) {
        let mut metrics = self.metrics.lock().await;

        match status {
            JobStatus::Succeeded => metrics.jobs_succeeded += 1,
            JobStatus::Failed => metrics.jobs_failed += 1,
            JobStatus::Paused => metrics.jobs_paused += 1,
            JobStatus::Pending | JobStatus::Running => {}
        }

        if let Some(kind) = failure {
            *metrics.failures.entry(kind).or_default() += 1;
        }
    }

    /// Start timing a page
    pub fn start_timer(&self) -> PageTimer {
        PageTimer {
            start: Instant::now(),
        }
    }

    /// Get all metrics
    pub async fn get_metrics(&self) -> Metrics {
        self.metrics.lock().await.clone()
    }

    /// Reset metrics
    pub async fn reset(&self) {
        let mut metrics = self.metrics.lock().await;
        *metrics = Metrics::default();
    }
}

/// Timer for measuring how long a page took
pub struct PageTimer {
    /// Start time of the page
    start: Instant,
}

impl PageTimer {
    /// End timing and get the duration in milliseconds
    pub fn end(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}
