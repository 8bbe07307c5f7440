use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::browser::BrowserError;
use crate::browser::pool::PoolError;
use crate::content::NormalizeError;
use crate::plugins::PluginError;
use crate::storage::StoreError;

/// Structured error classification shared by the engine, the error log and
/// job summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retryable within the retry budget (timeouts, transport errors)
    Transient,
    /// The remote session became invalid
    SessionLost,
    /// Not retried: bad selector, malformed URL, no matching plugin
    Permanent,
    /// The job-level deadline expired
    Timeout,
    /// No session became available before the acquire timeout
    PoolExhausted,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::SessionLost => "session_lost",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Timeout => "timeout",
            ErrorKind::PoolExhausted => "pool_exhausted",
        };
        f.write_str(name)
    }
}

/// Engine-level failure of a crawl step or job
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("{label} failed after {attempts} attempt(s): {source}")]
    Step {
        label: String,
        kind: ErrorKind,
        attempts: u32,
        #[source]
        source: BrowserError,
    },

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {job_id} cannot be resumed while {status}")]
    NotResumable { job_id: String, status: String },

    #[error("Job exceeded its timeout of {0}s")]
    Timeout(u64),

    #[error("Engine is shut down")]
    ShutDown,
}

impl CrawlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CrawlError::Step { kind, .. } => *kind,
            CrawlError::Pool(e) => e.kind(),
            CrawlError::Plugin(e) => e.kind(),
            CrawlError::Store(e) => e.kind(),
            CrawlError::Normalize(e) => e.kind(),
            CrawlError::InvalidJob(_) => ErrorKind::Permanent,
            CrawlError::JobNotFound(_) => ErrorKind::Permanent,
            CrawlError::NotResumable { .. } => ErrorKind::Permanent,
            CrawlError::Timeout(_) => ErrorKind::Timeout,
            CrawlError::ShutDown => ErrorKind::Permanent,
        }
    }

    /// Attempts spent on the failing operation, 1 when nothing was retried
    pub fn attempts(&self) -> u32 {
        match self {
            CrawlError::Step { attempts, .. } => *attempts,
            _ => 1,
        }
    }
}

pub type CrawlResult<T> = Result<T, CrawlError>;
