pub mod controller;
pub mod pagination;
pub mod retry;
pub mod scheduler;
pub mod task;

// Re-export common types
pub use controller::CrawlerController;
pub use pagination::Paginator;
pub use retry::{RetryExecutor, RetryPolicy};
pub use scheduler::{decide_next, NextPage, StopReason};
pub use task::{CrawlJob, CrawlOutput, CrawlState, ErrorRecord, JobId, JobStatus, JobSummary, PageResult};
