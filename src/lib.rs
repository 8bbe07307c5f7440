pub mod browser;
pub mod cli;
pub mod content;
pub mod crawler;
pub mod error;
pub mod plugins;
pub mod storage;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use crawler::{CrawlJob, CrawlerController, JobId, JobStatus};
pub use error::{CrawlError, CrawlResult, ErrorKind};
