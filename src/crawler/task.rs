use serde::{Serialize, Deserialize};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

use crate::browser::{BrowserKind, SessionSpec};
use crate::crawler::scheduler::normalize_url;
use crate::error::{CrawlError, ErrorKind};

/// Unique identifier of a crawl job
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name stem for this id. `[A-Za-z0-9_-]` pass through, every other
    /// byte becomes `%XX`, so distinct ids never share a file and the stem
    /// never contains a path separator or a dot.
    pub fn file_stem(&self) -> String {
        let mut stem = String::with_capacity(self.0.len());
        for byte in self.0.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
                stem.push(byte as char);
            } else {
                stem.push_str(&format!("%{:02X}", byte));
            }
        }
        stem
    }

    /// Ids accepted for new jobs: 1 to `MAX_JOB_ID_LEN` characters of `[A-Za-z0-9_-]`
    pub fn check(&self) -> Result<(), CrawlError> {
        let valid_chars = self
            .0
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if self.0.is_empty() || self.0.len() > MAX_JOB_ID_LEN || !valid_chars {
            return Err(CrawlError::InvalidJob(format!(
                "job id {:?} must be 1-{} characters of letters, digits, '-' or '_'",
                self.0, MAX_JOB_ID_LEN
            )));
        }
        Ok(())
    }
}

pub const MAX_JOB_ID_LEN: usize = 128;

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One end-to-end crawl rooted at a seed URL. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlJob {
    /// Unique identifier for the job
    id: JobId,

    /// URL pagination starts from
    seed_url: String,

    /// Maximum number of pages to extract
    max_depth: u32,

    /// Browser the job's session must run
    browser: BrowserKind,

    /// Whether the session runs headless
    headless: bool,

    /// Job-level deadline in seconds
    timeout_secs: u64,
}

impl CrawlJob {
    pub const DEFAULT_MAX_DEPTH: u32 = 10;
    pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;

    pub fn new(seed_url: impl Into<String>) -> Self {
        Self {
            id: JobId::generate(),
            seed_url: seed_url.into(),
            max_depth: Self::DEFAULT_MAX_DEPTH,
            browser: BrowserKind::Chrome,
            headless: true,
            timeout_secs: Self::DEFAULT_TIMEOUT_SECS,
        }
    }

    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_browser(mut self, browser: BrowserKind) -> Self {
        self.browser = browser;
        self
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn seed_url(&self) -> &str {
        &self.seed_url
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    pub fn browser(&self) -> BrowserKind {
        self.browser
    }

    pub fn headless(&self) -> bool {
        self.headless
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn session_spec(&self) -> SessionSpec {
        SessionSpec {
            kind: self.browser,
            headless: self.headless,
        }
    }

    /// Reject jobs that could never make progress
    pub fn validate(&self) -> Result<(), CrawlError> {
        self.id.check()?;
        let url = Url::parse(&self.seed_url)
            .map_err(|e| CrawlError::InvalidJob(format!("invalid seed URL {}: {}", self.seed_url, e)))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(CrawlError::InvalidJob(format!("unsupported seed URL: {}", self.seed_url)));
        }
        if self.max_depth == 0 {
            return Err(CrawlError::InvalidJob("max depth must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Lifecycle status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Paused,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Paused)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Paused => "paused",
        };
        f.write_str(name)
    }
}

/// Content extracted from one page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageResult {
    /// URL the page was loaded from
    pub url: String,

    /// Fields exactly as the parse plugin produced them
    pub fields: BTreeMap<String, String>,

    /// Absolute link targets found on the page, first occurrence order
    #[serde(default)]
    pub links: Vec<String>,

    /// Normalized page text
    pub text: String,

    /// Timestamp when the page was extracted
    pub extracted_at: DateTime<Utc>,

    /// Position of the page in navigation order
    pub index: usize,
}

/// Mutable progress of one job, persisted after every page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlState {
    job: CrawlJob,
    current_url: String,
    depth: u32,
    visited: BTreeSet<String>,
    pages: Vec<PageResult>,
    status: JobStatus,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_error: Option<ErrorKind>,
}

impl CrawlState {
    pub fn new(job: CrawlJob) -> Self {
        let now = Utc::now();
        Self {
            current_url: job.seed_url().to_string(),
            job,
            depth: 0,
            visited: BTreeSet::new(),
            pages: Vec::new(),
            status: JobStatus::Pending,
            started_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    pub fn job(&self) -> &CrawlJob {
        &self.job
    }

    pub fn job_id(&self) -> &JobId {
        self.job.id()
    }

    pub fn current_url(&self) -> &str {
        &self.current_url
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn visited(&self) -> &BTreeSet<String> {
        &self.visited
    }

    pub fn pages(&self) -> &[PageResult] {
        &self.pages
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    pub fn has_visited(&self, url: &str) -> bool {
        self.visited.contains(&normalize_url(url))
    }

    /// Append an extracted page. The visited set and depth grow only here.
    pub fn record_page(
        &mut self,
        url: &str,
        fields: BTreeMap<String, String>,
        links: Vec<String>,
        text: String,
    ) -> &PageResult {
        let page = PageResult {
            url: url.to_string(),
            fields,
            links,
            text,
            extracted_at: Utc::now(),
            index: self.pages.len(),
        };
        self.visited.insert(normalize_url(url));
        self.pages.push(page);
        self.depth += 1;
        self.touch();
        &self.pages[self.pages.len() - 1]
    }

    /// Point the job at the next page to load
    pub fn advance_to(&mut self, url: String) {
        self.current_url = url;
        self.touch();
    }

    pub fn set_status(&mut self, status: JobStatus) {
        self.status = status;
        if status == JobStatus::Running || status == JobStatus::Succeeded {
            self.last_error = None;
        }
        self.touch();
    }

    pub fn fail(&mut self, kind: ErrorKind) {
        self.status = JobStatus::Failed;
        self.last_error = Some(kind);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// A `Running` checkpoint that has not moved for longer than the job timeout
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        let idle = now.signed_duration_since(self.updated_at);
        idle.num_seconds() > self.job.timeout().as_secs() as i64
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            job_id: self.job_id().clone(),
            seed_url: self.job.seed_url().to_string(),
            status: self.status,
            current_url: self.current_url.clone(),
            depth: self.depth,
            pages: self.pages.len(),
            updated_at: self.updated_at,
            last_error: self.last_error,
        }
    }

    pub fn output(&self) -> CrawlOutput {
        CrawlOutput {
            job_id: self.job_id().clone(),
            seed_url: self.job.seed_url().to_string(),
            pages: self.pages.clone(),
            links: merged_links(&self.pages),
            metadata: OutputMetadata {
                page_count: self.pages.len(),
                is_paginated: self.pages.len() > 1,
                started_at: self.started_at,
                finished_at: self.updated_at,
            },
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, by: chrono::Duration) {
        self.updated_at = self.updated_at - by;
    }
}

/// Status view of a job derived from its last checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub seed_url: String,
    pub status: JobStatus,
    pub current_url: String,
    pub depth: u32,
    pub pages: usize,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<ErrorKind>,
}

/// Durable record of one terminal job failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Job the failure belongs to
    pub job_id: JobId,

    /// URL that was being processed
    pub url: String,

    /// Structured failure kind
    pub kind: ErrorKind,

    /// Attempts spent before giving up
    pub attempts: u32,

    /// Error message
    pub message: String,

    /// Timestamp when the failure occurred
    pub occurred_at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(job_id: &JobId, url: &str, error: &CrawlError) -> Self {
        Self {
            job_id: job_id.clone(),
            url: url.to_string(),
            kind: error.kind(),
            attempts: error.attempts(),
            message: error.to_string(),
            occurred_at: Utc::now(),
        }
    }
}

/// Aggregate handed to output plugins once pagination finishes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlOutput {
    pub job_id: JobId,
    pub seed_url: String,
    pub pages: Vec<PageResult>,
    /// Links of every page, deduplicated in page order
    #[serde(default)]
    pub links: Vec<String>,
    pub metadata: OutputMetadata,
}

fn merged_links(pages: &[PageResult]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut links = Vec::new();
    for link in pages.iter().flat_map(|page| &page.links) {
        if seen.insert(link.as_str()) {
            links.push(link.clone());
        }
    }
    links
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMetadata {
    pub page_count: usize,
    pub is_paginated: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
