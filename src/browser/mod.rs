pub mod pool;
pub mod session;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::error::ErrorKind;

// Re-export common types
pub use pool::{SessionHandle, SessionHealth, SessionPool};
pub use session::WebDriverBrowser;

/// Browser engine a session runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserKind {
    Chrome,
    Firefox,
}

impl fmt::Display for BrowserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrowserKind::Chrome => f.write_str("chrome"),
            BrowserKind::Firefox => f.write_str("firefox"),
        }
    }
}

impl FromStr for BrowserKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chrome" => Ok(BrowserKind::Chrome),
            "firefox" => Ok(BrowserKind::Firefox),
            other => Err(format!("Unsupported browser type: {}", other)),
        }
    }
}

/// What a pooled session must look like to serve a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionSpec {
    pub kind: BrowserKind,
    pub headless: bool,
}

/// Identifier of a live remote browser session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Readiness signal polled after a navigation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyCondition {
    /// At least one element matches the CSS selector
    ElementPresent(String),
    /// `document.readyState` reports `complete`
    DocumentComplete,
}

/// A page load as shaped by the input plugins
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub ready: ReadyCondition,
    /// Next-page selectors, highest priority first
    pub next_page_selectors: Vec<String>,
}

impl PageRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            ready: ReadyCondition::DocumentComplete,
            next_page_selectors: Vec::new(),
        }
    }
}

/// A single-value DOM query: the text of the first match, or one of its attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldQuery {
    pub selector: String,
    pub attribute: Option<String>,
}

impl FieldQuery {
    pub fn text(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            attribute: None,
        }
    }

    pub fn attr(selector: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            attribute: Some(attribute.into()),
        }
    }
}

/// Failures reported by the browser-control layer
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrowserError {
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Session lost: {0}")]
    SessionLost(String),

    #[error("Element not found: {0}")]
    ElementMissing(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Browser error: {0}")]
    Other(String),
}

impl BrowserError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrowserError::Timeout(_) | BrowserError::Transport(_) => ErrorKind::Transient,
            BrowserError::SessionLost(_) => ErrorKind::SessionLost,
            BrowserError::ElementMissing(_) | BrowserError::InvalidUrl(_) | BrowserError::Other(_) => {
                ErrorKind::Permanent
            }
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, BrowserError::Transport(_))
    }
}

/// Classifier for browser operations run against a lease. Transport errors
/// mark the lease unhealthy so the pool never hands the session out again.
pub fn classify_with_health(health: SessionHealth) -> impl Fn(&BrowserError) -> ErrorKind {
    move |err| {
        if err.is_transport() || err.kind() == ErrorKind::SessionLost {
            health.mark_unhealthy();
        }
        err.kind()
    }
}

/// Remote browser-control capability consumed by the engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrowserControl: Send + Sync {
    /// Open a new remote session
    async fn open_session(&self, spec: &SessionSpec) -> Result<SessionId, BrowserError>;

    /// Load a page in the session
    async fn navigate(&self, session: &SessionId, request: &PageRequest, timeout: Duration) -> Result<(), BrowserError>;

    /// Poll until the condition holds or the timeout elapses
    async fn wait_for_condition(
        &self,
        session: &SessionId,
        condition: &ReadyCondition,
        timeout: Duration,
    ) -> Result<(), BrowserError>;

    /// Read one value from the current page, `None` when nothing matches
    async fn extract_field(&self, session: &SessionId, query: &FieldQuery) -> Result<Option<String>, BrowserError>;

    /// Full HTML source of the current page
    async fn page_source(&self, session: &SessionId) -> Result<String, BrowserError>;

    /// Scroll to the end of the current page and report its height afterwards
    async fn scroll_to_bottom(&self, session: &SessionId) -> Result<u64, BrowserError>;

    /// Close the session
    async fn close_session(&self, session: &SessionId) -> Result<(), BrowserError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn browser_errors_map_to_retry_classes() {
        assert_eq!(BrowserError::Timeout("x".into()).kind(), ErrorKind::Transient);
        assert_eq!(BrowserError::Transport("x".into()).kind(), ErrorKind::Transient);
        assert_eq!(BrowserError::SessionLost("x".into()).kind(), ErrorKind::SessionLost);
        assert_eq!(BrowserError::ElementMissing("x".into()).kind(), ErrorKind::Permanent);
        assert_eq!(BrowserError::InvalidUrl("x".into()).kind(), ErrorKind::Permanent);
    }

    #[test]
    fn transport_errors_taint_the_lease() {
        let health = SessionHealth::default();
        let classify = classify_with_health(health.clone());

        assert_eq!(classify(&BrowserError::Timeout("slow".into())), ErrorKind::Transient);
        assert!(health.is_healthy());

        assert_eq!(classify(&BrowserError::Transport("reset".into())), ErrorKind::Transient);
        assert!(!health.is_healthy());
    }

    #[test]
    fn browser_kind_parses_case_insensitively() {
        assert_eq!("Chrome".parse::<BrowserKind>().unwrap(), BrowserKind::Chrome);
        assert_eq!("firefox".parse::<BrowserKind>().unwrap(), BrowserKind::Firefox);
        assert!("safari".parse::<BrowserKind>().is_err());
    }
}
