//! Scripted in-memory browser used by the unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::browser::{BrowserControl, BrowserError, FieldQuery, PageRequest, ReadyCondition, SessionId, SessionSpec};

pub const NEXT_SELECTOR: &str = "a[rel=\"next\"]";

#[derive(Default)]
struct FakePage {
    html: String,
    fields: HashMap<String, String>,
}

#[derive(Default)]
struct FakeState {
    pages: HashMap<String, FakePage>,
    sessions: HashMap<SessionId, Option<String>>,
    navigate_failures: HashMap<String, VecDeque<BrowserError>>,
    wait_failures: HashMap<String, VecDeque<BrowserError>>,
    navigations: Vec<String>,
    waits: HashMap<String, usize>,
    heights: HashMap<String, VecDeque<u64>>,
    scrolls: HashMap<String, usize>,
    scroll_failures: HashMap<String, VecDeque<BrowserError>>,
    headers: Vec<(String, Vec<(String, String)>)>,
    navigate_delay: Option<Duration>,
    next_id: usize,
}

/// Browser fake serving a fixed set of pages with scripted failures
#[derive(Default)]
pub struct FakeBrowser {
    state: Mutex<FakeState>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl FakeBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `url` with a body and an optional `rel=next` link
    pub fn with_page(self, url: &str, body: &str, next: Option<&str>) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let page = state.pages.entry(url.to_string()).or_default();
            page.html = format!("<html><head><title>{url}</title></head><body>{body}</body></html>");
            if let Some(next) = next {
                page.fields.insert(NEXT_SELECTOR.to_string(), next.to_string());
            }
        }
        self
    }

    /// Expose an attribute value under an arbitrary selector
    pub fn with_link(self, url: &str, selector: &str, href: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let page = state.pages.entry(url.to_string()).or_default();
            page.fields.insert(selector.to_string(), href.to_string());
        }
        self
    }

    pub fn fail_navigate(self, url: &str, errors: Vec<BrowserError>) -> Self {
        self.state
            .lock()
            .unwrap()
            .navigate_failures
            .insert(url.to_string(), errors.into());
        self
    }

    pub fn fail_wait(self, url: &str, errors: Vec<BrowserError>) -> Self {
        self.state.lock().unwrap().wait_failures.insert(url.to_string(), errors.into());
        self
    }

    /// Page heights reported by successive scrolls. The last one repeats.
    pub fn with_heights(self, url: &str, heights: Vec<u64>) -> Self {
        self.state.lock().unwrap().heights.insert(url.to_string(), heights.into());
        self
    }

    pub fn fail_scroll(self, url: &str, errors: Vec<BrowserError>) -> Self {
        self.state.lock().unwrap().scroll_failures.insert(url.to_string(), errors.into());
        self
    }

    pub fn with_navigate_delay(self, delay: Duration) -> Self {
        self.state.lock().unwrap().navigate_delay = Some(delay);
        self
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn live_sessions(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.state.lock().unwrap().navigations.clone()
    }

    pub fn wait_attempts(&self, url: &str) -> usize {
        self.state.lock().unwrap().waits.get(url).copied().unwrap_or(0)
    }

    pub fn scrolls(&self, url: &str) -> usize {
        self.state.lock().unwrap().scrolls.get(url).copied().unwrap_or(0)
    }

    pub fn headers_sent(&self, url: &str) -> Vec<(String, String)> {
        self.state
            .lock()
            .unwrap()
            .headers
            .iter()
            .filter(|(u, _)| u == url)
            .flat_map(|(_, h)| h.clone())
            .collect()
    }

    fn current_url(state: &FakeState, session: &SessionId) -> Result<Option<String>, BrowserError> {
        state
            .sessions
            .get(session)
            .cloned()
            .ok_or_else(|| BrowserError::SessionLost(session.to_string()))
    }
}

#[async_trait]
impl BrowserControl for FakeBrowser {
    async fn open_session(&self, _spec: &SessionSpec) -> Result<SessionId, BrowserError> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = SessionId::new(format!("session-{}", state.next_id));
        state.sessions.insert(id.clone(), None);
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn navigate(&self, session: &SessionId, request: &PageRequest, _timeout: Duration) -> Result<(), BrowserError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            Self::current_url(&state, session)?;
            state.navigations.push(request.url.clone());
            state.headers.push((
                request.url.clone(),
                request.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            ));
            if let Some(err) = state.navigate_failures.get_mut(&request.url).and_then(|q| q.pop_front()) {
                if err.kind() == crate::error::ErrorKind::SessionLost {
                    state.sessions.remove(session);
                }
                return Err(err);
            }
            state.navigate_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.sessions.insert(session.clone(), Some(request.url.clone()));
        Ok(())
    }

    async fn wait_for_condition(
        &self,
        session: &SessionId,
        _condition: &ReadyCondition,
        _timeout: Duration,
    ) -> Result<(), BrowserError> {
        let mut state = self.state.lock().unwrap();
        let url = Self::current_url(&state, session)?.unwrap_or_default();
        *state.waits.entry(url.clone()).or_default() += 1;
        if let Some(err) = state.wait_failures.get_mut(&url).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        Ok(())
    }

    async fn extract_field(&self, session: &SessionId, query: &FieldQuery) -> Result<Option<String>, BrowserError> {
        let state = self.state.lock().unwrap();
        let url = Self::current_url(&state, session)?.unwrap_or_default();
        Ok(state.pages.get(&url).and_then(|p| p.fields.get(&query.selector)).cloned())
    }

    async fn page_source(&self, session: &SessionId) -> Result<String, BrowserError> {
        let state = self.state.lock().unwrap();
        let url = Self::current_url(&state, session)?.unwrap_or_default();
        state
            .pages
            .get(&url)
            .map(|p| p.html.clone())
            .ok_or_else(|| BrowserError::ElementMissing(format!("no page at {url}")))
    }

    async fn scroll_to_bottom(&self, session: &SessionId) -> Result<u64, BrowserError> {
        let mut state = self.state.lock().unwrap();
        let url = Self::current_url(&state, session)?.unwrap_or_default();
        *state.scrolls.entry(url.clone()).or_default() += 1;
        if let Some(err) = state.scroll_failures.get_mut(&url).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        let height = match state.heights.get_mut(&url) {
            Some(heights) if heights.len() > 1 => heights.pop_front(),
            Some(heights) => heights.front().copied(),
            None => None,
        };
        Ok(height.unwrap_or(1000))
    }

    async fn close_session(&self, session: &SessionId) -> Result<(), BrowserError> {
        let mut state = self.state.lock().unwrap();
        self.closed.fetch_add(1, Ordering::SeqCst);
        state
            .sessions
            .remove(session)
            .map(|_| ())
            .ok_or_else(|| BrowserError::SessionLost(session.to_string()))
    }
}
