use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::browser::{
    classify_with_health, BrowserControl, BrowserError, FieldQuery, PageRequest, SessionHandle, SessionId,
    SessionPool,
};
use crate::cli::config::HarvesterConfig;
use crate::content::ContentNormalizer;
use crate::crawler::retry::{RetryExecutor, RetryFailure, RetryPolicy};
use crate::crawler::scheduler::{decide_next, NextPage};
use crate::crawler::task::{CrawlState, ErrorRecord, JobStatus};
use crate::error::{CrawlError, CrawlResult};
use crate::plugins::{PageSource, PluginRegistry};
use crate::storage::CheckpointStore;
use crate::utils::metrics::{MetricsCollector, PageTimer};

/// Bounded waits of the page loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepTimeouts {
    pub acquire: Duration,
    pub page_load: Duration,
    pub ready: Duration,
}

impl StepTimeouts {
    pub fn from_config(config: &HarvesterConfig) -> Self {
        Self {
            acquire: Duration::from_secs(config.pool.acquire_timeout_secs),
            page_load: Duration::from_secs(config.browser.page_load_timeout_secs),
            ready: Duration::from_secs(config.browser.ready_timeout_secs),
        }
    }
}

/// Scrolling done on each page before its source is read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollPolicy {
    /// Upper bound on scrolls per page, 0 disables scrolling
    pub attempts: u32,
    pub pause: Duration,
}

impl ScrollPolicy {
    pub fn from_config(config: &HarvesterConfig) -> Self {
        Self {
            attempts: config.browser.scroll_attempts,
            pause: Duration::from_millis(config.browser.scroll_pause_ms),
        }
    }
}

/// States of one job's page loop once a session is leased
#[derive(Debug)]
enum Phase {
    Navigating,
    WaitingForLoad,
    Extracting,
    DetectingNextPage,
    Done,
    Failed(CrawlError),
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Navigating => f.write_str("navigating"),
            Phase::WaitingForLoad => f.write_str("waiting_for_load"),
            Phase::Extracting => f.write_str("extracting"),
            Phase::DetectingNextPage => f.write_str("detecting_next_page"),
            Phase::Done => f.write_str("done"),
            Phase::Failed(_) => f.write_str("failed"),
        }
    }
}

fn step_error(label: &str, failure: RetryFailure<BrowserError>) -> CrawlError {
    CrawlError::Step {
        label: label.to_string(),
        kind: failure.kind,
        attempts: failure.attempts,
        source: failure.error,
    }
}

/// Drives one job through its pages on a single leased session.
///
/// Progress is checkpointed after every extracted page and every next-page
/// decision, so a run can be re-entered from any saved state.
pub struct Paginator {
    browser: Arc<dyn BrowserControl>,
    pool: Arc<SessionPool>,
    store: Arc<dyn CheckpointStore>,
    plugins: Arc<PluginRegistry>,
    normalizer: Arc<ContentNormalizer>,
    executor: RetryExecutor,
    metrics: MetricsCollector,
    timeouts: StepTimeouts,
    scroll: ScrollPolicy,
}

impl Paginator {
    pub fn new(
        browser: Arc<dyn BrowserControl>,
        pool: Arc<SessionPool>,
        store: Arc<dyn CheckpointStore>,
        plugins: Arc<PluginRegistry>,
        normalizer: Arc<ContentNormalizer>,
        config: &HarvesterConfig,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            executor: RetryExecutor::new(RetryPolicy::from(&config.retry), metrics.clone()),
            timeouts: StepTimeouts::from_config(config),
            scroll: ScrollPolicy::from_config(config),
            browser,
            pool,
            store,
            plugins,
            normalizer,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    /// Run the job from its current URL until it is done or fails.
    ///
    /// The returned state matches the final checkpoint. Terminal failures are
    /// recorded in the store before this returns.
    pub async fn run(&self, mut state: CrawlState) -> CrawlState {
        let mut lease = match self.init(&mut state).await {
            Ok(lease) => lease,
            Err(error) => {
                self.fail(&mut state, None, error).await;
                return state;
            }
        };

        let mut request = PageRequest::new(state.current_url());
        let mut timer = None;
        let mut phase = Phase::Navigating;

        loop {
            debug!("Job {} entering {}", state.job_id(), phase);
            phase = match phase {
                Phase::Navigating => self
                    .navigating(&state, &mut lease, &mut request, &mut timer)
                    .await
                    .unwrap_or_else(Phase::Failed),
                Phase::WaitingForLoad => self
                    .waiting_for_load(&mut lease, &request)
                    .await
                    .unwrap_or_else(Phase::Failed),
                Phase::Extracting => self
                    .extracting(&mut state, &mut lease, &request, timer.take())
                    .await
                    .unwrap_or_else(Phase::Failed),
                Phase::DetectingNextPage => self
                    .detecting_next_page(&mut state, &mut lease, &request)
                    .await
                    .unwrap_or_else(Phase::Failed),
                Phase::Done => {
                    self.finish(&mut state, lease).await;
                    return state;
                }
                Phase::Failed(error) => {
                    self.fail(&mut state, Some(lease), error).await;
                    return state;
                }
            };
        }
    }

    async fn init(&self, state: &mut CrawlState) -> CrawlResult<SessionHandle> {
        debug!("Job {} entering init", state.job_id());
        let lease = self
            .pool
            .acquire(state.job().session_spec(), self.timeouts.acquire)
            .await?;

        state.set_status(JobStatus::Running);
        if let Err(e) = self.store.save(state).await {
            self.pool.release(lease).await;
            return Err(e.into());
        }

        info!(
            "Job {} running on session {} from {} (depth {}/{})",
            state.job_id(),
            lease.id(),
            state.current_url(),
            state.depth(),
            state.job().max_depth()
        );
        Ok(lease)
    }

    async fn navigating(
        &self,
        state: &CrawlState,
        lease: &mut SessionHandle,
        request: &mut PageRequest,
        timer: &mut Option<PageTimer>,
    ) -> CrawlResult<Phase> {
        let url = state.current_url();
        *timer = Some(self.metrics.start_timer());
        *request = self.plugins.input_for(url)?.shape_request(PageRequest::new(url));

        let label = format!("navigate to {}", url);
        let shaped: &PageRequest = request;
        let classify = classify_with_health(lease.health());
        self.executor
            .execute(
                &label,
                lease,
                &self.pool,
                |id| {
                    let browser = Arc::clone(&self.browser);
                    let timeout = self.timeouts.page_load;
                    async move { browser.navigate(&id, shaped, timeout).await }
                },
                classify,
            )
            .await
            .map_err(|f| step_error(&label, f))?;

        Ok(Phase::WaitingForLoad)
    }

    async fn waiting_for_load(&self, lease: &mut SessionHandle, request: &PageRequest) -> CrawlResult<Phase> {
        let label = format!("load {}", request.url);
        let attempt = AtomicU32::new(0);
        let classify = classify_with_health(lease.health());

        self.executor
            .execute(
                &label,
                lease,
                &self.pool,
                |id| {
                    let browser = Arc::clone(&self.browser);
                    let timeouts = self.timeouts;
                    let reload = attempt.fetch_add(1, Ordering::SeqCst) > 0;
                    async move {
                        if reload {
                            browser.navigate(&id, request, timeouts.page_load).await?;
                        }
                        browser.wait_for_condition(&id, &request.ready, timeouts.ready).await
                    }
                },
                classify,
            )
            .await
            .map_err(|f| step_error(&label, f))?;

        Ok(Phase::Extracting)
    }

    async fn extracting(
        &self,
        state: &mut CrawlState,
        lease: &mut SessionHandle,
        request: &PageRequest,
        timer: Option<PageTimer>,
    ) -> CrawlResult<Phase> {
        let url = state.current_url().to_string();
        if state.has_visited(&url) {
            debug!("Page {} already extracted for job {}, skipping", url, state.job_id());
            return Ok(Phase::DetectingNextPage);
        }

        self.load_lazy_content(lease, &url).await;

        let label = format!("read source of {}", url);
        let html = self
            .reloading(&label, lease, request, |browser, id| async move { browser.page_source(&id).await })
            .await?;

        let parser = self.plugins.parse_for(&url)?;
        let raw = parser.extract(&PageSource { url: &url, html: &html })?;
        let text = self.normalizer.normalize(&raw);

        let index = state.record_page(&url, raw.fields, raw.links, text).index;
        self.store.save(state).await?;
        if let Some(timer) = timer {
            self.metrics.record_page(timer.end()).await;
        }

        info!("Job {} extracted page {} ({}) with {}", state.job_id(), index + 1, url, parser.name());
        Ok(Phase::DetectingNextPage)
    }

    async fn detecting_next_page(
        &self,
        state: &mut CrawlState,
        lease: &mut SessionHandle,
        request: &PageRequest,
    ) -> CrawlResult<Phase> {
        let label = format!("find next page on {}", request.url);
        let selectors = &request.next_page_selectors;

        let href = self
            .reloading(&label, lease, request, |browser, id| async move {
                for selector in selectors {
                    let query = FieldQuery::attr(selector.as_str(), "href");
                    if let Some(href) = browser.extract_field(&id, &query).await? {
                        if !href.trim().is_empty() {
                            return Ok(Some(href));
                        }
                    }
                }
                Ok::<_, BrowserError>(None)
            })
            .await?;

        let phase = match decide_next(state, href.as_deref()) {
            NextPage::Navigate(next) => {
                debug!("Job {} continues to {}", state.job_id(), next);
                state.advance_to(next);
                Phase::Navigating
            }
            NextPage::Done(reason) => {
                debug!("Job {} stops pagination: {:?}", state.job_id(), reason);
                state.touch();
                Phase::Done
            }
        };

        self.store.save(state).await?;
        Ok(phase)
    }

    /// Scroll until the page height stops changing or the attempts run out.
    /// Best effort: a failed scroll leaves the page as it is.
    async fn load_lazy_content(&self, lease: &SessionHandle, url: &str) {
        let mut last_height = None;
        for attempt in 0..self.scroll.attempts {
            if attempt > 0 {
                tokio::time::sleep(self.scroll.pause).await;
            }
            match self.browser.scroll_to_bottom(lease.id()).await {
                Ok(height) if last_height == Some(height) => break,
                Ok(height) => last_height = Some(height),
                Err(e) => {
                    classify_with_health(lease.health())(&e);
                    warn!("Scrolling {} failed, extracting as loaded: {}", url, e);
                    return;
                }
            }
        }
        debug!("Scrolled {} to height {:?}", url, last_height);
    }

    /// Retry `read` against the loaded page. Attempts after the first reload
    /// the page, since a replaced session starts blank.
    async fn reloading<T, F, Fut>(
        &self,
        label: &str,
        lease: &mut SessionHandle,
        request: &PageRequest,
        read: F,
    ) -> CrawlResult<T>
    where
        F: Fn(Arc<dyn BrowserControl>, SessionId) -> Fut,
        Fut: std::future::Future<Output = Result<T, BrowserError>>,
    {
        let attempt = AtomicU32::new(0);
        let read = &read;
        let classify = classify_with_health(lease.health());

        self.executor
            .execute(
                label,
                lease,
                &self.pool,
                |id| {
                    let browser = Arc::clone(&self.browser);
                    let timeouts = self.timeouts;
                    let reload = attempt.fetch_add(1, Ordering::SeqCst) > 0;
                    async move {
                        if reload {
                            browser.navigate(&id, request, timeouts.page_load).await?;
                            browser.wait_for_condition(&id, &request.ready, timeouts.ready).await?;
                        }
                        read(browser, id).await
                    }
                },
                classify,
            )
            .await
            .map_err(|f| step_error(label, f))
    }

    async fn finish(&self, state: &mut CrawlState, lease: SessionHandle) {
        self.pool.release(lease).await;
        state.set_status(JobStatus::Succeeded);

        if let Err(e) = self.store.save(state).await {
            self.fail(state, None, e.into()).await;
            return;
        }
        info!("Job {} succeeded with {} page(s)", state.job_id(), state.pages().len());
    }

    async fn fail(&self, state: &mut CrawlState, lease: Option<SessionHandle>, error: CrawlError) {
        if let Some(lease) = lease {
            self.pool.release(lease).await;
        }

        error!(
            "Job {} failed at {} ({}): {}",
            state.job_id(),
            state.current_url(),
            error.kind(),
            error
        );
        state.fail(error.kind());

        let record = ErrorRecord::new(state.job_id(), state.current_url(), &error);
        if let Err(e) = self.store.append_error(&record).await {
            error!("Failed to record error for job {}: {}", state.job_id(), e);
        }
        if let Err(e) = self.store.save(state).await {
            error!("Failed to save checkpoint for job {}: {}", state.job_id(), e);
        }
    }
}
