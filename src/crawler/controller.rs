use anyhow::Context;
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::browser::{BrowserControl, SessionPool, WebDriverBrowser};
use crate::cli::config::HarvesterConfig;
use crate::content::ContentNormalizer;
use crate::crawler::pagination::Paginator;
use crate::crawler::task::{CrawlJob, CrawlState, ErrorRecord, JobId, JobStatus, JobSummary};
use crate::error::{CrawlError, CrawlResult, ErrorKind};
use crate::plugins::PluginRegistry;
use crate::storage::{CheckpointStore, CheckpointStoreFactory};
use crate::utils::metrics::MetricsCollector;

/// A job waiting in the queue together with its cancel signal
struct QueuedJob {
    state: CrawlState,
    cancel: watch::Receiver<bool>,
}

/// In-process handles of a submitted or resumed job
struct JobEntry {
    cancel: watch::Sender<bool>,
    status: watch::Sender<JobStatus>,
}

impl JobEntry {
    /// Queued or running in this process
    fn is_active(&self) -> bool {
        !self.status.borrow().is_terminal()
    }

    fn not_resumable(&self, job_id: &JobId) -> CrawlError {
        CrawlError::NotResumable {
            job_id: job_id.to_string(),
            status: self.status.borrow().to_string(),
        }
    }
}

enum Outcome {
    Finished(CrawlState),
    TimedOut,
    Cancelled,
}

/// State shared by the controller and its workers
struct Shared {
    paginator: Paginator,
    store: Arc<dyn CheckpointStore>,
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    metrics: MetricsCollector,
}

/// Resolves once the job is asked to stop. A dropped sender never cancels.
async fn cancelled(signal: &mut watch::Receiver<bool>) {
    if signal.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

impl Shared {
    async fn process(&self, queued: QueuedJob) -> JobStatus {
        let QueuedJob { state, mut cancel } = queued;
        let job_id = state.job_id().clone();

        if *cancel.borrow() {
            info!("Job {} was cancelled before it started", job_id);
            return self.pause(state).await;
        }

        let timeout = state.job().timeout();
        let fallback = state.clone();

        let outcome = tokio::select! {
            state = self.paginator.run(state) => Outcome::Finished(state),
            _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
            _ = cancelled(&mut cancel) => Outcome::Cancelled,
        };

        match outcome {
            Outcome::Finished(state) => {
                if state.status() == JobStatus::Succeeded {
                    self.deliver(&state).await;
                }
                self.metrics.record_job(state.status(), state.last_error()).await;
                state.status()
            }
            Outcome::TimedOut => {
                warn!("Job {} exceeded its timeout of {:?}", job_id, timeout);
                let mut state = self.last_checkpoint(fallback).await;
                self.expire(&mut state).await;
                JobStatus::Failed
            }
            Outcome::Cancelled => {
                info!("Job {} cancelled", job_id);
                let state = self.last_checkpoint(fallback).await;
                self.pause(state).await
            }
        }
    }

    /// The last durable state of an abandoned run
    async fn last_checkpoint(&self, fallback: CrawlState) -> CrawlState {
        match self.store.load(fallback.job_id()).await {
            Ok(Some(state)) => state,
            Ok(None) => fallback,
            Err(e) => {
                error!("Failed to load checkpoint for job {}: {}", fallback.job_id(), e);
                fallback
            }
        }
    }

    async fn pause(&self, mut state: CrawlState) -> JobStatus {
        state.set_status(JobStatus::Paused);
        if let Err(e) = self.store.save(&state).await {
            error!("Failed to save paused job {}: {}", state.job_id(), e);
        }
        self.metrics.record_job(JobStatus::Paused, None).await;
        JobStatus::Paused
    }

    /// Fail a job whose deadline passed, recording a single timeout error
    async fn expire(&self, state: &mut CrawlState) {
        let error = CrawlError::Timeout(state.job().timeout().as_secs());
        state.fail(ErrorKind::Timeout);

        let record = ErrorRecord::new(state.job_id(), state.current_url(), &error);
        if let Err(e) = self.store.append_error(&record).await {
            error!("Failed to record timeout for job {}: {}", state.job_id(), e);
        }
        if let Err(e) = self.store.save(state).await {
            error!("Failed to save timed out job {}: {}", state.job_id(), e);
        }
        self.metrics.record_job(JobStatus::Failed, Some(ErrorKind::Timeout)).await;
    }

    /// Force a `Running` checkpoint left behind by a dead process to `Failed`
    async fn recover_stale(&self, mut state: CrawlState) -> CrawlState {
        if !state.is_stale(Utc::now()) {
            return state;
        }
        warn!(
            "Job {} has been running since {} without progress, marking it failed",
            state.job_id(),
            state.updated_at()
        );
        self.expire(&mut state).await;
        state
    }

    /// Hand a finished job to the first output plugin that accepts its seed
    async fn deliver(&self, state: &CrawlState) {
        let seed = state.job().seed_url();
        let plugin = match self.paginator.plugins().output_for(seed) {
            Ok(plugin) => plugin,
            Err(e) => {
                error!("Output of job {} not delivered: {}", state.job_id(), e);
                return;
            }
        };

        match plugin.adapt_output(&state.output()).await {
            Ok(response) => info!("Output plugin {} delivered job {}: {}", plugin.name(), state.job_id(), response),
            Err(e) => error!("Output plugin {} failed for job {}: {}", plugin.name(), state.job_id(), e),
        }
    }

    async fn publish(&self, job_id: &JobId, status: JobStatus) {
        if let Some(entry) = self.jobs.lock().await.get(job_id) {
            entry.status.send_replace(status);
        }
    }
}

/// Worker pool and job submission interface of the engine
pub struct CrawlerController {
    config: HarvesterConfig,
    pool: Arc<SessionPool>,
    shared: Arc<Shared>,
    sender: Mutex<Option<mpsc::UnboundedSender<QueuedJob>>>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<QueuedJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CrawlerController {
    /// Create a controller with the built-in plugins
    pub fn new(
        config: HarvesterConfig,
        browser: Arc<dyn BrowserControl>,
        store: Arc<dyn CheckpointStore>,
    ) -> CrawlResult<Self> {
        let plugins = PluginRegistry::with_defaults(&config)?;
        Self::with_plugins(config, browser, store, plugins)
    }

    pub fn with_plugins(
        config: HarvesterConfig,
        browser: Arc<dyn BrowserControl>,
        store: Arc<dyn CheckpointStore>,
        plugins: PluginRegistry,
    ) -> CrawlResult<Self> {
        let normalizer = ContentNormalizer::from_settings(&config.content)?;
        let metrics = MetricsCollector::new();
        let pool = Arc::new(SessionPool::new(browser.clone(), config.pool.capacity));

        let paginator = Paginator::new(
            browser,
            pool.clone(),
            store.clone(),
            Arc::new(plugins),
            Arc::new(normalizer),
            &config,
            metrics.clone(),
        );

        let (sender, receiver) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            pool,
            shared: Arc::new(Shared {
                paginator,
                store,
                jobs: Mutex::new(HashMap::new()),
                metrics,
            }),
            sender: Mutex::new(Some(sender)),
            receiver: Arc::new(Mutex::new(receiver)),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Build the production engine: WebDriver sessions and the configured store
    pub async fn connect(config: HarvesterConfig) -> anyhow::Result<Self> {
        let store = CheckpointStoreFactory::create(&config.storage)
            .await
            .context(format!("Failed to open {} checkpoint store", config.storage.storage_type))?;
        let browser = Arc::new(WebDriverBrowser::new(config.browser.clone()));

        Self::new(config, browser, store).context("Failed to initialize crawler controller")
    }

    pub fn config(&self) -> &HarvesterConfig {
        &self.config
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.shared.metrics
    }

    /// Start the workers after failing stale `Running` checkpoints.
    /// Returns the number of recovered jobs.
    pub async fn start(&self) -> CrawlResult<usize> {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return Ok(0);
        }

        let mut recovered = 0;
        for job_id in self.shared.store.list().await? {
            if let Some(state) = self.shared.store.load(&job_id).await? {
                if state.is_stale(Utc::now()) {
                    self.shared.recover_stale(state).await;
                    recovered += 1;
                }
            }
        }
        if recovered > 0 {
            info!("Recovered {} stale job(s)", recovered);
        }

        let count = self.config.engine.workers.max(1);
        info!("Starting {} worker(s)", count);
        for index in 0..count {
            workers.push(Self::spawn_worker(index, self.shared.clone(), self.receiver.clone()));
        }
        Ok(recovered)
    }

    fn spawn_worker(
        index: usize,
        shared: Arc<Shared>,
        receiver: Arc<Mutex<mpsc::UnboundedReceiver<QueuedJob>>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!("Worker {} started", index);
            loop {
                let next = receiver.lock().await.recv().await;
                let Some(queued) = next else {
                    break;
                };

                let job_id = queued.state.job_id().clone();
                debug!("Worker {} processing job {}", index, job_id);
                let status = shared.process(queued).await;
                info!("Worker {} finished job {} as {}", index, job_id, status);
                shared.publish(&job_id, status).await;
            }
            debug!("Worker {} stopped", index);
        })
    }

    /// Validate, checkpoint and queue a new job
    pub async fn submit(&self, job: CrawlJob) -> CrawlResult<JobId> {
        job.validate()?;
        if self.shared.store.load(job.id()).await?.is_some() {
            return Err(CrawlError::InvalidJob(format!("job {} already exists", job.id())));
        }

        let state = CrawlState::new(job);
        self.shared.store.save(&state).await?;
        let job_id = state.job_id().clone();

        self.enqueue(state).await?;
        info!("Submitted job {}", job_id);
        Ok(job_id)
    }

    /// Queue a failed or paused job again from its last checkpoint
    pub async fn resume(&self, job_id: &JobId) -> CrawlResult<JobId> {
        // A job still queued or running here keeps its checkpoint untouched
        if let Some(entry) = self.shared.jobs.lock().await.get(job_id) {
            if entry.is_active() {
                return Err(entry.not_resumable(job_id));
            }
        }

        let state = self
            .shared
            .store
            .load(job_id)
            .await?
            .ok_or_else(|| CrawlError::JobNotFound(job_id.to_string()))?;
        let state = self.shared.recover_stale(state).await;

        match state.status() {
            JobStatus::Failed | JobStatus::Paused | JobStatus::Pending => {}
            JobStatus::Running | JobStatus::Succeeded => {
                return Err(CrawlError::NotResumable {
                    job_id: job_id.to_string(),
                    status: state.status().to_string(),
                });
            }
        }

        info!(
            "Resuming job {} from {} with {} page(s) done",
            job_id,
            state.current_url(),
            state.pages().len()
        );
        self.enqueue(state).await?;
        Ok(job_id.clone())
    }

    /// Register and queue a job. Fails with `NotResumable` when the job is
    /// already queued or running, checked under the same `jobs` lock as the insert.
    async fn enqueue(&self, state: CrawlState) -> CrawlResult<()> {
        let sender = self.sender.lock().await;
        let sender = sender.as_ref().ok_or(CrawlError::ShutDown)?;

        let mut jobs = self.shared.jobs.lock().await;
        if let Some(entry) = jobs.get(state.job_id()) {
            if entry.is_active() {
                return Err(entry.not_resumable(state.job_id()));
            }
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        // Queued jobs report Pending until a worker publishes the outcome
        let (status_tx, _) = watch::channel(JobStatus::Pending);
        jobs.insert(
            state.job_id().clone(),
            JobEntry {
                cancel: cancel_tx,
                status: status_tx,
            },
        );

        sender
            .send(QueuedJob {
                state,
                cancel: cancel_rx,
            })
            .map_err(|_| CrawlError::ShutDown)
    }

    /// Summary of the last durable checkpoint
    pub async fn status(&self, job_id: &JobId) -> CrawlResult<JobSummary> {
        self.shared
            .store
            .load(job_id)
            .await?
            .map(|state| state.summary())
            .ok_or_else(|| CrawlError::JobNotFound(job_id.to_string()))
    }

    /// Ask a queued or running job to stop. It ends `Paused` and can be resumed.
    pub async fn cancel(&self, job_id: &JobId) -> CrawlResult<()> {
        let jobs = self.shared.jobs.lock().await;
        match jobs.get(job_id) {
            Some(entry) => {
                if entry.is_active() {
                    info!("Cancelling job {}", job_id);
                    entry.cancel.send_replace(true);
                }
                Ok(())
            }
            None => Err(CrawlError::JobNotFound(job_id.to_string())),
        }
    }

    /// Error records of one job in append order
    pub async fn errors(&self, job_id: &JobId) -> CrawlResult<Vec<ErrorRecord>> {
        Ok(self.shared.store.errors(Some(job_id)).await?)
    }

    /// Wait until a job queued in this process reaches a final status
    pub async fn wait(&self, job_id: &JobId) -> CrawlResult<JobSummary> {
        let receiver = self
            .shared
            .jobs
            .lock()
            .await
            .get(job_id)
            .map(|entry| entry.status.subscribe());

        if let Some(mut receiver) = receiver {
            if receiver.wait_for(|status| status.is_terminal()).await.is_err() {
                return Err(CrawlError::ShutDown);
            }
        }
        self.status(job_id).await
    }

    /// Stop accepting jobs, pause the active ones and close all sessions
    pub async fn shutdown(&self) {
        info!("Shutting down crawler controller");
        for entry in self.shared.jobs.lock().await.values() {
            if entry.is_active() {
                entry.cancel.send_replace(true);
            }
        }
        self.sender.lock().await.take();

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for result in join_all(workers).await {
            if let Err(e) = result {
                error!("Worker terminated abnormally: {}", e);
            }
        }
        self.pool.shutdown().await;
    }
}
