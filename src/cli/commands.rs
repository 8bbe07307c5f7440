use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::browser::BrowserKind;
use crate::cli::config::HarvesterConfig;
use crate::crawler::controller::CrawlerController;
use crate::crawler::task::{CrawlJob, JobId, JobStatus, JobSummary};
use crate::storage::CheckpointStoreFactory;

/// Per-invocation overrides of the job defaults
#[derive(Debug, Clone, Default)]
pub struct CrawlOptions {
    pub browser: Option<BrowserKind>,
    pub headless: bool,
    pub depth: Option<u32>,
    pub timeout: Option<u64>,
}

/// Load, override from the environment and validate the configuration
pub fn load_config(path: Option<&Path>) -> Result<HarvesterConfig> {
    let mut config = match path {
        Some(path) => HarvesterConfig::load_from_file(path)?,
        None => HarvesterConfig::load_default()?,
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

/// Build a job from the seed URL, the configured defaults and the overrides
pub fn build_job(config: &HarvesterConfig, url: String, options: &CrawlOptions) -> CrawlJob {
    let timeout = options.timeout.unwrap_or(config.engine.job_timeout_secs);
    CrawlJob::new(url)
        .with_max_depth(options.depth.unwrap_or(config.engine.default_max_depth))
        .with_browser(options.browser.unwrap_or(config.engine.browser_type))
        .with_headless(config.engine.headless && options.headless)
        .with_timeout(Duration::from_secs(timeout))
}

fn print_summary(summary: &JobSummary) {
    println!("Job ID: {}", summary.job_id);
    println!("Seed: {}", summary.seed_url);
    println!("Status: {}", summary.status);
    println!("Pages Extracted: {}", summary.pages);
    println!("Current URL: {}", summary.current_url);
    println!("Last Updated: {}", summary.updated_at);
    if let Some(kind) = summary.last_error {
        println!("Last Error: {}", kind);
    }
}

/// Run new jobs to completion in this process
pub async fn crawl(config: HarvesterConfig, urls: Vec<String>, options: CrawlOptions) -> Result<()> {
    let controller = CrawlerController::connect(config).await?;
    controller.start().await?;

    let mut submitted = Vec::new();
    for url in urls {
        let job = build_job(controller.config(), url.clone(), &options);
        match controller.submit(job).await {
            Ok(job_id) => {
                info!("Crawling job started with ID: {}", job_id);
                submitted.push(job_id);
            }
            Err(e) => warn!("Skipping {}: {}", url, e),
        }
    }

    let failed = wait_all(&controller, &submitted).await;

    let metrics = controller.metrics().get_metrics().await;
    info!(
        "Extracted {} page(s) with {} retried attempt(s)",
        metrics.pages_extracted,
        metrics.total_retries()
    );
    controller.shutdown().await;

    if failed > 0 {
        anyhow::bail!("{} of {} job(s) did not succeed", failed, submitted.len());
    }
    Ok(())
}

async fn wait_all(controller: &CrawlerController, jobs: &[JobId]) -> usize {
    let mut failed = 0;
    for job_id in jobs {
        match controller.wait(job_id).await {
            Ok(summary) => {
                if summary.status != JobStatus::Succeeded {
                    failed += 1;
                    println!("Use `harvester resume {}` to continue the job", job_id);
                }
                print_summary(&summary);
            }
            Err(e) => {
                failed += 1;
                warn!("Lost track of job {}: {}", job_id, e);
            }
        }
    }
    failed
}

/// Check the status of a crawling job
pub async fn status(config: HarvesterConfig, job_id: String) -> Result<()> {
    let store = CheckpointStoreFactory::create(&config.storage).await?;
    let state = store
        .load(&JobId::from(job_id.clone()))
        .await?
        .context(format!("No checkpoint for job {}", job_id))?;

    print_summary(&state.summary());
    Ok(())
}

/// List every job known to the checkpoint store
pub async fn jobs(config: HarvesterConfig) -> Result<()> {
    let store = CheckpointStoreFactory::create(&config.storage).await?;
    let ids = store.list().await?;
    if ids.is_empty() {
        println!("No jobs found");
        return Ok(());
    }

    for job_id in ids {
        if let Some(state) = store.load(&job_id).await? {
            let summary = state.summary();
            println!(
                "{}  {:<9}  {:>4} page(s)  {}",
                summary.job_id, summary.status, summary.pages, summary.seed_url
            );
        }
    }
    Ok(())
}

/// Resume a job in this process and wait for it
pub async fn resume(config: HarvesterConfig, job_id: String) -> Result<()> {
    let controller = CrawlerController::connect(config).await?;
    controller.start().await?;

    let job_id = controller.resume(&JobId::from(job_id)).await?;
    let failed = wait_all(&controller, std::slice::from_ref(&job_id)).await;
    controller.shutdown().await;

    if failed > 0 {
        anyhow::bail!("Job {} did not succeed", job_id);
    }
    Ok(())
}

/// Print the error log, optionally for one job
pub async fn errors(config: HarvesterConfig, job_id: Option<String>) -> Result<()> {
    let store = CheckpointStoreFactory::create(&config.storage).await?;
    let job_id = job_id.map(JobId::from);
    let records = store.errors(job_id.as_ref()).await?;

    if records.is_empty() {
        println!("No errors recorded");
    }
    for record in records {
        println!(
            "{} [{}] {} ({} attempt(s)) {}: {}",
            record.occurred_at, record.kind, record.job_id, record.attempts, record.url, record.message
        );
    }
    Ok(())
}

/// Show the effective configuration
pub fn show_config(config: &HarvesterConfig) -> Result<()> {
    let contents = serde_yaml::to_string(config).context("Failed to serialize configuration")?;
    println!("Current configuration:");
    println!("{}", contents);
    Ok(())
}

/// Write the default configuration unless the file already exists
pub fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        anyhow::bail!("Configuration file already exists: {}", path.display());
    }
    HarvesterConfig::default().save_to_file(path)?;
    println!("Created default configuration: {}", path.display());
    Ok(())
}
