pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::browser::BrowserKind;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to the per-user default.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl one or more seed URLs and wait for the jobs to finish
    Crawl {
        /// Seed URLs, one job each
        #[arg(required = true)]
        urls: Vec<String>,

        /// Browser to drive (chrome or firefox)
        #[arg(short, long)]
        browser: Option<BrowserKind>,

        /// Show the browser window
        #[arg(long)]
        no_headless: bool,

        /// Maximum number of pages per job
        #[arg(short, long)]
        depth: Option<u32>,

        /// Job timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Show the status of a job
    Status {
        /// Job ID to check status for
        #[arg(required = true)]
        job_id: String,
    },

    /// List every job with a checkpoint
    Jobs,

    /// Resume a failed or paused job from its last checkpoint
    Resume {
        #[arg(required = true)]
        job_id: String,
    },

    /// Print the error log
    Errors {
        /// Only records of this job
        job_id: Option<String>,
    },

    /// Show the effective configuration
    Config {
        /// Write the defaults to the configuration file
        #[arg(long)]
        init: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    if let Commands::Config { init: true } = cli.command {
        let path = cli.config.unwrap_or_else(config::HarvesterConfig::default_path);
        info!("Writing default configuration to {}", path.display());
        return commands::init_config(&path);
    }

    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Crawl { urls, browser, no_headless, depth, timeout } => {
            info!("Starting {} crawl job(s)", urls.len());
            let options = commands::CrawlOptions {
                browser,
                headless: !no_headless,
                depth,
                timeout,
            };
            commands::crawl(config, urls, options).await
        }
        Commands::Status { job_id } => commands::status(config, job_id).await,
        Commands::Jobs => commands::jobs(config).await,
        Commands::Resume { job_id } => {
            info!("Resuming job {}", job_id);
            commands::resume(config, job_id).await
        }
        Commands::Errors { job_id } => commands::errors(config, job_id).await,
        Commands::Config { .. } => commands::show_config(&config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn crawl_accepts_several_seeds_and_overrides() {
        let cli = Cli::try_parse_from([
            "harvester", "crawl", "https://a.example.com", "https://b.example.com",
            "--browser", "firefox", "--depth", "3", "--no-headless",
        ])
        .unwrap();

        match cli.command {
            Commands::Crawl { urls, browser, no_headless, depth, timeout } => {
                assert_eq!(urls.len(), 2);
                assert_eq!(browser, Some(BrowserKind::Firefox));
                assert!(no_headless);
                assert_eq!(depth, Some(3));
                assert_eq!(timeout, None);
            }
            _ => panic!("expected crawl"),
        }
    }

    #[test]
    fn errors_job_filter_is_optional() {
        let cli = Cli::try_parse_from(["harvester", "errors"]).unwrap();
        assert!(matches!(cli.command, Commands::Errors { job_id: None }));
        assert!(Cli::try_parse_from(["harvester", "crawl"]).is_err());
    }
}
