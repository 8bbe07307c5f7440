use anyhow::{Result, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::fs;
use std::str::FromStr;
use tracing::{info, debug, error};

use crate::browser::BrowserKind;

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct HarvesterConfig {
    pub engine: EngineSettings,
    pub browser: BrowserSettings,
    pub pool: PoolSettings,
    pub retry: RetrySettings,
    pub pagination: PaginationSettings,
    pub content: ContentSettings,
    pub output: OutputSettings,
    pub storage: StorageSettings,
}

/// Worker and job defaults
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EngineSettings {
    pub workers: usize,
    pub job_timeout_secs: u64,
    pub default_max_depth: u32,
    pub browser_type: BrowserKind,
    pub headless: bool,
}

/// Remote browser settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BrowserSettings {
    pub webdriver_url: String,
    pub page_load_timeout_secs: u64,
    pub ready_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Element that signals a loaded page; `None` waits for `document.readyState`
    pub ready_selector: Option<String>,
    /// Scrolls per page to trigger lazy-loaded content; 0 disables scrolling
    pub scroll_attempts: u32,
    pub scroll_pause_ms: u64,
    pub viewport: Viewport,
}

/// Browser viewport settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Session pool settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PoolSettings {
    pub capacity: usize,
    pub acquire_timeout_secs: u64,
}

/// Retry policy settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RetrySettings {
    pub retry_count: u32,
    pub base_delay_ms: u64,
    pub jitter: f64,
}

/// Next-page detection settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PaginationSettings {
    /// Candidate selectors, highest priority first
    pub next_page_selectors: Vec<String>,
}

/// Content extraction and normalization settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ContentSettings {
    /// Elements dropped before text is concatenated
    pub exclude_selectors: Vec<String>,
    /// Main content containers tried in order by the generic parser
    pub content_selectors: Vec<String>,
}

/// File format written by the catch-all output plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    Text,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "text" | "txt" => Ok(OutputFormat::Text),
            other => Err(format!("Unknown output format: {}", other)),
        }
    }
}

/// Output plugin settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct OutputSettings {
    pub output_dir: PathBuf,
    pub format: OutputFormat,
    pub api_endpoint: Option<String>,
    pub api_token: Option<String>,
    /// Seed URLs routed to the API adapter; all seeds when unset
    pub api_url_pattern: Option<String>,
}

/// Checkpoint storage settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StorageSettings {
    pub storage_type: String, // "memory", "filesystem", "redis"
    pub path: PathBuf,
    pub redis_url: String,
    pub key_prefix: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            job_timeout_secs: 3600,
            default_max_depth: 10,
            browser_type: BrowserKind::Chrome,
            headless: true,
        }
    }
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:4444".to_string(),
            page_load_timeout_secs: 30,
            ready_timeout_secs: 10,
            poll_interval_ms: 500,
            ready_selector: Some("body".to_string()),
            scroll_attempts: 5,
            scroll_pause_ms: 1000,
            viewport: Viewport {
                width: 1920,
                height: 1080,
            },
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            capacity: 4,
            acquire_timeout_secs: 60,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            retry_count: 3,
            base_delay_ms: 2000,
            jitter: 0.5,
        }
    }
}

impl Default for PaginationSettings {
    fn default() -> Self {
        Self {
            next_page_selectors: vec![
                "a[rel=\"next\"]".to_string(),
                "link[rel=\"next\"]".to_string(),
                ".pagination .next a".to_string(),
                ".pagination a.next".to_string(),
                ".pager .next a".to_string(),
                "a.next".to_string(),
                "a[aria-label=\"Next\"]".to_string(),
            ],
        }
    }
}

impl Default for ContentSettings {
    fn default() -> Self {
        Self {
            exclude_selectors: vec![
                "script".to_string(),
                "style".to_string(),
                "noscript".to_string(),
                "template".to_string(),
                "iframe".to_string(),
                "[data-ad]".to_string(),
                ".ad".to_string(),
                ".ads".to_string(),
                ".advert".to_string(),
                ".advertisement".to_string(),
            ],
            content_selectors: vec![
                "article".to_string(),
                ".content".to_string(),
                "#content".to_string(),
                "main".to_string(),
            ],
        }
    }
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./output"),
            format: OutputFormat::Json,
            api_endpoint: None,
            api_token: None,
            api_url_pattern: None,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            storage_type: "filesystem".to_string(),
            path: HarvesterConfig::data_dir().join("state"),
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "harvester".to_string(),
        }
    }
}

impl HarvesterConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("com", "page-harvester", "page-harvester") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        }
    }

    /// Get the path to the data directory
    pub fn data_dir() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("com", "page-harvester", "page-harvester") {
            proj_dirs.data_dir().to_path_buf()
        } else {
            PathBuf::from("./data")
        }
    }

    /// Location of the configuration used when none is given
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("default.yaml")
    }

    /// Load the default configuration
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_path();

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            // Create and save the default configuration
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            if let Err(e) = config.save_to_file(&config_path) {
                error!("Failed to save default configuration: {}", e);
            }
            Ok(config)
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(config)
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    /// Apply `HARVESTER_*` environment overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("HARVESTER_WEBDRIVER_URL") {
            self.browser.webdriver_url = url;
        }
        if let Some(browser) = lookup("HARVESTER_BROWSER") {
            self.engine.browser_type = browser.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(headless) = lookup("HARVESTER_HEADLESS") {
            self.engine.headless = matches!(headless.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(format) = lookup("HARVESTER_OUTPUT_FORMAT") {
            self.output.format = format.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(workers) = lookup("HARVESTER_WORKERS") {
            self.engine.workers = workers
                .parse()
                .context(format!("Invalid HARVESTER_WORKERS value: {}", workers))?;
        }
        Ok(())
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.engine.workers == 0 {
            anyhow::bail!("engine.workers must be at least 1");
        }
        if self.pool.capacity == 0 {
            anyhow::bail!("pool.capacity must be at least 1");
        }
        if self.retry.retry_count == 0 {
            anyhow::bail!("retry.retry_count must be at least 1");
        }
        if self.engine.default_max_depth == 0 {
            anyhow::bail!("engine.default_max_depth must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = HarvesterConfig::default();
        config.validate().unwrap();
        assert_eq!(config.retry.retry_count, 3);
        assert_eq!(config.retry.base_delay_ms, 2000);
        assert_eq!(config.engine.job_timeout_secs, 3600);
        assert_eq!(config.pagination.next_page_selectors[0], "a[rel=\"next\"]");
    }

    #[test]
    fn partial_yaml_falls_back_to_defaults() {
        let yaml = "pool:\n  capacity: 2\nretry:\n  retry_count: 5\n";
        let config: HarvesterConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.pool.capacity, 2);
        assert_eq!(config.pool.acquire_timeout_secs, 60);
        assert_eq!(config.retry.retry_count, 5);
        assert_eq!(config.retry.jitter, 0.5);
        assert_eq!(config.storage.storage_type, "filesystem");
        assert_eq!(config.browser.scroll_attempts, 5);
        assert_eq!(config.output.format, OutputFormat::Json);

        let config: HarvesterConfig =
            serde_yaml::from_str("browser:\n  scroll_attempts: 0\noutput:\n  format: text\n").unwrap();
        assert_eq!(config.browser.scroll_attempts, 0);
        assert_eq!(config.browser.scroll_pause_ms, 1000);
        assert_eq!(config.output.format, OutputFormat::Text);
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn save_and_load_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("harvester.yaml");

        let mut config = HarvesterConfig::default();
        config.engine.workers = 7;
        config.save_to_file(&path).unwrap();

        let loaded = HarvesterConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.engine.workers, 7);
    }

    #[test]
    fn environment_overrides_apply() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("HARVESTER_WEBDRIVER_URL", "http://grid:4444/wd/hub"),
            ("HARVESTER_BROWSER", "firefox"),
            ("HARVESTER_HEADLESS", "false"),
            ("HARVESTER_WORKERS", "2"),
            ("HARVESTER_OUTPUT_FORMAT", "text"),
        ]);
        let mut config = HarvesterConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.browser.webdriver_url, "http://grid:4444/wd/hub");
        assert_eq!(config.engine.browser_type, BrowserKind::Firefox);
        assert!(!config.engine.headless);
        assert_eq!(config.engine.workers, 2);
        assert_eq!(config.output.format, OutputFormat::Text);
    }

    #[test]
    fn zero_workers_are_rejected() {
        let mut config = HarvesterConfig::default();
        config.engine.workers = 0;
        assert!(config.validate().is_err());
    }
}
