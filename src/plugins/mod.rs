pub mod input;
pub mod output;
pub mod parse;

use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::browser::PageRequest;
use crate::cli::config::{HarvesterConfig, OutputFormat};
use crate::crawler::task::CrawlOutput;
use crate::error::ErrorKind;

pub use input::{AjaxInputPlugin, DefaultInputPlugin};
pub use output::{ApiAdapterPlugin, JsonFileOutputPlugin, TextFileOutputPlugin};
pub use parse::{GenericParser, NewsParser};

/// Pipeline stage a plugin serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Input,
    Parse,
    Output,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Input => f.write_str("input"),
            Stage::Parse => f.write_str("parse"),
            Stage::Output => f.write_str("output"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("No {stage} plugin can handle {url}")]
    NoPluginMatched { stage: Stage, url: String },

    #[error("Invalid selector '{selector}': {message}")]
    InvalidSelector { selector: String, message: String },

    #[error("Invalid URL pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("{plugin} could not extract content: {message}")]
    Extraction { plugin: String, message: String },

    #[error("{plugin} output failed: {message}")]
    Output { plugin: String, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PluginError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PluginError::Http(e) if e.is_timeout() || e.is_connect() => ErrorKind::Transient,
            PluginError::Io(_) => ErrorKind::Transient,
            _ => ErrorKind::Permanent,
        }
    }
}

/// Parse a CSS selector, keeping the offending text in the error
pub(crate) fn selector(css: &str) -> Result<Selector, PluginError> {
    Selector::parse(css).map_err(|e| PluginError::InvalidSelector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

/// Absolute http(s) targets of the anchors matched by `anchors`, without
/// fragments, deduplicated in document order
pub(crate) fn page_links(document: &Html, anchors: &Selector, page_url: &str) -> Vec<String> {
    let base = Url::parse(page_url).ok();
    let mut seen = BTreeSet::new();
    let mut links = Vec::new();

    for href in document.select(anchors).filter_map(|a| a.value().attr("href")) {
        let href = href.trim();
        if href.is_empty() || href.starts_with('#') {
            continue;
        }
        let resolved = match &base {
            Some(base) => base.join(href),
            None => Url::parse(href),
        };
        let Ok(mut link) = resolved else {
            continue;
        };
        if !matches!(link.scheme(), "http" | "https") {
            continue;
        }
        link.set_fragment(None);

        let link = link.to_string();
        if seen.insert(link.clone()) {
            links.push(link);
        }
    }
    links
}

/// Which URLs a plugin claims
#[derive(Debug, Clone)]
pub enum UrlMatcher {
    Any,
    /// Case-insensitive substring match
    Contains(String),
    Pattern(Regex),
}

impl UrlMatcher {
    pub fn contains(needle: &str) -> Self {
        UrlMatcher::Contains(needle.to_lowercase())
    }

    pub fn pattern(pattern: &str) -> Result<Self, PluginError> {
        Ok(UrlMatcher::Pattern(Regex::new(pattern)?))
    }

    pub fn matches(&self, url: &str) -> bool {
        match self {
            UrlMatcher::Any => true,
            UrlMatcher::Contains(needle) => url.to_lowercase().contains(needle.as_str()),
            UrlMatcher::Pattern(re) => re.is_match(url),
        }
    }
}

/// Capability shared by every plugin
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn can_handle(&self, url: &str) -> bool;
}

/// Shapes the page request before navigation
pub trait InputPlugin: Plugin {
    fn shape_request(&self, request: PageRequest) -> PageRequest;
}

/// Rendered page handed to a parse plugin
#[derive(Debug, Clone, Copy)]
pub struct PageSource<'a> {
    pub url: &'a str,
    pub html: &'a str,
}

/// Fields pulled out of one page plus the HTML fragment holding its main content
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFields {
    pub fields: BTreeMap<String, String>,
    pub links: Vec<String>,
    pub body_html: String,
}

/// Turns a rendered page into raw fields
pub trait ParsePlugin: Plugin {
    fn extract(&self, page: &PageSource<'_>) -> Result<RawFields, PluginError>;
}

/// Delivers the aggregated result of a finished job
#[async_trait]
pub trait OutputPlugin: Plugin {
    async fn adapt_output(&self, output: &CrawlOutput) -> Result<serde_json::Value, PluginError>;
}

/// A plugin tagged with the stage it serves
#[derive(Clone)]
pub enum StagePlugin {
    Input(Arc<dyn InputPlugin>),
    Parse(Arc<dyn ParsePlugin>),
    Output(Arc<dyn OutputPlugin>),
}

impl StagePlugin {
    pub fn stage(&self) -> Stage {
        match self {
            StagePlugin::Input(_) => Stage::Input,
            StagePlugin::Parse(_) => Stage::Parse,
            StagePlugin::Output(_) => Stage::Output,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            StagePlugin::Input(p) => p.name(),
            StagePlugin::Parse(p) => p.name(),
            StagePlugin::Output(p) => p.name(),
        }
    }
}

impl fmt::Debug for StagePlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.stage(), self.name())
    }
}

/// Ordered plugin lists per stage. The first plugin that can handle a URL wins.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    input: Vec<Arc<dyn InputPlugin>>,
    parse: Vec<Arc<dyn ParsePlugin>>,
    output: Vec<Arc<dyn OutputPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in plugins, specific matchers ahead of catch-alls
    pub fn with_defaults(config: &HarvesterConfig) -> Result<Self, PluginError> {
        let mut registry = Self::new();

        let base = DefaultInputPlugin::from_config(config);
        registry.register(StagePlugin::Input(Arc::new(AjaxInputPlugin::new(base.clone()))));
        registry.register(StagePlugin::Input(Arc::new(base)));

        registry.register(StagePlugin::Parse(Arc::new(NewsParser::new()?)));
        registry.register(StagePlugin::Parse(Arc::new(GenericParser::new(
            &config.content.content_selectors,
        )?)));

        if let Some(endpoint) = &config.output.api_endpoint {
            let matcher = match &config.output.api_url_pattern {
                Some(pattern) => UrlMatcher::pattern(pattern)?,
                None => UrlMatcher::Any,
            };
            registry.register(StagePlugin::Output(Arc::new(ApiAdapterPlugin::new(
                endpoint,
                config.output.api_token.clone(),
                matcher,
            )?)));
        }
        let output_dir = config.output.output_dir.clone();
        registry.register(match config.output.format {
            OutputFormat::Json => StagePlugin::Output(Arc::new(JsonFileOutputPlugin::new(output_dir))),
            OutputFormat::Text => StagePlugin::Output(Arc::new(TextFileOutputPlugin::new(output_dir))),
        });

        Ok(registry)
    }

    /// Append a plugin to the end of its stage's list
    pub fn register(&mut self, plugin: StagePlugin) {
        info!("Registering {} plugin {}", plugin.stage(), plugin.name());
        match plugin {
            StagePlugin::Input(p) => self.input.push(p),
            StagePlugin::Parse(p) => self.parse.push(p),
            StagePlugin::Output(p) => self.output.push(p),
        }
    }

    /// Plugin names of a stage in dispatch order
    pub fn names(&self, stage: Stage) -> Vec<&str> {
        match stage {
            Stage::Input => self.input.iter().map(|p| p.name()).collect(),
            Stage::Parse => self.parse.iter().map(|p| p.name()).collect(),
            Stage::Output => self.output.iter().map(|p| p.name()).collect(),
        }
    }

    pub fn dispatch(&self, stage: Stage, url: &str) -> Result<StagePlugin, PluginError> {
        match stage {
            Stage::Input => self.input_for(url).map(StagePlugin::Input),
            Stage::Parse => self.parse_for(url).map(StagePlugin::Parse),
            Stage::Output => self.output_for(url).map(StagePlugin::Output),
        }
    }

    pub fn input_for(&self, url: &str) -> Result<Arc<dyn InputPlugin>, PluginError> {
        first_match(&self.input, Stage::Input, url)
    }

    pub fn parse_for(&self, url: &str) -> Result<Arc<dyn ParsePlugin>, PluginError> {
        first_match(&self.parse, Stage::Parse, url)
    }

    pub fn output_for(&self, url: &str) -> Result<Arc<dyn OutputPlugin>, PluginError> {
        first_match(&self.output, Stage::Output, url)
    }
}

fn first_match<P>(plugins: &[Arc<P>], stage: Stage, url: &str) -> Result<Arc<P>, PluginError>
where
    P: Plugin + ?Sized,
{
    let plugin = plugins
        .iter()
        .find(|p| p.can_handle(url))
        .cloned()
        .ok_or_else(|| PluginError::NoPluginMatched {
            stage,
            url: url.to_string(),
        })?;
    debug!("Dispatched {} stage for {} to {}", stage, url, plugin.name());
    Ok(plugin)
}
