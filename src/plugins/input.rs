use tracing::debug;

use crate::browser::{PageRequest, ReadyCondition};
use crate::cli::config::HarvesterConfig;
use crate::plugins::{InputPlugin, Plugin, UrlMatcher};

/// Catch-all input plugin: readiness condition and next-page selector priority
#[derive(Debug, Clone)]
pub struct DefaultInputPlugin {
    ready: ReadyCondition,
    next_page_selectors: Vec<String>,
}

impl DefaultInputPlugin {
    pub fn new(ready_selector: Option<String>, next_page_selectors: Vec<String>) -> Self {
        let ready = match ready_selector {
            Some(selector) if !selector.trim().is_empty() => ReadyCondition::ElementPresent(selector),
            _ => ReadyCondition::DocumentComplete,
        };
        Self {
            ready,
            next_page_selectors,
        }
    }

    pub fn from_config(config: &HarvesterConfig) -> Self {
        Self::new(
            config.browser.ready_selector.clone(),
            config.pagination.next_page_selectors.clone(),
        )
    }
}

impl Plugin for DefaultInputPlugin {
    fn name(&self) -> &str {
        "default-input"
    }

    fn can_handle(&self, _url: &str) -> bool {
        true
    }
}

impl InputPlugin for DefaultInputPlugin {
    fn shape_request(&self, mut request: PageRequest) -> PageRequest {
        request.ready = self.ready.clone();
        if request.next_page_selectors.is_empty() {
            request.next_page_selectors = self.next_page_selectors.clone();
        }
        request
    }
}

/// XHR-style endpoints under `/ajax/` expect JSON request headers
#[derive(Debug, Clone)]
pub struct AjaxInputPlugin {
    matcher: UrlMatcher,
    base: DefaultInputPlugin,
}

impl AjaxInputPlugin {
    pub fn new(base: DefaultInputPlugin) -> Self {
        Self {
            matcher: UrlMatcher::contains("/ajax/"),
            base,
        }
    }
}

impl Plugin for AjaxInputPlugin {
    fn name(&self) -> &str {
        "ajax"
    }

    fn can_handle(&self, url: &str) -> bool {
        self.matcher.matches(url)
    }
}

impl InputPlugin for AjaxInputPlugin {
    fn shape_request(&self, request: PageRequest) -> PageRequest {
        let mut request = self.base.shape_request(request);
        debug!("Adding AJAX headers for {}", request.url);
        request
            .headers
            .insert("X-Requested-With".to_string(), "XMLHttpRequest".to_string());
        request
            .headers
            .insert("Accept".to_string(), "application/json".to_string());
        request
    }
}
