use url::Url;
use tracing::debug;

use crate::crawler::task::CrawlState;

/// Why pagination stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// No next-page affordance on the page
    NoNextLink,
    /// The job already extracted `max_depth` pages
    DepthLimit,
    /// The link points back at a page of this job
    AlreadyVisited,
    /// The link points at the current page
    SelfLoop,
    /// The link could not be resolved to an http(s) URL
    InvalidLink,
}

/// Outcome of next-page detection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextPage {
    Navigate(String),
    Done(StopReason),
}

/// Decide whether pagination continues from the current page.
///
/// Continues only when a link was found, the depth budget allows another
/// page, the target is not the current page and was never visited.
pub fn decide_next(state: &CrawlState, candidate: Option<&str>) -> NextPage {
    let Some(href) = candidate.map(str::trim).filter(|h| !h.is_empty()) else {
        return NextPage::Done(StopReason::NoNextLink);
    };

    let Some(target) = resolve_link(state.current_url(), href) else {
        debug!("Ignoring unusable next-page link: {}", href);
        return NextPage::Done(StopReason::InvalidLink);
    };

    if normalize_url(&target) == normalize_url(state.current_url()) {
        debug!("Next-page link points at the current page: {}", target);
        return NextPage::Done(StopReason::SelfLoop);
    }

    if state.depth() >= state.job().max_depth() {
        debug!("Depth limit {} reached", state.job().max_depth());
        return NextPage::Done(StopReason::DepthLimit);
    }

    if state.has_visited(&target) {
        debug!("Skipping already visited URL: {}", target);
        return NextPage::Done(StopReason::AlreadyVisited);
    }

    NextPage::Navigate(target)
}

/// Resolve a possibly relative href against the page it was found on
pub fn resolve_link(base: &str, href: &str) -> Option<String> {
    let resolved = match Url::parse(href) {
        Ok(url) => url,
        Err(_) => Url::parse(base).ok()?.join(href).ok()?,
    };

    match resolved.scheme() {
        "http" | "https" => Some(resolved.to_string()),
        _ => None,
    }
}

/// Normalize a URL to avoid duplicates due to minor differences
pub fn normalize_url(url: &str) -> String {
    // Parse the URL
    let parsed_url = match Url::parse(url) {
        Ok(url) => url,
        Err(_) => return url.to_string(), // Can't normalize, return as is
    };

    let mut normalized = parsed_url.clone();

    // Remove default ports
    if let Some(port) = normalized.port() {
        if (normalized.scheme() == "http" && port == 80) ||
           (normalized.scheme() == "https" && port == 443) {
            let _ = normalized.set_port(None);
        }
    }

    // Sort query parameters if present
    if normalized.query().map_or(false, |q| !q.is_empty()) {
        let mut params: Vec<(String, String)> = parsed_url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        params.sort();
        normalized.query_pairs_mut().clear().extend_pairs(params);
    }

    // Remove fragments (anchors)
    normalized.set_fragment(None);

    // The url crate lowercases hosts; only the root slash is left to trim
    let mut result = normalized.to_string();
    if normalized.path() == "/" && normalized.query().is_none() && result.ends_with('/') {
        result.pop();
    }
    result
}
