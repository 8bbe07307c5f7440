use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thirtyfour::extensions::cdp::ChromeDevTools;
use thirtyfour::prelude::*;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info};
use url::Url;
use uuid::Uuid;

use crate::browser::{
    BrowserControl, BrowserError, BrowserKind, FieldQuery, PageRequest, ReadyCondition, SessionId, SessionSpec,
};
use crate::cli::config::BrowserSettings;

/// Map a WebDriver failure onto the engine's browser error classes
pub fn classify_webdriver_message(message: &str) -> BrowserError {
    let lower = message.to_lowercase();
    let message = message.to_string();

    if lower.contains("invalid session id")
        || lower.contains("no such window")
        || lower.contains("session deleted")
        || lower.contains("not reachable")
        || lower.contains("session not created")
    {
        BrowserError::SessionLost(message)
    } else if lower.contains("timeout") || lower.contains("timed out") {
        BrowserError::Timeout(message)
    } else if lower.contains("no such element") {
        BrowserError::ElementMissing(message)
    } else if lower.contains("invalid selector") || lower.contains("invalid argument") {
        BrowserError::Other(message)
    } else if lower.contains("connect") || lower.contains("request") || lower.contains("broken pipe") {
        BrowserError::Transport(message)
    } else {
        BrowserError::Other(message)
    }
}

fn webdriver_error(e: WebDriverError) -> BrowserError {
    classify_webdriver_message(&e.to_string())
}

#[derive(Clone)]
struct LiveSession {
    driver: WebDriver,
    kind: BrowserKind,
    /// Extra headers the browser currently sends with every request
    applied_headers: BTreeMap<String, String>,
}

/// Headers to push over CDP before a navigation, `None` when the session
/// already sends exactly the requested set. An empty set clears earlier headers.
fn headers_to_apply<'a>(
    applied: &BTreeMap<String, String>,
    requested: &'a BTreeMap<String, String>,
) -> Option<&'a BTreeMap<String, String>> {
    (applied != requested).then_some(requested)
}

const SCROLL_SCRIPT: &str = "window.scrollTo(0, document.body.scrollHeight); return document.body.scrollHeight;";

/// Browser control over a (remote) WebDriver endpoint
pub struct WebDriverBrowser {
    /// WebDriver server URL
    webdriver_url: String,

    /// Browser settings
    config: BrowserSettings,

    /// Live sessions by id
    sessions: Mutex<HashMap<SessionId, LiveSession>>,
}

impl WebDriverBrowser {
    pub fn new(config: BrowserSettings) -> Self {
        Self {
            webdriver_url: config.webdriver_url.clone(),
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    async fn live(&self, session: &SessionId) -> Result<LiveSession, BrowserError> {
        self.sessions
            .lock()
            .await
            .get(session)
            .cloned()
            .ok_or_else(|| BrowserError::SessionLost(format!("unknown session {}", session)))
    }

    async fn connect(&self, spec: &SessionSpec) -> WebDriverResult<WebDriver> {
        let viewport = &self.config.viewport;
        match spec.kind {
            BrowserKind::Chrome => {
                let mut caps = DesiredCapabilities::chrome();
                caps.add_chrome_arg(&format!("--window-size={},{}", viewport.width, viewport.height))?;
                caps.add_chrome_arg("--disable-dev-shm-usage")?;
                if spec.headless {
                    caps.set_headless()?;
                }
                WebDriver::new(&self.webdriver_url, caps).await
            }
            BrowserKind::Firefox => {
                let mut caps = DesiredCapabilities::firefox();
                if spec.headless {
                    caps.set_headless()?;
                }
                WebDriver::new(&self.webdriver_url, caps).await
            }
        }
    }

    async fn set_extra_headers(&self, driver: &WebDriver, headers: &BTreeMap<String, String>) -> Result<(), BrowserError> {
        let dev_tools = ChromeDevTools::new(driver.handle.clone());
        dev_tools
            .execute_cdp("Network.enable")
            .await
            .map_err(webdriver_error)?;
        dev_tools
            .execute_cdp_with_params(
                "Network.setExtraHTTPHeaders",
                serde_json::json!({ "headers": headers }),
            )
            .await
            .map_err(webdriver_error)?;
        Ok(())
    }

    async fn condition_holds(&self, driver: &WebDriver, condition: &ReadyCondition) -> Result<bool, BrowserError> {
        match condition {
            ReadyCondition::ElementPresent(selector) => {
                let elements = driver.find_all(By::Css(selector)).await.map_err(webdriver_error)?;
                Ok(!elements.is_empty())
            }
            ReadyCondition::DocumentComplete => {
                let ret = driver
                    .execute("return document.readyState;", Vec::new())
                    .await
                    .map_err(webdriver_error)?;
                Ok(ret.json().as_str() == Some("complete"))
            }
        }
    }
}

#[async_trait]
impl BrowserControl for WebDriverBrowser {
    async fn open_session(&self, spec: &SessionSpec) -> Result<SessionId, BrowserError> {
        let driver = self.connect(spec).await.map_err(|e| {
            error!("Failed to connect to WebDriver at {}: {}", self.webdriver_url, e);
            webdriver_error(e)
        })?;

        driver
            .set_page_load_timeout(Duration::from_secs(self.config.page_load_timeout_secs))
            .await
            .map_err(webdriver_error)?;

        let id = SessionId::new(Uuid::new_v4().to_string());
        info!("Opened {} session {} (headless: {})", spec.kind, id, spec.headless);
        self.sessions.lock().await.insert(
            id.clone(),
            LiveSession {
                driver,
                kind: spec.kind,
                applied_headers: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    async fn navigate(&self, session: &SessionId, request: &PageRequest, timeout: Duration) -> Result<(), BrowserError> {
        Url::parse(&request.url).map_err(|e| BrowserError::InvalidUrl(format!("{}: {}", request.url, e)))?;
        let LiveSession {
            driver,
            kind,
            applied_headers,
        } = self.live(session).await?;

        match kind {
            BrowserKind::Chrome => {
                if let Some(headers) = headers_to_apply(&applied_headers, &request.headers) {
                    self.set_extra_headers(&driver, headers).await?;
                    if let Some(live) = self.sessions.lock().await.get_mut(session) {
                        live.applied_headers = headers.clone();
                    }
                }
            }
            BrowserKind::Firefox if !request.headers.is_empty() => {
                debug!("Extra headers are only supported on Chrome, ignoring for {}", request.url);
            }
            BrowserKind::Firefox => {}
        }

        debug!("Navigating to: {}", request.url);
        match tokio::time::timeout(timeout, driver.goto(&request.url)).await {
            Ok(result) => result.map_err(webdriver_error),
            Err(_) => Err(BrowserError::Timeout(format!(
                "navigation to {} exceeded {:?}",
                request.url, timeout
            ))),
        }
    }

    async fn wait_for_condition(
        &self,
        session: &SessionId,
        condition: &ReadyCondition,
        timeout: Duration,
    ) -> Result<(), BrowserError> {
        let driver = self.live(session).await?.driver;
        let deadline = Instant::now() + timeout;
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(10));

        loop {
            if self.condition_holds(&driver, condition).await? {
                return Ok(());
            }
            if Instant::now() + poll > deadline {
                return Err(BrowserError::Timeout(format!("{:?} not met within {:?}", condition, timeout)));
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn extract_field(&self, session: &SessionId, query: &FieldQuery) -> Result<Option<String>, BrowserError> {
        let driver = self.live(session).await?.driver;
        let elements = driver
            .find_all(By::Css(&query.selector))
            .await
            .map_err(webdriver_error)?;

        let Some(element) = elements.into_iter().next() else {
            return Ok(None);
        };

        match &query.attribute {
            Some(attribute) => element.attr(attribute).await.map_err(webdriver_error),
            None => element.text().await.map(Some).map_err(webdriver_error),
        }
    }

    async fn page_source(&self, session: &SessionId) -> Result<String, BrowserError> {
        let driver = self.live(session).await?.driver;
        driver.source().await.map_err(webdriver_error)
    }

    async fn scroll_to_bottom(&self, session: &SessionId) -> Result<u64, BrowserError> {
        let driver = self.live(session).await?.driver;
        let ret = driver
            .execute(SCROLL_SCRIPT, Vec::new())
            .await
            .map_err(webdriver_error)?;
        ret.json()
            .as_u64()
            .or_else(|| ret.json().as_f64().map(|height| height as u64))
            .ok_or_else(|| BrowserError::Other(format!("unexpected page height {}", ret.json())))
    }

    async fn close_session(&self, session: &SessionId) -> Result<(), BrowserError> {
        let Some(live) = self.sessions.lock().await.remove(session) else {
            return Ok(());
        };
        live.driver.quit().await.map_err(webdriver_error)?;
        debug!("Browser session {} closed", session);
        Ok(())
    }
}
