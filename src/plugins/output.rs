use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

use crate::crawler::task::CrawlOutput;
use crate::plugins::{OutputPlugin, Plugin, PluginError, UrlMatcher};

/// Posts the aggregate to an HTTP endpoint with an optional bearer token
pub struct ApiAdapterPlugin {
    client: Client,
    endpoint: String,
    token: Option<String>,
    matcher: UrlMatcher,
}

impl ApiAdapterPlugin {
    pub fn new(endpoint: &str, token: Option<String>, matcher: UrlMatcher) -> Result<Self, PluginError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            token,
            matcher,
        })
    }
}

impl Plugin for ApiAdapterPlugin {
    fn name(&self) -> &str {
        "api-adapter"
    }

    fn can_handle(&self, url: &str) -> bool {
        self.matcher.matches(url)
    }
}

#[async_trait]
impl OutputPlugin for ApiAdapterPlugin {
    async fn adapt_output(&self, output: &CrawlOutput) -> Result<serde_json::Value, PluginError> {
        debug!("Posting {} page(s) of job {} to {}", output.pages.len(), output.job_id, self.endpoint);

        let mut request = self.client.post(&self.endpoint).json(output);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(PluginError::Output {
                plugin: self.name().to_string(),
                message: format!("{} returned {}: {}", self.endpoint, status, body),
            });
        }

        let data = serde_json::from_str(&body).unwrap_or(serde_json::Value::String(body));
        info!("Delivered job {} to {}", output.job_id, self.endpoint);

        Ok(json!({
            "status": status.as_u16(),
            "data": data,
        }))
    }
}

/// `<output_dir>/<stem>.<extension>`, where the stem encodes the job id
fn output_path(output_dir: &Path, output: &CrawlOutput, extension: &str) -> PathBuf {
    output_dir.join(format!("{}.{}", output.job_id.file_stem(), extension))
}

/// Writes the aggregate to `<output_dir>/<job_id>.json`
pub struct JsonFileOutputPlugin {
    output_dir: PathBuf,
}

impl JsonFileOutputPlugin {
    pub fn new(output_dir: PathBuf) -> Self {
        Self { output_dir }
    }
}

impl Plugin for JsonFileOutputPlugin {
    fn name(&self) -> &str {
        "json-file"
    }

    fn can_handle(&self, _url: &str) -> bool {
        true
    }
}

#[async_trait]
impl OutputPlugin for JsonFileOutputPlugin {
    async fn adapt_output(&self, output: &CrawlOutput) -> Result<serde_json::Value, PluginError> {
        fs::create_dir_all(&self.output_dir).await?;

        let path = output_path(&self.output_dir, output, "json");
        let contents = serde_json::to_vec_pretty(output)?;
        fs::write(&path, contents).await?;

        info!("Saved {} page(s) of job {} to {}", output.pages.len(), output.job_id, path.display());
        Ok(json!({
            "path": path.display().to_string(),
            "pages": output.metadata.page_count,
        }))
    }
}

const RULE_WIDTH: usize = 80;

/// Writes the aggregate as readable text to `<output_dir>/<job_id>.txt`
pub struct TextFileOutputPlugin {
    output_dir: PathBuf,
}

impl TextFileOutputPlugin {
    pub fn new(output_dir: PathBuf) -> Self {
        Self { output_dir }
    }

    /// Job header, then each page's title, URL and text between rules
    pub fn render(output: &CrawlOutput) -> String {
        let rule = "-".repeat(RULE_WIDTH);
        let mut lines = vec![
            format!("Job: {}", output.job_id),
            format!("Seed URL: {}", output.seed_url),
            format!("Pages: {}", output.metadata.page_count),
            format!("Started: {}", output.metadata.started_at.to_rfc3339()),
            format!("Finished: {}", output.metadata.finished_at.to_rfc3339()),
            rule.clone(),
        ];

        for page in &output.pages {
            let title = page.fields.get("title").map(String::as_str).unwrap_or(&page.url);
            lines.push(String::new());
            lines.push(format!("[{}] {}", page.index + 1, title));
            lines.push(format!("URL: {}", page.url));
            lines.push(format!("Extracted: {}", page.extracted_at.to_rfc3339()));
            lines.push(String::new());
            lines.push(page.text.clone());
            lines.push(String::new());
            lines.push(rule.clone());
        }

        let mut text = lines.join("\n");
        text.push('\n');
        text
    }
}

impl Plugin for TextFileOutputPlugin {
    fn name(&self) -> &str {
        "text-file"
    }

    fn can_handle(&self, _url: &str) -> bool {
        true
    }
}

#[async_trait]
impl OutputPlugin for TextFileOutputPlugin {
    async fn adapt_output(&self, output: &CrawlOutput) -> Result<serde_json::Value, PluginError> {
        fs::create_dir_all(&self.output_dir).await?;

        let path = output_path(&self.output_dir, output, "txt");
        fs::write(&path, Self::render(output)).await?;

        info!("Saved {} page(s) of job {} to {}", output.pages.len(), output.job_id, path.display());
        Ok(json!({
            "path": path.display().to_string(),
            "pages": output.metadata.page_count,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::task::{CrawlJob, CrawlState};
    use std::collections::BTreeMap;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_output() -> CrawlOutput {
        output_for("job-42")
    }

    fn output_for(id: &str) -> CrawlOutput {
        let mut state = CrawlState::new(CrawlJob::new("https://example.com/list").with_id(id));
        let title = BTreeMap::from([("title".to_string(), "Listing".to_string())]);
        state.record_page("https://example.com/list", title, Vec::new(), "first".to_string());
        state.record_page("https://example.com/list?p=2", BTreeMap::new(), Vec::new(), "second".to_string());
        state.output()
    }

    #[tokio::test]
    async fn api_adapter_posts_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"accepted": 2})))
            .expect(1)
            .mount(&server)
            .await;

        let plugin = ApiAdapterPlugin::new(
            &format!("{}/ingest", server.uri()),
            Some("secret".to_string()),
            UrlMatcher::Any,
        )
        .unwrap();

        let result = plugin.adapt_output(&sample_output()).await.unwrap();
        assert_eq!(result["status"], 201);
        assert_eq!(result["data"]["accepted"], 2);
    }

    #[tokio::test]
    async fn api_adapter_reports_error_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let plugin = ApiAdapterPlugin::new(&server.uri(), None, UrlMatcher::Any).unwrap();
        let err = plugin.adapt_output(&sample_output()).await.unwrap_err();
        assert!(matches!(err, PluginError::Output { .. }));
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn json_file_output_writes_one_file_per_job() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = JsonFileOutputPlugin::new(dir.path().join("out"));

        let result = plugin.adapt_output(&sample_output()).await.unwrap();
        assert_eq!(result["pages"], 2);

        let written = std::fs::read_to_string(dir.path().join("out").join("job-42.json")).unwrap();
        let parsed: CrawlOutput = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed.pages.len(), 2);
        assert!(parsed.metadata.is_paginated);
    }

    #[tokio::test]
    async fn file_outputs_stay_inside_the_output_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let plugin = JsonFileOutputPlugin::new(out.clone());

        let result = plugin.adapt_output(&output_for("../../escaped")).await.unwrap();
        let written = PathBuf::from(result["path"].as_str().unwrap());
        assert_eq!(written.parent(), Some(out.as_path()));
        assert!(written.exists());
        assert!(!dir.path().join("escaped.json").exists());

        plugin.adapt_output(&output_for("job/a")).await.unwrap();
        plugin.adapt_output(&output_for("job_a")).await.unwrap();
        assert!(out.join("job%2Fa.json").exists());
        assert!(out.join("job_a.json").exists());
    }

    #[tokio::test]
    async fn text_output_lists_pages_under_a_job_header() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = TextFileOutputPlugin::new(dir.path().to_path_buf());

        let result = plugin.adapt_output(&sample_output()).await.unwrap();
        assert_eq!(result["pages"], 2);

        let written = std::fs::read_to_string(dir.path().join("job-42.txt")).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines[0], "Job: job-42");
        assert_eq!(lines[1], "Seed URL: https://example.com/list");
        assert_eq!(lines[2], "Pages: 2");
        assert_eq!(lines[5], "-".repeat(80));
        assert!(lines.contains(&"[1] Listing"));
        assert!(lines.contains(&"[2] https://example.com/list?p=2"));
        assert!(lines.contains(&"URL: https://example.com/list?p=2"));

        let first = written.find("first").unwrap();
        let second = written.find("second").unwrap();
        assert!(first < second);
    }
}
