use std::collections::BTreeMap;
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::changes::ChangeWindow;
use crate::config::ArchiverConfig;

pub const NS_MAIN: i32 = 0;

/// One `list=recentchanges` entry (`rcprop=title|ids|timestamp`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RecentChange {
    pub title: String,
    pub pageid: u64,
    pub revid: u64,
    #[serde(default)]
    pub old_revid: u64,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RecentChangesPage {
    pub changes: Vec<RecentChange>,
    /// Server-supplied `continue` object; `None` once the feed is exhausted.
    pub continuation: Option<BTreeMap<String, String>>,
}

/// One record of a REST revision comparison.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DiffRecord {
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageData {
    pub source: Option<String>,
    pub latest_id: Option<u64>,
}

pub trait WikiReadApi {
    /// Base URL of the wiki this client talks to.
    fn site(&self) -> &str;
    fn recent_changes_page(
        &mut self,
        window: &ChangeWindow,
        continuation: &BTreeMap<String, String>,
    ) -> Result<RecentChangesPage>;
    fn compare_revisions(&mut self, old_revision_id: u64, new_revision_id: u64)
    -> Result<Vec<DiffRecord>>;
    fn page_data(&mut self, title: &str) -> Result<PageData>;
    fn request_count(&self) -> usize;
}

pub trait WikiWriteApi: WikiReadApi {
    /// Replaces the page source, failing when `latest_id` is no longer the current revision.
    /// Returns the id of the new revision when the wiki reports it.
    fn edit_page(
        &mut self,
        title: &str,
        source: &str,
        comment: &str,
        latest_id: u64,
    ) -> Result<Option<u64>>;
}

#[derive(Debug, Clone)]
pub struct WikiClientConfig {
    pub site: String,
    pub action_api: String,
    pub rest_api: String,
    pub user_agent: String,
    pub token: Option<String>,
    pub timeout: Duration,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
}

impl WikiClientConfig {
    pub fn from_config(config: &ArchiverConfig) -> Self {
        Self {
            site: config.wiki_url(),
            action_api: config.action_api(),
            rest_api: config.rest_api(),
            user_agent: config.user_agent(),
            token: config.token(),
            timeout: config.request_timeout(),
            rate_limit_read_ms: 100,
            rate_limit_write_ms: 1_000,
        }
    }
}

pub struct MediaWikiClient {
    client: Client,
    config: WikiClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl MediaWikiClient {
    pub fn new(config: WikiClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build MediaWiki HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
        })
    }

    fn with_headers(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("User-Agent", self.config.user_agent.clone());
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn request_json_get(&mut self, params: &[(&str, String)]) -> Result<Value> {
        let base_url = Url::parse(&self.config.action_api)
            .with_context(|| format!("invalid action API URL: {}", self.config.action_api))?;

        let mut pairs = Vec::with_capacity(params.len() + 2);
        pairs.push(("format".to_string(), "json".to_string()));
        pairs.push(("formatversion".to_string(), "2".to_string()));
        for (key, value) in params {
            if !value.is_empty() {
                pairs.push(((*key).to_string(), value.clone()));
            }
        }

        self.apply_rate_limit(false);
        let response = self
            .with_headers(self.client.get(base_url))
            .query(&pairs)
            .send()
            .context("failed to call MediaWiki API")?;
        let status = response.status();
        if !status.is_success() {
            bail!("MediaWiki API request failed with HTTP {status}");
        }

        let payload: Value = response
            .json()
            .context("failed to decode MediaWiki API JSON response")?;
        if let Some(error) = payload.get("error") {
            let code = error
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error");
            let info = error
                .get("info")
                .and_then(Value::as_str)
                .unwrap_or("unknown info");
            bail!("MediaWiki API error [{code}]: {info}");
        }
        Ok(payload)
    }

    fn request_rest(&mut self, request: RequestBuilder, is_write: bool) -> Result<Value> {
        self.apply_rate_limit(is_write);
        let response = self
            .with_headers(request)
            .send()
            .context("failed to call MediaWiki REST API")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!(
                "MediaWiki REST request failed with HTTP {status}: {}",
                truncate(body.trim(), 300)
            );
        }
        response
            .json()
            .context("failed to decode MediaWiki REST JSON response")
    }

    fn rest_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.config.rest_api)
            .with_context(|| format!("invalid REST API URL: {}", self.config.rest_api))?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| anyhow::anyhow!("REST API URL cannot be a base: {}", self.config.rest_api))?;
            path.pop_if_empty();
            // `push` escapes `/` so subpage titles stay a single segment
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    fn apply_rate_limit(&mut self, is_write: bool) {
        let delay = if is_write {
            Duration::from_millis(self.config.rate_limit_write_ms)
        } else {
            Duration::from_millis(self.config.rate_limit_read_ms)
        };
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }
}

impl WikiReadApi for MediaWikiClient {
    fn site(&self) -> &str {
        &self.config.site
    }

    fn recent_changes_page(
        &mut self,
        window: &ChangeWindow,
        continuation: &BTreeMap<String, String>,
    ) -> Result<RecentChangesPage> {
        let mut params = vec![
            ("action", "query".to_string()),
            ("list", "recentchanges".to_string()),
            ("rcnamespace", NS_MAIN.to_string()),
            ("rclimit", "max".to_string()),
            ("rcshow", "!bot".to_string()),
            ("rctype", "edit".to_string()),
            ("rcstart", window.rcstart()),
            ("rcend", window.rcend()),
            ("rcprop", "title|ids|timestamp".to_string()),
        ];
        for (key, value) in continuation {
            params.push((key.as_str(), value.clone()));
        }

        let response = self.request_json_get(&params)?;
        let parsed: QueryResponse = serde_json::from_value(response)
            .context("failed to decode recentchanges API response")?;
        debug!(
            changes = parsed.query.recentchanges.len(),
            "recent changes page received"
        );

        Ok(RecentChangesPage {
            changes: parsed.query.recentchanges,
            continuation: parsed.continuation.map(stringify_continuation),
        })
    }

    fn compare_revisions(
        &mut self,
        old_revision_id: u64,
        new_revision_id: u64,
    ) -> Result<Vec<DiffRecord>> {
        let url = self.rest_url(&[
            "revision",
            &old_revision_id.to_string(),
            "compare",
            &new_revision_id.to_string(),
        ])?;
        let request = self.client.get(url);
        let response = self.request_rest(request, false)?;
        let parsed: CompareResponse = serde_json::from_value(response)
            .context("failed to decode revision compare response")?;
        Ok(parsed.diff)
    }

    fn page_data(&mut self, title: &str) -> Result<PageData> {
        let url = self.rest_url(&["page", title])?;
        let request = self.client.get(url);
        let response = self
            .request_rest(request, false)
            .with_context(|| format!("failed to read page {title}"))?;
        let parsed: PageResponse =
            serde_json::from_value(response).context("failed to decode page response")?;
        Ok(PageData {
            source: parsed.source,
            latest_id: parsed.latest.map(|latest| latest.id),
        })
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

impl WikiWriteApi for MediaWikiClient {
    fn edit_page(
        &mut self,
        title: &str,
        source: &str,
        comment: &str,
        latest_id: u64,
    ) -> Result<Option<u64>> {
        let url = self.rest_url(&["page", title])?;
        let payload = json!({
            "source": source,
            "comment": comment,
            "latest": { "id": latest_id },
        });
        let request = self.client.put(url).json(&payload);
        let response = self
            .request_rest(request, true)
            .with_context(|| format!("MediaWiki edit failed for {title}"))?;
        let parsed: PageResponse =
            serde_json::from_value(response).context("failed to decode edit response")?;
        Ok(parsed.latest.map(|latest| latest.id))
    }
}

fn stringify_continuation(raw: BTreeMap<String, Value>) -> BTreeMap<String, String> {
    raw.into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(text) => text,
                other => other.to_string(),
            };
            (key, value)
        })
        .collect()
}

fn truncate(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let mut output = value.chars().take(max_chars).collect::<String>();
    output.push('…');
    output
}

#[derive(Debug, Deserialize, Default)]
struct QueryResponse {
    #[serde(default)]
    query: QueryPayload,
    #[serde(default, rename = "continue")]
    continuation: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Deserialize, Default)]
struct QueryPayload {
    #[serde(default)]
    recentchanges: Vec<RecentChange>,
}

#[derive(Debug, Deserialize, Default)]
struct CompareResponse {
    #[serde(default)]
    diff: Vec<DiffRecord>,
}

#[derive(Debug, Deserialize, Default)]
struct PageResponse {
    source: Option<String>,
    latest: Option<LatestRevision>,
}

#[derive(Debug, Deserialize)]
struct LatestRevision {
    id: u64,
}
