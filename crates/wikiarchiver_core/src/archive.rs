use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::ArchiverConfig;

pub const SNAPSHOT_MARKER: &str = "web.archive.org/web/";
pub const WAYBACK_HOST: &str = "https://web.archive.org";
pub const WAYBACK_SAVE_ENDPOINT: &str = "https://web.archive.org/save/";
pub const WAYBACK_AVAILABILITY_ENDPOINT: &str = "https://archive.org/wayback/available";

/// Path segment following the snapshot marker, e.g. `20250115033343`.
pub fn snapshot_timestamp(snapshot_url: &str) -> Option<&str> {
    let (_, rest) = snapshot_url.split_once(SNAPSHOT_MARKER)?;
    let timestamp = rest.split('/').next()?;
    if timestamp.is_empty() {
        return None;
    }
    Some(timestamp)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedArchive {
    pub url: String,
    pub snapshot_url: Option<String>,
}

impl ResolvedArchive {
    /// Replays a snapshot that is already known; no network access.
    pub fn from_known(url: &str, snapshot_url: &str) -> Self {
        Self {
            url: url.to_string(),
            snapshot_url: Some(snapshot_url.to_string()),
        }
    }

    pub fn is_archived(&self) -> bool {
        self.snapshot_url
            .as_deref()
            .is_some_and(|snapshot| snapshot.contains(SNAPSHOT_MARKER))
    }

    pub fn timestamp(&self) -> Option<&str> {
        self.snapshot_url.as_deref().and_then(snapshot_timestamp)
    }
}

/// Network operations of the snapshot service and link probing.
pub trait SnapshotApi {
    /// HTTP status of a HEAD request that follows redirects.
    fn probe_status(&mut self, url: &str, timeout: Duration) -> Result<u16>;
    /// Submits `url` for capture, retrying internally within a bounded budget.
    fn save(&mut self, url: &str) -> Result<Option<String>>;
    /// Closest existing snapshot reported by the availability lookup.
    fn closest_available(&mut self, url: &str) -> Result<Option<String>>;
}

#[derive(Debug, Clone)]
pub struct WaybackConfig {
    pub user_agent: String,
    pub timeout: Duration,
    pub save_max_tries: usize,
    pub save_retry_delay: Duration,
}

impl WaybackConfig {
    pub fn from_config(config: &ArchiverConfig) -> Self {
        Self {
            user_agent: config.user_agent(),
            timeout: config.request_timeout(),
            save_max_tries: config.save_max_tries(),
            save_retry_delay: config.save_retry_delay(),
        }
    }
}

pub struct WaybackClient {
    client: Client,
    config: WaybackConfig,
}

impl WaybackClient {
    pub fn new(config: WaybackConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build Wayback HTTP client")?;
        Ok(Self { client, config })
    }
}

impl SnapshotApi for WaybackClient {
    fn probe_status(&mut self, url: &str, timeout: Duration) -> Result<u16> {
        let response = self
            .client
            .head(url)
            .header("User-Agent", self.config.user_agent.clone())
            .timeout(timeout)
            .send()
            .with_context(|| format!("failed to probe {url}"))?;
        Ok(response.status().as_u16())
    }

    fn save(&mut self, url: &str) -> Result<Option<String>> {
        let endpoint = format!("{WAYBACK_SAVE_ENDPOINT}{url}");
        let client = &self.client;
        let user_agent = self.config.user_agent.clone();
        let retry_delay = self.config.save_retry_delay;

        run_save_attempts(
            self.config.save_max_tries,
            |attempt| {
                let response = client
                    .get(&endpoint)
                    .header("User-Agent", user_agent.clone())
                    .send()?;
                let status = response.status();
                let header = |name: &str| {
                    response
                        .headers()
                        .get(name)
                        .and_then(|value| value.to_str().ok())
                        .map(ToString::to_string)
                };
                let snapshot = snapshot_from_response(
                    header("content-location").as_deref(),
                    header("link").as_deref(),
                    response.url().as_str(),
                );
                debug!(url, attempt, %status, found = snapshot.is_some(), "save attempt");
                Ok((status, snapshot))
            },
            |attempt| sleep(retry_delay_for(retry_delay, attempt)),
        )
    }

    fn closest_available(&mut self, url: &str) -> Result<Option<String>> {
        let response = self
            .client
            .get(WAYBACK_AVAILABILITY_ENDPOINT)
            .header("User-Agent", self.config.user_agent.clone())
            .query(&[("url", url)])
            .send()
            .context("failed to call Wayback availability API")?;
        let status = response.status();
        if !status.is_success() {
            bail!("Wayback availability API failed with HTTP {status}");
        }
        let payload: AvailabilityResponse = response
            .json()
            .context("failed to decode Wayback availability response")?;
        Ok(payload.closest_url())
    }
}

/// Resolves snapshots with a save-then-lookup fallback and probes link liveness.
pub struct ArchiveResolver<S> {
    api: S,
    archive_delay: Duration,
    last_submission_at: Option<Instant>,
}

impl<S: SnapshotApi> ArchiveResolver<S> {
    pub fn new(api: S) -> Self {
        Self {
            api,
            archive_delay: Duration::ZERO,
            last_submission_at: None,
        }
    }

    /// Minimum gap between successive archive submissions.
    pub fn with_archive_delay(mut self, delay: Duration) -> Self {
        self.archive_delay = delay;
        self
    }

    pub fn api(&self) -> &S {
        &self.api
    }

    /// Alive when the status is below 404; 401 and 403 are access control, not link death.
    pub fn is_alive(&mut self, url: &str, timeout: Duration) -> bool {
        match self.api.probe_status(url, timeout) {
            Ok(status) => {
                info!(url, status, "checked url");
                status < 404
            }
            Err(error) => {
                warn!(url, error = %format!("{error:#}"), "url check failed");
                false
            }
        }
    }

    pub fn archive(&mut self, url: &str) -> Option<String> {
        self.apply_archive_delay();
        info!(url, "attempting to archive url");

        match self.api.save(url) {
            Ok(Some(snapshot)) => {
                info!(url, snapshot = %snapshot, "archived via save API");
                return Some(snapshot);
            }
            Ok(None) => warn!(url, "save API returned no snapshot"),
            Err(error) => error!(url, error = %format!("{error:#}"), "save API failed"),
        }

        debug!(url, "trying availability lookup");
        match self.api.closest_available(url) {
            Ok(Some(snapshot)) => {
                info!(url, snapshot = %snapshot, "found existing snapshot");
                Some(snapshot)
            }
            Ok(None) => {
                warn!(url, "no snapshot found");
                None
            }
            Err(error) => {
                error!(url, error = %format!("{error:#}"), "availability lookup failed");
                None
            }
        }
    }

    pub fn resolve(&mut self, url: &str) -> ResolvedArchive {
        ResolvedArchive {
            url: url.to_string(),
            snapshot_url: self.archive(url),
        }
    }

    fn apply_archive_delay(&mut self) {
        if let Some(last) = self.last_submission_at {
            let elapsed = last.elapsed();
            if elapsed < self.archive_delay {
                sleep(self.archive_delay - elapsed);
            }
        }
        self.last_submission_at = Some(Instant::now());
    }
}

/// Picks the capture URL out of a save response.
fn snapshot_from_response(
    content_location: Option<&str>,
    link: Option<&str>,
    final_url: &str,
) -> Option<String> {
    if let Some(location) = content_location
        && location.starts_with("/web/")
    {
        let candidate = format!("{WAYBACK_HOST}{location}");
        if is_capture_url(&candidate) {
            return Some(candidate);
        }
    }

    if let Some(link) = link {
        let memento = link
            .split(',')
            .filter(|entry| entry.contains("memento"))
            .filter_map(|entry| {
                let start = entry.find('<')?;
                let end = entry[start..].find('>')? + start;
                Some(entry[start + 1..end].trim().to_string())
            })
            .filter(|candidate| is_capture_url(candidate))
            .next_back();
        if memento.is_some() {
            return memento;
        }
    }

    if is_capture_url(final_url) {
        return Some(final_url.to_string());
    }
    None
}

fn is_capture_url(value: &str) -> bool {
    snapshot_timestamp(value)
        .is_some_and(|timestamp| timestamp.chars().all(|ch| ch.is_ascii_digit()))
}

#[derive(Debug, PartialEq, Eq)]
enum SaveAttempt {
    Captured(String),
    /// Worth another try; carries the failure, if any, to report once the budget runs out.
    Retry(Option<String>),
    Fail(String),
}

fn classify_save_response(status: StatusCode, snapshot: Option<String>) -> SaveAttempt {
    match snapshot {
        Some(snapshot) if status.is_success() => SaveAttempt::Captured(snapshot),
        _ if status.is_success() => SaveAttempt::Retry(None),
        _ if is_retryable_status(status) => SaveAttempt::Retry(Some(format!("HTTP {status}"))),
        _ => SaveAttempt::Fail(format!("Wayback save failed with HTTP {status}")),
    }
}

/// Runs up to `max_tries` save attempts, calling `wait(n)` before retry `n + 1`.
fn run_save_attempts<F, W>(max_tries: usize, mut attempt: F, mut wait: W) -> Result<Option<String>>
where
    F: FnMut(usize) -> Result<(StatusCode, Option<String>)>,
    W: FnMut(usize),
{
    let max_tries = max_tries.max(1);
    let mut last_error = None::<String>;

    for index in 0..max_tries {
        if index > 0 {
            wait(index - 1);
        }
        match attempt(index) {
            Ok((status, snapshot)) => match classify_save_response(status, snapshot) {
                SaveAttempt::Captured(snapshot) => return Ok(Some(snapshot)),
                SaveAttempt::Retry(error) => last_error = error,
                SaveAttempt::Fail(message) => bail!(message),
            },
            Err(error) => last_error = Some(format!("{error:#}")),
        }
    }

    match last_error {
        Some(message) => bail!("Wayback save failed after {max_tries} attempts: {message}"),
        None => Ok(None),
    }
}

/// Exponential backoff from `base` plus up to 99ms of jitter.
fn retry_delay_for(base: Duration, attempt: usize) -> Duration {
    let exponent = u32::try_from(attempt).unwrap_or(16);
    let base = u64::try_from(base.as_millis())
        .unwrap_or(u64::MAX)
        .saturating_mul(2u64.saturating_pow(exponent));
    let jitter = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| u64::from(duration.subsec_millis() % 100))
        .unwrap_or(0);
    Duration::from_millis(base.saturating_add(jitter))
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

#[derive(Debug, Deserialize, Default)]
struct AvailabilityResponse {
    #[serde(default)]
    archived_snapshots: ArchivedSnapshots,
}

#[derive(Debug, Deserialize, Default)]
struct ArchivedSnapshots {
    closest: Option<ClosestSnapshot>,
}

#[derive(Debug, Deserialize)]
struct ClosestSnapshot {
    #[serde(default)]
    available: bool,
    url: Option<String>,
}

impl AvailabilityResponse {
    fn closest_url(self) -> Option<String> {
        self.archived_snapshots
            .closest
            .filter(|closest| closest.available)
            .and_then(|closest| closest.url)
            .filter(|url| !url.trim().is_empty())
    }
}
