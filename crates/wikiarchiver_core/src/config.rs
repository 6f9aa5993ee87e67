use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILENAME: &str = "wikiarchiver.toml";
pub const DEFAULT_WIKI_URL: &str = "https://pt.wikipedia.org";
pub const DEFAULT_USER_AGENT: &str = "wikiarchiver/0.1 (citation archiving bot)";
pub const DEFAULT_DB_PATH: &str = "wikiarchiver.db";
pub const DEFAULT_LAST_HOURS: u32 = 24;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SAVE_MAX_TRIES: usize = 3;
pub const DEFAULT_SAVE_RETRY_DELAY_MS: u64 = 5_000;

/// Snapshot hosts and persistent identifiers that are never submitted for archiving.
pub const DEFAULT_SKIP_URL_PREFIXES: &[&str] = &[
    "https://web.archive.org/",
    "http://web.archive.org/",
    "https://archive.org/",
    "http://archive.org/",
    "https://archive.ph/",
    "https://archive.today/",
    "https://webcitation.org/",
    "https://doi.org/",
    "http://doi.org/",
    "https://dx.doi.org/",
    "http://dx.doi.org/",
    "https://hdl.handle.net/",
];

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ArchiverConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub archive: ArchiveSection,
    #[serde(default)]
    pub storage: StorageSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub url: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ArchiveSection {
    pub skip_url_prefixes: Option<Vec<String>>,
    pub last_hours: Option<u32>,
    pub request_timeout_secs: Option<u64>,
    pub save_max_tries: Option<usize>,
    pub save_retry_delay_ms: Option<u64>,
    pub archive_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct StorageSection {
    pub db_path: Option<String>,
}

impl ArchiverConfig {
    /// Resolve the wiki base URL: env WIKI_URL > config > DEFAULT_WIKI_URL.
    pub fn wiki_url(&self) -> String {
        let url = env_override("WIKI_URL")
            .or_else(|| self.wiki.url.clone())
            .unwrap_or_else(|| DEFAULT_WIKI_URL.to_string());
        url.trim().trim_end_matches('/').to_string()
    }

    pub fn action_api(&self) -> String {
        format!("{}/w/api.php", self.wiki_url())
    }

    pub fn rest_api(&self) -> String {
        format!("{}/w/rest.php/v1", self.wiki_url())
    }

    /// Resolve user agent: env WIKI_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        env_override("WIKI_USER_AGENT")
            .or_else(|| self.wiki.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    /// OAuth bearer token; only read from the environment so it never lands in config files.
    pub fn token(&self) -> Option<String> {
        env_override("WIKI_TOKEN")
    }

    pub fn skip_url_prefixes(&self) -> Vec<String> {
        match &self.archive.skip_url_prefixes {
            Some(prefixes) => prefixes
                .iter()
                .map(|prefix| prefix.trim().to_lowercase())
                .filter(|prefix| !prefix.is_empty())
                .collect(),
            None => DEFAULT_SKIP_URL_PREFIXES
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }

    pub fn last_hours(&self) -> u32 {
        self.archive.last_hours.unwrap_or(DEFAULT_LAST_HOURS)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(
            self.archive
                .request_timeout_secs
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        )
    }

    pub fn save_max_tries(&self) -> usize {
        self.archive
            .save_max_tries
            .unwrap_or(DEFAULT_SAVE_MAX_TRIES)
            .max(1)
    }

    pub fn save_retry_delay(&self) -> Duration {
        Duration::from_millis(
            self.archive
                .save_retry_delay_ms
                .unwrap_or(DEFAULT_SAVE_RETRY_DELAY_MS),
        )
    }

    pub fn archive_delay(&self) -> Duration {
        Duration::from_millis(self.archive.archive_delay_ms.unwrap_or(0))
    }

    /// Resolve the ledger path: env ARCHIVER_DB_PATH > config > DEFAULT_DB_PATH.
    /// Relative paths are resolved against `base_dir`.
    pub fn db_path(&self, base_dir: &Path) -> PathBuf {
        let raw = env_override("ARCHIVER_DB_PATH")
            .or_else(|| self.storage.db_path.clone())
            .unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let path = PathBuf::from(raw);
        if path.is_absolute() {
            path
        } else {
            base_dir.join(path)
        }
    }
}

/// Load and parse an ArchiverConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<ArchiverConfig> {
    if !config_path.exists() {
        return Ok(ArchiverConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: ArchiverConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn env_override(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/wikiarchiver.toml")).expect("load config");
        assert_eq!(config, ArchiverConfig::default());
        assert_eq!(config.last_hours(), DEFAULT_LAST_HOURS);
        assert_eq!(config.save_max_tries(), DEFAULT_SAVE_MAX_TRIES);
        assert_eq!(config.archive_delay(), Duration::ZERO);
    }

    #[test]
    fn load_config_parses_all_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join(DEFAULT_CONFIG_FILENAME);
        fs::write(
            &config_path,
            r#"
[wiki]
url = "https://test.wikipedia.org/"
user_agent = "test-agent/1.0"

[archive]
skip_url_prefixes = ["HTTPS://DOI.ORG/", "  "]
last_hours = 168
request_timeout_secs = 10
save_max_tries = 0
archive_delay_ms = 250

[storage]
db_path = "state/ledger.db"
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(
            config.wiki.url.as_deref(),
            Some("https://test.wikipedia.org/")
        );
        assert_eq!(config.wiki.user_agent.as_deref(), Some("test-agent/1.0"));
        assert_eq!(config.skip_url_prefixes(), vec!["https://doi.org/".to_string()]);
        assert_eq!(config.last_hours(), 168);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.save_max_tries(), 1);
        assert_eq!(config.archive_delay(), Duration::from_millis(250));
        assert_eq!(config.storage.db_path.as_deref(), Some("state/ledger.db"));
    }

    #[test]
    fn load_config_tolerates_partial_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join(DEFAULT_CONFIG_FILENAME);
        fs::write(&config_path, "[archive]\nlast_hours = 6\n").expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert!(config.wiki.url.is_none());
        assert_eq!(config.last_hours(), 6);
        assert!(
            config
                .skip_url_prefixes()
                .contains(&"https://doi.org/".to_string())
        );
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join(DEFAULT_CONFIG_FILENAME);
        fs::write(&config_path, "[wiki\nurl = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn default_skip_prefixes_cover_snapshot_hosts_and_doi() {
        let prefixes = ArchiverConfig::default().skip_url_prefixes();
        assert!(prefixes.iter().any(|prefix| prefix.contains("web.archive.org")));
        assert!(prefixes.iter().any(|prefix| prefix.contains("doi.org")));
        assert!(
            prefixes
                .iter()
                .all(|prefix| *prefix == prefix.to_lowercase())
        );
    }
}
