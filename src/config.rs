//! Optional config file loading. Search order: ./wnscrape.toml, then
//! $XDG_CONFIG_HOME/wnscrape/config.toml (or ~/.config/wnscrape/config.toml).
//! `WNSCRAPE_DATA_DIR` and `WNSCRAPE_PROXY_URL` override the file.

use crate::fetch::RequestPolicy;
use crate::sync::{ContentFailurePolicy, SyncOptions};
use serde::Deserialize;
use std::path::PathBuf;

pub const DATA_DIR_ENV: &str = "WNSCRAPE_DATA_DIR";
pub const PROXY_URL_ENV: &str = "WNSCRAPE_PROXY_URL";

/// Config file contents. All fields optional; only present keys override defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case", default, deny_unknown_fields)]
pub struct Config {
    /// Directory holding one subdirectory per Work. Paths are relative to CWD.
    pub data_dir: Option<PathBuf>,
    /// Decode guide JSON file. The bundled guide is used when unset.
    pub decode_guide: Option<PathBuf>,
    /// Rendering proxy endpoint.
    pub proxy_url: Option<String>,
    /// Allow falling back to the rendering proxy (default: true).
    pub secondary_fetch: Option<bool>,
    /// HTTP User-Agent header.
    pub user_agent: Option<String>,
    /// Delay in seconds between requests (default 0).
    pub request_delay_secs: Option<u64>,
    /// Request timeout in seconds (default 20).
    pub timeout_secs: Option<u64>,
    /// Attempts per fetch strategy (default 3).
    pub retry_count: Option<u32>,
    /// Delay in seconds between attempts (default 1).
    pub time_between_retries_secs: Option<u64>,
    /// Skip direct fetching and always go through the rendering proxy.
    pub force_secondary_fetch: Option<bool>,
    /// Persist the Work every N chapters during bulk runs (default 10).
    pub persist_every: Option<usize>,
    /// Chapters per compiled EPUB (default 100).
    pub chapters_per_volume: Option<usize>,
    /// What bulk runs do with chapters that yield no content: skip (default) or abort.
    pub on_content_failure: Option<ContentFailurePolicy>,
    /// Include a visible table-of-contents page in EPUBs (default: true).
    pub toc_page: Option<bool>,
}

impl Config {
    /// Apply environment overrides, read through `lookup` (normally `std::env::var`).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(DATA_DIR_ENV).filter(|v| !v.trim().is_empty()) {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(url) = lookup(PROXY_URL_ENV).filter(|v| !v.trim().is_empty()) {
            self.proxy_url = Some(url);
        }
    }

    /// Global request policy: built-in defaults with the configured keys on top.
    pub fn request_policy(&self) -> RequestPolicy {
        let defaults = RequestPolicy::default();
        RequestPolicy {
            timeout_secs: self.timeout_secs.unwrap_or(defaults.timeout_secs),
            retries: self.retry_count.unwrap_or(defaults.retries).max(1),
            time_between_retries_secs: self
                .time_between_retries_secs
                .unwrap_or(defaults.time_between_retries_secs),
            force_secondary_fetch: self
                .force_secondary_fetch
                .unwrap_or(defaults.force_secondary_fetch),
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        let defaults = SyncOptions::default();
        SyncOptions {
            persist_every: self.persist_every.unwrap_or(defaults.persist_every).max(1),
            on_content_failure: self
                .on_content_failure
                .unwrap_or(defaults.on_content_failure),
        }
    }
}

/// Search order: (1) ./wnscrape.toml, (2) $XDG_CONFIG_HOME/wnscrape/config.toml.
/// Missing file returns Ok(None). Invalid TOML or I/O error reading a present file returns Err.
pub fn load_config() -> Result<Option<Config>, String> {
    let cwd = std::env::current_dir()
        .map_err(|e| format!("Cannot determine current directory: {}", e))?;
    let mut paths = vec![cwd.join("wnscrape.toml")];
    if let Some(d) = dirs::config_dir() {
        paths.push(d.join("wnscrape").join("config.toml"));
    }
    for path in &paths {
        if path.exists() {
            let s = std::fs::read_to_string(path)
                .map_err(|e| format!("Cannot read config {}: {}", path.display(), e))?;
            let config: Config = toml::from_str(&s)
                .map_err(|e| format!("Invalid config {}: {}", path.display(), e))?;
            tracing::debug!(path = %path.display(), "config loaded");
            return Ok(Some(config));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_config() -> Result<(), toml::de::Error> {
        let c: Config = toml::from_str("")?;
        assert!(c.data_dir.is_none());
        assert!(c.decode_guide.is_none());
        assert!(c.proxy_url.is_none());
        assert!(c.on_content_failure.is_none());
        assert_eq!(c.request_policy(), RequestPolicy::default());
        assert_eq!(c.sync_options(), SyncOptions::default());
        Ok(())
    }

    #[test]
    fn parse_full_config() -> Result<(), toml::de::Error> {
        let s = r#"
            data_dir = "novels"
            decode_guide = "guide.json"
            proxy_url = "http://proxy:8191/v1"
            secondary_fetch = false
            user_agent = "Custom/1.0"
            request_delay_secs = 2
            timeout_secs = 60
            retry_count = 5
            time_between_retries_secs = 4
            force_secondary_fetch = true
            persist_every = 25
            chapters_per_volume = 50
            on_content_failure = "abort"
            toc_page = false
        "#;
        let c: Config = toml::from_str(s)?;
        assert_eq!(c.data_dir.as_deref(), Some(std::path::Path::new("novels")));
        assert_eq!(c.proxy_url.as_deref(), Some("http://proxy:8191/v1"));
        assert_eq!(c.secondary_fetch, Some(false));
        assert_eq!(c.chapters_per_volume, Some(50));
        assert_eq!(c.toc_page, Some(false));
        assert_eq!(
            c.request_policy(),
            RequestPolicy {
                timeout_secs: 60,
                retries: 5,
                time_between_retries_secs: 4,
                force_secondary_fetch: true,
            }
        );
        assert_eq!(
            c.sync_options(),
            SyncOptions {
                persist_every: 25,
                on_content_failure: ContentFailurePolicy::Abort,
            }
        );
        Ok(())
    }

    #[test]
    fn zero_retries_still_attempt_once() -> Result<(), toml::de::Error> {
        let c: Config = toml::from_str("retry_count = 0\npersist_every = 0")?;
        assert_eq!(c.request_policy().retries, 1);
        assert_eq!(c.sync_options().persist_every, 1);
        Ok(())
    }

    #[test]
    fn environment_overrides_file() -> Result<(), toml::de::Error> {
        let mut c: Config = toml::from_str("data_dir = \"a\"\nproxy_url = \"http://a\"")?;
        c.apply_env(|key| match key {
            DATA_DIR_ENV => Some("/srv/novels".to_string()),
            PROXY_URL_ENV => Some("   ".to_string()),
            _ => None,
        });
        assert_eq!(c.data_dir, Some(PathBuf::from("/srv/novels")));
        assert_eq!(c.proxy_url.as_deref(), Some("http://a"));
        Ok(())
    }

    #[test]
    fn invalid_config_errors() {
        assert!(toml::from_str::<Config>("data_dir = [").is_err());
        assert!(toml::from_str::<Config>("on_content_failure = \"later\"").is_err());
        assert!(toml::from_str::<Config>("output_dir = \"x\"").is_err());
    }
}
