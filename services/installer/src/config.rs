//! Configuration for the installer.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use dnp_retry::RetryPolicy;

use crate::fetcher::FetcherConfig;
use crate::install::{InstallPaths, DEFAULT_ROOT_DIR};

/// Installer configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Install root.
    pub root_dir: PathBuf,

    /// Release metadata repository.
    pub releases_dir: PathBuf,

    /// Content store gateway URL.
    pub content_url: String,

    /// Maximum concurrent downloads.
    pub download_concurrency: usize,

    /// Attempts per download.
    pub download_max_attempts: u32,

    /// Backoff base in milliseconds.
    pub download_backoff_ms: u64,

    /// Stall watchdog in milliseconds.
    pub download_stall_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let root_dir = var("DNP_ROOT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT_DIR));

        let releases_dir = var("DNP_RELEASES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| root_dir.join("releases"));

        let content_url =
            var("DNP_CONTENT_URL").unwrap_or_else(|| "http://127.0.0.1:8080".to_string());

        let download_concurrency = var("DNP_DOWNLOAD_CONCURRENCY")
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(2);

        let download_max_attempts = var("DNP_DOWNLOAD_MAX_ATTEMPTS")
            .and_then(|s| s.parse::<u32>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(3);

        let download_backoff_ms = var("DNP_DOWNLOAD_BACKOFF_MS")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(225);

        let download_stall_timeout_ms = var("DNP_DOWNLOAD_STALL_TIMEOUT_MS")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(3000);

        let log_level = var("DNP_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            root_dir,
            releases_dir,
            content_url,
            download_concurrency,
            download_max_attempts,
            download_backoff_ms,
            download_stall_timeout_ms,
            log_level,
        })
    }

    pub fn install_paths(&self) -> InstallPaths {
        InstallPaths::new(&self.root_dir)
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            concurrency: self.download_concurrency,
            retry: RetryPolicy::new(
                self.download_max_attempts,
                Duration::from_millis(self.download_backoff_ms),
            ),
            stall_timeout: Duration::from_millis(self.download_stall_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned()).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]);
        assert_eq!(config.root_dir, PathBuf::from("/usr/src/dappnode"));
        assert_eq!(config.releases_dir, PathBuf::from("/usr/src/dappnode/releases"));
        assert_eq!(config.content_url, "http://127.0.0.1:8080");
        assert_eq!(config.log_level, "info");

        let fetcher = config.fetcher_config();
        assert_eq!(fetcher.concurrency, 2);
        assert_eq!(fetcher.retry.max_attempts, 3);
        assert_eq!(fetcher.retry.base, Duration::from_millis(225));
        assert_eq!(fetcher.stall_timeout, Duration::from_millis(3000));
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("DNP_ROOT_DIR", "/data"),
            ("DNP_DOWNLOAD_CONCURRENCY", "4"),
            ("DNP_DOWNLOAD_STALL_TIMEOUT_MS", "500"),
        ]);
        assert_eq!(config.releases_dir, PathBuf::from("/data/releases"));
        assert_eq!(config.install_paths().root(), std::path::Path::new("/data"));
        assert_eq!(config.download_concurrency, 4);
        assert_eq!(config.download_stall_timeout_ms, 500);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = load(&[
            ("DNP_DOWNLOAD_CONCURRENCY", "0"),
            ("DNP_DOWNLOAD_MAX_ATTEMPTS", "many"),
        ]);
        assert_eq!(config.download_concurrency, 2);
        assert_eq!(config.download_max_attempts, 3);
    }
}
