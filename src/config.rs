//! Configuration types for the cache lifecycle and its front ends.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Names of the three cache partitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionNames {
    /// Staging area for a new version's shell files.
    pub temp: String,
    /// Long-lived resource cache serving runtime requests.
    pub content: String,
    /// Holds the last applied resource manifest.
    pub manifest: String,
}

impl Default for PartitionNames {
    fn default() -> Self {
        Self {
            temp: "flutter-temp-cache".to_string(),
            content: "flutter-app-cache".to_string(),
            manifest: "flutter-app-manifest".to_string(),
        }
    }
}

/// Configuration for cache lifecycle operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Origin that logical keys are resolved against, without a trailing slash.
    pub origin: String,
    /// Partition names.
    pub partitions: PartitionNames,
    /// Number of concurrent fetches when pre-warming the cache.
    pub concurrent_fetches: usize,
    /// Per-request timeout in seconds. Zero disables the timeout.
    pub request_timeout_secs: u64,
    /// User agent sent with every network fetch.
    pub user_agent: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            origin: "http://localhost:8080".to_string(),
            partitions: PartitionNames::default(),
            concurrent_fetches: 4,
            request_timeout_secs: 30,
            user_agent: concat!("shellcache/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl CacheConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the origin. A trailing slash is removed.
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = normalize_origin(&origin.into());
        self
    }

    /// Sets the partition names.
    #[must_use]
    pub fn with_partitions(mut self, partitions: PartitionNames) -> Self {
        self.partitions = partitions;
        self
    }

    /// Sets the number of concurrent fetches used by offline downloads.
    #[must_use]
    pub const fn with_concurrent_fetches(mut self, concurrent: usize) -> Self {
        self.concurrent_fetches = concurrent;
        self
    }

    /// Sets the per-request timeout in seconds.
    #[must_use]
    pub const fn with_request_timeout_secs(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Returns the request timeout, or `None` when disabled.
    #[must_use]
    pub const fn request_timeout(&self) -> Option<Duration> {
        if self.request_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.request_timeout_secs))
        }
    }

    /// Checks the configuration for values that cannot work at runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the origin is not an absolute http(s) URL,
    /// partition names collide, or the fetch concurrency is zero.
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.origin)
            .map_err(|e| Error::Config(format!("origin {:?}: {e}", self.origin)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "origin must be http or https, got {}",
                url.scheme()
            )));
        }
        let p = &self.partitions;
        if p.temp == p.content || p.temp == p.manifest || p.content == p.manifest {
            return Err(Error::Config("partition names must be distinct".to_string()));
        }
        if self.concurrent_fetches == 0 {
            return Err(Error::Config(
                "concurrent_fetches must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Strips trailing slashes so that `origin + "/" + key` is well formed.
fn normalize_origin(origin: &str) -> String {
    origin.trim_end_matches('/').to_string()
}

/// Proxy server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Proxy bind address.
    pub host: String,
    /// Proxy port.
    pub port: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9723,
        }
    }
}

/// Complete application configuration, as read from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Cache lifecycle configuration.
    pub cache: CacheConfig,
    /// Proxy configuration.
    pub proxy: ProxyConfig,
    /// Directory holding the on-disk partitions.
    pub cache_dir: Option<PathBuf>,
    /// Path to the deployment file (manifest plus core shell list).
    pub deployment: Option<PathBuf>,
}

impl AppConfig {
    /// Creates a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid TOML, or
    /// fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml(&contents)?;
        // Relative paths in the file are relative to the file itself.
        if let Some(base) = path.parent() {
            config.cache_dir = config.cache_dir.map(|p| base.join(p));
            config.deployment = config.deployment.map(|p| base.join(p));
        }
        Ok(config)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid TOML or fails validation.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let mut config: Self =
            toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))?;
        config.cache.origin = normalize_origin(&config.cache.origin);
        config.cache.validate()?;
        Ok(config)
    }

    /// Returns the directory holding on-disk partitions.
    ///
    /// Uses the configured directory, then `CACHE_DIRECTORY` (set by systemd
    /// when `CacheDirectory=` is configured), falling back to
    /// `$XDG_CACHE_HOME/shellcache`.
    #[must_use]
    pub fn resolved_cache_dir(&self) -> PathBuf {
        if let Some(dir) = &self.cache_dir {
            return dir.clone();
        }
        if let Ok(dir) = std::env::var("CACHE_DIRECTORY") {
            return PathBuf::from(dir);
        }
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("shellcache")
    }
}
