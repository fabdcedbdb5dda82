//! Server configuration.
//!
//! Layers, lowest to highest precedence: [`ServerConfig::default`], an
//! optional JSON file, `CODEROOM_*` environment variables, then whatever the
//! binary applies from its command line.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Directory holding one snapshot directory per room
    pub sessions_root: PathBuf,
    /// Outbound queue capacity per connection
    pub outbound_capacity: usize,
    /// Heartbeat interval in seconds (0 disables pings)
    pub heartbeat_interval_secs: u64,
    /// Upper bound for a single commit + push
    pub commit_timeout_secs: u64,
    /// Evict rooms empty for this long (None = keep forever)
    pub room_ttl_secs: Option<u64>,
    /// Git host, or a base URL with scheme
    pub github_host: String,
    /// Token used when `github-connect` carries none
    pub github_token: Option<String>,
    pub commit_author_name: Option<String>,
    pub commit_author_email: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            sessions_root: PathBuf::from("sessions"),
            outbound_capacity: 256,
            heartbeat_interval_secs: 30,
            commit_timeout_secs: 120,
            room_ttl_secs: None,
            github_host: "github.com".to_string(),
            github_token: None,
            commit_author_name: None,
            commit_author_email: None,
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with a JSON file. Missing keys keep their defaults.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `CODEROOM_*` variables from the process environment.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_env_from(|var| std::env::var(var).ok())
    }

    /// Apply `CODEROOM_*` variables from `lookup`.
    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup("CODEROOM_BIND") {
            self.bind_addr = bind;
        }
        if let Some(dir) = lookup("CODEROOM_SESSIONS_DIR") {
            self.sessions_root = PathBuf::from(dir);
        }
        if let Some(token) = lookup("CODEROOM_GITHUB_TOKEN") {
            self.github_token = Some(token).filter(|t| !t.is_empty());
        }
        if let Some(secs) = lookup("CODEROOM_COMMIT_TIMEOUT_SECS") {
            self.commit_timeout_secs = parse_secs("CODEROOM_COMMIT_TIMEOUT_SECS", secs)?;
        }
        if let Some(secs) = lookup("CODEROOM_ROOM_TTL_SECS") {
            // 0 switches eviction off.
            let ttl = parse_secs("CODEROOM_ROOM_TTL_SECS", secs)?;
            self.room_ttl_secs = (ttl > 0).then_some(ttl);
        }
        Ok(self)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_secs(self.commit_timeout_secs.max(1))
    }

    pub fn room_ttl(&self) -> Option<Duration> {
        self.room_ttl_secs.map(Duration::from_secs)
    }
}

fn parse_secs(var: &'static str, value: String) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}
