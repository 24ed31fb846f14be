//! Configuration types for newsweave

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// NNTP server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server hostname
    pub host: String,

    /// Server port (default: 119)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Use implicit TLS
    #[serde(default)]
    pub secure: bool,

    /// Username for AUTHINFO
    #[serde(default)]
    pub username: Option<String>,

    /// Password for AUTHINFO
    #[serde(default)]
    pub password: Option<String>,

    /// Maximum simultaneous connections (default: 1)
    #[serde(default = "default_connections")]
    pub connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            secure: false,
            username: None,
            password: None,
            connections: default_connections(),
        }
    }
}

impl ServerConfig {
    /// Plain text server on the default port
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    /// Credentials, when both halves are configured
    pub(crate) fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Top level client configuration
///
/// Every field has a serde default, so a minimal JSON document only needs
/// `{"server": {"host": "news.example.com"}}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Server to pool connections to
    pub server: ServerConfig,

    /// Log every wire command and status line at debug level
    #[serde(default)]
    pub debug: bool,

    /// Root for per-manifest segment caches and repair directories
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Minimum pause between two decode starts (default: 50ms)
    #[serde(default = "default_decode_throttle", with = "millis_serde")]
    pub decode_throttle: Duration,

    /// Maximum simultaneous outstanding segment fetches (default: 50)
    #[serde(default = "default_file_queue_limit")]
    pub file_queue_limit: usize,

    /// Bound on a single wire command (default: 15 seconds)
    #[serde(default = "default_command_timeout", with = "duration_serde")]
    pub command_timeout: Duration,

    /// Idle time after which a surplus connection is closed (default: 30 seconds)
    #[serde(default = "default_idle_timeout", with = "duration_serde")]
    pub idle_timeout: Duration,

    /// How often idle connections are checked (default: 31 seconds)
    #[serde(default = "default_idle_check_interval", with = "duration_serde")]
    pub idle_check_interval: Duration,

    /// Collapse CRLF to LF in multi-line bodies
    #[serde(default)]
    pub convert_newlines: bool,

    /// Retry policy for manifest retrieval
    #[serde(default)]
    pub retry: RetryConfig,

    /// Explicit par2 binary; discovered on PATH when unset
    #[serde(default)]
    pub par2_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            debug: false,
            temp_dir: default_temp_dir(),
            decode_throttle: default_decode_throttle(),
            file_queue_limit: default_file_queue_limit(),
            command_timeout: default_command_timeout(),
            idle_timeout: default_idle_timeout(),
            idle_check_interval: default_idle_check_interval(),
            convert_newlines: false,
            retry: RetryConfig::default(),
            par2_path: None,
        }
    }
}

impl Config {
    /// Configuration for a single plain text server with all other defaults
    pub fn for_host(host: impl Into<String>) -> Self {
        Self {
            server: ServerConfig::new(host),
            ..Default::default()
        }
    }

    /// Reject settings the pool and pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            return Err(Error::config("host must not be empty", "server.host"));
        }
        if self.server.connections == 0 {
            return Err(Error::config(
                "at least one connection is required",
                "server.connections",
            ));
        }
        if self.file_queue_limit == 0 {
            return Err(Error::config(
                "file queue limit must be at least 1",
                "file_queue_limit",
            ));
        }
        if self.command_timeout.is_zero() {
            return Err(Error::config(
                "command timeout must be positive",
                "command_timeout",
            ));
        }
        Ok(())
    }
}

fn default_port() -> u16 {
    119
}

fn default_connections() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("newsweave")
}

fn default_decode_throttle() -> Duration {
    Duration::from_millis(50)
}

fn default_file_queue_limit() -> usize {
    50
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_idle_check_interval() -> Duration {
    Duration::from_secs(31)
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

// Durations as whole seconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Durations as milliseconds
mod millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
