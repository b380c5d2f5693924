//! TOML configuration for relaymedic.
//!
//! Every section has compiled-in defaults, so a partial (or missing) file is
//! always valid. The file path can be overridden with the `RELAYMEDIC_CONFIG`
//! environment variable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "RELAYMEDIC_CONFIG";

/// Standard system location for the config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/relaymedic/relaymedic.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the relaymedic process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub tester: TesterConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RelayConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded relaymedic configuration");
        Ok(config)
    }

    /// Resolve configuration, in order:
    /// 1. `explicit` (the `--config` flag), which must load if given.
    /// 2. The path in `RELAYMEDIC_CONFIG`.
    /// 3. `/etc/relaymedic/relaymedic.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "RELAYMEDIC_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port for the admin API.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/relaymedic.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tester
// ---------------------------------------------------------------------------

/// Settings for the upstream probe requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TesterConfig {
    /// Upstream HTTP timeout for a single probe (seconds).
    pub timeout_sec: u64,
    /// Prompt sent in chat-style probes.
    pub prompt: String,
    /// `max_tokens` requested from chat-style probes.
    pub max_tokens: u32,
    pub user_agent: String,
}

impl TesterConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec.max(1))
    }
}

impl Default for TesterConfig {
    fn default() -> Self {
        Self {
            timeout_sec: 60,
            prompt: "hi".to_string(),
            max_tokens: 16,
            user_agent: concat!("relaymedic/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Batch job defaults and rate-limit backoff policy.
///
/// Per-job values are still clamped by the runner; these only fill in what a
/// job request leaves unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub default_concurrency: i64,
    pub default_interval_ms: i64,
    pub default_retry_limit: i64,
    /// Wait before each asynchronous retry of a rate-limited probe (seconds).
    pub rate_limit_backoff_sec: u64,
    /// Number of asynchronous retries of a rate-limited probe.
    pub rate_limit_max_retries: u32,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 2,
            default_interval_ms: 200,
            default_retry_limit: 0,
            rate_limit_backoff_sec: 60,
            rate_limit_max_retries: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = RelayConfig::default();

        assert_eq!(cfg.server.bind, "0.0.0.0:8080");
        assert_eq!(cfg.storage.db_path, PathBuf::from("data/relaymedic.db"));
        assert_eq!(cfg.tester.timeout(), Duration::from_secs(60));
        assert_eq!(cfg.jobs.default_concurrency, 2);
        assert_eq!(cfg.jobs.default_interval_ms, 200);
        assert_eq!(cfg.jobs.default_retry_limit, 0);
        assert_eq!(cfg.jobs.rate_limit_backoff_sec, 60);
        assert_eq!(cfg.jobs.rate_limit_max_retries, 3);
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[server]
bind = "127.0.0.1:9000"

[storage]
db_path = "/var/lib/relaymedic/relay.db"

[tester]
timeout_sec = 20
prompt = "ping"
max_tokens = 4

[jobs]
default_concurrency = 8
default_interval_ms = 500
default_retry_limit = 2
rate_limit_backoff_sec = 30
rate_limit_max_retries = 1

[logging]
level = "debug"
format = "json"
"#;

        let cfg: RelayConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.server.bind, "127.0.0.1:9000");
        assert_eq!(cfg.storage.db_path, PathBuf::from("/var/lib/relaymedic/relay.db"));
        assert_eq!(cfg.tester.timeout_sec, 20);
        assert_eq!(cfg.tester.prompt, "ping");
        assert_eq!(cfg.tester.max_tokens, 4);
        assert_eq!(cfg.jobs.default_concurrency, 8);
        assert_eq!(cfg.jobs.default_interval_ms, 500);
        assert_eq!(cfg.jobs.default_retry_limit, 2);
        assert_eq!(cfg.jobs.rate_limit_backoff_sec, 30);
        assert_eq!(cfg.jobs.rate_limit_max_retries, 1);
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: RelayConfig = toml::from_str("[jobs]\ndefault_concurrency = 4\n").unwrap();
        assert_eq!(cfg.jobs.default_concurrency, 4);
        assert_eq!(cfg.jobs.default_interval_ms, 200);
        assert_eq!(cfg.server.bind, "0.0.0.0:8080");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relaymedic.toml");
        std::fs::write(&path, "[server]\nbind = \"127.0.0.1:1234\"\n").unwrap();

        let cfg = RelayConfig::resolve(Some(&path)).unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:1234");
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RelayConfig::resolve(Some(&dir.path().join("nope.toml"))).is_err());
    }
}
