//! Configuration loading and validation.
//!
//! Courier reads `~/.courier/config.toml`. Every section is optional and
//! falls back to the defaults below; a missing file means "all defaults".
//! Secrets (the bridge API token) never live here, they come from
//! `~/.courier/.env` via [`crate::credentials`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log filter used when `RUST_LOG` is unset.
    pub logging: LoggingConfig,

    /// Bridge sidecar connection settings.
    pub bridge: BridgeConfig,

    /// Reconnection policy for dropped sessions.
    pub reconnect: ReconnectConfig,

    /// Outbound queue processing.
    pub queue: QueueConfig,

    /// Duplicate suppression window.
    pub dedup: DedupConfig,

    /// Bulk campaign pacing.
    pub campaign: CampaignConfig,

    /// Sessions to connect on `start`.
    pub sessions: Vec<SessionConfig>,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}

/// Bridge sidecar connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Base URL of the bridge HTTP API.
    pub base_url: String,

    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Timeout for ordinary requests in seconds.
    pub request_timeout_secs: u64,

    /// Long-poll timeout for the event stream in seconds.
    pub poll_timeout_secs: u64,

    /// Credential key holding the bridge API token, if the bridge requires one.
    pub token_env: Option<String>,

    /// Capacity of each session's lifecycle event channel.
    pub channel_buffer: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3001".to_owned(),
            connect_timeout_secs: 5,
            request_timeout_secs: 30,
            poll_timeout_secs: 60,
            token_env: Some("COURIER_BRIDGE_TOKEN".to_owned()),
            channel_buffer: 64,
        }
    }
}

/// Reconnection policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Recoverable disconnects tolerated before the session is torn down.
    pub max_attempts: u32,

    /// Delay before the first reconnect, doubled per attempt.
    pub base_delay_ms: u64,

    /// Upper bound on the reconnect delay.
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectConfig {
    /// Backoff before reconnect attempt `attempt` (1-based):
    /// `min(base * 2^(attempt-1), max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 1_u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Outbound queue processing settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Interval between processing-loop ticks.
    pub poll_interval_ms: u64,

    /// Retries granted to each newly enqueued item.
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_retries: 3,
        }
    }
}

impl QueueConfig {
    /// Tick interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Duplicate suppression settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// How long an identical send counts as a duplicate.
    pub ttl_secs: u64,

    /// Chance that a lookup sweeps expired entries.
    pub sweep_probability: f64,

    /// Content longer than this is fingerprinted by prefix and length.
    pub fingerprint_prefix: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            sweep_probability: 0.1,
            fingerprint_prefix: 100,
        }
    }
}

/// Bulk campaign settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CampaignConfig {
    /// Default pause between consecutive recipients.
    pub delay_between_ms: u64,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            delay_between_ms: 3000,
        }
    }
}

impl CampaignConfig {
    /// Pause between recipients as a [`Duration`].
    pub fn delay_between(&self) -> Duration {
        Duration::from_millis(self.delay_between_ms)
    }
}

/// A session connected on `start`.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Session identifier.
    pub id: String,

    /// Connect automatically on startup.
    #[serde(default = "default_autostart")]
    pub autostart: bool,
}

fn default_autostart() -> bool {
    true
}

impl Config {
    /// Check values that serde cannot.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        let url = url::Url::parse(&self.bridge.base_url)
            .map_err(|e| anyhow::anyhow!("invalid bridge.base_url {:?}: {e}", self.bridge.base_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("bridge.base_url must be http or https, got {}", url.scheme());
        }
        if !(0.0..=1.0).contains(&self.dedup.sweep_probability) {
            anyhow::bail!(
                "dedup.sweep_probability must be within 0..=1, got {}",
                self.dedup.sweep_probability
            );
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            anyhow::bail!("reconnect.max_delay_ms must not be below base_delay_ms");
        }
        for session in &self.sessions {
            crate::types::SessionId::parse(&session.id)
                .map_err(|e| anyhow::anyhow!("invalid [[sessions]] entry: {e}"))?;
        }
        Ok(())
    }
}

/// Load and validate configuration from a TOML file.
///
/// A missing file yields the defaults.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed, or validated.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let config = match std::fs::read_to_string(path) {
        Ok(contents) => toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no config file found, using defaults");
            Config::default()
        }
        Err(e) => {
            return Err(anyhow::anyhow!(
                "failed to read config at {}: {e}",
                path.display()
            ))
        }
    };
    config.validate()?;
    Ok(config)
}

/// Resolve the default config directory (`~/.courier/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".courier"))
}

/// Filesystem layout under the runtime root.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    /// Runtime root (`~/.courier`).
    pub root: PathBuf,
    /// `config.toml`.
    pub config_toml: PathBuf,
    /// `.env` with secrets.
    pub env_file: PathBuf,
    /// Snapshot data directory.
    pub data_dir: PathBuf,
    /// Rotated JSON logs.
    pub logs_dir: PathBuf,
}

impl RuntimePaths {
    /// Layout rooted at an arbitrary directory.
    pub fn under(root: &Path) -> Self {
        Self {
            root: root.to_owned(),
            config_toml: root.join("config.toml"),
            env_file: root.join(".env"),
            data_dir: root.join("data"),
            logs_dir: root.join("logs"),
        }
    }
}

/// Resolve runtime paths under `~/.courier`.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn runtime_paths() -> anyhow::Result<RuntimePaths> {
    Ok(RuntimePaths::under(&config_dir()?))
}
