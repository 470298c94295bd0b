//! Daemon configuration.
//!
//! The configuration is a single YAML document. It is loaded once at startup
//! and rewritten only when a stream persists a refreshed session token
//! (see [`ConfigFile`]).

mod store;

pub use store::{ConfigFile, CredentialStore};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::HttpConnectorConfig;
use crate::error::{Error, Result};

/// Default encoder binary.
pub const DEFAULT_ENCODER_COMMAND: &str = "ffmpeg";

/// Recaps are never published for broadcasts shorter than this.
pub const MIN_RECAP_DURATION_MINUTES: u64 = 2;

fn default_encoder_args() -> Vec<String> {
    [
        "-analyzeduration",
        "20M",
        "-probesize",
        "20M",
        "-c",
        "copy",
        "-bufsize",
        "4096k",
        "-max_muxing_queue_size",
        "1024",
        "-loglevel",
        "error",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Credentials of one account. `token` is the persisted opaque session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// External ingest process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub command: String,
    pub args: Vec<String>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            command: DEFAULT_ENCODER_COMMAND.to_string(),
            args: default_encoder_args(),
        }
    }
}

/// Long-form publish after a broadcast ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecapConfig {
    pub enabled: bool,
    pub min_duration_minutes: u64,
    pub share_to_feed: bool,
    pub description: String,
}

impl Default for RecapConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_duration_minutes: MIN_RECAP_DURATION_MINUTES,
            share_to_feed: false,
            description: String::new(),
        }
    }
}

impl RecapConfig {
    pub fn min_duration(&self) -> Duration {
        Duration::from_secs(self.min_duration_minutes * 60)
    }
}

/// Pinned message posted once per broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnouncementConfig {
    pub enabled: bool,
    pub delay_secs: u64,
    pub message: String,
}

impl Default for AnnouncementConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            delay_secs: 60,
            message: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudienceLogConfig {
    pub enabled: bool,
    pub directory: PathBuf,
}

impl Default for AudienceLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: PathBuf::from("./logs"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub directory: PathBuf,
    /// Filter directive; empty means the built-in default.
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./logs"),
            filter: String::new(),
        }
    }
}

/// Lifecycle timings, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingsConfig {
    pub cooldown_ms: u64,
    pub encoder_restart_ms: u64,
    pub poll_interval_ms: u64,
    pub challenge_timeout_ms: u64,
    pub grace_period_ms: u64,
    pub comments_per_fetch: usize,
    pub max_poll_failures: u32,
}

impl Default for TimingsConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 30_000,
            encoder_restart_ms: 5_000,
            poll_interval_ms: 5_000,
            challenge_timeout_ms: 120_000,
            grace_period_ms: 5_000,
            comments_per_fetch: 10,
            max_poll_failures: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub dedup_ttl_secs: u64,
    pub recent_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            dedup_ttl_secs: 60,
            recent_capacity: 100,
        }
    }
}

/// Root configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Source the encoder reads from.
    pub input_url: String,
    #[serde(default)]
    pub title: String,
    /// Notify followers when a broadcast starts.
    #[serde(default)]
    pub notify: bool,
    /// Start every stream as soon as the daemon boots.
    #[serde(default)]
    pub autostart: bool,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub recap: RecapConfig,
    #[serde(default)]
    pub announcement: AnnouncementConfig,
    #[serde(default)]
    pub audience_log: AudienceLogConfig,
    #[serde(default)]
    pub service: HttpConnectorConfig,
    #[serde(default)]
    pub logging: LogConfig,
    #[serde(default)]
    pub timings: TimingsConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub accounts: BTreeMap<String, AccountCredentials>,
}

impl AppConfig {
    /// Parse, normalize and validate a YAML document.
    pub fn from_yaml(source: &str) -> Result<Self> {
        let mut config: AppConfig = serde_yaml::from_str(source)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Fill in values that may be left empty in the document.
    pub fn normalize(&mut self) {
        if self.encoder.command.trim().is_empty() {
            self.encoder.command = DEFAULT_ENCODER_COMMAND.to_string();
        }
        if self.recap.min_duration_minutes < MIN_RECAP_DURATION_MINUTES {
            self.recap.min_duration_minutes = MIN_RECAP_DURATION_MINUTES;
        }
        if self.timings.comments_per_fetch == 0 {
            self.timings.comments_per_fetch = TimingsConfig::default().comments_per_fetch;
        }
        if self.relay.recent_capacity == 0 {
            self.relay.recent_capacity = RelayConfig::default().recent_capacity;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_url.trim().is_empty() {
            return Err(Error::config("input_url must not be empty"));
        }
        for (name, account) in &self.accounts {
            if account.password.is_none() && account.token.is_none() {
                return Err(Error::config(format!(
                    "account {name} needs a password or a token"
                )));
            }
        }
        Ok(())
    }

    /// Apply `API_BIND_ADDRESS` / `API_PORT` overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(bind_address) = std::env::var("API_BIND_ADDRESS")
            && !bind_address.trim().is_empty()
        {
            self.api.bind_address = bind_address;
        }

        if let Ok(port) = std::env::var("API_PORT")
            && let Ok(parsed) = port.parse::<u16>()
        {
            self.api.port = parsed;
        }
    }
}
