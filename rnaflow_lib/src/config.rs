//! Client configuration.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ClientError;

pub const API_URL_ENV: &str = "RNAFLOW_API_URL";

/// Intervals and budgets of the watchers. None of these are protocol
/// constants; they only have to keep every bounded wait bounded.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PollSettings {
    #[serde(default = "default_status_interval")]
    pub status_interval_ms: u64,

    #[serde(default = "default_prerequisite_interval")]
    pub prerequisite_interval_ms: u64,

    /// attempts before a prerequisite wait gives up (300 x 2s is about ten minutes)
    #[serde(default = "default_prerequisite_max_attempts")]
    pub prerequisite_max_attempts: u32,

    /// consecutive failed fetches before a prerequisite wait gives up
    #[serde(default = "default_prerequisite_max_faults")]
    pub prerequisite_max_faults: u32,

    #[serde(default = "default_action_initial_delay")]
    pub action_initial_delay_ms: u64,

    #[serde(default = "default_action_interval")]
    pub action_interval_ms: u64,

    #[serde(default = "default_action_max_attempts")]
    pub action_max_attempts: u32,

    /// upper bound for a single status round trip inside any watcher
    #[serde(default = "default_tick_timeout")]
    pub tick_timeout_ms: u64,
}

fn default_status_interval() -> u64 {
    2000
}

fn default_prerequisite_interval() -> u64 {
    2000
}

fn default_prerequisite_max_attempts() -> u32 {
    300
}

fn default_prerequisite_max_faults() -> u32 {
    20
}

fn default_action_initial_delay() -> u64 {
    1200
}

fn default_action_interval() -> u64 {
    1500
}

fn default_action_max_attempts() -> u32 {
    40
}

fn default_tick_timeout() -> u64 {
    10000
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            status_interval_ms: default_status_interval(),
            prerequisite_interval_ms: default_prerequisite_interval(),
            prerequisite_max_attempts: default_prerequisite_max_attempts(),
            prerequisite_max_faults: default_prerequisite_max_faults(),
            action_initial_delay_ms: default_action_initial_delay(),
            action_interval_ms: default_action_interval(),
            action_max_attempts: default_action_max_attempts(),
            tick_timeout_ms: default_tick_timeout(),
        }
    }
}

impl PollSettings {
    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    pub fn prerequisite_interval(&self) -> Duration {
        Duration::from_millis(self.prerequisite_interval_ms)
    }

    pub fn action_initial_delay(&self) -> Duration {
        Duration::from_millis(self.action_initial_delay_ms)
    }

    pub fn action_interval(&self) -> Duration {
        Duration::from_millis(self.action_interval_ms)
    }

    pub fn tick_timeout(&self) -> Duration {
        Duration::from_millis(self.tick_timeout_ms)
    }

    /// rejects settings that would busy-loop or wait without bound
    pub fn validate(&self) -> Result<(), ClientError> {
        let intervals = [
            ("status_interval_ms", self.status_interval_ms),
            ("prerequisite_interval_ms", self.prerequisite_interval_ms),
            ("action_interval_ms", self.action_interval_ms),
            ("tick_timeout_ms", self.tick_timeout_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ClientError::Config(format!("{} must be positive", name)));
            }
        }
        let budgets = [
            ("prerequisite_max_attempts", self.prerequisite_max_attempts),
            ("prerequisite_max_faults", self.prerequisite_max_faults),
            ("action_max_attempts", self.action_max_attempts),
        ];
        for (name, value) in budgets {
            if value == 0 {
                return Err(ClientError::Config(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Base URL of the analysis backend, without the `/api` suffix.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Where the session record is kept between runs.
    #[serde(default = "default_session_path")]
    pub session_path: PathBuf,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    #[serde(default)]
    pub poll: PollSettings,
}

fn default_api_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_session_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rnaflow")
        .join("session.json")
}

fn default_request_timeout() -> u64 {
    30000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            session_path: default_session_path(),
            request_timeout_ms: default_request_timeout(),
            poll: PollSettings::default(),
        }
    }
}

impl ClientConfig {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rnaflow")
            .join("config.json")
    }

    /// Loads configuration from a JSON file, falling back to defaults when
    /// the file does not exist. The API URL environment variable wins over
    /// the file.
    pub fn load(path: &Path) -> Result<Self, ClientError> {
        let mut config = if path.exists() {
            let buf = fs::read(path)?;
            serde_json::from_slice::<ClientConfig>(&buf)?
        } else {
            info!("no config at {}, using defaults", path.display());
            ClientConfig::default()
        };
        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                config.api_url = url.trim().to_string();
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Saves the configuration as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ClientError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        let url = self.api_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ClientError::Config(format!(
                "api_url must be an http(s) URL, got '{}'",
                self.api_url
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(ClientError::Config(
                "request_timeout_ms must be positive".to_string(),
            ));
        }
        self.poll.validate()
    }
}
