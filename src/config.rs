//! Process-wide configuration.
//!
//! Layered the usual way: built-in defaults, then an optional config file,
//! then `WHEELHOUSE_*` environment overrides. CLI flags override individual
//! fields after loading. Invalid configuration is a startup error mapped to
//! exit code 2.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the profile catalog.
    pub profiles_root: PathBuf,
    /// Blob-storage bucket for artifacts; absent disables uploads.
    pub artifact_bucket: Option<String>,
    pub default_browser_channel: Option<String>,
    /// Seconds.
    pub default_step_timeout: u64,
    /// Seconds.
    pub default_script_deadline: u64,
    /// Seconds.
    pub session_drain_deadline: u64,
    pub max_vision_escalations_per_script: u64,
    /// Model identifier used by the vision tiers.
    pub llm_model: String,
    /// Where the consolidated per-tool secret JSON lives.
    pub consolidated_secret_path: Option<PathBuf>,
    /// Mutable settings surface (API keys etc.); defaults next to the
    /// profile root.
    pub settings_path: Option<PathBuf>,
    pub listen_addr: SocketAddr,
    /// Number of artifact upload workers.
    pub upload_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            profiles_root: PathBuf::from("./browser-profiles"),
            artifact_bucket: None,
            default_browser_channel: None,
            default_step_timeout: 60,
            default_script_deadline: 1800,
            session_drain_deadline: 30,
            max_vision_escalations_per_script: 50,
            llm_model: "gpt-4o-mini".to_string(),
            consolidated_secret_path: None,
            settings_path: None,
            listen_addr: "127.0.0.1:8765".parse().expect("valid default addr"),
            upload_workers: 4,
        }
    }
}

impl Config {
    /// Load from an optional file plus `WHEELHOUSE_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path.to_path_buf()));
        } else {
            builder = builder.add_source(File::with_name("wheelhouse").required(false));
        }
        builder = builder.add_source(Environment::with_prefix("WHEELHOUSE").separator("__"));

        let loaded: Config = builder.build()?.try_deserialize()?;
        loaded.validated()
    }

    fn validated(self) -> Result<Self, ConfigError> {
        if self.default_step_timeout == 0 {
            return Err(ConfigError::Invalid(
                "default_step_timeout must be positive".into(),
            ));
        }
        if self.default_script_deadline == 0 {
            return Err(ConfigError::Invalid(
                "default_script_deadline must be positive".into(),
            ));
        }
        if self.upload_workers == 0 {
            return Err(ConfigError::Invalid(
                "upload_workers must be positive".into(),
            ));
        }
        if let Some(bucket) = &self.artifact_bucket {
            if bucket.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "artifact_bucket must not be blank".into(),
                ));
            }
        }
        Ok(self)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.default_step_timeout)
    }

    pub fn script_deadline(&self) -> Duration {
        Duration::from_secs(self.default_script_deadline)
    }

    pub fn drain_deadline(&self) -> Duration {
        Duration::from_secs(self.session_drain_deadline)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.settings_path
            .clone()
            .unwrap_or_else(|| self.profiles_root.join("settings.json"))
    }
}
