//! # Configuration
//!
//! Runtime settings for the relay, read from `HITRELAY_*` environment
//! variables (a `.env` file is honored by the binary) or from a YAML file.
//!
//! - **Version**: 1.0.0
//! - **Since**: 0.1.0

use crate::dispatcher::DispatcherConfig;
use crate::hit::AppInfo;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "HITRELAY_";

fn default_store_path() -> String {
    "hitrelay.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_request_timeout() -> f64 {
    30.0
}

fn default_app_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Identity attached to every recorded hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    pub tracking_id: String,

    /// Generated per run when unset
    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default = "default_app_name")]
    pub app_name: String,

    #[serde(default = "default_app_version")]
    pub app_version: String,

    #[serde(default)]
    pub app_id: Option<String>,
}

impl TrackerConfig {
    pub fn app_info(&self) -> AppInfo {
        let client_id = self
            .client_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let app = AppInfo::new(
            self.tracking_id.clone(),
            client_id,
            self.app_name.clone(),
            self.app_version.clone(),
        );
        match &self.app_id {
            Some(app_id) => app.with_app_id(app_id.clone()),
            None => app,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub tracker: TrackerConfig,

    /// SQLite file holding pending hits
    #[serde(default = "default_store_path")]
    pub store_path: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Seconds before a single send is abandoned
    #[serde(default = "default_request_timeout")]
    pub request_timeout: f64,

    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

impl Config {
    /// Build the configuration from `HITRELAY_*` environment variables.
    /// Only `HITRELAY_TRACKING_ID` is required.
    pub fn from_env() -> Result<Self> {
        let defaults = DispatcherConfig::default();

        let config = Config {
            tracker: TrackerConfig {
                tracking_id: var("TRACKING_ID")
                    .ok_or_else(|| anyhow!("{ENV_PREFIX}TRACKING_ID must be set"))?,
                client_id: var("CLIENT_ID"),
                app_name: var("APP_NAME").unwrap_or_else(default_app_name),
                app_version: var("APP_VERSION").unwrap_or_else(default_app_version),
                app_id: var("APP_ID"),
            },
            store_path: var("STORE_PATH").unwrap_or_else(default_store_path),
            log_level: var("LOG_LEVEL").unwrap_or_else(default_log_level),
            request_timeout: parsed("REQUEST_TIMEOUT")?.unwrap_or_else(default_request_timeout),
            dispatcher: DispatcherConfig {
                dispatch_interval: parsed("DISPATCH_INTERVAL")?
                    .unwrap_or(defaults.dispatch_interval),
                opt_out: parsed("OPT_OUT")?.unwrap_or(defaults.opt_out),
                use_https: parsed("USE_HTTPS")?.unwrap_or(defaults.use_https),
                block_size: parsed("BLOCK_SIZE")?.unwrap_or(defaults.block_size),
                max_in_flight: parsed("MAX_IN_FLIGHT")?.unwrap_or(defaults.max_in_flight),
                shutdown_grace: parsed("SHUTDOWN_GRACE")?.unwrap_or(defaults.shutdown_grace),
                host: var("HOST").unwrap_or(defaults.host),
                http_port: parsed("HTTP_PORT")?.unwrap_or(defaults.http_port),
                https_port: parsed("HTTPS_PORT")?.unwrap_or(defaults.https_port),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn load(path: &str) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("reading config {path}"))?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tracker.tracking_id.trim().is_empty() {
            return Err(anyhow!("tracking_id must not be empty"));
        }
        if self.store_path.is_empty() {
            return Err(anyhow!("store_path must not be empty"));
        }
        self.request_timeout()?;
        self.dispatcher.validate()
    }

    pub fn request_timeout(&self) -> Result<Duration> {
        Duration::try_from_secs_f64(self.request_timeout)
            .ok()
            .filter(|timeout| !timeout.is_zero())
            .ok_or_else(|| {
                anyhow!(
                    "request_timeout must be a positive number of seconds: {}",
                    self.request_timeout
                )
            })
    }
}

fn var(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .filter(|value| !value.is_empty())
}

fn parsed<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow!("invalid {ENV_PREFIX}{name} '{raw}': {e}")),
        None => Ok(None),
    }
}
