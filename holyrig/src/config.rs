//! Service configuration.
//!
//! One TOML file describes the transport listen address and every rig the
//! service should drive. A rig whose schema or model later fails to compile
//! is reported Disabled rather than taking the service down.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::link::{LinkOpener, TcpOpener};
use crate::rig::RigSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("rig `{rig}` has an unsupported link `{link}`; expected `tcp:<host>:<port>`")]
    UnsupportedLink { rig: String, link: String },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// UDP address the JSON-RPC transport binds to.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Per-subscriber notification queue bound (*Q*).
    #[serde(default = "default_queue_limit")]
    pub queue_limit: usize,
    #[serde(default)]
    pub rigs: Vec<RigConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RigConfig {
    pub id: String,
    /// Path to the schema source.
    pub schema: PathBuf,
    /// Path to the model file.
    pub model: PathBuf,
    /// Link endpoint, e.g. `tcp:127.0.0.1:7355` for a ser2net bridge.
    pub link: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    pub poll_interval_ms: Option<u64>,
    pub exchange_timeout_ms: Option<u64>,
    pub init_retries: Option<u32>,
    pub reconnect_secs: Option<u64>,
    pub timeout_budget: Option<u32>,
}

impl RigConfig {
    /// Runtime knobs with per-rig overrides applied.
    pub fn settings(&self) -> RigSettings {
        let mut settings = RigSettings::default();
        if let Some(ms) = self.poll_interval_ms {
            settings.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.exchange_timeout_ms {
            settings.exchange_timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = self.init_retries {
            settings.init_retries = retries;
        }
        if let Some(secs) = self.reconnect_secs {
            settings.reconnect_interval = Duration::from_secs(secs);
        }
        if let Some(budget) = self.timeout_budget {
            settings.timeout_budget = budget;
        }
        settings
    }

    /// Builds the link opener for this rig's endpoint.
    pub fn opener(&self) -> Result<Box<dyn LinkOpener>, ConfigError> {
        match self.link.split_once(':') {
            Some(("tcp", addr)) => Ok(Box::new(TcpOpener::new(addr))),
            _ => Err(ConfigError::UnsupportedLink {
                rig: self.id.clone(),
                link: self.link.clone(),
            }),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:4570".to_owned()
}

fn default_queue_limit() -> usize {
    64
}

fn default_enabled() -> bool {
    true
}

pub fn parse(source: &str) -> Result<ServiceConfig, ConfigError> {
    Ok(toml::from_str(source)?)
}

pub fn load(path: &Path) -> Result<ServiceConfig, ConfigError> {
    let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_owned(),
        source,
    })?;
    parse(&source)
}
