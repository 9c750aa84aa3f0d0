//! Relay configuration.
//!
//! Layering, lowest to highest priority:
//! 1. [`RelayConfig::default()`]
//! 2. optional JSON file
//! 3. `GRIMLINK_*` environment variables, `__` separating nested keys
//!    (`GRIMLINK_EXTENSION__CLIENT_ID`)
//!
//! Command-line overrides are applied by the daemon on top of the result.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broadcast::{BroadcasterId, ExtensionCredentials};
use crate::sync::SyncConfig;

pub const ENV_PREFIX: &str = "GRIMLINK_";

pub const DEFAULT_API_BASE_URL: &str = "https://api.twitch.tv/helix";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address the channel server listens on.
    pub bind_addr: SocketAddr,
    pub grace_period_ms: u64,
    pub burst_window_ms: u64,
    pub flush_spacing_ms: u64,
    /// Full-state upload spacing; `0` or `null` disables uploads.
    pub full_state_sync_ms: Option<u64>,
    pub api_base_url: String,
    pub extension: ExtensionCredentials,
    /// Broadcaster to publish for before any identity arrives on the control channel.
    pub broadcaster_id: Option<BroadcasterId>,
    /// Where calibrated overlay offsets are kept; in memory when unset.
    pub overlay_path: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9191)),
            grace_period_ms: 5000,
            burst_window_ms: 10,
            flush_spacing_ms: 333,
            full_state_sync_ms: Some(1000),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            extension: ExtensionCredentials::default(),
            broadcaster_id: None,
            overlay_path: None,
        }
    }
}

impl RelayConfig {
    /// The provider stack, for callers that want to add layers of their own.
    pub fn figment(file: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(RelayConfig::default()));
        if let Some(file) = file {
            figment = figment.merge(Json::file(file));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        Self::from_figment(&Self::figment(file))
    }

    pub fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
        let config: RelayConfig = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_spacing_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "flush_spacing_ms must be greater than zero".into(),
            ));
        }
        if self.grace_period_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "grace_period_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            burst_window: Duration::from_millis(self.burst_window_ms),
            flush_spacing: Duration::from_millis(self.flush_spacing_ms),
            full_state_spacing: self
                .full_state_sync_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
        }
    }
}
