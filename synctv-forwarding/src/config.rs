//! Forwarding engine configuration

use crate::error::Result;
use crate::transponder::Traversal;
use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Forwarding engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardingConfig {
    /// Stats younger than this are served from cache without querying the engine
    pub stats_cache_window_ms: u64,
    /// Traversal used when a bitrate request does not name one
    pub default_traversal: Traversal,
    /// Mute instead of falling back to the cheapest layer when nothing fits
    pub strict_by_default: bool,
    /// Initial spatial layer cap for new transponders (None = unbounded)
    pub max_spatial_layer: Option<u8>,
    /// Initial temporal layer cap for new transponders (None = unbounded)
    pub max_temporal_layer: Option<u8>,
    /// Interval of the manager's sweep of stopped tracks/outputs
    pub sweep_interval_secs: u64,
    pub logging: LoggingConfig,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            stats_cache_window_ms: 100,
            default_traversal: Traversal::Bitrate,
            strict_by_default: false,
            max_spatial_layer: None,
            max_temporal_layer: None,
            sweep_interval_secs: 60,
            logging: LoggingConfig::default(),
        }
    }
}

impl ForwardingConfig {
    /// Load configuration from an optional file, then `SYNCTV_FORWARDING_*` env overrides
    ///
    /// Nested keys use a double underscore, e.g. `SYNCTV_FORWARDING_LOGGING__LEVEL=debug`.
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("SYNCTV_FORWARDING")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    #[must_use]
    pub const fn stats_cache_window(&self) -> Duration {
        Duration::from_millis(self.stats_cache_window_ms)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}
