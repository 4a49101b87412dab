//! Mod host configuration schema, typed for serde YAML/JSON.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::defaults::{DEFAULT_LOG_DIR, DEFAULT_LOG_LEVEL, DEFAULT_MODS_DIR};

/// Root configuration for the mod host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    /// Directory scanned for `<name>.json` mod manifests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mods_dir: Option<String>,

    /// Load every discovered mod at startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoload: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// `trace`, `debug`, `info`, `warn` or `error`. `RUST_LOG` wins when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Directory for the rolling JSON log file. Empty disables file logging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,

    /// Emit console logs as JSON instead of human-readable text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<bool>,
}

impl HostConfig {
    pub fn mods_dir(&self) -> PathBuf {
        PathBuf::from(self.mods_dir.as_deref().unwrap_or(DEFAULT_MODS_DIR))
    }

    pub fn autoload(&self) -> bool {
        self.autoload.unwrap_or(true)
    }

    pub fn log_level(&self) -> &str {
        self.logging
            .as_ref()
            .and_then(|logging| logging.level.as_deref())
            .unwrap_or(DEFAULT_LOG_LEVEL)
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        let dir = self
            .logging
            .as_ref()
            .and_then(|logging| logging.dir.as_deref())
            .unwrap_or(DEFAULT_LOG_DIR);
        (!dir.is_empty()).then(|| PathBuf::from(dir))
    }

    pub fn log_json(&self) -> bool {
        self.logging
            .as_ref()
            .and_then(|logging| logging.json)
            .unwrap_or(false)
    }
}
