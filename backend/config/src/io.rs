//! Config file resolution, reading and atomic writes.

use crate::schema::HostConfig;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Default config file name within the config directory.
const CONFIG_FILE_NAME: &str = "config.yaml";

/// Explicit config file path, checked before the config directory.
pub const ENV_CONFIG_FILE: &str = "MODHOST_CONFIG";

/// Resolve the mod host config directory.
/// Priority: `MODHOST_CONFIG_DIR` env > `~/.modhost/` > `./.modhost`
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("MODHOST_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    match dirs::home_dir() {
        Some(home) => home.join(".modhost"),
        None => PathBuf::from(".modhost"),
    }
}

/// Resolve the full path to the main config file.
pub fn config_file_path(config_dir: &Path) -> PathBuf {
    config_dir.join(CONFIG_FILE_NAME)
}

/// Pick the config file: an explicit path, then `MODHOST_CONFIG`, then the
/// file inside [`config_dir`].
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match std::env::var(ENV_CONFIG_FILE) {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => config_file_path(&config_dir()),
    }
}

/// Load and parse the config from disk.
///
/// Returns `Ok(Default::default())` if the file doesn't exist (first run).
pub async fn load_config(path: &Path) -> Result<HostConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "Config file does not exist; using defaults");
        return Ok(HostConfig::default());
    }

    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    // An empty file parses as YAML null.
    if raw.trim().is_empty() {
        return Ok(HostConfig::default());
    }
    let config: HostConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("Failed to parse config YAML at: {}", path.display()))?;

    info!(path = %path.display(), "Loaded config");
    Ok(config)
}

/// Write config to disk atomically (write to temp file, rename), keeping the
/// previous file as `config.yaml.bak`.
pub async fn write_config(config: &HostConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.with_context(|| {
            format!("Failed to create config directory: {}", parent.display())
        })?;
    }

    if path.exists() {
        let backup = path.with_extension("yaml.bak");
        if let Err(e) = fs::copy(path, &backup).await {
            warn!(path = %backup.display(), error = %e, "Failed to back up previous config");
        }
    }

    let yaml = serde_yaml::to_string(config).context("Failed to serialize config to YAML")?;

    let tmp_path = path.with_extension("yaml.tmp");
    fs::write(&tmp_path, yaml.as_bytes())
        .await
        .with_context(|| format!("Failed to write temp config: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("Failed to rename temp config to: {}", path.display()))?;

    info!(path = %path.display(), "Wrote config");
    Ok(())
}
