//! Environment handling for config values.
//!
//! Two passes run after the YAML is parsed:
//! - `${VAR_NAME}` references inside path values are expanded. Only
//!   uppercase `[A-Z_][A-Z0-9_]*` names match; `$${VAR}` escapes to a literal
//!   `${VAR}`.
//! - `MODHOST_*` variables override individual fields.

use anyhow::{Result, bail};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashMap;

use crate::schema::{HostConfig, LoggingConfig};

/// Matches `${VAR}` and the escaped form `$${VAR}` in one pass.
static ENV_VAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\$?)\$\{([A-Z_][A-Z0-9_]*)\}").unwrap());

pub const ENV_MODS_DIR: &str = "MODHOST_MODS_DIR";
pub const ENV_LOG_LEVEL: &str = "MODHOST_LOG_LEVEL";
pub const ENV_LOG_DIR: &str = "MODHOST_LOG_DIR";
pub const ENV_AUTOLOAD: &str = "MODHOST_AUTOLOAD";

/// Error returned for missing env vars.
#[derive(Debug, thiserror::Error)]
#[error("Missing env var \"{var_name}\" referenced at config path: {config_path}")]
pub struct MissingEnvVarError {
    pub var_name: String,
    pub config_path: String,
}

/// Expand `${VAR}` references and apply `MODHOST_*` overrides from the
/// process environment.
pub fn apply_env(config: HostConfig) -> Result<HostConfig> {
    apply_env_with(config, &std::env::vars().collect())
}

/// Same as [`apply_env`] against a provided map (useful for testing).
pub fn apply_env_with(mut config: HostConfig, env: &HashMap<String, String>) -> Result<HostConfig> {
    if let Some(dir) = config.mods_dir.take() {
        config.mods_dir = Some(substitute_string(&dir, env, "modsDir")?);
    }
    if let Some(logging) = config.logging.as_mut() {
        if let Some(dir) = logging.dir.take() {
            logging.dir = Some(substitute_string(&dir, env, "logging.dir")?);
        }
    }

    let non_empty = |key: &str| env.get(key).filter(|value| !value.is_empty()).cloned();
    if let Some(dir) = non_empty(ENV_MODS_DIR) {
        config.mods_dir = Some(dir);
    }
    if let Some(level) = non_empty(ENV_LOG_LEVEL) {
        config.logging.get_or_insert_with(LoggingConfig::default).level = Some(level);
    }
    if let Some(dir) = env.get(ENV_LOG_DIR) {
        config.logging.get_or_insert_with(LoggingConfig::default).dir = Some(dir.clone());
    }
    if let Some(flag) = non_empty(ENV_AUTOLOAD) {
        config.autoload = Some(parse_flag(ENV_AUTOLOAD, &flag)?);
    }
    Ok(config)
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("{key} must be a boolean, got '{other}'"),
    }
}

/// Substitute `${VAR}` references in one string value.
pub fn substitute_string(s: &str, env: &HashMap<String, String>, path: &str) -> Result<String> {
    if !s.contains('$') {
        return Ok(s.to_string());
    }

    let mut missing: Option<MissingEnvVarError> = None;
    let substituted = ENV_VAR_PATTERN.replace_all(s, |caps: &Captures| {
        let var_name = &caps[2];
        if !caps[1].is_empty() {
            return format!("${{{var_name}}}");
        }
        match env.get(var_name) {
            Some(value) if !value.is_empty() => value.clone(),
            _ => {
                missing.get_or_insert_with(|| MissingEnvVarError {
                    var_name: var_name.to_string(),
                    config_path: path.to_string(),
                });
                String::new()
            }
        }
    });

    if let Some(err) = missing {
        bail!(err);
    }
    Ok(substituted.into_owned())
}

/// Check whether a string contains any env var references.
pub fn contains_env_var_reference(s: &str) -> bool {
    s.contains('$') && ENV_VAR_PATTERN.is_match(s)
}
