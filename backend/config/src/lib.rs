//! `modhost-config`: mod host configuration management.
//!
//! Provides:
//! - Typed config schema (mods directory, autoload, logging)
//! - YAML read/write with an atomic rename and a backup of the previous file
//! - `${ENV_VAR}` substitution and `MODHOST_*` overrides
//! - Default value application
//! - Validation with field paths

pub mod defaults;
pub mod env;
pub mod io;
pub mod schema;
pub mod validation;

pub use defaults::apply_all_defaults;
pub use env::{MissingEnvVarError, apply_env, apply_env_with, contains_env_var_reference};
pub use io::{config_dir, config_file_path, load_config, resolve_config_path, write_config};
pub use schema::{HostConfig, LoggingConfig};
pub use validation::{ConfigValidationError, ValidationReport, validate};

use anyhow::{Context, Result, bail};
use std::path::Path;

/// Load, apply env, apply defaults and validate a config file.
///
/// This is the main entry point for loading a config at runtime. Warnings are
/// logged; any validation error aborts.
pub async fn load_and_prepare(path: &Path) -> Result<HostConfig> {
    let config = load_config(path).await?;
    let config = apply_env(config).context("Failed to apply environment to config")?;
    let config = apply_all_defaults(config);

    let report = validate(&config);
    for warning in &report.warnings {
        tracing::warn!(path = %warning.path, message = %warning.message, "Config warning");
    }
    for error in &report.errors {
        tracing::error!(path = %error.path, message = %error.message, "Config error");
    }
    if let Some(first) = report.errors.into_iter().next() {
        bail!(first);
    }

    Ok(config)
}
