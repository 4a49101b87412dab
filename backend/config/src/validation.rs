//! Config validation with field paths and user-friendly messages.

use crate::schema::HostConfig;
use thiserror::Error;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// A config validation error with field path and message.
#[derive(Debug, Error)]
#[error("Config validation error at '{path}': {message}")]
pub struct ConfigValidationError {
    pub path: String,
    pub message: String,
}

/// A collection of validation errors found in one pass.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            path: path.into(),
            message: message.into(),
        });
    }

    fn warn(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            path: path.into(),
            message: message.into(),
        });
    }
}

/// Validate the config and return a report of all errors and warnings.
pub fn validate(config: &HostConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    validate_mods_dir(config, &mut report);
    validate_logging(config, &mut report);
    report
}

fn validate_mods_dir(config: &HostConfig, report: &mut ValidationReport) {
    if let Some(dir) = &config.mods_dir {
        if dir.trim().is_empty() {
            report.error("modsDir", "modsDir cannot be empty");
            return;
        }
    }
    let dir = config.mods_dir();
    if !dir.exists() {
        report.warn(
            "modsDir",
            format!("{} does not exist; no mods will be discovered", dir.display()),
        );
    } else if !dir.is_dir() {
        report.error("modsDir", format!("{} is not a directory", dir.display()));
    }
}

fn validate_logging(config: &HostConfig, report: &mut ValidationReport) {
    let Some(logging) = &config.logging else { return };
    if let Some(level) = &logging.level {
        if !LOG_LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
            report.error(
                "logging.level",
                format!("Unknown log level '{level}'. Use one of: {}", LOG_LEVELS.join(", ")),
            );
        }
    }
}
