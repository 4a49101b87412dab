//! Config defaults: fills in every unset field so the effective config can be
//! printed and written back out in full.

use crate::schema::{HostConfig, LoggingConfig};

pub const DEFAULT_MODS_DIR: &str = "mods";

pub const DEFAULT_LOG_LEVEL: &str = "info";

pub const DEFAULT_LOG_DIR: &str = "logs";

/// Apply all defaults to a freshly loaded config.
pub fn apply_all_defaults(mut config: HostConfig) -> HostConfig {
    config.mods_dir.get_or_insert_with(|| DEFAULT_MODS_DIR.to_string());
    config.autoload.get_or_insert(true);

    let logging = config.logging.get_or_insert_with(LoggingConfig::default);
    logging.level.get_or_insert_with(|| DEFAULT_LOG_LEVEL.to_string());
    logging.dir.get_or_insert_with(|| DEFAULT_LOG_DIR.to_string());
    logging.json.get_or_insert(false);
    config
}
