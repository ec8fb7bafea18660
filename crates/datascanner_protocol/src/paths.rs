use crate::defaults::{DEFAULT_CONFIG_FILE, DEFAULT_DATABASE_FILE};
use std::path::PathBuf;

/// Resolve the datascanner home directory.
///
/// Priority:
/// 1) DATASCANNER_HOME
/// 2) the user's home directory
/// 3) the current directory
pub fn datascanner_home() -> PathBuf {
    if let Some(override_path) = std::env::var_os("DATASCANNER_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".datascanner")
}

/// Default queue and report database: ~/.datascanner/datascanner.sqlite3
pub fn default_database_path() -> PathBuf {
    datascanner_home().join(DEFAULT_DATABASE_FILE)
}

/// Default configuration file: ~/.datascanner/config.toml
pub fn default_config_path() -> PathBuf {
    datascanner_home().join(DEFAULT_CONFIG_FILE)
}

/// Default logs directory: ~/.datascanner/logs
pub fn default_logs_dir() -> PathBuf {
    datascanner_home().join("logs")
}
