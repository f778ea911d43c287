//! Centralized path utilities
//!
//! All application paths in one place for consistency

use std::path::PathBuf;

const CONFIG_DIR_NAME: &str = ".kubechain";

/// Get the kubechain config directory (~/.kubechain)
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
}

/// Get the config file (~/.kubechain/config.toml)
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Get the logs directory (~/.kubechain/logs)
pub fn logs_dir() -> PathBuf {
    config_dir().join("logs")
}

/// Get the default resource database (~/.kubechain/kubechain.db)
pub fn default_database() -> PathBuf {
    config_dir().join("kubechain.db")
}
