//! Configuration
//!
//! Loaded from `~/.kubechain/config.toml` (or an explicit path). Every field
//! has a default, so a missing file yields a usable configuration.
//! Environment overrides:
//! - `KUBECHAIN_DB`: database path
//! - `HUMANLAYER_API_BASE`: approval API base URL

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::paths;

pub const DEFAULT_HUMANLAYER_API_BASE: &str = "https://api.humanlayer.dev";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubechainConfig {
    pub database_path: PathBuf,
    /// Workers per controller
    pub workers: usize,
    /// Delay used when waiting on a dependency or an approval
    pub requeue_delay_secs: u64,
    pub llm: LlmConfig,
    pub mcp: McpConfig,
    pub humanlayer: HumanLayerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub default_model: String,
    pub timeout_secs: u64,
    /// Retryable LLM failures tolerated before a TaskRun fails
    pub max_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    pub retry_secs: u64,
    pub refresh_secs: u64,
    /// Working directory for stdio servers; the process cwd when unset
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HumanLayerConfig {
    pub api_base: String,
}

impl Default for KubechainConfig {
    fn default() -> Self {
        Self {
            database_path: paths::default_database(),
            workers: 2,
            requeue_delay_secs: 5,
            llm: LlmConfig::default(),
            mcp: McpConfig::default(),
            humanlayer: HumanLayerConfig::default(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            timeout_secs: 120,
            max_retries: 3,
        }
    }
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            retry_secs: 30,
            refresh_secs: 600,
            working_dir: None,
        }
    }
}

impl Default for HumanLayerConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_HUMANLAYER_API_BASE.to_string(),
        }
    }
}

impl KubechainConfig {
    /// Load from `path`, or the default location when `None`, then apply env overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(paths::config_file);

        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config {:?}", path))?;
            let config = Self::from_toml(&raw)
                .with_context(|| format!("Failed to parse config {:?}", path))?;
            info!("Loaded config from {:?}", path);
            config
        } else {
            debug!("No config at {:?}, using defaults", path);
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(db) = var("KUBECHAIN_DB").filter(|v| !v.is_empty()) {
            self.database_path = PathBuf::from(db);
        }
        if let Some(base) = var("HUMANLAYER_API_BASE").filter(|v| !v.is_empty()) {
            self.humanlayer.api_base = base;
        }
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_secs(self.requeue_delay_secs)
    }

    pub fn mcp_working_dir(&self) -> PathBuf {
        self.mcp
            .working_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = KubechainConfig::from_toml(
            r#"
workers = 4

[llm]
max_retries = 5
"#,
        )
        .unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.llm.max_retries, 5);
        assert_eq!(config.llm.default_model, "gpt-4");
        assert_eq!(config.requeue_delay_secs, 5);
        assert_eq!(config.mcp.retry_secs, 30);
        assert_eq!(config.humanlayer.api_base, DEFAULT_HUMANLAYER_API_BASE);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = KubechainConfig::default();
        config.apply_env(|key| match key {
            "KUBECHAIN_DB" => Some("/tmp/other.db".to_string()),
            "HUMANLAYER_API_BASE" => Some("http://localhost:9000".to_string()),
            _ => None,
        });
        assert_eq!(config.database_path, PathBuf::from("/tmp/other.db"));
        assert_eq!(config.humanlayer.api_base, "http://localhost:9000");
    }

    #[test]
    fn load_reads_explicit_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "requeue_delay_secs = 1\n").unwrap();
        let config = KubechainConfig::load(Some(&path)).unwrap();
        assert_eq!(config.requeue_delay(), Duration::from_secs(1));
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(KubechainConfig::from_toml("workers = \"many\"").is_err());
    }
}
