//! # Proctor Configuration
//!
//! Persisted settings in `.proctor/config.json`, overlaid with `PROCTOR_*`
//! environment variables. Every field has a default so an empty or missing
//! file is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the config file
pub const DEFAULT_CONFIG_PATH: &str = ".proctor/config.json";

/// What to do when a case report arrives for an evaluation that is already
/// COMPLETED
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LateReportPolicy {
    /// Apply the report and move the evaluation back to READY
    #[default]
    Reopen,
    /// Leave the case and evaluation untouched
    Ignore,
}

/// OpenAI-compatible chat completions endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmSettings {
    pub base_url: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            timeout_secs: 120,
        }
    }
}

impl LlmSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Bounds for long-poll status streams
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamSettings {
    pub poll_interval_ms: u64,
    pub max_wait_secs: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_wait_secs: 300,
        }
    }
}

impl StreamSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProctorConfig {
    pub database_path: PathBuf,
    pub llm: LlmSettings,
    pub stream: StreamSettings,
    pub late_report_policy: LateReportPolicy,
    /// Per-subscriber queue depth for pushed status events
    pub subscriber_buffer: usize,
}

impl Default for ProctorConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(crate::state::db::DEFAULT_DB_PATH),
            llm: LlmSettings::default(),
            stream: StreamSettings::default(),
            late_report_policy: LateReportPolicy::default(),
            subscriber_buffer: 64,
        }
    }
}

impl ProctorConfig {
    /// Load from `path` (missing file means defaults), then apply the
    /// process environment.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let mut config = if tokio::fs::try_exists(path).await.unwrap_or(false) {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            if content.trim().is_empty() {
                Self::default()
            } else {
                serde_json::from_str(&content)
                    .with_context(|| format!("Invalid config {}", path.display()))?
            }
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write config {}", path.display()))
    }

    /// Overlay values from an environment lookup. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = get("PROCTOR_DB_PATH") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(key) = get("PROCTOR_LLM_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(url) = get("PROCTOR_LLM_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(model) = get("PROCTOR_LLM_MODEL") {
            self.llm.model = model;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: ProctorConfig =
            serde_json::from_str(r#"{"late_report_policy": "ignore", "llm": {"model": "m"}}"#)
                .unwrap();

        assert_eq!(config.late_report_policy, LateReportPolicy::Ignore);
        assert_eq!(config.llm.model, "m");
        assert_eq!(config.llm.timeout_secs, 120);
        assert_eq!(config.stream, StreamSettings::default());
        assert_eq!(config.subscriber_buffer, 64);
    }

    #[test]
    fn test_env_overlay() {
        let env: HashMap<&str, &str> = [
            ("PROCTOR_DB_PATH", "/tmp/p.db"),
            ("PROCTOR_LLM_MODEL", "local-model"),
            ("PROCTOR_LLM_API_KEY", "  "),
        ]
        .into_iter()
        .collect();

        let mut config = ProctorConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.database_path, PathBuf::from("/tmp/p.db"));
        assert_eq!(config.llm.model, "local-model");
        assert!(config.llm.api_key.is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = ProctorConfig::default();
        config.stream.max_wait_secs = 5;
        config.save(&path).await.unwrap();

        let loaded = ProctorConfig::load(&path).await.unwrap();
        assert_eq!(loaded.stream.max_wait_secs, 5);
    }

    #[tokio::test]
    async fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = ProctorConfig::load(dir.path().join("absent.json"))
            .await
            .unwrap();
        assert_eq!(loaded.late_report_policy, LateReportPolicy::Reopen);
    }
}
