use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::conversation_store::PLACEHOLDER_TITLE;
use crate::error::ConfigError;
use crate::history_sync::HistorySettings;
use crate::scheduler::RetryPolicy;
use crate::stream_parser::WireFormat;

pub const BACKEND_URL_ENV: &str = "CHATSYNC_BACKEND_URL";
pub const API_KEY_ENV: &str = "CHATSYNC_API_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub initial_delay_ms: u64,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    pub placeholder_title: String,
    pub page_size: u32,
    pub max_pages: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 2000,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_attempts: 5,
            placeholder_title: PLACEHOLDER_TITLE.to_string(),
            page_size: 50,
            max_pages: 20,
        }
    }
}

impl HistoryConfig {
    pub fn settings(&self) -> HistorySettings {
        HistorySettings {
            policy: RetryPolicy {
                initial_delay: Duration::from_millis(self.initial_delay_ms),
                base_delay: Duration::from_millis(self.base_delay_ms),
                max_delay: Duration::from_millis(self.max_delay_ms),
                max_attempts: self.max_attempts,
            },
            placeholder_title: self.placeholder_title.clone(),
            page_size: self.page_size,
            max_pages: self.max_pages,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub backend_url: String,
    pub api_key: String,
    pub wire_format: WireFormat,
    /// Audio attachments are cut to this many characters
    pub audio_char_budget: usize,
    pub history: HistoryConfig,
    pub idempotency_ttl_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:8080".to_string(),
            api_key: String::new(),
            wire_format: WireFormat::default(),
            audio_char_budget: 1_000_000,
            history: HistoryConfig::default(),
            idempotency_ttl_secs: 600,
        }
    }
}

impl ClientConfig {
    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }

    /// Environment wins over the file
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(BACKEND_URL_ENV).filter(|v| !v.trim().is_empty()) {
            self.backend_url = url;
        }
        if let Some(key) = lookup(API_KEY_ENV) {
            self.api_key = key;
        }
    }
}

pub fn default_config_path() -> PathBuf {
    let Some(dirs) = ProjectDirs::from("com", "chatsync", "chatsync") else {
        return Path::new("chatsync-config.json").to_path_buf();
    };
    dirs.config_dir().join("config.json")
}

/// Missing or unreadable files fall back to defaults
pub fn load_config(path: &Path) -> ClientConfig {
    let Ok(bytes) = fs::read(path) else {
        return ClientConfig::default();
    };
    match serde_json::from_slice::<ClientConfig>(&bytes) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "invalid config file, using defaults");
            ClientConfig::default()
        }
    }
}

/// `.env`, then the config file, then environment overrides
pub fn load_effective_config(path: &Path) -> ClientConfig {
    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!(error = %e, "no .env file loaded");
    }
    let mut cfg = load_config(path);
    cfg.apply_env_overrides();
    cfg
}

pub fn save_config(path: &Path, cfg: &ClientConfig) -> Result<(), ConfigError> {
    let json = serde_json::to_vec_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(&dir.path().join("absent.json"));
        assert_eq!(cfg, ClientConfig::default());
        assert_eq!(cfg.history.max_attempts, 5);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let cfg = ClientConfig {
            backend_url: "https://chat.example.com".to_string(),
            wire_format: WireFormat::Sse,
            ..Default::default()
        };

        save_config(&path, &cfg).unwrap();
        assert_eq!(load_config(&path), cfg);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"wire_format":"sse","history":{"max_attempts":3}}"#).unwrap();

        let cfg = load_config(&path);
        assert_eq!(cfg.wire_format, WireFormat::Sse);
        assert_eq!(cfg.history.max_attempts, 3);
        assert_eq!(cfg.history.page_size, 50);
        assert_eq!(cfg.audio_char_budget, 1_000_000);
    }

    #[test]
    fn test_garbage_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_config(&path), ClientConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (BACKEND_URL_ENV, "http://override:9000"),
            (API_KEY_ENV, "secret"),
        ]
        .into_iter()
        .collect();
        let mut cfg = ClientConfig::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.backend_url, "http://override:9000");
        assert_eq!(cfg.api_key, "secret");
    }

    #[test]
    fn test_history_settings_conversion() {
        let settings = HistoryConfig::default().settings();
        assert_eq!(settings.policy, RetryPolicy::default());
        assert_eq!(settings.placeholder_title, PLACEHOLDER_TITLE);
        assert_eq!(settings.max_pages, 20);
    }
}
