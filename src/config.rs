use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BlitzConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub recall: RecallConfig,
    pub tasks: TaskConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `"local"` (ONNX all-MiniLM-L6-v2) or `"hashing"` (deterministic, no model files).
    pub provider: String,
    pub model: String,
    pub cache_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RecallConfig {
    pub enabled: bool,
    pub top_k: usize,
    pub primary_threshold: f64,
    pub lexical_threshold: f64,
    pub tie_epsilon: f64,
    pub lexical_corpus_size: usize,
    pub backend_timeout_secs: u64,
    /// Entries older than this are pruned. `0` keeps them forever.
    pub max_entry_age_days: u64,
    pub prune_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TaskConfig {
    /// Processing ceiling; a task still running after this is forced to `error(timeout)`.
    pub timeout_secs: u64,
    /// How long terminal tasks stay pollable. Must exceed `timeout_secs`.
    pub ttl_margin_secs: u64,
    pub sweep_interval_secs: u64,
    pub call_timeout_secs: u64,
    pub tool_retries: u32,
    pub max_content_chars: usize,
    pub history_limit: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AgentConfig {
    pub assistant_url: Option<String>,
    pub tools_url: Option<String>,
    /// Tool whose `query` argument is remembered for recall once an answer completes.
    pub sql_tool: String,
}

impl Default for BlitzConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            embedding: EmbeddingConfig::default(),
            recall: RecallConfig::default(),
            tasks: TaskConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8411,
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_blitz_dir()
            .join("blitz.db")
            .to_string_lossy()
            .into_owned();
        Self { db_path }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache_dir = default_blitz_dir()
            .join("models")
            .to_string_lossy()
            .into_owned();
        Self {
            provider: "local".into(),
            model: "all-MiniLM-L6-v2".into(),
            cache_dir,
        }
    }
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            top_k: 5,
            primary_threshold: 0.82,
            lexical_threshold: 0.5,
            tie_epsilon: 1e-4,
            lexical_corpus_size: 500,
            backend_timeout_secs: 5,
            max_entry_age_days: 90,
            prune_interval_secs: 3600,
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 100,
            ttl_margin_secs: 600,
            sweep_interval_secs: 15,
            call_timeout_secs: 45,
            tool_retries: 2,
            max_content_chars: 4000,
            history_limit: 20,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            assistant_url: None,
            tools_url: None,
            sql_tool: "query".into(),
        }
    }
}

impl RecallConfig {
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_secs)
    }

    /// `None` when retention is disabled.
    pub fn max_entry_age(&self) -> Option<chrono::Duration> {
        match self.max_entry_age_days {
            0 => None,
            days => Some(chrono::Duration::days(days as i64)),
        }
    }
}

impl TaskConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn ttl_margin(&self) -> Duration {
        Duration::from_secs(self.ttl_margin_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// Returns `~/.blitz/`
pub fn default_blitz_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".blitz")
}

/// Returns the default config file path: `~/.blitz/config.toml`
pub fn default_config_path() -> PathBuf {
    default_blitz_dir().join("config.toml")
}

impl BlitzConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, apply env var overrides, then validate.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            BlitzConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("BLITZ_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("BLITZ_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("BLITZ_HOST") {
            self.server.host = val;
        }
        if let Ok(val) = std::env::var("BLITZ_PORT") {
            match val.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %val, "ignoring invalid BLITZ_PORT"),
            }
        }
        if let Ok(val) = std::env::var("BLITZ_ASSISTANT_URL") {
            self.agent.assistant_url = Some(val);
        }
        if let Ok(val) = std::env::var("BLITZ_TOOLS_URL") {
            self.agent.tools_url = Some(val);
        }
    }

    /// Reject configurations that would break the polling contract.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("tasks.timeout_secs", self.tasks.timeout_secs),
            ("tasks.sweep_interval_secs", self.tasks.sweep_interval_secs),
            ("tasks.call_timeout_secs", self.tasks.call_timeout_secs),
            ("recall.backend_timeout_secs", self.recall.backend_timeout_secs),
            ("recall.prune_interval_secs", self.recall.prune_interval_secs),
        ] {
            if value == 0 {
                bail!("{name} must be greater than zero");
            }
        }
        // Evicting before the ceiling would hand pollers a false not_found.
        if self.tasks.ttl_margin_secs <= self.tasks.timeout_secs {
            bail!(
                "tasks.ttl_margin_secs ({}) must exceed tasks.timeout_secs ({})",
                self.tasks.ttl_margin_secs,
                self.tasks.timeout_secs
            );
        }
        for (name, value) in [
            ("recall.primary_threshold", self.recall.primary_threshold),
            ("recall.lexical_threshold", self.recall.lexical_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("{name} must be between 0.0 and 1.0, got {value}");
            }
        }
        if self.recall.top_k == 0 {
            bail!("recall.top_k must be at least 1");
        }
        Ok(())
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = BlitzConfig::default();
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.recall.top_k, 5);
        assert_eq!(config.tasks.timeout_secs, 100);
        assert!(config.storage.db_path.ends_with("blitz.db"));
        config.validate().unwrap();
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[server]
log_level = "debug"
port = 9000

[storage]
db_path = "/tmp/test.db"

[recall]
primary_threshold = 0.9

[tasks]
timeout_secs = 30
"#;
        let config: BlitzConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.storage.db_path, "/tmp/test.db");
        assert_eq!(config.recall.primary_threshold, 0.9);
        assert_eq!(config.tasks.timeout_secs, 30);
        // defaults still apply for unset fields
        assert_eq!(config.recall.lexical_threshold, 0.5);
        assert_eq!(config.tasks.ttl_margin_secs, 600);
    }

    #[test]
    fn ttl_margin_must_exceed_timeout() {
        let mut config = BlitzConfig::default();
        config.tasks.ttl_margin_secs = config.tasks.timeout_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn thresholds_out_of_range_are_rejected() {
        let mut config = BlitzConfig::default();
        config.recall.lexical_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let mut config = BlitzConfig::default();
        config.tasks.sweep_interval_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("tasks.sweep_interval_secs"));

        let mut config = BlitzConfig::default();
        config.tasks.call_timeout_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("tasks.call_timeout_secs"));

        let mut config = BlitzConfig::default();
        config.recall.backend_timeout_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("recall.backend_timeout_secs"));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut config = BlitzConfig::default();
        config.tasks.timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_age_disables_retention() {
        let mut config = BlitzConfig::default();
        assert_eq!(config.recall.max_entry_age(), Some(chrono::Duration::days(90)));
        config.recall.max_entry_age_days = 0;
        assert!(config.recall.max_entry_age().is_none());
        config.validate().unwrap();
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = BlitzConfig::default();
        std::env::set_var("BLITZ_DB", "/tmp/override.db");
        std::env::set_var("BLITZ_LOG_LEVEL", "trace");
        std::env::set_var("BLITZ_PORT", "9123");

        config.apply_env_overrides();

        assert_eq!(config.storage.db_path, "/tmp/override.db");
        assert_eq!(config.server.log_level, "trace");
        assert_eq!(config.server.port, 9123);

        // Clean up
        std::env::remove_var("BLITZ_DB");
        std::env::remove_var("BLITZ_LOG_LEVEL");
        std::env::remove_var("BLITZ_PORT");
    }
}
