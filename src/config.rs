//! Static process configuration.
//!
//! Loaded once at startup from a TOML file (path in `CRAWL_RECOVERY_CONFIG`,
//! default `recovery.toml`) with environment overrides. Thresholds that operators
//! tune at runtime live in `system_config` instead; see `engine::config_manager`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::AppError;

pub const CONFIG_PATH_ENV: &str = "CRAWL_RECOVERY_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "recovery.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Identifies this worker in leases and coordination locks.
    pub worker_id: String,
    pub database: DatabaseConfig,
    pub store: StoreConfig,
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub pool_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
    /// Deadline applied to every store round-trip.
    pub op_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub enabled: bool,
    /// OpenAI-compatible API root, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", &uuid::Uuid::new_v4().to_string()[..8]),
            database: DatabaseConfig::default(),
            store: StoreConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/recovery.db"),
            pool_size: 8,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".into(),
            op_timeout_ms: 2_000,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
            api_key: None,
            timeout_secs: 30,
        }
    }
}

impl StoreConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms.max(1))
    }
}

impl LlmConfig {
    /// HTTP-level deadline for one provider call.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl AppConfig {
    /// Load `.env`, then the TOML file, then apply env overrides.
    pub fn load() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        let mut config = Self::from_file(Path::new(&path))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file. A missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self, AppError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_toml(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(AppError::Io(e)),
        }
    }

    pub fn from_toml(raw: &str) -> Result<Self, AppError> {
        toml::from_str(raw).map_err(|e| AppError::Config(e.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CRAWL_RECOVERY_WORKER_ID") {
            self.worker_id = v;
        }
        if let Ok(v) = std::env::var("CRAWL_RECOVERY_DB") {
            self.database.path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CRAWL_RECOVERY_REDIS_URL") {
            self.store.redis_url = v;
            self.store.backend = StoreBackend::Redis;
        }
        if let Ok(v) = std::env::var("CRAWL_RECOVERY_LLM_API_KEY") {
            self.llm.api_key = Some(v);
            self.llm.enabled = true;
        }
        if let Ok(v) = std::env::var("CRAWL_RECOVERY_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Ok(v) = std::env::var("CRAWL_RECOVERY_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.worker_id.trim().is_empty() {
            return Err(AppError::Config("worker_id cannot be empty".into()));
        }
        if self.database.pool_size == 0 {
            return Err(AppError::Config("database.pool_size must be > 0".into()));
        }
        if self.llm.enabled && self.llm.api_key.as_deref().unwrap_or("").is_empty() {
            return Err(AppError::Config("llm.enabled requires llm.api_key".into()));
        }
        Ok(())
    }
}
