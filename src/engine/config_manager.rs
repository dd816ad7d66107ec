//! Cached dynamic settings backed by `system_config`.
//!
//! Readers get a typed [`RecoverySettings`] snapshot from memory; the background
//! refresher reloads it once the cache TTL elapses. A failed reload keeps the
//! previous snapshot.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

use super::proxy::SelectionStrategy;
use crate::db::models::SystemConfigEntry;
use crate::db::repos::core::system_config as config_repo;
use crate::db::settings_keys as keys;
use crate::db::DbPool;
use crate::error::AppError;

/// Typed view over every threshold the recovery layer reads.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoverySettings {
    pub consecutive_threshold: i64,
    pub error_rate_threshold: f64,
    pub min_samples: i64,
    pub counter_ttl: Duration,
    pub max_attempts: usize,
    pub agent_enabled: bool,
    pub ai_timeout: Duration,
    pub block_threshold: i64,
    pub lock_ttl: Duration,
    pub result_ttl: Duration,
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
    pub lease_ttl: Duration,
    pub cooldown_base: Duration,
    pub max_hourly_failures: i64,
    pub disable_duration: Duration,
    pub domain_affinity_weight: f64,
    pub affinity_top_n: usize,
    pub proxy_strategy: SelectionStrategy,
    pub proxy_refresh_interval: Duration,
    pub rules_cache_ttl: Duration,
    pub config_cache_ttl: Duration,
    pub promotion_threshold: i64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            consecutive_threshold: 3,
            error_rate_threshold: 0.10,
            min_samples: 10,
            counter_ttl: Duration::from_secs(3600),
            max_attempts: 3,
            agent_enabled: true,
            ai_timeout: Duration::from_secs(30),
            block_threshold: 5,
            lock_ttl: Duration::from_secs(30),
            result_ttl: Duration::from_secs(300),
            wait_timeout: Duration::from_millis(10_000),
            poll_interval: Duration::from_millis(500),
            lease_ttl: Duration::from_secs(30),
            cooldown_base: Duration::from_secs(60),
            max_hourly_failures: 10,
            disable_duration: Duration::from_secs(30 * 60),
            domain_affinity_weight: 0.7,
            affinity_top_n: 5,
            proxy_strategy: SelectionStrategy::DomainAffinity,
            proxy_refresh_interval: Duration::from_secs(300),
            rules_cache_ttl: Duration::from_secs(300),
            config_cache_ttl: Duration::from_secs(60),
            promotion_threshold: 3,
        }
    }
}

// ── Value readers ──────────────────────────────────────────────────

struct Reader<'a>(&'a HashMap<String, Value>);

impl Reader<'_> {
    fn int(&self, key: &str, default: i64) -> i64 {
        match self.0.get(key) {
            None => default,
            Some(v) => v
                .as_i64()
                .or_else(|| v.as_f64().map(|f| f as i64))
                .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
                .unwrap_or_else(|| {
                    tracing::warn!(key, value = %v, "Ignoring non-integer config value");
                    default
                }),
        }
    }

    fn positive(&self, key: &str, default: i64) -> u64 {
        self.int(key, default).max(1) as u64
    }

    fn float(&self, key: &str, default: f64) -> f64 {
        match self.0.get(key) {
            None => default,
            Some(v) => v
                .as_f64()
                .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
                .unwrap_or_else(|| {
                    tracing::warn!(key, value = %v, "Ignoring non-numeric config value");
                    default
                }),
        }
    }

    fn boolean(&self, key: &str, default: bool) -> bool {
        match self.0.get(key) {
            None => default,
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.as_str(), "true" | "1" | "yes"),
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
            Some(v) => {
                tracing::warn!(key, value = %v, "Ignoring non-boolean config value");
                default
            }
        }
    }

    fn text(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }
}

impl RecoverySettings {
    pub fn from_values(values: &HashMap<String, Value>) -> Self {
        let d = Self::default();
        let r = Reader(values);
        let strategy = match r.text(keys::PROXY_STRATEGY) {
            None => d.proxy_strategy,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!(value = raw, "Unknown proxy strategy, using domain_affinity");
                d.proxy_strategy
            }),
        };

        Self {
            consecutive_threshold: r.int(keys::CONSECUTIVE_THRESHOLD, d.consecutive_threshold).max(1),
            error_rate_threshold: r
                .float(keys::ERROR_RATE_THRESHOLD, d.error_rate_threshold)
                .clamp(0.0, 1.0),
            min_samples: r.int(keys::MIN_SAMPLES, d.min_samples).max(1),
            counter_ttl: Duration::from_secs(r.positive(keys::COUNTER_TTL_SECS, 3600)),
            max_attempts: r.positive(keys::MAX_ATTEMPTS, 3) as usize,
            agent_enabled: r.boolean(keys::AGENT_ENABLED, d.agent_enabled),
            ai_timeout: Duration::from_secs(r.positive(keys::AI_TIMEOUT_SECS, 30)),
            block_threshold: r.int(keys::BLOCK_THRESHOLD, d.block_threshold).max(1),
            lock_ttl: Duration::from_secs(r.positive(keys::LOCK_TTL_SECS, 30)),
            result_ttl: Duration::from_secs(r.positive(keys::RESULT_TTL_SECS, 300)),
            wait_timeout: Duration::from_millis(r.positive(keys::WAIT_TIMEOUT_MS, 10_000)),
            poll_interval: Duration::from_millis(r.positive(keys::POLL_INTERVAL_MS, 500)),
            lease_ttl: Duration::from_secs(r.positive(keys::LEASE_TTL_SECS, 30)),
            cooldown_base: Duration::from_secs(r.positive(keys::COOLDOWN_BASE_SECS, 60)),
            max_hourly_failures: r.int(keys::MAX_HOURLY_FAILURES, d.max_hourly_failures).max(1),
            disable_duration: Duration::from_secs(r.positive(keys::DISABLE_MINUTES, 30) * 60),
            domain_affinity_weight: r
                .float(keys::DOMAIN_AFFINITY_WEIGHT, d.domain_affinity_weight)
                .clamp(0.0, 1.0),
            affinity_top_n: r.positive(keys::AFFINITY_TOP_N, 5) as usize,
            proxy_strategy: strategy,
            proxy_refresh_interval: Duration::from_secs(r.positive(keys::PROXY_REFRESH_INTERVAL_SECS, 300)),
            rules_cache_ttl: Duration::from_secs(r.positive(keys::RULES_CACHE_TTL_SECS, 300)),
            config_cache_ttl: Duration::from_secs(r.positive(keys::CONFIG_CACHE_TTL_SECS, 60)),
            promotion_threshold: r.int(keys::PROMOTION_THRESHOLD, d.promotion_threshold).max(1),
        }
    }
}

// ── Manager ────────────────────────────────────────────────────────

struct Cache {
    values: HashMap<String, Value>,
    settings: RecoverySettings,
    loaded_at: Instant,
}

pub struct ConfigManager {
    pool: DbPool,
    cache: RwLock<Cache>,
}

impl ConfigManager {
    /// Load settings once. Falls back to built-in defaults when the table is unreadable.
    pub fn new(pool: DbPool) -> Self {
        let values = match load_values(&pool) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load system_config, using defaults");
                HashMap::new()
            }
        };
        let settings = RecoverySettings::from_values(&values);
        Self {
            pool,
            cache: RwLock::new(Cache { values, settings, loaded_at: Instant::now() }),
        }
    }

    /// Current snapshot. Never touches the database.
    pub fn settings(&self) -> RecoverySettings {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache.settings.clone()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache.values.get(key).cloned()
    }

    pub fn is_stale(&self) -> bool {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache.loaded_at.elapsed() >= cache.settings.config_cache_ttl
    }

    /// Reload from the database. On failure the previous snapshot stays in place.
    pub fn refresh(&self) -> Result<(), AppError> {
        let values = load_values(&self.pool)?;
        let settings = RecoverySettings::from_values(&values);
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        if cache.settings != settings {
            tracing::info!("Recovery settings reloaded with changes");
        }
        *cache = Cache { values, settings, loaded_at: Instant::now() };
        Ok(())
    }

    /// Write through and reload. Rejects non-editable keys.
    pub fn set(&self, key: &str, value: Value) -> Result<SystemConfigEntry, AppError> {
        let entry = config_repo::set(&self.pool, key, &value)?;
        self.refresh()?;
        Ok(entry)
    }

    pub fn list(&self) -> Result<Vec<SystemConfigEntry>, AppError> {
        config_repo::get_all(&self.pool)
    }
}

fn load_values(pool: &DbPool) -> Result<HashMap<String, Value>, AppError> {
    Ok(config_repo::get_all(pool)?
        .into_iter()
        .map(|e| (e.key, e.value))
        .collect())
}
