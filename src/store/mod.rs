//! Shared coordination store.
//!
//! The only synchronization primitive between worker processes. Every counter in
//! the recovery layer goes through an atomic store operation (`hincr_by`,
//! `zincr_by`, `increment`, `set_nx`), never a read-then-write.

pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis_store;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::AppError;

pub use memory::MemoryStore;

/// Key-value store with atomic counters, conditional set, hashes and sorted sets.
///
/// Implementations must make each individual operation atomic with respect to
/// concurrent callers in other processes.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError>;

    /// Unconditional set. `ttl = None` keeps the value until deleted.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), AppError>;

    /// Set only if absent. Returns `true` when this call created the key.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, AppError>;

    /// Returns `true` when a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, AppError>;

    async fn exists(&self, key: &str) -> Result<bool, AppError>;

    /// Glob-style listing (`*` wildcard only).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, AppError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, AppError>;

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, AppError>;

    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> Result<(), AppError>;

    /// Atomically add `delta` to an integer hash field, returning the new value.
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, AppError>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), AppError>;

    /// Atomically add `delta` to a member's score, returning the new score.
    async fn zincr_by(&self, key: &str, member: &str, delta: f64) -> Result<f64, AppError>;

    /// Members with `min <= score <= max`, ascending by score.
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, AppError>;

    /// Atomically increment an integer key by one, returning the new value.
    async fn increment(&self, key: &str) -> Result<i64, AppError>;

    /// Returns `true` when the key existed and its TTL was set.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, AppError>;
}

pub type SharedStore = Arc<dyn CoordinationStore>;

/// Build the store selected in config.
pub async fn connect(config: &StoreConfig) -> Result<SharedStore, AppError> {
    match config.backend {
        StoreBackend::Memory => {
            tracing::info!("Using in-process coordination store (single worker)");
            Ok(Arc::new(MemoryStore::new()))
        }
        #[cfg(feature = "redis-store")]
        StoreBackend::Redis => {
            let store = redis_store::RedisStore::connect(&config.redis_url, config.op_timeout()).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis-store"))]
        StoreBackend::Redis => Err(AppError::Config(
            "store.backend = \"redis\" requires the redis-store feature".into(),
        )),
    }
}

/// Run `fut` under a deadline, mapping expiry to [`AppError::Timeout`].
pub async fn with_deadline<T, F>(what: &str, deadline: Duration, fut: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(res) => res,
        Err(_) => Err(AppError::Timeout(format!("{what} after {}ms", deadline.as_millis()))),
    }
}

/// Parse an integer hash field, treating absent or malformed values as zero.
pub fn field_i64(fields: &HashMap<String, String>, name: &str) -> i64 {
    fields.get(name).and_then(|v| v.parse().ok()).unwrap_or(0)
}

pub fn field_bool(fields: &HashMap<String, String>, name: &str) -> bool {
    matches!(fields.get(name).map(String::as_str), Some("1") | Some("true"))
}

/// Parse an RFC 3339 timestamp hash field.
pub fn field_time(
    fields: &HashMap<String, String>,
    name: &str,
) -> Option<chrono::DateTime<chrono::Utc>> {
    fields
        .get(name)
        .filter(|v| !v.is_empty())
        .and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&chrono::Utc))
}

/// Minimal glob matcher supporting `*`.
pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }
    let mut rest = key;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("recovery:domain:*", "recovery:domain:shop.com"));
        assert!(!glob_match("recovery:domain:*", "recovery:errors:shop.com"));
        assert!(glob_match("*:lease:*", "recovery:proxy:lease:p1"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
        assert!(glob_match("a*c", "abc"));
        assert!(!glob_match("a*c", "abd"));
    }

    #[tokio::test]
    async fn test_with_deadline_times_out() {
        let res: Result<(), AppError> = with_deadline("slow op", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(AppError::Timeout(_))));
    }

    #[test]
    fn test_field_helpers() {
        let mut fields = HashMap::new();
        fields.insert("n".to_string(), "42".to_string());
        fields.insert("b".to_string(), "1".to_string());
        fields.insert("bad".to_string(), "x".to_string());
        assert_eq!(field_i64(&fields, "n"), 42);
        assert_eq!(field_i64(&fields, "bad"), 0);
        assert_eq!(field_i64(&fields, "missing"), 0);
        assert!(field_bool(&fields, "b"));
        assert!(!field_bool(&fields, "missing"));
    }
}
