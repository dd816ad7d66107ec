use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{glob_match, CoordinationStore};
use crate::error::AppError;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    ZSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|t| now >= t)
    }
}

/// In-process [`CoordinationStore`].
///
/// A single mutex serializes every operation, which gives the same per-operation
/// atomicity Redis does. Expired keys are evicted lazily on access.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drop `key` if expired, then return the live entry.
    fn live<'a>(map: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
        let now = Instant::now();
        if map.get(key).is_some_and(|e| e.is_expired(now)) {
            map.remove(key);
        }
        map.get_mut(key)
    }

    fn wrong_type(key: &str) -> AppError {
        AppError::Store(format!("WRONGTYPE operation against key {key}"))
    }

    /// Remaining lifetime of a live key, like Redis `PTTL`. `None` for a
    /// missing key or one without expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut map = self.lock();
        let expires_at = Self::live(&mut map, key)?.expires_at?;
        Some(expires_at.saturating_duration_since(Instant::now()))
    }

    /// Remove every expired key. Callers may run this periodically in long-lived
    /// single-process deployments.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut map = self.lock();
        let before = map.len();
        map.retain(|_, e| !e.is_expired(now));
        before - map.len()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut map = self.lock();
        match Self::live(&mut map, key) {
            None => Ok(None),
            Some(Entry { value: Value::Str(s), .. }) => Ok(Some(s.clone())),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), AppError> {
        let mut map = self.lock();
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, AppError> {
        let mut map = self.lock();
        if Self::live(&mut map, key).is_some() {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, AppError> {
        let mut map = self.lock();
        let existed = Self::live(&mut map, key).is_some();
        map.remove(key);
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> Result<bool, AppError> {
        let mut map = self.lock();
        Ok(Self::live(&mut map, key).is_some())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, AppError> {
        let now = Instant::now();
        let map = self.lock();
        let mut keys: Vec<String> = map
            .iter()
            .filter(|(k, e)| !e.is_expired(now) && glob_match(pattern, k))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, AppError> {
        let mut map = self.lock();
        match Self::live(&mut map, key) {
            None => Ok(None),
            Some(Entry { value: Value::Hash(h), .. }) => Ok(h.get(field).cloned()),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, AppError> {
        let mut map = self.lock();
        match Self::live(&mut map, key) {
            None => Ok(HashMap::new()),
            Some(Entry { value: Value::Hash(h), .. }) => Ok(h.clone()),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> Result<(), AppError> {
        let mut map = self.lock();
        if Self::live(&mut map, key).is_none() {
            map.insert(
                key.to_string(),
                Entry { value: Value::Hash(HashMap::new()), expires_at: None },
            );
        }
        match map.get_mut(key) {
            Some(Entry { value: Value::Hash(h), .. }) => {
                for (f, v) in fields {
                    h.insert((*f).to_string(), v.clone());
                }
                Ok(())
            }
            _ => Err(Self::wrong_type(key)),
        }
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, AppError> {
        let mut map = self.lock();
        if Self::live(&mut map, key).is_none() {
            map.insert(
                key.to_string(),
                Entry { value: Value::Hash(HashMap::new()), expires_at: None },
            );
        }
        match map.get_mut(key) {
            Some(Entry { value: Value::Hash(h), .. }) => {
                let current: i64 = match h.get(field) {
                    Some(v) => v.parse().map_err(|_| {
                        AppError::Store(format!("hash value is not an integer: {key}.{field}"))
                    })?,
                    None => 0,
                };
                let next = current + delta;
                h.insert(field.to_string(), next.to_string());
                Ok(next)
            }
            _ => Err(Self::wrong_type(key)),
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), AppError> {
        let mut map = self.lock();
        if Self::live(&mut map, key).is_none() {
            map.insert(
                key.to_string(),
                Entry { value: Value::ZSet(HashMap::new()), expires_at: None },
            );
        }
        match map.get_mut(key) {
            Some(Entry { value: Value::ZSet(z), .. }) => {
                z.insert(member.to_string(), score);
                Ok(())
            }
            _ => Err(Self::wrong_type(key)),
        }
    }

    async fn zincr_by(&self, key: &str, member: &str, delta: f64) -> Result<f64, AppError> {
        let mut map = self.lock();
        if Self::live(&mut map, key).is_none() {
            map.insert(
                key.to_string(),
                Entry { value: Value::ZSet(HashMap::new()), expires_at: None },
            );
        }
        match map.get_mut(key) {
            Some(Entry { value: Value::ZSet(z), .. }) => {
                let score = z.entry(member.to_string()).or_insert(0.0);
                *score += delta;
                Ok(*score)
            }
            _ => Err(Self::wrong_type(key)),
        }
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, AppError> {
        let mut map = self.lock();
        match Self::live(&mut map, key) {
            None => Ok(Vec::new()),
            Some(Entry { value: Value::ZSet(z), .. }) => {
                let mut members: Vec<(String, f64)> = z
                    .iter()
                    .filter(|(_, s)| **s >= min && **s <= max)
                    .map(|(m, s)| (m.clone(), *s))
                    .collect();
                // Redis orders ties lexicographically.
                members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                Ok(members)
            }
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn increment(&self, key: &str) -> Result<i64, AppError> {
        let mut map = self.lock();
        match Self::live(&mut map, key) {
            None => {
                map.insert(
                    key.to_string(),
                    Entry { value: Value::Str("1".into()), expires_at: None },
                );
                Ok(1)
            }
            Some(Entry { value: Value::Str(s), .. }) => {
                let next = s
                    .parse::<i64>()
                    .map_err(|_| AppError::Store(format!("value is not an integer: {key}")))?
                    + 1;
                *s = next.to_string();
                Ok(next)
            }
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, AppError> {
        let mut map = self.lock();
        match Self::live(&mut map, key) {
            None => Ok(false),
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
        }
    }
}
