//! Fleet-wide deduplication of recovery decisions per `(domain, pattern)`.
//!
//! One worker wins a TTL lock and becomes the coordinator; it decides and
//! publishes a [`RecoveryResult`]. Everyone else is a follower that either
//! reuses a cached result or waits a bounded time for one.

use std::sync::Arc;

use chrono::Utc;

use super::config_manager::ConfigManager;
use super::types::{ErrorPattern, RecoveryPlan, RecoveryResult};
use crate::error::AppError;
use crate::store::SharedStore;

fn lock_key(domain: &str, pattern: ErrorPattern) -> String {
    format!("recovery:coord:lock:{domain}:{}", pattern.as_str())
}

fn result_key(domain: &str, pattern: ErrorPattern) -> String {
    format!("recovery:coord:result:{domain}:{}", pattern.as_str())
}

#[derive(Debug, Clone, PartialEq)]
pub enum Role {
    /// Holds the lock and must decide, then publish or release.
    Coordinator,
    /// Someone else is deciding. Carries the cached result when one exists.
    Follower(Option<RecoveryResult>),
}

impl Role {
    pub fn is_coordinator(&self) -> bool {
        matches!(self, Role::Coordinator)
    }
}

pub struct RecoveryCoordinator {
    store: SharedStore,
    config: Arc<ConfigManager>,
    worker_id: String,
}

impl RecoveryCoordinator {
    pub fn new(store: SharedStore, config: Arc<ConfigManager>, worker_id: impl Into<String>) -> Self {
        Self { store, config, worker_id: worker_id.into() }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Cached result first, then the lock.
    pub async fn try_acquire(&self, domain: &str, pattern: ErrorPattern) -> Result<Role, AppError> {
        if let Some(result) = self.cached_result(domain, pattern).await? {
            tracing::debug!(domain, pattern = %pattern, "Reusing published recovery result");
            return Ok(Role::Follower(Some(result)));
        }

        let ttl = self.config.settings().lock_ttl;
        if self.store.set_nx(&lock_key(domain, pattern), &self.worker_id, ttl).await? {
            tracing::debug!(domain, pattern = %pattern, worker_id = %self.worker_id, "Became recovery coordinator");
            Ok(Role::Coordinator)
        } else {
            Ok(Role::Follower(None))
        }
    }

    async fn cached_result(
        &self,
        domain: &str,
        pattern: ErrorPattern,
    ) -> Result<Option<RecoveryResult>, AppError> {
        let Some(raw) = self.store.get(&result_key(domain, pattern)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(result) => Ok(Some(result)),
            Err(e) => {
                tracing::warn!(domain, pattern = %pattern, error = %e, "Ignoring malformed recovery result");
                Ok(None)
            }
        }
    }

    /// Poll for the coordinator's result. `None` after the wait timeout.
    pub async fn wait_for_result(
        &self,
        domain: &str,
        pattern: ErrorPattern,
    ) -> Result<Option<RecoveryResult>, AppError> {
        let settings = self.config.settings();
        let deadline = tokio::time::Instant::now() + settings.wait_timeout;
        loop {
            if let Some(result) = self.cached_result(domain, pattern).await? {
                return Ok(Some(result));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                tracing::debug!(domain, pattern = %pattern, "Timed out waiting for coordinator");
                return Ok(None);
            }
            tokio::time::sleep(settings.poll_interval.min(deadline - now)).await;
        }
    }

    /// Publish with the result TTL, then drop the lock.
    pub async fn publish_result(
        &self,
        domain: &str,
        pattern: ErrorPattern,
        plan: &RecoveryPlan,
    ) -> Result<RecoveryResult, AppError> {
        let result = RecoveryResult {
            domain: domain.to_string(),
            pattern,
            plan: plan.clone(),
            coordinator_id: self.worker_id.clone(),
            decided_at: Utc::now(),
        };
        let ttl = self.config.settings().result_ttl;
        self.store
            .set(&result_key(domain, pattern), &serde_json::to_string(&result)?, Some(ttl))
            .await?;
        self.release_lock(domain, pattern).await?;
        tracing::debug!(domain, pattern = %pattern, action = %plan.action, "Recovery result published");
        Ok(result)
    }

    /// Free the slot early. Only deletes a lock this worker holds.
    pub async fn release_lock(&self, domain: &str, pattern: ErrorPattern) -> Result<bool, AppError> {
        let key = lock_key(domain, pattern);
        match self.store.get(&key).await? {
            Some(holder) if holder == self.worker_id => self.store.delete(&key).await,
            _ => Ok(false),
        }
    }

    /// Drop a cached result so the next failure triggers a fresh decision.
    pub async fn invalidate(&self, domain: &str, pattern: ErrorPattern) -> Result<bool, AppError> {
        self.store.delete(&result_key(domain, pattern)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::db::settings_keys as keys;
    use crate::store::{CoordinationStore, MemoryStore};
    use std::time::Duration;

    fn pair() -> (RecoveryCoordinator, RecoveryCoordinator) {
        let config = Arc::new(ConfigManager::new(init_test_db().unwrap()));
        let store: SharedStore = Arc::new(MemoryStore::new());
        (
            RecoveryCoordinator::new(store.clone(), config.clone(), "w1"),
            RecoveryCoordinator::new(store, config, "w2"),
        )
    }

    #[tokio::test]
    async fn test_one_coordinator_then_follower_gets_result() {
        let (a, b) = pair();
        assert_eq!(a.try_acquire("shop.com", ErrorPattern::Blocked).await.unwrap(), Role::Coordinator);
        assert_eq!(b.try_acquire("shop.com", ErrorPattern::Blocked).await.unwrap(), Role::Follower(None));

        let plan = RecoveryPlan::retry(Duration::from_secs(3), "decided by w1");
        let published = a.publish_result("shop.com", ErrorPattern::Blocked, &plan).await.unwrap();

        let got = b.wait_for_result("shop.com", ErrorPattern::Blocked).await.unwrap().unwrap();
        assert_eq!(got, published);
        assert_eq!(got.coordinator_id, "w1");

        // Later callers reuse the cached result without taking the lock.
        match b.try_acquire("shop.com", ErrorPattern::Blocked).await.unwrap() {
            Role::Follower(Some(r)) => assert_eq!(r.plan, plan),
            other => panic!("unexpected role {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wait_times_out_with_none() {
        let (a, b) = pair();
        a.config.set(keys::WAIT_TIMEOUT_MS, serde_json::json!(100)).unwrap();
        a.config.set(keys::POLL_INTERVAL_MS, serde_json::json!(20)).unwrap();
        assert!(a.try_acquire("x.com", ErrorPattern::Timeout).await.unwrap().is_coordinator());
        let started = std::time::Instant::now();
        assert!(b.wait_for_result("x.com", ErrorPattern::Timeout).await.unwrap().is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_release_lock_only_by_holder() {
        let (a, b) = pair();
        assert!(a.try_acquire("x.com", ErrorPattern::Captcha).await.unwrap().is_coordinator());
        assert!(!b.release_lock("x.com", ErrorPattern::Captcha).await.unwrap());
        assert!(a.release_lock("x.com", ErrorPattern::Captcha).await.unwrap());
        assert!(b.try_acquire("x.com", ErrorPattern::Captcha).await.unwrap().is_coordinator());
    }

    #[tokio::test]
    async fn test_patterns_are_independent() {
        let (a, b) = pair();
        assert!(a.try_acquire("x.com", ErrorPattern::Blocked).await.unwrap().is_coordinator());
        assert!(b.try_acquire("x.com", ErrorPattern::RateLimited).await.unwrap().is_coordinator());
    }

    #[tokio::test]
    async fn test_malformed_result_is_ignored() {
        let (a, _) = pair();
        a.store.set(&result_key("x.com", ErrorPattern::Blocked), "not json", None).await.unwrap();
        assert!(a.try_acquire("x.com", ErrorPattern::Blocked).await.unwrap().is_coordinator());
    }
}
