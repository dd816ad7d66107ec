//! Per-domain block state with severity-scaled backoff.
//!
//! Blocks are never swept in the background: [`DomainHealth::get`] treats a
//! block whose `blocked_until` has passed as cleared and writes that back.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::config_manager::ConfigManager;
use super::types::ErrorPattern;
use crate::error::AppError;
use crate::store::{field_bool, field_i64, field_time, SharedStore};

/// Upper bound on any automatic block.
pub const MAX_BLOCK: Duration = Duration::from_secs(60 * 60);
const BLOCK_UNIT_SECS: f64 = 60.0;
const MAX_WORKING_PROXIES: usize = 10;
const DOMAIN_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const KEY_PREFIX: &str = "recovery:domain:";

const F_SUCCESS: &str = "success";
const F_FAILURE: &str = "failure";
const F_CONSECUTIVE: &str = "consecutive_fails";
const F_LAST_FAILURE: &str = "last_failure";
const F_LAST_SUCCESS: &str = "last_success";
const F_BLOCKED: &str = "blocked";
const F_BLOCKED_UNTIL: &str = "blocked_until";
const F_LAST_PATTERN: &str = "last_pattern";
const F_PROXIES: &str = "working_proxies";

fn key(domain: &str) -> String {
    format!("{KEY_PREFIX}{domain}")
}

/// `min(1h, 1min × consecutive_fails × severity)`.
pub fn calculate_block_duration(consecutive_fails: i64, pattern: ErrorPattern) -> Duration {
    let secs = BLOCK_UNIT_SECS * consecutive_fails.max(0) as f64 * pattern.severity_multiplier();
    Duration::from_secs_f64(secs.min(MAX_BLOCK.as_secs_f64()))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainStatus {
    pub domain: String,
    pub success_count: i64,
    pub failure_count: i64,
    pub consecutive_fails: i64,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub is_blocked: bool,
    pub blocked_until: Option<DateTime<Utc>>,
    pub last_pattern: Option<String>,
    pub working_proxies: Vec<String>,
}

pub struct DomainHealth {
    store: SharedStore,
    config: Arc<ConfigManager>,
}

impl DomainHealth {
    pub fn new(store: SharedStore, config: Arc<ConfigManager>) -> Self {
        Self { store, config }
    }

    /// Count a failure; auto-block once the streak reaches the threshold.
    pub async fn record_failure(
        &self,
        domain: &str,
        pattern: ErrorPattern,
    ) -> Result<DomainStatus, AppError> {
        let key = key(domain);
        self.store.hincr_by(&key, F_FAILURE, 1).await?;
        let consecutive = self.store.hincr_by(&key, F_CONSECUTIVE, 1).await?;
        self.store
            .hset(
                &key,
                &[
                    (F_LAST_FAILURE, Utc::now().to_rfc3339()),
                    (F_LAST_PATTERN, pattern.as_str().to_string()),
                ],
            )
            .await?;
        self.store.expire(&key, DOMAIN_TTL).await?;

        let threshold = self.config.settings().block_threshold;
        if consecutive >= threshold {
            let duration = calculate_block_duration(consecutive, pattern);
            if self.block(domain, duration).await? {
                tracing::warn!(
                    domain,
                    pattern = %pattern,
                    consecutive,
                    block_secs = duration.as_secs(),
                    "Domain auto-blocked",
                );
            }
        }

        self.get(domain).await
    }

    /// Count a success and reset the streak. An active block stays in place.
    pub async fn record_success(&self, domain: &str, proxy_id: Option<&str>) -> Result<(), AppError> {
        let key = key(domain);
        self.store.hincr_by(&key, F_SUCCESS, 1).await?;
        self.store
            .hset(
                &key,
                &[
                    (F_CONSECUTIVE, "0".to_string()),
                    (F_LAST_SUCCESS, Utc::now().to_rfc3339()),
                ],
            )
            .await?;
        if let Some(proxy_id) = proxy_id {
            self.remember_proxy(&key, proxy_id).await?;
        }
        self.store.expire(&key, DOMAIN_TTL).await?;
        Ok(())
    }

    /// Most-recent-first list of proxies that worked for the domain, capped at 10.
    /// Best-effort: concurrent writers may drop an entry.
    async fn remember_proxy(&self, key: &str, proxy_id: &str) -> Result<(), AppError> {
        let current = self.store.hget(key, F_PROXIES).await?.unwrap_or_default();
        let mut proxies: Vec<&str> = vec![proxy_id];
        proxies.extend(current.split(',').filter(|p| !p.is_empty() && *p != proxy_id));
        proxies.truncate(MAX_WORKING_PROXIES);
        self.store.hset(key, &[(F_PROXIES, proxies.join(","))]).await
    }

    pub async fn get(&self, domain: &str) -> Result<DomainStatus, AppError> {
        let key = key(domain);
        let fields = self.store.hget_all(&key).await?;

        let mut is_blocked = field_bool(&fields, F_BLOCKED);
        let mut blocked_until = field_time(&fields, F_BLOCKED_UNTIL);
        if is_blocked && blocked_until.is_some_and(|until| Utc::now() > until) {
            self.store
                .hset(&key, &[(F_BLOCKED, "0".to_string()), (F_BLOCKED_UNTIL, String::new())])
                .await?;
            tracing::info!(domain, "Domain block expired");
            is_blocked = false;
            blocked_until = None;
        }

        Ok(DomainStatus {
            domain: domain.to_string(),
            success_count: field_i64(&fields, F_SUCCESS),
            failure_count: field_i64(&fields, F_FAILURE),
            consecutive_fails: field_i64(&fields, F_CONSECUTIVE),
            last_failure: field_time(&fields, F_LAST_FAILURE),
            last_success: field_time(&fields, F_LAST_SUCCESS),
            is_blocked,
            blocked_until: if is_blocked { blocked_until } else { None },
            last_pattern: fields.get(F_LAST_PATTERN).cloned(),
            working_proxies: fields
                .get(F_PROXIES)
                .map(|v| v.split(',').filter(|p| !p.is_empty()).map(str::to_string).collect())
                .unwrap_or_default(),
        })
    }

    pub async fn is_blocked(&self, domain: &str) -> Result<bool, AppError> {
        Ok(self.get(domain).await?.is_blocked)
    }

    /// Manual or automatic block for `duration` from now.
    ///
    /// Only ever extends: an active block ending later is left as is. Returns
    /// `true` when `blocked_until` was written. Use [`unblock`](Self::unblock)
    /// to lift a block early.
    pub async fn block(&self, domain: &str, duration: Duration) -> Result<bool, AppError> {
        let now = Utc::now();
        let until = now + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::hours(1));
        let key = key(domain);

        let fields = self.store.hget_all(&key).await?;
        let current = field_time(&fields, F_BLOCKED_UNTIL)
            .filter(|t| field_bool(&fields, F_BLOCKED) && *t > now);
        if current.is_some_and(|t| t >= until) {
            tracing::debug!(domain, "Existing block outlasts the requested one");
            return Ok(false);
        }

        self.store
            .hset(&key, &[(F_BLOCKED, "1".to_string()), (F_BLOCKED_UNTIL, until.to_rfc3339())])
            .await?;
        self.store.expire(&key, DOMAIN_TTL.max(duration)).await?;
        Ok(true)
    }

    pub async fn unblock(&self, domain: &str) -> Result<(), AppError> {
        self.store
            .hset(
                &key(domain),
                &[
                    (F_BLOCKED, "0".to_string()),
                    (F_BLOCKED_UNTIL, String::new()),
                    (F_CONSECUTIVE, "0".to_string()),
                ],
            )
            .await?;
        tracing::info!(domain, "Domain unblocked");
        Ok(())
    }

    /// Every tracked domain, sorted by name.
    pub async fn list(&self) -> Result<Vec<DomainStatus>, AppError> {
        let keys = self.store.keys(&format!("{KEY_PREFIX}*")).await?;
        let mut out = Vec::with_capacity(keys.len());
        for k in keys {
            if let Some(domain) = k.strip_prefix(KEY_PREFIX) {
                out.push(self.get(domain).await?);
            }
        }
        out.sort_by(|a, b| a.domain.cmp(&b.domain));
        Ok(out)
    }

    pub async fn working_proxies(&self, domain: &str) -> Result<Vec<String>, AppError> {
        Ok(self.get(domain).await?.working_proxies)
    }
}
