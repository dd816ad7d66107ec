use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rand::seq::SliceRandom;
use rand::Rng;

use super::{ProxyHealth, ProxyLease, ProxyManager, SelectionStrategy};
use crate::db::models::Proxy;
use crate::engine::config_manager::{ConfigManager, RecoverySettings};
use crate::engine::types::ErrorPattern;
use crate::error::AppError;
use crate::store::{field_i64, field_time, SharedStore};

const USAGE_KEY: &str = "recovery:proxy:usage";
const AFFINITY_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const ROTATION_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const HOURLY_TTL: Duration = Duration::from_secs(2 * 60 * 60);
/// Health and usage entries of a proxy nobody has touched for this long are dropped.
const HEALTH_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const F_SUCCESS: &str = "success";
const F_FAILURE: &str = "failure";
const F_LAST_PATTERN: &str = "last_failure_pattern";
const F_LAST_SUCCESS: &str = "last_success";
const F_LAST_FAILURE: &str = "last_failure";
const F_DISABLED_UNTIL: &str = "disabled_until";

fn lease_key(proxy_id: &str) -> String {
    format!("recovery:proxy:lease:{proxy_id}")
}

fn health_key(proxy_id: &str) -> String {
    format!("recovery:proxy:health:{proxy_id}")
}

fn hourly_key(proxy_id: &str) -> String {
    format!("recovery:proxy:hourly:{proxy_id}:{}", Utc::now().format("%Y%m%d%H"))
}

fn affinity_key(domain: &str) -> String {
    format!("recovery:proxy:affinity:{domain}")
}

fn cooldown_key(domain: &str, proxy_id: &str) -> String {
    format!("recovery:proxy:cooldown:{domain}:{proxy_id}")
}

fn rotation_key(domain: &str) -> String {
    format!("recovery:proxy:rr:{domain}")
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::hours(1))
}

/// Fleet-wide proxy selection over the shared store.
///
/// Candidates come from the local [`ProxyManager`] snapshot. A candidate is
/// skipped while leased, while cooling down for the target domain, or while
/// globally disabled.
pub struct DistributedProxyManager {
    store: SharedStore,
    config: Arc<ConfigManager>,
    inventory: Arc<ProxyManager>,
    worker_id: String,
    /// Leases this worker currently holds, by proxy id.
    held: Mutex<HashMap<String, ProxyLease>>,
}

impl DistributedProxyManager {
    pub fn new(
        store: SharedStore,
        config: Arc<ConfigManager>,
        inventory: Arc<ProxyManager>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            config,
            inventory,
            worker_id: worker_id.into(),
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn inventory(&self) -> &Arc<ProxyManager> {
        &self.inventory
    }

    /// Pick and lease a proxy for `domain`. `None` when every candidate is
    /// unavailable or was leased by another worker first.
    pub async fn acquire(&self, domain: &str) -> Result<Option<ProxyLease>, AppError> {
        self.acquire_preferring(domain, &[]).await
    }

    /// Like [`acquire`](Self::acquire), with `preferred` (the domain's recently
    /// working proxies) ranked right after scored proxies under domain affinity.
    pub async fn acquire_preferring(
        &self,
        domain: &str,
        preferred: &[String],
    ) -> Result<Option<ProxyLease>, AppError> {
        let settings = self.config.settings();

        let mut available = Vec::new();
        for proxy in self.inventory.snapshot() {
            if self.is_available(&proxy.proxy_id, domain).await? {
                available.push(proxy);
            }
        }
        if available.is_empty() {
            tracing::debug!(domain, "No proxy available");
            return Ok(None);
        }

        let ordered = self.order(available, domain, preferred, &settings).await?;
        for proxy in ordered {
            // Losing the set-if-absent race just moves on to the next candidate.
            if let Some(lease) = self.try_lease(&proxy, domain, settings.lease_ttl).await? {
                tracing::debug!(
                    domain,
                    proxy_id = %lease.proxy_id,
                    strategy = %settings.proxy_strategy,
                    "Proxy leased",
                );
                return Ok(Some(lease));
            }
        }
        Ok(None)
    }

    async fn is_available(&self, proxy_id: &str, domain: &str) -> Result<bool, AppError> {
        if self.store.exists(&lease_key(proxy_id)).await? {
            return Ok(false);
        }
        if self.store.exists(&cooldown_key(domain, proxy_id)).await? {
            return Ok(false);
        }
        let disabled_until = self.store.hget(&health_key(proxy_id), F_DISABLED_UNTIL).await?;
        let disabled = disabled_until
            .and_then(|v| chrono::DateTime::parse_from_rfc3339(&v).ok())
            .is_some_and(|until| until > Utc::now());
        Ok(!disabled)
    }

    async fn order(
        &self,
        mut candidates: Vec<Proxy>,
        domain: &str,
        preferred: &[String],
        settings: &RecoverySettings,
    ) -> Result<Vec<Proxy>, AppError> {
        match settings.proxy_strategy {
            SelectionStrategy::RoundRobin => {
                let key = rotation_key(domain);
                let n = self.store.increment(&key).await?;
                self.store.expire(&key, ROTATION_TTL).await?;
                let offset = (n.max(1) - 1) as usize % candidates.len();
                candidates.rotate_left(offset);
                Ok(candidates)
            }
            SelectionStrategy::LeastUsed => self.by_usage(candidates).await,
            SelectionStrategy::Random => {
                candidates.shuffle(&mut rand::thread_rng());
                Ok(candidates)
            }
            SelectionStrategy::DomainAffinity => {
                let roll: f64 = rand::thread_rng().gen();
                if roll >= settings.domain_affinity_weight {
                    return self.by_usage(candidates).await;
                }
                let mut scores: HashMap<String, f64> = self
                    .store
                    .zrange_by_score(&affinity_key(domain), 0.0, f64::INFINITY)
                    .await?
                    .into_iter()
                    .filter(|(_, score)| *score > 0.0)
                    .collect();
                // Working proxies without a score yet rank below every scored one.
                for (rank, proxy_id) in preferred.iter().enumerate() {
                    scores
                        .entry(proxy_id.clone())
                        .or_insert(f64::MIN_POSITIVE * (preferred.len() - rank) as f64);
                }
                let (mut top, rest): (Vec<Proxy>, Vec<Proxy>) =
                    candidates.into_iter().partition(|p| scores.contains_key(&p.proxy_id));
                top.sort_by(|a, b| {
                    let sa = scores.get(&a.proxy_id).copied().unwrap_or(0.0);
                    let sb = scores.get(&b.proxy_id).copied().unwrap_or(0.0);
                    sb.total_cmp(&sa).then_with(|| a.proxy_id.cmp(&b.proxy_id))
                });
                let overflow = top.split_off(top.len().min(settings.affinity_top_n));
                let mut fallback = rest;
                fallback.extend(overflow);
                top.extend(self.by_usage(fallback).await?);
                Ok(top)
            }
        }
    }

    async fn by_usage(&self, mut candidates: Vec<Proxy>) -> Result<Vec<Proxy>, AppError> {
        let usage: HashMap<String, f64> = self
            .store
            .zrange_by_score(USAGE_KEY, f64::NEG_INFINITY, f64::INFINITY)
            .await?
            .into_iter()
            .collect();
        candidates.sort_by(|a, b| {
            let ua = usage.get(&a.proxy_id).copied().unwrap_or(0.0);
            let ub = usage.get(&b.proxy_id).copied().unwrap_or(0.0);
            ua.total_cmp(&ub).then_with(|| a.proxy_id.cmp(&b.proxy_id))
        });
        Ok(candidates)
    }

    async fn try_lease(
        &self,
        proxy: &Proxy,
        domain: &str,
        ttl: Duration,
    ) -> Result<Option<ProxyLease>, AppError> {
        let token = uuid::Uuid::new_v4().to_string();
        if !self.store.set_nx(&lease_key(&proxy.proxy_id), &token, ttl).await? {
            return Ok(None);
        }
        let now = Utc::now();
        let lease = ProxyLease {
            proxy_id: proxy.proxy_id.clone(),
            server: proxy.server.clone(),
            domain: domain.to_string(),
            worker_id: self.worker_id.clone(),
            token,
            acquired_at: now,
            expires_at: now + to_chrono(ttl),
        };
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.insert(lease.proxy_id.clone(), lease.clone());
        Ok(Some(lease))
    }

    /// Give a lease back early. Only deletes the key while it still carries
    /// this lease's token. Returns `true` when the key was removed.
    pub async fn release(&self, lease: &ProxyLease) -> Result<bool, AppError> {
        {
            let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
            if held.get(&lease.proxy_id).is_some_and(|h| h.token == lease.token) {
                held.remove(&lease.proxy_id);
            }
        }
        let key = lease_key(&lease.proxy_id);
        match self.store.get(&key).await? {
            Some(current) if current == lease.token => self.store.delete(&key).await,
            _ => Ok(false),
        }
    }

    async fn release_held(&self, proxy_id: &str) -> Result<(), AppError> {
        let lease = {
            let held = self.held.lock().unwrap_or_else(|e| e.into_inner());
            held.get(proxy_id).cloned()
        };
        if let Some(lease) = lease {
            self.release(&lease).await?;
        }
        Ok(())
    }

    /// Release, bump success and usage, raise affinity for the domain.
    pub async fn record_success(&self, proxy_id: &str, domain: &str) -> Result<(), AppError> {
        self.release_held(proxy_id).await?;
        let health = health_key(proxy_id);
        self.store.hincr_by(&health, F_SUCCESS, 1).await?;
        self.store.hset(&health, &[(F_LAST_SUCCESS, Utc::now().to_rfc3339())]).await?;
        self.store.expire(&health, HEALTH_TTL).await?;
        self.store.zincr_by(USAGE_KEY, proxy_id, 1.0).await?;
        self.store.expire(USAGE_KEY, HEALTH_TTL).await?;
        let affinity = affinity_key(domain);
        self.store.zincr_by(&affinity, proxy_id, 1.0).await?;
        self.store.expire(&affinity, AFFINITY_TTL).await?;
        self.inventory.record_success(proxy_id, domain, Some(&self.worker_id));
        Ok(())
    }

    /// Release, count the failure, cool the proxy down for the domain, halve its
    /// affinity, and disable it once the hourly failure budget is spent.
    pub async fn record_failure(
        &self,
        proxy_id: &str,
        domain: &str,
        pattern: ErrorPattern,
    ) -> Result<(), AppError> {
        let settings = self.config.settings();
        self.release_held(proxy_id).await?;

        let health = health_key(proxy_id);
        self.store.hincr_by(&health, F_FAILURE, 1).await?;
        self.store
            .hset(
                &health,
                &[
                    (F_LAST_PATTERN, pattern.as_str().to_string()),
                    (F_LAST_FAILURE, Utc::now().to_rfc3339()),
                ],
            )
            .await?;

        let hourly = hourly_key(proxy_id);
        let hourly_failures = self.store.increment(&hourly).await?;
        self.store.expire(&hourly, HOURLY_TTL).await?;

        self.store.expire(&health, HEALTH_TTL).await?;

        let cooldown = settings.cooldown_base.mul_f64(pattern.severity_multiplier());
        self.store
            .set(&cooldown_key(domain, proxy_id), "1", Some(cooldown))
            .await?;

        // Two increments rather than a read-then-write, so concurrent successes survive.
        let affinity = affinity_key(domain);
        let current = self.store.zincr_by(&affinity, proxy_id, 0.0).await?;
        if current > 0.0 {
            self.store.zincr_by(&affinity, proxy_id, -current / 2.0).await?;
        }

        if hourly_failures >= settings.max_hourly_failures {
            let until = Utc::now() + to_chrono(settings.disable_duration);
            self.store
                .hset(&health, &[(F_DISABLED_UNTIL, until.to_rfc3339())])
                .await?;
            self.store.expire(&health, HEALTH_TTL.max(settings.disable_duration)).await?;
            tracing::warn!(
                proxy_id,
                hourly_failures,
                disabled_until = %until,
                "Proxy disabled after repeated failures",
            );
        }

        tracing::debug!(
            proxy_id,
            domain,
            pattern = %pattern,
            cooldown_secs = cooldown.as_secs(),
            "Proxy failure recorded",
        );
        self.inventory
            .record_failure(proxy_id, domain, Some(&self.worker_id), Some(pattern.as_str()));
        Ok(())
    }

    pub async fn health(&self, proxy_id: &str) -> Result<ProxyHealth, AppError> {
        let fields = self.store.hget_all(&health_key(proxy_id)).await?;
        let hourly_failures = self
            .store
            .get(&hourly_key(proxy_id))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let usage_score = self
            .store
            .zrange_by_score(USAGE_KEY, f64::NEG_INFINITY, f64::INFINITY)
            .await?
            .into_iter()
            .find(|(member, _)| member == proxy_id)
            .map(|(_, score)| score)
            .unwrap_or(0.0);
        let disabled_until = field_time(&fields, F_DISABLED_UNTIL).filter(|t| *t > Utc::now());
        let success = field_i64(&fields, F_SUCCESS);
        let failure = field_i64(&fields, F_FAILURE);

        Ok(ProxyHealth {
            proxy_id: proxy_id.to_string(),
            success,
            failure,
            total_requests: success + failure,
            last_success: field_time(&fields, F_LAST_SUCCESS),
            last_failure: field_time(&fields, F_LAST_FAILURE),
            hourly_failures,
            usage_score,
            is_leased: self.store.exists(&lease_key(proxy_id)).await?,
            is_disabled: disabled_until.is_some(),
            disabled_until,
            last_failure_pattern: fields.get(F_LAST_PATTERN).cloned(),
        })
    }
}
