//! Per-domain error counters shared by every worker.
//!
//! Decides whether a failure is worth a recovery decision at all. Counters live
//! in one store hash per domain and are only ever changed with `hincr_by`.

use std::sync::Arc;

use serde::Serialize;

use super::config_manager::ConfigManager;
use super::types::ErrorPattern;
use crate::error::AppError;
use crate::store::{field_i64, SharedStore};

const F_SUCCESS: &str = "success";
const F_FAILURE: &str = "failure";
const F_CONSECUTIVE: &str = "consecutive_errs";
const F_LAST_PATTERN: &str = "last_pattern";

fn key(domain: &str) -> String {
    format!("recovery:errors:{domain}")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerDecision {
    pub should_recover: bool,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainErrorStats {
    pub domain: String,
    pub success: i64,
    pub failure: i64,
    pub consecutive_errs: i64,
    pub last_pattern: Option<String>,
    pub error_rate: f64,
}

pub struct ErrorTracker {
    store: SharedStore,
    config: Arc<ConfigManager>,
}

impl ErrorTracker {
    pub fn new(store: SharedStore, config: Arc<ConfigManager>) -> Self {
        Self { store, config }
    }

    /// Count a success and reset the consecutive-error streak.
    pub async fn record_success(&self, domain: &str) -> Result<(), AppError> {
        let key = key(domain);
        self.store.hincr_by(&key, F_SUCCESS, 1).await?;
        // Streak reset is a plain field write; concurrent failures may re-raise it.
        self.store.hset(&key, &[(F_CONSECUTIVE, "0".to_string())]).await?;
        self.store.expire(&key, self.config.settings().counter_ttl).await?;
        Ok(())
    }

    /// Count a failure and decide whether recovery should run.
    pub async fn record_failure(
        &self,
        domain: &str,
        pattern: ErrorPattern,
    ) -> Result<TriggerDecision, AppError> {
        let settings = self.config.settings();
        let key = key(domain);

        let failures = self.store.hincr_by(&key, F_FAILURE, 1).await?;
        let consecutive = self.store.hincr_by(&key, F_CONSECUTIVE, 1).await?;
        self.store
            .hset(&key, &[(F_LAST_PATTERN, pattern.as_str().to_string())])
            .await?;
        self.store.expire(&key, settings.counter_ttl).await?;

        if matches!(pattern, ErrorPattern::Captcha | ErrorPattern::AuthRequired) {
            return Ok(trigger(format!("{pattern} always requires recovery")));
        }

        if consecutive >= settings.consecutive_threshold {
            return Ok(trigger(format!(
                "{consecutive} consecutive errors (threshold {})",
                settings.consecutive_threshold
            )));
        }

        let successes = self
            .store
            .hget(&key, F_SUCCESS)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let total = successes + failures;
        if total >= settings.min_samples {
            let rate = failures as f64 / total as f64;
            if rate >= settings.error_rate_threshold {
                return Ok(trigger(format!(
                    "error rate {:.0}% over {total} requests (threshold {:.0}%)",
                    rate * 100.0,
                    settings.error_rate_threshold * 100.0
                )));
            }
        }

        Ok(TriggerDecision {
            should_recover: false,
            reason: format!("below thresholds ({consecutive} consecutive, {failures}/{total} failed)"),
        })
    }

    pub async fn stats(&self, domain: &str) -> Result<DomainErrorStats, AppError> {
        let fields = self.store.hget_all(&key(domain)).await?;
        let success = field_i64(&fields, F_SUCCESS);
        let failure = field_i64(&fields, F_FAILURE);
        let total = success + failure;
        Ok(DomainErrorStats {
            domain: domain.to_string(),
            success,
            failure,
            consecutive_errs: field_i64(&fields, F_CONSECUTIVE),
            last_pattern: fields.get(F_LAST_PATTERN).cloned(),
            error_rate: if total > 0 { failure as f64 / total as f64 } else { 0.0 },
        })
    }

    pub async fn reset(&self, domain: &str) -> Result<(), AppError> {
        self.store.delete(&key(domain)).await?;
        Ok(())
    }
}

fn trigger(reason: String) -> TriggerDecision {
    TriggerDecision { should_recover: true, reason }
}
