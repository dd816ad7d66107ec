//! Learning system: turns repeatedly successful AI decisions into rules.
//!
//! Every AI-sourced attempt is stored with a signature over
//! `pattern|domain|action`. Once enough successful, unpromoted rows share a
//! signature, a learned rule is created and the rows are marked promoted. A
//! signature only ever gets one rule; later batches attach to it.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::config_manager::ConfigManager;
use super::rules::RuleEngine;
use super::types::{ActionParams, ActionType, ErrorPattern, PlanSource, RecoveryAttempt};
use crate::db::models::{
    ConditionField, ConditionOperator, CreateLearnedActionInput, CreateRuleInput, LearningStats,
    RecoveryRule, RuleCondition,
};
use crate::db::repos::recovery::learned_actions as learned_repo;
use crate::db::repos::recovery::rules as rule_repo;
use crate::db::DbPool;
use crate::error::AppError;

pub const LEARNED_RULE_PRIORITY: i64 = 100;

const SUBDOMAIN_PREFIXES: &[&str] = &["www.", "m.", "mobile."];

/// Per-attempt lease details added by the manager; never part of a learned decision.
const LEASE_PARAMS: &[&str] = &["proxy_id", "proxy_server"];

fn decision_params(attempt: &RecoveryAttempt) -> ActionParams {
    let mut params = attempt.plan.params.clone();
    params.retain(|k, _| !LEASE_PARAMS.contains(&k.as_str()));
    params
}

/// Stable hex signature. Different actions for the same pattern and domain differ.
pub fn error_signature(pattern: ErrorPattern, domain: &str, action: ActionType) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{}|{}", pattern.as_str(), domain.to_lowercase(), action.as_str()).as_bytes());
    hex::encode(hasher.finalize())
}

/// Strip common subdomain prefixes: `www.m.shop.com` → `shop.com`.
pub fn base_domain(domain: &str) -> String {
    let mut d = domain.trim().to_lowercase();
    loop {
        match SUBDOMAIN_PREFIXES.iter().find(|p| d.starts_with(*p) && d.len() > p.len()) {
            Some(prefix) => d = d[prefix.len()..].to_string(),
            None => return d,
        }
    }
}

pub struct LearningSystem {
    pool: DbPool,
    config: Arc<ConfigManager>,
    rules: Arc<RuleEngine>,
}

impl LearningSystem {
    pub fn new(pool: DbPool, config: Arc<ConfigManager>, rules: Arc<RuleEngine>) -> Self {
        Self { pool, config, rules }
    }

    /// Store an AI decision and its outcome; promote when the threshold is met.
    ///
    /// Never fails the caller: write errors are logged and dropped. Returns the
    /// learned rule this call promoted rows into, if any.
    pub fn record(&self, attempt: &RecoveryAttempt, ai_reasoning: Option<&str>) -> Option<RecoveryRule> {
        if attempt.plan.source != PlanSource::Ai {
            return None;
        }
        match self.try_record(attempt, ai_reasoning) {
            Ok(rule) => rule,
            Err(e) => {
                tracing::warn!(
                    task_id = %attempt.task_id,
                    domain = %attempt.detected_error.domain,
                    error = %e,
                    "Failed to record learned action",
                );
                None
            }
        }
    }

    fn try_record(
        &self,
        attempt: &RecoveryAttempt,
        ai_reasoning: Option<&str>,
    ) -> Result<Option<RecoveryRule>, AppError> {
        let detected = &attempt.detected_error;
        let signature = error_signature(detected.pattern, &detected.domain, attempt.plan.action);
        learned_repo::create(
            &self.pool,
            CreateLearnedActionInput {
                execution_id: attempt.execution_id.clone(),
                task_id: attempt.task_id.clone(),
                error_pattern: detected.pattern,
                error_signature: signature.clone(),
                domain: detected.domain.clone(),
                action: attempt.plan.action,
                action_params: decision_params(attempt),
                ai_reasoning: ai_reasoning.map(str::to_string).or_else(|| Some(attempt.plan.reason.clone())),
                success: attempt.success,
            },
        )?;

        if !attempt.success {
            return Ok(None);
        }
        let threshold = self.config.settings().promotion_threshold;
        let count = learned_repo::count_promotable(&self.pool, &signature)?;
        if count < threshold {
            tracing::debug!(signature = %signature, count, threshold, "Learned action below promotion threshold");
            return Ok(None);
        }
        self.promote(attempt, &signature)
    }

    fn promote(&self, attempt: &RecoveryAttempt, signature: &str) -> Result<Option<RecoveryRule>, AppError> {
        let detected = &attempt.detected_error;
        let base = base_domain(&detected.domain);

        // One rule per signature: later successes attach to the existing rule.
        if let Some(existing) = rule_repo::get_by_learned_from(&self.pool, signature)? {
            let promoted = learned_repo::mark_promoted(&self.pool, signature, &existing.id)?;
            tracing::debug!(rule_id = %existing.id, signature, promoted, "Signature already has a learned rule");
            return Ok(Some(existing));
        }

        let rule = self.rules.create(CreateRuleInput {
            name: format!("learned: {} on {} -> {}", detected.pattern, base, attempt.plan.action),
            description: Some(format!(
                "Promoted after repeated successful AI decisions (signature {})",
                &signature[..12]
            )),
            priority: Some(LEARNED_RULE_PRIORITY),
            enabled: Some(true),
            pattern: Some(detected.pattern),
            conditions: vec![RuleCondition {
                field: ConditionField::Domain,
                operator: ConditionOperator::Contains,
                value: base.clone(),
            }],
            action: Some(attempt.plan.action),
            action_params: decision_params(attempt),
            max_retries: None,
            retry_delay_secs: None,
            is_learned: Some(true),
            learned_from: Some(signature.to_string()),
        })?;

        let promoted = learned_repo::mark_promoted(&self.pool, signature, &rule.id)?;
        if promoted == 0 {
            // Another worker marked these rows first; keep only its rule.
            self.rules.delete(&rule.id)?;
            tracing::debug!(signature, "Signature already promoted elsewhere");
            return Ok(None);
        }

        tracing::info!(
            rule_id = %rule.id,
            domain = %base,
            pattern = %detected.pattern,
            action = %attempt.plan.action,
            promoted,
            "Learned action promoted to rule",
        );
        Ok(Some(rule))
    }

    pub fn stats(&self) -> Result<LearningStats, AppError> {
        learned_repo::stats(&self.pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::engine::detector;
    use crate::engine::types::{FetchFailure, RecoveryPlan};
    use std::time::Duration;

    fn system() -> LearningSystem {
        let pool = init_test_db().unwrap();
        let config = Arc::new(ConfigManager::new(pool.clone()));
        let rules = Arc::new(RuleEngine::new(pool.clone(), config.clone()));
        LearningSystem::new(pool, config, rules)
    }

    fn attempt(action: ActionType, source: PlanSource, success: bool) -> RecoveryAttempt {
        let mut plan = RecoveryPlan::retry(Duration::ZERO, "ip banned");
        plan.action = action;
        plan.source = source;
        plan.params.insert("proxy_id".into(), serde_json::json!("p1"));
        RecoveryAttempt {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: "task".into(),
            execution_id: "exec".into(),
            detected_error: detector::detect(&FetchFailure::status(403), "https://www.shop.com/x", None),
            plan,
            success,
            duration: Duration::from_millis(5),
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_signature_is_action_inclusive_and_stable() {
        let a = error_signature(ErrorPattern::Blocked, "shop.com", ActionType::SwitchProxy);
        let b = error_signature(ErrorPattern::Blocked, "shop.com", ActionType::AddDelay);
        assert_ne!(a, b);
        assert_eq!(a, error_signature(ErrorPattern::Blocked, "SHOP.com", ActionType::SwitchProxy));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_base_domain() {
        assert_eq!(base_domain("www.shop.com"), "shop.com");
        assert_eq!(base_domain("m.shop.com"), "shop.com");
        assert_eq!(base_domain("mobile.shop.com"), "shop.com");
        assert_eq!(base_domain("api.shop.com"), "api.shop.com");
        assert_eq!(base_domain("www."), "www.");
    }

    #[test]
    fn test_third_success_promotes() {
        let s = system();
        assert!(s.record(&attempt(ActionType::SwitchProxy, PlanSource::Ai, true), None).is_none());
        assert!(s.record(&attempt(ActionType::SwitchProxy, PlanSource::Ai, false), None).is_none());
        assert!(s.record(&attempt(ActionType::SwitchProxy, PlanSource::Ai, true), None).is_none());
        let rule = s
            .record(&attempt(ActionType::SwitchProxy, PlanSource::Ai, true), Some("rotating works"))
            .unwrap();
        assert!(rule.is_learned);
        assert_eq!(rule.priority, LEARNED_RULE_PRIORITY);
        assert_eq!(rule.pattern, Some(ErrorPattern::Blocked));
        assert_eq!(rule.conditions[0].value, "shop.com");
        assert!(!rule.action_params.contains_key("proxy_id"));

        let sig = error_signature(ErrorPattern::Blocked, "www.shop.com", ActionType::SwitchProxy);
        let rows = learned_repo::get_by_signature(&s.pool, &sig).unwrap();
        assert_eq!(rows.iter().filter(|r| r.promoted_to_rule).count(), 3);
        assert!(rows.iter().filter(|r| r.promoted_to_rule).all(|r| r.rule_id.as_deref() == Some(rule.id.as_str())));

        let stats = s.stats().unwrap();
        assert_eq!(stats, LearningStats { total: 4, successful: 3, promoted: 3 });
    }

    #[test]
    fn test_signature_promotes_into_a_single_rule() {
        let s = system();
        let mut promoted_ids = Vec::new();
        for _ in 0..7 {
            if let Some(rule) = s.record(&attempt(ActionType::SwitchProxy, PlanSource::Ai, true), None) {
                promoted_ids.push(rule.id);
            }
        }
        // Promotions at the 3rd and 6th success, both into the same rule.
        assert_eq!(promoted_ids.len(), 2);
        assert_eq!(promoted_ids[0], promoted_ids[1]);

        let learned: Vec<_> = s.rules.list().unwrap().into_iter().filter(|r| r.is_learned).collect();
        assert_eq!(learned.len(), 1);

        let sig = error_signature(ErrorPattern::Blocked, "www.shop.com", ActionType::SwitchProxy);
        let rows = learned_repo::get_by_signature(&s.pool, &sig).unwrap();
        assert_eq!(rows.iter().filter(|r| r.promoted_to_rule).count(), 6);
        assert!(rows
            .iter()
            .filter(|r| r.promoted_to_rule)
            .all(|r| r.rule_id.as_deref() == Some(learned[0].id.as_str())));
    }

    #[test]
    fn test_non_ai_plans_are_ignored() {
        let s = system();
        for _ in 0..5 {
            assert!(s.record(&attempt(ActionType::SwitchProxy, PlanSource::Rule, true), None).is_none());
        }
        assert_eq!(s.stats().unwrap().total, 0);
    }
}
