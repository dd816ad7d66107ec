//! Rule engine: first-match-wins over operator and learned rules.
//!
//! Enabled rules are cached in priority order with their regexes compiled.
//! Matching only takes a read lock; a stale cache is reloaded on a blocking
//! task while readers keep using the old list.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use regex::Regex;

use super::actions;
use super::config_manager::ConfigManager;
use super::types::{ActionType, DetectedError, PlanSource, RecoveryPlan};
use crate::db::models::{
    ConditionField, ConditionOperator, CreateRuleInput, RecoveryRule, RuleCondition, UpdateRuleInput,
};
use crate::db::repos::recovery::rules as rule_repo;
use crate::db::DbPool;
use crate::error::AppError;

// =============================================================================
// Compiled conditions
// =============================================================================

#[derive(Debug)]
enum Matcher {
    Equals(String),
    Contains(String),
    Regex(Regex),
    Gt(i64),
    Lt(i64),
}

#[derive(Debug)]
struct CompiledCondition {
    field: ConditionField,
    matcher: Matcher,
}

fn parse_int(raw: &str) -> Result<i64, AppError> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| AppError::Validation(format!("'{raw}' is not an integer")))
}

fn compile_condition(cond: &RuleCondition) -> Result<CompiledCondition, AppError> {
    let matcher = match cond.operator {
        ConditionOperator::Equals => Matcher::Equals(cond.value.to_lowercase()),
        ConditionOperator::Contains => Matcher::Contains(cond.value.to_lowercase()),
        ConditionOperator::Regex => Matcher::Regex(
            Regex::new(&cond.value)
                .map_err(|e| AppError::Validation(format!("Invalid regex '{}': {e}", cond.value)))?,
        ),
        ConditionOperator::Gt => Matcher::Gt(parse_int(&cond.value)?),
        ConditionOperator::Lt => Matcher::Lt(parse_int(&cond.value)?),
    };
    Ok(CompiledCondition { field: cond.field, matcher })
}

impl CompiledCondition {
    fn field_value(&self, error: &DetectedError) -> Option<String> {
        match self.field {
            ConditionField::Domain => Some(error.domain.clone()),
            ConditionField::UrlPattern => Some(error.url.clone()),
            ConditionField::ErrorContains => Some(error.raw_error.clone()),
            ConditionField::StatusCode => error.status_code.map(|c| c.to_string()),
            ConditionField::PageContent => error.page_content_excerpt.clone(),
        }
    }

    fn matches(&self, error: &DetectedError) -> bool {
        let Some(value) = self.field_value(error) else {
            return false;
        };
        match &self.matcher {
            Matcher::Equals(expected) => value.to_lowercase() == *expected,
            Matcher::Contains(needle) => value.to_lowercase().contains(needle.as_str()),
            Matcher::Regex(re) => re.is_match(&value),
            Matcher::Gt(n) => value.trim().parse::<i64>().is_ok_and(|v| v > *n),
            Matcher::Lt(n) => value.trim().parse::<i64>().is_ok_and(|v| v < *n),
        }
    }
}

#[derive(Debug)]
struct CompiledRule {
    rule: RecoveryRule,
    conditions: Vec<CompiledCondition>,
}

impl CompiledRule {
    fn compile(rule: RecoveryRule) -> Result<Self, AppError> {
        let conditions = rule
            .conditions
            .iter()
            .map(compile_condition)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rule, conditions })
    }

    fn matches(&self, error: &DetectedError) -> bool {
        self.rule.pattern.map_or(true, |p| p == error.pattern)
            && self.conditions.iter().all(|c| c.matches(error))
    }
}

// =============================================================================
// Cache
// =============================================================================

struct Cache {
    rules: Vec<Arc<CompiledRule>>,
    loaded_at: Instant,
}

/// Load and compile enabled rules. A rule that no longer compiles is skipped.
fn load(pool: &DbPool) -> Result<Vec<Arc<CompiledRule>>, AppError> {
    let mut compiled = Vec::new();
    for rule in rule_repo::get_enabled(pool)? {
        let id = rule.id.clone();
        match CompiledRule::compile(rule) {
            Ok(c) => compiled.push(Arc::new(c)),
            Err(e) => tracing::warn!(rule_id = %id, error = %e, "Skipping rule that fails to compile"),
        }
    }
    Ok(compiled)
}

fn replace_cache(cache: &RwLock<Cache>, rules: Vec<Arc<CompiledRule>>) -> usize {
    let count = rules.len();
    let mut guard = cache.write().unwrap_or_else(|e| e.into_inner());
    *guard = Cache { rules, loaded_at: Instant::now() };
    count
}

// =============================================================================
// Engine
// =============================================================================

pub struct RuleEngine {
    pool: DbPool,
    config: Arc<ConfigManager>,
    cache: Arc<RwLock<Cache>>,
    refreshing: Arc<AtomicBool>,
}

impl RuleEngine {
    /// Build with an initial load. An unreadable table starts with no rules.
    pub fn new(pool: DbPool, config: Arc<ConfigManager>) -> Self {
        let rules = load(&pool).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to load recovery rules, starting empty");
            Vec::new()
        });
        tracing::debug!(count = rules.len(), "Recovery rules loaded");
        Self {
            pool,
            config,
            cache: Arc::new(RwLock::new(Cache { rules, loaded_at: Instant::now() })),
            refreshing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Synchronous reload. Used after writes and by the background refresher.
    pub fn refresh(&self) -> Result<usize, AppError> {
        let rules = load(&self.pool)?;
        Ok(replace_cache(&self.cache, rules))
    }

    /// Reload on a blocking task so async callers never stall on SQLite.
    pub async fn refresh_now(&self) -> Result<usize, AppError> {
        let pool = self.pool.clone();
        let rules = tokio::task::spawn_blocking(move || load(&pool))
            .await
            .map_err(|e| AppError::Internal(format!("rule refresh task failed: {e}")))??;
        let count = replace_cache(&self.cache, rules);
        tracing::info!(count, "Recovery rules refreshed");
        Ok(count)
    }

    pub fn is_stale(&self) -> bool {
        let ttl = self.config.settings().rules_cache_ttl;
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache.loaded_at.elapsed() >= ttl
    }

    /// Start a background reload when the cache is stale and none is running.
    fn refresh_if_stale(&self) {
        if !self.is_stale() || self.refreshing.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.refreshing.store(false, Ordering::Release);
            return;
        };
        let pool = self.pool.clone();
        let cache = Arc::clone(&self.cache);
        let refreshing = Arc::clone(&self.refreshing);
        handle.spawn_blocking(move || {
            match load(&pool) {
                Ok(rules) => {
                    let count = replace_cache(&cache, rules);
                    tracing::debug!(count, "Stale rule cache reloaded");
                }
                Err(e) => tracing::warn!(error = %e, "Rule cache reload failed, keeping stale rules"),
            }
            refreshing.store(false, Ordering::Release);
        });
    }

    /// First enabled rule, in priority order, whose pattern and conditions match.
    pub fn match_rule(&self, error: &DetectedError) -> Option<RecoveryRule> {
        self.refresh_if_stale();
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache
            .rules
            .iter()
            .find(|r| r.matches(error))
            .map(|r| r.rule.clone())
    }

    /// Cached rules in evaluation order.
    pub fn cached(&self) -> Vec<RecoveryRule> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache.rules.iter().map(|r| r.rule.clone()).collect()
    }

    /// Turn a matched rule into a plan. Learned rules are tagged as such.
    pub fn to_plan(&self, rule: &RecoveryRule) -> Result<RecoveryPlan, AppError> {
        let source = if rule.is_learned { PlanSource::Learned } else { PlanSource::Rule };
        let mut plan = actions::build_plan_for(
            rule.action,
            &rule.action_params,
            format!("matched rule '{}'", rule.name),
            source,
        )?;
        if rule.action == ActionType::Retry && !rule.action_params.contains_key("delay_seconds") {
            plan.retry_delay = std::time::Duration::from_secs(rule.retry_delay_secs.max(0) as u64);
        }
        plan.rule_id = Some(rule.id.clone());
        Ok(plan)
    }

    // ── CRUD (write-through) ───────────────────────────────────────

    pub fn list(&self) -> Result<Vec<RecoveryRule>, AppError> {
        rule_repo::get_all(&self.pool)
    }

    pub fn get(&self, id: &str) -> Result<RecoveryRule, AppError> {
        rule_repo::get_by_id(&self.pool, id)
    }

    pub fn create(&self, input: CreateRuleInput) -> Result<RecoveryRule, AppError> {
        if let Some(action) = input.action {
            actions::spec(action).parse(&input.action_params)?;
        }
        validate_conditions(&input.conditions)?;
        let rule = rule_repo::create(&self.pool, input)?;
        self.refresh()?;
        tracing::info!(rule_id = %rule.id, name = %rule.name, priority = rule.priority, "Recovery rule created");
        Ok(rule)
    }

    pub fn update(&self, id: &str, input: UpdateRuleInput) -> Result<RecoveryRule, AppError> {
        if input.action.is_some() || input.action_params.is_some() {
            let existing = rule_repo::get_by_id(&self.pool, id)?;
            let action = input.action.unwrap_or(existing.action);
            let params = input.action_params.as_ref().unwrap_or(&existing.action_params);
            actions::spec(action).parse(params)?;
        }
        if let Some(ref conditions) = input.conditions {
            validate_conditions(conditions)?;
        }
        let rule = rule_repo::update(&self.pool, id, input)?;
        self.refresh()?;
        tracing::info!(rule_id = %rule.id, "Recovery rule updated");
        Ok(rule)
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), AppError> {
        rule_repo::set_enabled(&self.pool, id, enabled)?;
        self.refresh()?;
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<bool, AppError> {
        let deleted = rule_repo::delete(&self.pool, id)?;
        self.refresh()?;
        if deleted {
            tracing::info!(rule_id = id, "Recovery rule deleted");
        }
        Ok(deleted)
    }

    /// Atomic success/failure counter bump after a rule-driven plan ran.
    pub fn record_outcome(&self, id: &str, success: bool) -> Result<(), AppError> {
        rule_repo::record_outcome(&self.pool, id, success)
    }
}

fn validate_conditions(conditions: &[RuleCondition]) -> Result<(), AppError> {
    for cond in conditions {
        compile_condition(cond)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::engine::detector;
    use crate::engine::types::{ErrorPattern, FetchFailure};
    use serde_json::json;

    fn engine() -> RuleEngine {
        let pool = init_test_db().unwrap();
        let config = Arc::new(ConfigManager::new(pool.clone()));
        RuleEngine::new(pool, config)
    }

    fn rule(name: &str, priority: i64, pattern: Option<ErrorPattern>, action: ActionType) -> CreateRuleInput {
        CreateRuleInput {
            name: name.into(),
            priority: Some(priority),
            pattern,
            action: Some(action),
            ..Default::default()
        }
    }

    fn cond(field: ConditionField, operator: ConditionOperator, value: &str) -> RuleCondition {
        RuleCondition { field, operator, value: value.into() }
    }

    fn blocked_on(url: &str) -> DetectedError {
        detector::detect(&FetchFailure::status(403), url, None)
    }

    #[test]
    fn test_lowest_priority_wins() {
        let e = engine();
        e.create(rule("late", 50, Some(ErrorPattern::Blocked), ActionType::AddDelay)).unwrap();
        e.create(rule("early", 10, Some(ErrorPattern::Blocked), ActionType::SwitchProxy)).unwrap();
        e.create(rule("any", 5, Some(ErrorPattern::Captcha), ActionType::SendToDlq)).unwrap();

        let matched = e.match_rule(&blocked_on("https://shop.com/a")).unwrap();
        assert_eq!(matched.name, "early");
    }

    #[test]
    fn test_unset_pattern_matches_everything() {
        let e = engine();
        e.create(rule("catch-all", 999, None, ActionType::Retry)).unwrap();
        let detected = detector::detect(&FetchFailure::message("timeout"), "https://a.com", None);
        assert_eq!(e.match_rule(&detected).unwrap().name, "catch-all");
    }

    #[test]
    fn test_conditions_must_all_hold() {
        let e = engine();
        let mut input = rule("shop-5xx", 10, None, ActionType::AddDelay);
        input.conditions = vec![
            cond(ConditionField::Domain, ConditionOperator::Contains, "shop.com"),
            cond(ConditionField::StatusCode, ConditionOperator::Gt, "499"),
            cond(ConditionField::UrlPattern, ConditionOperator::Regex, r"/products/\d+"),
        ];
        e.create(input).unwrap();

        let hit = detector::detect(&FetchFailure::status(503), "https://www.shop.com/products/42", None);
        assert!(e.match_rule(&hit).is_some());
        let wrong_status = detector::detect(&FetchFailure::status(404), "https://www.shop.com/products/42", None);
        assert!(e.match_rule(&wrong_status).is_none());
        let wrong_path = detector::detect(&FetchFailure::status(503), "https://www.shop.com/about", None);
        assert!(e.match_rule(&wrong_path).is_none());
        let no_status = detector::detect(&FetchFailure::message("boom"), "https://www.shop.com/products/1", None);
        assert!(e.match_rule(&no_status).is_none());
    }

    #[test]
    fn test_lt_compares_numerically() {
        let e = engine();
        let mut input = rule("low-status", 10, None, ActionType::Retry);
        input.conditions = vec![cond(ConditionField::StatusCode, ConditionOperator::Lt, "500")];
        e.create(input).unwrap();
        assert!(e.match_rule(&blocked_on("https://a.com")).is_some());
        let d = detector::detect(&FetchFailure::status(502), "https://a.com", None);
        assert!(e.match_rule(&d).is_none());
    }

    #[test]
    fn test_invalid_rules_rejected() {
        let e = engine();
        let mut bad_regex = rule("r", 1, None, ActionType::Retry);
        bad_regex.conditions = vec![cond(ConditionField::UrlPattern, ConditionOperator::Regex, "(")];
        assert!(matches!(e.create(bad_regex), Err(AppError::Validation(_))));

        let mut bad_number = rule("n", 1, None, ActionType::Retry);
        bad_number.conditions = vec![cond(ConditionField::StatusCode, ConditionOperator::Gt, "4xx")];
        assert!(matches!(e.create(bad_number), Err(AppError::Validation(_))));

        let mut bad_params = rule("p", 1, None, ActionType::AddDelay);
        bad_params.action_params = json!({"seconds": "soon"}).as_object().cloned().unwrap();
        assert!(matches!(e.create(bad_params), Err(AppError::Validation(_))));
        assert!(e.list().unwrap().is_empty());
    }

    #[test]
    fn test_writes_refresh_cache() {
        let e = engine();
        let created = e.create(rule("r", 10, Some(ErrorPattern::Blocked), ActionType::SwitchProxy)).unwrap();
        assert_eq!(e.cached().len(), 1);

        e.set_enabled(&created.id, false).unwrap();
        assert!(e.match_rule(&blocked_on("https://a.com")).is_none());
        e.set_enabled(&created.id, true).unwrap();

        let updated = e
            .update(&created.id, UpdateRuleInput { priority: Some(1), ..Default::default() })
            .unwrap();
        assert_eq!(updated.priority, 1);
        assert_eq!(e.cached()[0].priority, 1);

        assert!(e.delete(&created.id).unwrap());
        assert!(e.cached().is_empty());
    }

    #[test]
    fn test_update_validates_params_against_new_action() {
        let e = engine();
        let created = e.create(rule("r", 10, None, ActionType::Retry)).unwrap();
        let input = UpdateRuleInput {
            action: Some(ActionType::SkipDomain),
            action_params: Some(json!({"minutes": "later"}).as_object().cloned().unwrap()),
            ..Default::default()
        };
        assert!(matches!(e.update(&created.id, input), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_to_plan_and_outcome() {
        let e = engine();
        let mut input = rule("retry-slow", 10, None, ActionType::Retry);
        input.retry_delay_secs = Some(12);
        let created = e.create(input).unwrap();

        let plan = e.to_plan(&created).unwrap();
        assert_eq!(plan.source, PlanSource::Rule);
        assert_eq!(plan.rule_id.as_deref(), Some(created.id.as_str()));
        assert_eq!(plan.retry_delay, std::time::Duration::from_secs(12));

        e.record_outcome(&created.id, true).unwrap();
        e.record_outcome(&created.id, false).unwrap();
        let stored = e.get(&created.id).unwrap();
        assert_eq!((stored.success_count, stored.failure_count), (1, 1));
    }

    #[tokio::test]
    async fn test_refresh_now_picks_up_external_writes() {
        let e = engine();
        rule_repo::create(&e.pool, rule("external", 10, None, ActionType::Retry)).unwrap();
        assert!(e.cached().is_empty());
        assert_eq!(e.refresh_now().await.unwrap(), 1);
        assert_eq!(e.cached()[0].name, "external");
    }
}
