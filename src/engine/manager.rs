//! `RecoveryManager`: the one entry point a crawl worker talks to.
//!
//! Construct one per process with injected store, pool and optional provider,
//! then share it behind an `Arc`. All sub-components hang off it; there is no
//! global state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;

use super::agent::RecoveryAgent;
use super::background::BackgroundRefresher;
use super::config_manager::ConfigManager;
use super::coordinator::{RecoveryCoordinator, Role};
use super::detector;
use super::domain_health::{DomainHealth, DomainStatus};
use super::incident::{IncidentContext, IncidentReporter, SnapshotProvider};
use super::learning::LearningSystem;
use super::provider::{self, LlmProvider};
use super::proxy::{DistributedProxyManager, ProxyManager};
use super::rules::RuleEngine;
use super::tracker::ErrorTracker;
use super::types::{
    ActionParams, ActionType, DetectedError, FetchFailure, PlanSource, RecoveryAttempt, RecoveryPlan,
};
use crate::config::AppConfig;
use crate::db::{self, DbPool};
use crate::error::AppError;
use crate::store::{self, SharedStore};

/// Delay for the plain retry returned while a domain is below the trigger thresholds.
const BELOW_THRESHOLD_DELAY: Duration = Duration::from_secs(2);

/// Delay for the retry used when a follower's wait or the AI call comes back empty.
const FALLBACK_RETRY_DELAY: Duration = Duration::from_secs(5);

// ============================================================================
// Builder
// ============================================================================

pub struct RecoveryManagerBuilder {
    pool: DbPool,
    store: SharedStore,
    worker_id: String,
    provider: Option<Arc<dyn LlmProvider>>,
    snapshots: Option<Arc<dyn SnapshotProvider>>,
    background: bool,
}

impl RecoveryManagerBuilder {
    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn snapshots(mut self, snapshots: Arc<dyn SnapshotProvider>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Start the cache refresher. Must be called from inside a Tokio runtime.
    pub fn background_refresh(mut self, enabled: bool) -> Self {
        self.background = enabled;
        self
    }

    pub fn build(self) -> RecoveryManager {
        let config = Arc::new(ConfigManager::new(self.pool.clone()));
        let rules = Arc::new(RuleEngine::new(self.pool.clone(), config.clone()));
        let inventory = Arc::new(ProxyManager::new(self.pool.clone()));
        let refresher = self
            .background
            .then(|| BackgroundRefresher::start(config.clone(), rules.clone(), inventory.clone()));

        RecoveryManager {
            tracker: ErrorTracker::new(self.store.clone(), config.clone()),
            health: DomainHealth::new(self.store.clone(), config.clone()),
            proxies: DistributedProxyManager::new(
                self.store.clone(),
                config.clone(),
                inventory,
                self.worker_id.clone(),
            ),
            agent: self.provider.map(|p| RecoveryAgent::new(p, config.clone())),
            learning: LearningSystem::new(self.pool.clone(), config.clone(), rules.clone()),
            coordinator: RecoveryCoordinator::new(self.store, config.clone(), self.worker_id.clone()),
            incidents: IncidentReporter::new(self.pool, self.snapshots),
            rules,
            config,
            worker_id: self.worker_id,
            tasks: Mutex::new(HashMap::new()),
            refresher: tokio::sync::Mutex::new(refresher),
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Per-task recovery history kept between `try_recover` and `record_outcome`.
#[derive(Default)]
struct TaskHistory {
    attempts: Vec<RecoveryAttempt>,
    ai_failure: Option<String>,
}

pub struct RecoveryManager {
    worker_id: String,
    config: Arc<ConfigManager>,
    tracker: ErrorTracker,
    health: DomainHealth,
    proxies: DistributedProxyManager,
    rules: Arc<RuleEngine>,
    agent: Option<RecoveryAgent>,
    learning: LearningSystem,
    coordinator: RecoveryCoordinator,
    incidents: IncidentReporter,
    tasks: Mutex<HashMap<String, TaskHistory>>,
    refresher: tokio::sync::Mutex<Option<BackgroundRefresher>>,
}

impl RecoveryManager {
    pub fn builder(pool: DbPool, store: SharedStore) -> RecoveryManagerBuilder {
        RecoveryManagerBuilder {
            pool,
            store,
            worker_id: format!("worker-{}", &uuid::Uuid::new_v4().to_string()[..8]),
            provider: None,
            snapshots: None,
            background: false,
        }
    }

    /// Wire everything from static config: database, store, provider, refresher.
    pub async fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        let pool = db::init_db(&config.database)?;
        let store = store::connect(&config.store).await?;
        let mut builder = Self::builder(pool, store)
            .worker_id(config.worker_id.clone())
            .background_refresh(true);
        if let Some(p) = provider::resolve_provider(&config.llm)? {
            builder = builder.provider(p);
        }
        let manager = builder.build();
        tracing::info!(
            worker_id = %manager.worker_id,
            ai = manager.agent.as_ref().map(|a| a.provider_name()).unwrap_or("disabled"),
            "Recovery manager ready",
        );
        Ok(manager)
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn config(&self) -> &Arc<ConfigManager> {
        &self.config
    }

    pub fn rules(&self) -> &Arc<RuleEngine> {
        &self.rules
    }

    pub fn proxies(&self) -> &DistributedProxyManager {
        &self.proxies
    }

    pub fn domain_health(&self) -> &DomainHealth {
        &self.health
    }

    pub fn tracker(&self) -> &ErrorTracker {
        &self.tracker
    }

    pub fn learning(&self) -> &LearningSystem {
        &self.learning
    }

    pub fn incidents(&self) -> &IncidentReporter {
        &self.incidents
    }

    // ── Entry point ────────────────────────────────────────────────

    /// Classify a failed fetch and return the plan the worker should execute.
    ///
    /// Returns [`AppError::RecoveryExhausted`] once the task has used up its
    /// attempts; an incident has been written by then.
    pub async fn try_recover(
        &self,
        task_id: &str,
        execution_id: &str,
        url: &str,
        failure: &FetchFailure,
        page_content: Option<&str>,
    ) -> Result<RecoveryPlan, AppError> {
        let started = Instant::now();
        let detected = detector::detect(failure, url, page_content);
        let domain = detected.domain.clone();
        let pattern = detected.pattern;
        tracing::debug!(
            task_id,
            domain = %domain,
            pattern = %pattern,
            confidence = detected.confidence,
            "Fetch failure classified",
        );

        let status = match self.health.record_failure(&domain, pattern).await {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!(domain = %domain, error = %e, "Domain health unavailable");
                None
            }
        };
        let trigger = match self.tracker.record_failure(&domain, pattern).await {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(domain = %domain, error = %e, "Error tracker unavailable, recovering uncoordinated");
                super::tracker::TriggerDecision {
                    should_recover: true,
                    reason: "error tracker unavailable".into(),
                }
            }
        };

        if let Some(status) = status.filter(|s| s.is_blocked) {
            return Ok(blocked_plan(&status));
        }

        if self.attempt_count(task_id) >= self.config.settings().max_attempts {
            return self.escalate(task_id, execution_id, detected).await;
        }

        let mut plan = if trigger.should_recover {
            tracing::info!(task_id, domain = %domain, pattern = %pattern, reason = %trigger.reason, "Recovery triggered");
            self.coordinated_plan(task_id, &detected).await
        } else {
            tracing::debug!(domain = %domain, reason = %trigger.reason, "Recovery not triggered");
            RecoveryPlan::retry(BELOW_THRESHOLD_DELAY, trigger.reason)
        };

        self.apply_side_effects(&domain, &mut plan).await;
        self.push_attempt(task_id, execution_id, detected, plan.clone(), started.elapsed());
        Ok(plan)
    }

    /// Coordinator decides and publishes; followers reuse or wait, then default.
    async fn coordinated_plan(&self, task_id: &str, detected: &DetectedError) -> RecoveryPlan {
        let domain = detected.domain.as_str();
        let pattern = detected.pattern;

        let role = match self.coordinator.try_acquire(domain, pattern).await {
            Ok(role) => role,
            Err(e) => {
                tracing::warn!(domain, pattern = %pattern, error = %e, "Coordination unavailable, deciding locally");
                return self.decide(task_id, detected).await;
            }
        };

        match role {
            Role::Follower(Some(result)) => result.plan,
            Role::Follower(None) => match self.coordinator.wait_for_result(domain, pattern).await {
                Ok(Some(result)) => result.plan,
                Ok(None) => {
                    tracing::info!(domain, pattern = %pattern, "Coordinator result timed out, retrying");
                    RecoveryPlan::retry(FALLBACK_RETRY_DELAY, "coordinator result not available in time")
                }
                Err(e) => {
                    tracing::warn!(domain, pattern = %pattern, error = %e, "Waiting for coordinator failed");
                    RecoveryPlan::retry(FALLBACK_RETRY_DELAY, "coordinator result unavailable")
                }
            },
            Role::Coordinator => {
                let plan = self.decide(task_id, detected).await;
                if let Err(e) = self.coordinator.publish_result(domain, pattern, &plan).await {
                    tracing::warn!(domain, pattern = %pattern, error = %e, "Failed to publish recovery result");
                    if let Err(e) = self.coordinator.release_lock(domain, pattern).await {
                        tracing::warn!(domain, error = %e, "Failed to release coordination lock");
                    }
                }
                plan
            }
        }
    }

    /// Rule, then AI, then a default. Always yields a plan.
    ///
    /// A failed AI call falls back to a plain retry; with no agent configured
    /// the pattern's recommended action is used instead.
    async fn decide(&self, task_id: &str, detected: &DetectedError) -> RecoveryPlan {
        if let Some(rule) = self.rules.match_rule(detected) {
            match self.rules.to_plan(&rule) {
                Ok(plan) => {
                    tracing::info!(rule_id = %rule.id, rule = %rule.name, action = %plan.action, "Rule matched");
                    return plan;
                }
                Err(e) => tracing::warn!(rule_id = %rule.id, error = %e, "Matched rule has unusable params"),
            }
        }

        if let Some(ref agent) = self.agent {
            if self.config.settings().agent_enabled {
                let history = self.history(task_id);
                match agent.decide(detected, &history).await {
                    Ok(plan) => return plan,
                    Err(e) => {
                        tracing::warn!(task_id, domain = %detected.domain, error = %e, "AI decision failed, retrying");
                        self.note_ai_failure(task_id, e.to_string());
                        return RecoveryPlan::retry(FALLBACK_RETRY_DELAY, format!("AI decision failed: {e}"));
                    }
                }
            }
        }

        detector::default_plan(detected)
    }

    /// Lease a proxy for `switch_proxy`, preferring the domain's working proxies;
    /// block the domain for `skip_domain`.
    async fn apply_side_effects(&self, domain: &str, plan: &mut RecoveryPlan) {
        match plan.action {
            ActionType::SwitchProxy => {
                let working = match self.health.working_proxies(domain).await {
                    Ok(w) => w,
                    Err(e) => {
                        tracing::warn!(domain, error = %e, "Working proxies unavailable");
                        Vec::new()
                    }
                };
                self.lease_proxy(domain, &working, plan).await;
            }
            ActionType::SkipDomain => {
                if let Err(e) = self.health.block(domain, plan.retry_delay).await {
                    tracing::warn!(domain, error = %e, "Failed to block domain");
                }
            }
            ActionType::AddDelay | ActionType::SendToDlq | ActionType::Retry => {}
        }
    }

    async fn lease_proxy(&self, domain: &str, working: &[String], plan: &mut RecoveryPlan) {
        match self.proxies.acquire_preferring(domain, working).await {
            Ok(Some(lease)) => {
                plan.params.insert("proxy_id".into(), json!(lease.proxy_id));
                plan.params.insert("proxy_server".into(), json!(lease.server));
            }
            Ok(None) => tracing::warn!(domain, "switch_proxy planned but no proxy is available"),
            Err(e) => tracing::warn!(domain, error = %e, "Proxy lease failed"),
        }
    }

    async fn escalate(
        &self,
        task_id: &str,
        execution_id: &str,
        detected: DetectedError,
    ) -> Result<RecoveryPlan, AppError> {
        let history = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.remove(task_id).unwrap_or_default()
        };
        let attempts = history.attempts.len();
        let domain = detected.domain.clone();
        let ctx = IncidentContext {
            task_id: task_id.to_string(),
            execution_id: execution_id.to_string(),
            detected,
            attempts: history.attempts,
            ai_failure: history.ai_failure,
        };
        match self.incidents.report(ctx).await {
            Ok(incident) => Err(AppError::RecoveryExhausted {
                domain,
                attempts,
                incident_id: incident.id,
            }),
            Err(e) => {
                tracing::error!(task_id, domain = %domain, error = %e, "Failed to record incident");
                let mut plan = RecoveryPlan::retry(Duration::ZERO, "recovery exhausted; incident not recorded");
                plan.action = ActionType::SendToDlq;
                plan.should_retry = false;
                Ok(plan)
            }
        }
    }

    // ── Outcomes ───────────────────────────────────────────────────

    /// Feed back whether a plan worked. Bookkeeping failures are logged, not returned.
    pub async fn record_outcome(&self, attempt: &RecoveryAttempt) -> Result<(), AppError> {
        if attempt.task_id.trim().is_empty() {
            return Err(AppError::Validation("Attempt has no task id".into()));
        }
        let domain = attempt.detected_error.domain.as_str();
        let pattern = attempt.detected_error.pattern;

        {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            if attempt.success {
                tasks.remove(&attempt.task_id);
            } else if let Some(stored) = tasks
                .get_mut(&attempt.task_id)
                .and_then(|h| h.attempts.iter_mut().find(|a| a.id == attempt.id))
            {
                stored.success = false;
                stored.duration = attempt.duration;
            }
        }

        if let Some(ref rule_id) = attempt.plan.rule_id {
            if let Err(e) = self.rules.record_outcome(rule_id, attempt.success) {
                tracing::warn!(rule_id = %rule_id, error = %e, "Failed to update rule counters");
            }
        }

        let ai_reasoning = (attempt.plan.source == PlanSource::Ai).then_some(attempt.plan.reason.as_str());
        if let Some(rule) = self.learning.record(attempt, ai_reasoning) {
            // Drop the cached AI plan so the fleet re-decides through the new rule.
            if let Err(e) = self.coordinator.invalidate(domain, pattern).await {
                tracing::warn!(rule_id = %rule.id, domain, error = %e, "Failed to invalidate cached recovery result");
            }
        }

        let proxy_id = attempt.plan.param_str("proxy_id");
        if let Some(proxy_id) = proxy_id {
            let res = if attempt.success {
                self.proxies.record_success(proxy_id, domain).await
            } else {
                self.proxies.record_failure(proxy_id, domain, pattern).await
            };
            if let Err(e) = res {
                tracing::warn!(proxy_id, domain, error = %e, "Failed to record proxy outcome");
            }
        }

        if attempt.success {
            self.reset_domain(domain, proxy_id).await;
        }

        tracing::debug!(
            task_id = %attempt.task_id,
            domain,
            action = %attempt.plan.action,
            success = attempt.success,
            "Recovery outcome recorded",
        );
        Ok(())
    }

    /// Finish the task's latest pending attempt and record it.
    pub async fn complete_attempt(
        &self,
        task_id: &str,
        success: bool,
    ) -> Result<RecoveryAttempt, AppError> {
        let mut attempt = self
            .history(task_id)
            .pop()
            .ok_or_else(|| AppError::NotFound(format!("Recovery attempt for task {task_id}")))?;
        attempt.success = success;
        attempt.duration = (chrono::Utc::now() - attempt.timestamp)
            .to_std()
            .unwrap_or(attempt.duration);
        self.record_outcome(&attempt).await?;
        Ok(attempt)
    }

    /// A clean fetch: reset streaks and credit the proxy that carried it.
    pub async fn record_fetch_success(&self, url: &str, proxy_id: Option<&str>) {
        let domain = detector::extract_domain(url);
        if let Some(proxy_id) = proxy_id {
            if let Err(e) = self.proxies.record_success(proxy_id, &domain).await {
                tracing::warn!(proxy_id, domain = %domain, error = %e, "Failed to record proxy success");
            }
        }
        self.reset_domain(&domain, proxy_id).await;
    }

    async fn reset_domain(&self, domain: &str, proxy_id: Option<&str>) {
        if let Err(e) = self.tracker.record_success(domain).await {
            tracing::warn!(domain, error = %e, "Failed to record success in error tracker");
        }
        if let Err(e) = self.health.record_success(domain, proxy_id).await {
            tracing::warn!(domain, error = %e, "Failed to record success in domain health");
        }
    }

    // ── Queries and maintenance ────────────────────────────────────

    pub async fn get_domain_status(&self, domain: &str) -> Result<DomainStatus, AppError> {
        self.health.get(domain).await
    }

    /// Out-of-band rule reload, e.g. after an operator edit.
    pub async fn refresh_rules(&self) -> Result<usize, AppError> {
        self.rules.refresh_now().await
    }

    /// Recovery history of a task, oldest first.
    pub fn history(&self, task_id: &str) -> Vec<RecoveryAttempt> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.get(task_id).map(|h| h.attempts.clone()).unwrap_or_default()
    }

    /// Stop background work. Safe to call more than once.
    pub async fn close(&self) -> Result<(), AppError> {
        let refresher = self.refresher.lock().await.take();
        if let Some(mut refresher) = refresher {
            refresher.shutdown().await;
        }
        tracing::info!(worker_id = %self.worker_id, "Recovery manager closed");
        Ok(())
    }

    fn attempt_count(&self, task_id: &str) -> usize {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.get(task_id).map_or(0, |h| h.attempts.len())
    }

    fn note_ai_failure(&self, task_id: &str, reason: String) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.entry(task_id.to_string()).or_default().ai_failure = Some(reason);
    }

    fn push_attempt(
        &self,
        task_id: &str,
        execution_id: &str,
        detected: DetectedError,
        plan: RecoveryPlan,
        duration: Duration,
    ) {
        let attempt = RecoveryAttempt {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            execution_id: execution_id.to_string(),
            detected_error: detected,
            plan,
            success: false,
            duration,
            timestamp: chrono::Utc::now(),
        };
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.entry(task_id.to_string()).or_default().attempts.push(attempt);
    }
}

/// The domain is blocked: wait out the remaining block.
fn blocked_plan(status: &DomainStatus) -> RecoveryPlan {
    let remaining = status
        .blocked_until
        .and_then(|until| (until - chrono::Utc::now()).to_std().ok())
        .unwrap_or(Duration::from_secs(60));
    let mut params = ActionParams::new();
    params.insert("minutes".into(), json!(remaining.as_secs().div_ceil(60)));
    RecoveryPlan {
        action: ActionType::SkipDomain,
        params,
        reason: format!("domain {} is blocked", status.domain),
        should_retry: true,
        retry_delay: remaining,
        source: PlanSource::Default,
        rule_id: None,
    }
}
