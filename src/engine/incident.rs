//! Incident reporter: the investigation record written when recovery gives up.

use std::sync::Arc;

use async_trait::async_trait;

use super::types::{DetectedError, ErrorPattern, PlanSource, RecoveryAttempt};
use crate::db::models::{
    CreateIncidentInput, Incident, IncidentFilter, IncidentPriority, IncidentStatus, PageSnapshot,
};
use crate::db::repos::recovery::incidents as incident_repo;
use crate::db::DbPool;
use crate::error::AppError;

/// Attempts at or above this count raise the priority to `high`.
const HIGH_PRIORITY_ATTEMPTS: usize = 3;

/// Browser-side collaborator that can capture the page a task was stuck on.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn capture(&self, task_id: &str, url: &str) -> Result<Option<PageSnapshot>, AppError>;
}

/// Everything the reporter needs about one exhausted task.
#[derive(Debug, Clone)]
pub struct IncidentContext {
    pub task_id: String,
    pub execution_id: String,
    pub detected: DetectedError,
    pub attempts: Vec<RecoveryAttempt>,
    pub ai_failure: Option<String>,
}

impl IncidentContext {
    /// Reasons of every AI-sourced plan, oldest first.
    fn ai_reasoning(&self) -> Option<String> {
        let reasons: Vec<&str> = self
            .attempts
            .iter()
            .filter(|a| a.plan.source == PlanSource::Ai)
            .map(|a| a.plan.reason.as_str())
            .collect();
        (!reasons.is_empty()).then(|| reasons.join("\n"))
    }
}

pub fn calculate_priority(pattern: ErrorPattern, attempts: usize, ai_failed: bool) -> IncidentPriority {
    match pattern {
        ErrorPattern::Captcha | ErrorPattern::AuthRequired => IncidentPriority::Critical,
        _ if ai_failed || attempts >= HIGH_PRIORITY_ATTEMPTS => IncidentPriority::High,
        ErrorPattern::Blocked | ErrorPattern::RateLimited => IncidentPriority::Medium,
        _ => IncidentPriority::Low,
    }
}

pub fn suggested_actions(pattern: ErrorPattern) -> Vec<String> {
    let items: &[&str] = match pattern {
        ErrorPattern::Captcha => &[
            "Solve the CAPTCHA manually and export the session cookies",
            "Consider a CAPTCHA solver integration for this domain",
            "Lower the crawl rate to avoid triggering the challenge",
        ],
        ErrorPattern::AuthRequired => &[
            "Check that the stored credentials for this domain are still valid",
            "Log in manually and refresh the session",
        ],
        ErrorPattern::Blocked => &[
            "Verify the proxy pool is not exhausted or flagged for this domain",
            "Try residential proxies or a different geo location",
            "Review request headers and browser fingerprint",
        ],
        ErrorPattern::RateLimited => &[
            "Increase the delay between requests for this domain",
            "Spread requests over more proxies",
        ],
        ErrorPattern::LayoutChanged => &[
            "Review the DOM snapshot for structural changes",
            "Update the extraction selectors",
        ],
        ErrorPattern::Timeout | ErrorPattern::ConnectionError => &[
            "Check whether the site is reachable from outside the proxy pool",
            "Raise the fetch timeout if the site is slow",
        ],
        ErrorPattern::NotFound => &[
            "Confirm the URL still exists and remove it from the crawl if not",
        ],
        ErrorPattern::ServerError => &[
            "Wait for the site to recover and retry later",
        ],
        ErrorPattern::Unknown => &[
            "Inspect the raw error and page snapshot",
            "Add a recovery rule once the failure is understood",
        ],
    };
    items.iter().map(|s| s.to_string()).collect()
}

pub struct IncidentReporter {
    pool: DbPool,
    snapshots: Option<Arc<dyn SnapshotProvider>>,
}

impl IncidentReporter {
    pub fn new(pool: DbPool, snapshots: Option<Arc<dyn SnapshotProvider>>) -> Self {
        Self { pool, snapshots }
    }

    /// Build and persist the incident. A failing snapshot capture is logged and skipped.
    pub async fn report(&self, ctx: IncidentContext) -> Result<Incident, AppError> {
        let detected = &ctx.detected;
        let snapshot = match self.snapshots {
            Some(ref provider) => match provider.capture(&ctx.task_id, &detected.url).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(task_id = %ctx.task_id, error = %e, "Page snapshot capture failed");
                    None
                }
            },
            None => None,
        };

        let priority = calculate_priority(detected.pattern, ctx.attempts.len(), ctx.ai_failure.is_some());
        let status = if incident_repo::exists_for(&self.pool, &detected.domain, detected.pattern)? {
            IncidentStatus::Recurring
        } else {
            IncidentStatus::Open
        };

        let incident = incident_repo::create(
            &self.pool,
            CreateIncidentInput {
                task_id: ctx.task_id.clone(),
                execution_id: ctx.execution_id.clone(),
                domain: detected.domain.clone(),
                url: detected.url.clone(),
                error_pattern: detected.pattern,
                error_message: detected.raw_error.clone(),
                status_code: detected.status_code,
                ai_reasoning: ctx.ai_reasoning(),
                ai_failure: ctx.ai_failure.clone(),
                attempts: ctx.attempts,
                snapshot,
                priority,
                suggested_actions: suggested_actions(detected.pattern),
                status,
            },
        )?;

        tracing::warn!(
            incident_id = %incident.id,
            task_id = %incident.task_id,
            domain = %incident.domain,
            pattern = %incident.error_pattern,
            priority = %incident.priority,
            status = %incident.status,
            "Recovery exhausted, incident opened",
        );
        Ok(incident)
    }

    pub fn get(&self, id: &str) -> Result<Incident, AppError> {
        incident_repo::get_by_id(&self.pool, id)
    }

    pub fn list(&self, filter: &IncidentFilter) -> Result<Vec<Incident>, AppError> {
        incident_repo::list(&self.pool, filter)
    }

    pub fn assign(&self, id: &str, assignee: &str) -> Result<Incident, AppError> {
        incident_repo::assign(&self.pool, id, assignee)
    }

    pub fn update_status(
        &self,
        id: &str,
        status: IncidentStatus,
        notes: Option<&str>,
    ) -> Result<Incident, AppError> {
        let incident = incident_repo::update_status(&self.pool, id, status, notes)?;
        tracing::info!(incident_id = %id, status = %status, "Incident status changed");
        Ok(incident)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::engine::detector;
    use crate::engine::types::{FetchFailure, RecoveryPlan};
    use std::time::Duration;

    struct FixedSnapshot;

    #[async_trait]
    impl SnapshotProvider for FixedSnapshot {
        async fn capture(&self, _task_id: &str, url: &str) -> Result<Option<PageSnapshot>, AppError> {
            Ok(Some(PageSnapshot {
                title: Some("Just a moment...".into()),
                final_url: Some(url.to_string()),
                ..Default::default()
            }))
        }
    }

    struct BrokenSnapshot;

    #[async_trait]
    impl SnapshotProvider for BrokenSnapshot {
        async fn capture(&self, _task_id: &str, _url: &str) -> Result<Option<PageSnapshot>, AppError> {
            Err(AppError::Internal("browser gone".into()))
        }
    }

    fn ctx(status: u16, attempts: usize) -> IncidentContext {
        let detected = detector::detect(&FetchFailure::status(status), "https://shop.com/item/9", None);
        let attempts = (0..attempts)
            .map(|i| {
                let mut plan = RecoveryPlan::retry(Duration::from_secs(1), format!("ai guess {i}"));
                plan.source = PlanSource::Ai;
                RecoveryAttempt {
                    id: format!("a{i}"),
                    task_id: "task-1".into(),
                    execution_id: "exec-1".into(),
                    detected_error: detected.clone(),
                    plan,
                    success: false,
                    duration: Duration::from_millis(20),
                    timestamp: chrono::Utc::now(),
                }
            })
            .collect();
        IncidentContext {
            task_id: "task-1".into(),
            execution_id: "exec-1".into(),
            detected,
            attempts,
            ai_failure: None,
        }
    }

    #[test]
    fn test_priority_rules() {
        assert_eq!(calculate_priority(ErrorPattern::Captcha, 0, false), IncidentPriority::Critical);
        assert_eq!(calculate_priority(ErrorPattern::AuthRequired, 5, true), IncidentPriority::Critical);
        assert_eq!(calculate_priority(ErrorPattern::Timeout, 0, true), IncidentPriority::High);
        assert_eq!(calculate_priority(ErrorPattern::Blocked, 3, false), IncidentPriority::High);
        assert_eq!(calculate_priority(ErrorPattern::Blocked, 2, false), IncidentPriority::Medium);
        assert_eq!(calculate_priority(ErrorPattern::RateLimited, 1, false), IncidentPriority::Medium);
        assert_eq!(calculate_priority(ErrorPattern::NotFound, 1, false), IncidentPriority::Low);
    }

    #[test]
    fn test_suggestions_are_pattern_specific() {
        assert!(suggested_actions(ErrorPattern::Captcha)[0].contains("CAPTCHA"));
        assert!(suggested_actions(ErrorPattern::LayoutChanged).iter().any(|s| s.contains("selectors")));
        for p in ErrorPattern::ALL {
            assert!(!suggested_actions(p).is_empty());
        }
    }

    #[tokio::test]
    async fn test_report_persists_history_and_snapshot() {
        let reporter = IncidentReporter::new(init_test_db().unwrap(), Some(Arc::new(FixedSnapshot)));
        let incident = reporter.report(ctx(403, 3)).await.unwrap();
        assert_eq!(incident.status, IncidentStatus::Open);
        assert_eq!(incident.priority, IncidentPriority::High);
        assert_eq!(incident.attempts.len(), 3);
        assert_eq!(incident.error_pattern, ErrorPattern::Blocked);
        assert_eq!(incident.status_code, Some(403));
        assert!(incident.ai_reasoning.as_deref().unwrap().contains("ai guess 2"));
        assert_eq!(incident.snapshot.unwrap().title.as_deref(), Some("Just a moment..."));
    }

    #[tokio::test]
    async fn test_second_incident_is_recurring() {
        let reporter = IncidentReporter::new(init_test_db().unwrap(), None);
        assert_eq!(reporter.report(ctx(403, 1)).await.unwrap().status, IncidentStatus::Open);
        assert_eq!(reporter.report(ctx(403, 1)).await.unwrap().status, IncidentStatus::Recurring);
        // A different pattern on the same domain starts fresh.
        assert_eq!(reporter.report(ctx(429, 1)).await.unwrap().status, IncidentStatus::Open);
    }

    #[tokio::test]
    async fn test_snapshot_failure_is_not_fatal() {
        let reporter = IncidentReporter::new(init_test_db().unwrap(), Some(Arc::new(BrokenSnapshot)));
        let incident = reporter.report(ctx(429, 1)).await.unwrap();
        assert!(incident.snapshot.is_none());
    }

    #[tokio::test]
    async fn test_triage_workflow() {
        let reporter = IncidentReporter::new(init_test_db().unwrap(), None);
        let incident = reporter.report(ctx(403, 1)).await.unwrap();

        let assigned = reporter.assign(&incident.id, "oncall").unwrap();
        assert_eq!(assigned.assigned_to.as_deref(), Some("oncall"));

        reporter.update_status(&incident.id, IncidentStatus::InProgress, None).unwrap();
        let resolved = reporter
            .update_status(&incident.id, IncidentStatus::Resolved, Some("rotated proxy pool"))
            .unwrap();
        assert!(resolved.resolved_at.is_some());
        assert_eq!(resolved.resolution_notes.as_deref(), Some("rotated proxy pool"));

        let err = reporter.update_status(&incident.id, IncidentStatus::InProgress, None).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let open = reporter
            .list(&IncidentFilter { status: Some(IncidentStatus::Open), ..Default::default() })
            .unwrap();
        assert!(open.is_empty());
    }
}
