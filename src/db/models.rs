use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::engine::types::{ActionParams, ActionType, ErrorPattern, RecoveryAttempt};
use crate::error::AppError;

/// Implements `as_str`, `Display` and `FromStr` for a unit enum from one name table.
macro_rules! str_enum {
    ($ty:ident, $what:literal, { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $name,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = AppError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok($ty::$variant),)+
                    other => Err(AppError::Validation(format!(concat!("unknown ", $what, " '{}'"), other))),
                }
            }
        }
    };
}

// ============================================================================
// Recovery Rules
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionField {
    Domain,
    UrlPattern,
    ErrorContains,
    StatusCode,
    PageContent,
}

str_enum!(ConditionField, "condition field", {
    Domain => "domain",
    UrlPattern => "url_pattern",
    ErrorContains => "error_contains",
    StatusCode => "status_code",
    PageContent => "page_content",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    Contains,
    Regex,
    Gt,
    Lt,
}

str_enum!(ConditionOperator, "condition operator", {
    Equals => "equals",
    Contains => "contains",
    Regex => "regex",
    Gt => "gt",
    Lt => "lt",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCondition {
    pub field: ConditionField,
    pub operator: ConditionOperator,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryRule {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    /// Lower value = evaluated first.
    pub priority: i64,
    pub enabled: bool,
    /// `None` matches every pattern.
    pub pattern: Option<ErrorPattern>,
    pub conditions: Vec<RuleCondition>,
    pub action: ActionType,
    pub action_params: ActionParams,
    pub max_retries: i64,
    pub retry_delay_secs: i64,
    pub is_learned: bool,
    pub learned_from: Option<String>,
    pub success_count: i64,
    pub failure_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateRuleInput {
    pub name: String,
    pub description: Option<String>,
    pub priority: Option<i64>,
    pub enabled: Option<bool>,
    pub pattern: Option<ErrorPattern>,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    pub action: Option<ActionType>,
    #[serde(default)]
    pub action_params: ActionParams,
    pub max_retries: Option<i64>,
    pub retry_delay_secs: Option<i64>,
    pub is_learned: Option<bool>,
    pub learned_from: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateRuleInput {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub priority: Option<i64>,
    pub enabled: Option<bool>,
    pub pattern: Option<Option<ErrorPattern>>,
    pub conditions: Option<Vec<RuleCondition>>,
    pub action: Option<ActionType>,
    pub action_params: Option<ActionParams>,
    pub max_retries: Option<i64>,
    pub retry_delay_secs: Option<i64>,
}

// ============================================================================
// Learned Actions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedAction {
    pub id: String,
    pub execution_id: String,
    pub task_id: String,
    pub error_pattern: ErrorPattern,
    pub error_signature: String,
    pub domain: String,
    pub action: ActionType,
    pub action_params: ActionParams,
    pub ai_reasoning: Option<String>,
    pub success: bool,
    pub promoted_to_rule: bool,
    pub rule_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct CreateLearnedActionInput {
    pub execution_id: String,
    pub task_id: String,
    pub error_pattern: ErrorPattern,
    pub error_signature: String,
    pub domain: String,
    pub action: ActionType,
    pub action_params: ActionParams,
    pub ai_reasoning: Option<String>,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LearningStats {
    pub total: i64,
    pub successful: i64,
    pub promoted: i64,
}

// ============================================================================
// Incidents
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentPriority {
    Low,
    Medium,
    High,
    Critical,
}

str_enum!(IncidentPriority, "incident priority", {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Open,
    InProgress,
    Resolved,
    Ignored,
    Recurring,
}

str_enum!(IncidentStatus, "incident status", {
    Open => "open",
    InProgress => "in_progress",
    Resolved => "resolved",
    Ignored => "ignored",
    Recurring => "recurring",
});

impl IncidentStatus {
    /// Allowed operator transitions. `recurring` behaves like `open`.
    pub fn can_transition_to(self, next: IncidentStatus) -> bool {
        use IncidentStatus::*;
        matches!(
            (self, next),
            (Open | Recurring, InProgress)
                | (Open | Recurring | InProgress, Resolved)
                | (Open | Recurring | InProgress, Ignored)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, IncidentStatus::Resolved | IncidentStatus::Ignored)
    }
}

/// Browser-side evidence captured when recovery gives up.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub screenshot_path: Option<String>,
    pub dom: Option<String>,
    pub title: Option<String>,
    pub final_url: Option<String>,
    #[serde(default)]
    pub cookies: Vec<serde_json::Value>,
    #[serde(default)]
    pub console_logs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub task_id: String,
    pub execution_id: String,
    pub domain: String,
    pub url: String,
    pub error_pattern: ErrorPattern,
    pub error_message: String,
    pub status_code: Option<u16>,
    pub attempts: Vec<RecoveryAttempt>,
    pub ai_reasoning: Option<String>,
    pub ai_failure: Option<String>,
    pub snapshot: Option<PageSnapshot>,
    pub priority: IncidentPriority,
    pub suggested_actions: Vec<String>,
    pub status: IncidentStatus,
    pub assigned_to: Option<String>,
    pub resolution_notes: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub resolved_at: Option<String>,
}

/// Everything needed to persist a new incident.
#[derive(Debug, Clone)]
pub struct CreateIncidentInput {
    pub task_id: String,
    pub execution_id: String,
    pub domain: String,
    pub url: String,
    pub error_pattern: ErrorPattern,
    pub error_message: String,
    pub status_code: Option<u16>,
    pub attempts: Vec<RecoveryAttempt>,
    pub ai_reasoning: Option<String>,
    pub ai_failure: Option<String>,
    pub snapshot: Option<PageSnapshot>,
    pub priority: IncidentPriority,
    pub suggested_actions: Vec<String>,
    pub status: IncidentStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IncidentFilter {
    pub status: Option<IncidentStatus>,
    pub domain: Option<String>,
    pub limit: Option<i64>,
}

// ============================================================================
// Proxies
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proxy {
    pub id: String,
    /// External identifier from the proxy provider.
    pub proxy_id: String,
    /// Full proxy URL, e.g. `http://1.2.3.4:8080`.
    pub server: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub address: String,
    pub port: u16,
    pub valid: bool,
    pub last_verified: Option<String>,
    pub country_code: Option<String>,
    pub city: Option<String>,
    pub proxy_type: String,
    pub failure_count: i64,
    pub success_count: i64,
    pub last_used: Option<String>,
    pub is_healthy: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateProxyInput {
    pub proxy_id: String,
    pub address: String,
    pub port: u16,
    pub scheme: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub country_code: Option<String>,
    pub city: Option<String>,
    pub proxy_type: Option<String>,
}

// ============================================================================
// System config
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfigEntry {
    pub key: String,
    /// Schemaless JSON value.
    pub value: serde_json::Value,
    pub description: Option<String>,
    pub category: String,
    pub editable: bool,
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incident_transitions() {
        use IncidentStatus::*;
        assert!(Open.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Resolved));
        assert!(InProgress.can_transition_to(Ignored));
        assert!(Recurring.can_transition_to(InProgress));
        assert!(!Resolved.can_transition_to(Open));
        assert!(!InProgress.can_transition_to(Open));
        assert!(!Ignored.can_transition_to(InProgress));
    }

    #[test]
    fn test_rule_serde_keeps_nested_params() {
        let mut params = ActionParams::new();
        params.insert("seconds".into(), serde_json::json!(45));
        params.insert("meta".into(), serde_json::json!({ "tags": ["a", "b"] }));
        let rule = RecoveryRule {
            id: "r1".into(),
            name: "slow down".into(),
            description: None,
            priority: 10,
            enabled: true,
            pattern: Some(ErrorPattern::RateLimited),
            conditions: vec![RuleCondition {
                field: ConditionField::StatusCode,
                operator: ConditionOperator::Gt,
                value: "428".into(),
            }],
            action: ActionType::AddDelay,
            action_params: params,
            max_retries: 3,
            retry_delay_secs: 45,
            is_learned: false,
            learned_from: None,
            success_count: 0,
            failure_count: 0,
            created_at: "2026-01-01T00:00:00Z".into(),
            updated_at: "2026-01-01T00:00:00Z".into(),
        };
        let json = serde_json::to_string(&rule).unwrap();
        let back: RecoveryRule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rule);
    }

    #[test]
    fn test_str_enums_parse() {
        assert_eq!("in_progress".parse::<IncidentStatus>().unwrap(), IncidentStatus::InProgress);
        assert_eq!("url_pattern".parse::<ConditionField>().unwrap(), ConditionField::UrlPattern);
        assert!("bogus".parse::<ConditionOperator>().is_err());
        assert!(IncidentPriority::Critical > IncidentPriority::High);
    }
}
