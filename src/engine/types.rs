use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

// =============================================================================
// ErrorPattern
// =============================================================================

/// Categorized crawl failure. Every [`DetectedError`] carries exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPattern {
    Blocked,
    RateLimited,
    Captcha,
    Timeout,
    ConnectionError,
    LayoutChanged,
    AuthRequired,
    NotFound,
    ServerError,
    Unknown,
}

impl ErrorPattern {
    pub const ALL: [ErrorPattern; 10] = [
        ErrorPattern::Blocked,
        ErrorPattern::RateLimited,
        ErrorPattern::Captcha,
        ErrorPattern::Timeout,
        ErrorPattern::ConnectionError,
        ErrorPattern::LayoutChanged,
        ErrorPattern::AuthRequired,
        ErrorPattern::NotFound,
        ErrorPattern::ServerError,
        ErrorPattern::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorPattern::Blocked => "blocked",
            ErrorPattern::RateLimited => "rate_limited",
            ErrorPattern::Captcha => "captcha",
            ErrorPattern::Timeout => "timeout",
            ErrorPattern::ConnectionError => "connection_error",
            ErrorPattern::LayoutChanged => "layout_changed",
            ErrorPattern::AuthRequired => "auth_required",
            ErrorPattern::NotFound => "not_found",
            ErrorPattern::ServerError => "server_error",
            ErrorPattern::Unknown => "unknown",
        }
    }

    /// Operational severity used to break confidence ties. Higher wins.
    pub fn precedence(&self) -> u8 {
        match self {
            ErrorPattern::Captcha => 10,
            ErrorPattern::AuthRequired => 9,
            ErrorPattern::Blocked => 8,
            ErrorPattern::RateLimited => 7,
            ErrorPattern::LayoutChanged => 6,
            ErrorPattern::Timeout => 5,
            ErrorPattern::ConnectionError => 4,
            ErrorPattern::NotFound => 3,
            ErrorPattern::ServerError => 2,
            ErrorPattern::Unknown => 1,
        }
    }

    /// Multiplier applied to block and cooldown durations.
    pub fn severity_multiplier(&self) -> f64 {
        match self {
            ErrorPattern::Captcha => 10.0,
            ErrorPattern::Blocked => 5.0,
            ErrorPattern::RateLimited => 2.0,
            _ => 1.0,
        }
    }
}

impl fmt::Display for ErrorPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorPattern {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorPattern::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| AppError::Validation(format!("unknown error pattern '{s}'")))
    }
}

// =============================================================================
// ActionType
// =============================================================================

/// Closed set of remediation actions. Parameter schemas and parsing live in
/// [`super::actions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    SwitchProxy,
    AddDelay,
    SkipDomain,
    SendToDlq,
    Retry,
}

impl ActionType {
    pub const ALL: [ActionType; 5] = [
        ActionType::SwitchProxy,
        ActionType::AddDelay,
        ActionType::SkipDomain,
        ActionType::SendToDlq,
        ActionType::Retry,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::SwitchProxy => "switch_proxy",
            ActionType::AddDelay => "add_delay",
            ActionType::SkipDomain => "skip_domain",
            ActionType::SendToDlq => "send_to_dlq",
            ActionType::Retry => "retry",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionType::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| AppError::Validation(format!("unknown action '{s}'")))
    }
}

/// Where a plan came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    Rule,
    Ai,
    Learned,
    Default,
}

// =============================================================================
// Failure input / detection output
// =============================================================================

/// What the worker saw when the fetch failed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchFailure {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl FetchFailure {
    pub fn message(msg: impl Into<String>) -> Self {
        Self { message: Some(msg.into()), ..Default::default() }
    }

    pub fn status(code: u16) -> Self {
        Self { status_code: Some(code), ..Default::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedError {
    pub pattern: ErrorPattern,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub raw_error: String,
    pub domain: String,
    pub url: String,
    pub status_code: Option<u16>,
    pub page_content_excerpt: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub detected_at: DateTime<Utc>,
}

// =============================================================================
// Plans and attempts
// =============================================================================

pub type ActionParams = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub action: ActionType,
    #[serde(default)]
    pub params: ActionParams,
    pub reason: String,
    pub should_retry: bool,
    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,
    pub source: PlanSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}

impl RecoveryPlan {
    /// Plain retry, used when nothing better is available.
    pub fn retry(delay: Duration, reason: impl Into<String>) -> Self {
        Self {
            action: ActionType::Retry,
            params: ActionParams::new(),
            reason: reason.into(),
            should_retry: true,
            retry_delay: delay,
            source: PlanSource::Default,
            rule_id: None,
        }
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub id: String,
    pub task_id: String,
    pub execution_id: String,
    pub detected_error: DetectedError,
    pub plan: RecoveryPlan,
    pub success: bool,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

/// Decision published by a coordinator for its followers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub domain: String,
    pub pattern: ErrorPattern,
    pub plan: RecoveryPlan,
    pub coordinator_id: String,
    pub decided_at: DateTime<Utc>,
}

/// Serialize a `Duration` as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_round_trips_through_str() {
        for p in ErrorPattern::ALL {
            assert_eq!(p.as_str().parse::<ErrorPattern>().unwrap(), p);
            assert_eq!(serde_json::to_value(p).unwrap(), p.as_str());
        }
        assert!("weird".parse::<ErrorPattern>().is_err());
    }

    #[test]
    fn test_action_names_match_serde() {
        for a in ActionType::ALL {
            assert_eq!(serde_json::to_value(a).unwrap(), a.as_str());
        }
        assert_eq!("send_to_dlq".parse::<ActionType>().unwrap(), ActionType::SendToDlq);
    }

    #[test]
    fn test_precedence_order() {
        let mut ranked = ErrorPattern::ALL.to_vec();
        ranked.sort_by_key(|p| std::cmp::Reverse(p.precedence()));
        assert_eq!(ranked[0], ErrorPattern::Captcha);
        assert_eq!(ranked[1], ErrorPattern::AuthRequired);
        assert_eq!(ranked[2], ErrorPattern::Blocked);
        assert_eq!(*ranked.last().unwrap(), ErrorPattern::Unknown);
    }

    #[test]
    fn test_plan_serializes_with_nested_params() {
        let mut plan = RecoveryPlan::retry(Duration::from_secs(5), "try again");
        plan.params.insert("nested".into(), serde_json::json!({ "a": [1, 2, 3] }));
        plan.rule_id = Some("rule-1".into());
        let json = serde_json::to_string(&plan).unwrap();
        let back: RecoveryPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(back, plan);
        assert_eq!(back.retry_delay, Duration::from_millis(5_000));
    }
}
