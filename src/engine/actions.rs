//! Action dispatch table.
//!
//! Each [`ActionType`] maps to exactly one [`ActionSpec`]: its tool description,
//! the JSON schema offered to the LLM, and the parser that turns raw arguments
//! (from a tool call, plain-text JSON, or a stored rule) into plan fields.
//! Unknown action names and malformed arguments fail here, at parse time.

use std::time::Duration;

use serde_json::{json, Value};

use super::provider::ToolDefinition;
use super::types::{ActionParams, ActionType, PlanSource, RecoveryPlan};
use crate::error::AppError;

const DEFAULT_DELAY_SECS: u64 = 30;
const MAX_DELAY_SECS: u64 = 3_600;
const DEFAULT_SKIP_MINUTES: u64 = 30;
const MAX_SKIP_MINUTES: u64 = 24 * 60;
const DEFAULT_RETRY_SECS: u64 = 5;

/// Plan fields produced by an action's parser.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedAction {
    pub params: ActionParams,
    pub should_retry: bool,
    pub retry_delay: Duration,
}

pub struct ActionSpec {
    pub action: ActionType,
    pub description: &'static str,
    schema: fn() -> Value,
    parse: fn(&ActionParams) -> Result<ParsedAction, AppError>,
}

impl ActionSpec {
    pub fn schema(&self) -> Value {
        (self.schema)()
    }

    pub fn parse(&self, args: &ActionParams) -> Result<ParsedAction, AppError> {
        (self.parse)(args)
    }

    pub fn tool_definition(&self) -> ToolDefinition {
        ToolDefinition::function(self.action.as_str(), self.description, self.schema())
    }
}

static ACTIONS: [ActionSpec; 5] = [
    ActionSpec {
        action: ActionType::SwitchProxy,
        description: "Retry the request through a different egress proxy. Use when the current IP \
                      appears blocked or fingerprinted.",
        schema: switch_proxy_schema,
        parse: parse_switch_proxy,
    },
    ActionSpec {
        action: ActionType::AddDelay,
        description: "Wait before retrying. Use for rate limiting or transient server overload.",
        schema: add_delay_schema,
        parse: parse_add_delay,
    },
    ActionSpec {
        action: ActionType::SkipDomain,
        description: "Pause all crawling of this domain for a number of minutes.",
        schema: skip_domain_schema,
        parse: parse_skip_domain,
    },
    ActionSpec {
        action: ActionType::SendToDlq,
        description: "Give up on this task and send it to the dead-letter queue for human review. \
                      Use for CAPTCHAs, login walls or permanent errors.",
        schema: send_to_dlq_schema,
        parse: parse_send_to_dlq,
    },
    ActionSpec {
        action: ActionType::Retry,
        description: "Retry the request as-is after a short delay. Use for one-off transient errors.",
        schema: retry_schema,
        parse: parse_retry,
    },
];

/// Look up the dispatch entry for an action.
pub fn spec(action: ActionType) -> &'static ActionSpec {
    // ACTIONS holds one entry per variant, in declaration order.
    &ACTIONS[action as usize]
}

/// Tool definitions offered to the recovery agent.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    ACTIONS.iter().map(ActionSpec::tool_definition).collect()
}

/// Build a plan from an action name and raw arguments.
pub fn build_plan(
    action_name: &str,
    args: &ActionParams,
    reason: impl Into<String>,
    source: PlanSource,
) -> Result<RecoveryPlan, AppError> {
    let action: ActionType = action_name.parse()?;
    build_plan_for(action, args, reason, source)
}

pub fn build_plan_for(
    action: ActionType,
    args: &ActionParams,
    reason: impl Into<String>,
    source: PlanSource,
) -> Result<RecoveryPlan, AppError> {
    let parsed = spec(action).parse(args)?;
    Ok(RecoveryPlan {
        action,
        params: parsed.params,
        reason: reason.into(),
        should_retry: parsed.should_retry,
        retry_delay: parsed.retry_delay,
        source,
        rule_id: None,
    })
}

// ── Parameter helpers ──────────────────────────────────────────────

/// Read a non-negative integer that may arrive as a JSON number or a numeric string.
fn read_u64(args: &ActionParams, key: &str) -> Result<Option<u64>, AppError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64))
            .map(Some)
            .ok_or_else(|| AppError::Validation(format!("'{key}' must be a non-negative number"))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| AppError::Validation(format!("'{key}' must be a number, got '{s}'"))),
        Some(other) => Err(AppError::Validation(format!("'{key}' must be a number, got {other}"))),
    }
}

fn read_str(args: &ActionParams, key: &str) -> Option<String> {
    args.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

// ── switch_proxy ───────────────────────────────────────────────────

fn switch_proxy_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "proxy_type": { "type": "string", "description": "Preferred proxy type, e.g. residential or datacenter" },
            "country": { "type": "string", "description": "Preferred ISO country code" },
            "reason": { "type": "string" }
        }
    })
}

fn parse_switch_proxy(args: &ActionParams) -> Result<ParsedAction, AppError> {
    let mut params = ActionParams::new();
    for key in ["proxy_type", "country"] {
        if let Some(v) = read_str(args, key) {
            params.insert(key.into(), Value::String(v));
        }
    }
    Ok(ParsedAction { params, should_retry: true, retry_delay: Duration::ZERO })
}

// ── add_delay ──────────────────────────────────────────────────────

fn add_delay_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "seconds": { "type": "integer", "minimum": 1, "maximum": MAX_DELAY_SECS, "description": "Delay before retrying" },
            "reason": { "type": "string" }
        }
    })
}

fn parse_add_delay(args: &ActionParams) -> Result<ParsedAction, AppError> {
    let secs = read_u64(args, "seconds")?
        .unwrap_or(DEFAULT_DELAY_SECS)
        .clamp(1, MAX_DELAY_SECS);
    let mut params = ActionParams::new();
    params.insert("seconds".into(), json!(secs));
    Ok(ParsedAction { params, should_retry: true, retry_delay: Duration::from_secs(secs) })
}

// ── skip_domain ────────────────────────────────────────────────────

fn skip_domain_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "minutes": { "type": "integer", "minimum": 1, "maximum": MAX_SKIP_MINUTES, "description": "How long to pause the domain" },
            "reason": { "type": "string" }
        }
    })
}

fn parse_skip_domain(args: &ActionParams) -> Result<ParsedAction, AppError> {
    let minutes = read_u64(args, "minutes")?
        .unwrap_or(DEFAULT_SKIP_MINUTES)
        .clamp(1, MAX_SKIP_MINUTES);
    let mut params = ActionParams::new();
    params.insert("minutes".into(), json!(minutes));
    Ok(ParsedAction {
        params,
        should_retry: true,
        retry_delay: Duration::from_secs(minutes * 60),
    })
}

// ── send_to_dlq ────────────────────────────────────────────────────

fn send_to_dlq_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "reason": { "type": "string", "description": "Why automated recovery should stop" }
        }
    })
}

fn parse_send_to_dlq(args: &ActionParams) -> Result<ParsedAction, AppError> {
    let mut params = ActionParams::new();
    if let Some(reason) = read_str(args, "reason") {
        params.insert("reason".into(), Value::String(reason));
    }
    Ok(ParsedAction { params, should_retry: false, retry_delay: Duration::ZERO })
}

// ── retry ──────────────────────────────────────────────────────────

fn retry_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "delay_seconds": { "type": "integer", "minimum": 0, "maximum": MAX_DELAY_SECS },
            "reason": { "type": "string" }
        }
    })
}

fn parse_retry(args: &ActionParams) -> Result<ParsedAction, AppError> {
    let secs = read_u64(args, "delay_seconds")?
        .unwrap_or(DEFAULT_RETRY_SECS)
        .min(MAX_DELAY_SECS);
    let mut params = ActionParams::new();
    params.insert("delay_seconds".into(), json!(secs));
    Ok(ParsedAction { params, should_retry: true, retry_delay: Duration::from_secs(secs) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: Value) -> ActionParams {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_table_is_indexed_by_variant() {
        for action in ActionType::ALL {
            assert_eq!(spec(action).action, action);
        }
        assert_eq!(tool_definitions().len(), ActionType::ALL.len());
    }

    #[test]
    fn test_add_delay_defaults_to_30s() {
        let plan = build_plan("add_delay", &ActionParams::new(), "slow down", PlanSource::Ai).unwrap();
        assert_eq!(plan.retry_delay, Duration::from_secs(30));
        assert!(plan.should_retry);
    }

    #[test]
    fn test_add_delay_accepts_string_seconds() {
        let plan = build_plan("add_delay", &args(json!({"seconds": "90"})), "", PlanSource::Ai).unwrap();
        assert_eq!(plan.retry_delay, Duration::from_secs(90));
        assert_eq!(plan.params["seconds"], json!(90));
    }

    #[test]
    fn test_skip_domain_minutes_to_duration() {
        let plan = build_plan("skip_domain", &args(json!({"minutes": 15})), "", PlanSource::Ai).unwrap();
        assert_eq!(plan.retry_delay, Duration::from_secs(15 * 60));
    }

    #[test]
    fn test_send_to_dlq_never_retries() {
        let plan = build_plan("send_to_dlq", &ActionParams::new(), "captcha", PlanSource::Ai).unwrap();
        assert!(!plan.should_retry);
    }

    #[test]
    fn test_unknown_action_rejected() {
        let err = build_plan("reboot_server", &ActionParams::new(), "", PlanSource::Ai).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_malformed_argument_rejected() {
        let err = build_plan("add_delay", &args(json!({"seconds": "soon"})), "", PlanSource::Ai).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_delay_is_clamped() {
        let plan = build_plan("add_delay", &args(json!({"seconds": 999_999})), "", PlanSource::Rule).unwrap();
        assert_eq!(plan.retry_delay, Duration::from_secs(MAX_DELAY_SECS));
    }
}
