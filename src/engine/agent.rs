//! AI fallback used when no rule matches.
//!
//! The model picks one action from the dispatch table through function calling.
//! Whatever it answers, the agent returns a usable plan; only provider errors
//! and the deadline surface as `Err`.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use super::actions;
use super::config_manager::ConfigManager;
use super::detector::truncate;
use super::provider::{ChatMessage, LlmProvider, LlmResponse};
use super::types::{ActionParams, DetectedError, PlanSource, RecoveryAttempt, RecoveryPlan};
use crate::error::AppError;
use crate::store::with_deadline;

const MAX_HISTORY: usize = 3;
const MAX_FIELD_CHARS: usize = 500;
const FALLBACK_DELAY: Duration = Duration::from_secs(5);
pub const UNPARSEABLE_REASON: &str = "unparseable response";

const SYSTEM_PROMPT: &str = "\
You are the recovery planner for a distributed web crawler. A fetch has failed and \
you must choose exactly one remediation by calling one of the provided functions.

Actions:
- switch_proxy: retry through a different egress proxy (IP blocks, fingerprinting).
- add_delay: wait `seconds` before retrying (rate limits, overloaded servers).
- skip_domain: pause the whole domain for `minutes` (sustained blocking).
- send_to_dlq: stop and hand the task to a human (CAPTCHA, login walls, permanent errors).
- retry: retry as-is after `delay_seconds` (one-off transient errors).

Prefer the cheapest action likely to succeed. Do not repeat an action that already \
failed for this task unless the situation has changed. Always include a short `reason`.";

/// Plain-text fallback shape: `{"action": ..., "params": {...}, "reason": ...}`.
#[derive(Debug, Deserialize)]
struct TextDecision {
    action: String,
    #[serde(default)]
    params: ActionParams,
    #[serde(default)]
    reason: Option<String>,
}

pub struct RecoveryAgent {
    provider: Arc<dyn LlmProvider>,
    config: Arc<ConfigManager>,
}

impl RecoveryAgent {
    pub fn new(provider: Arc<dyn LlmProvider>, config: Arc<ConfigManager>) -> Self {
        Self { provider, config }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Providers without a ping capability are assumed reachable.
    pub async fn is_available(&self) -> bool {
        match self.provider.pingable() {
            Some(p) => p.is_available().await,
            None => true,
        }
    }

    /// Ask the model for a plan, bounded by the configured AI timeout.
    pub async fn decide(
        &self,
        error: &DetectedError,
        history: &[RecoveryAttempt],
    ) -> Result<RecoveryPlan, AppError> {
        let timeout = self.config.settings().ai_timeout;
        let messages = build_messages(error, history);
        let tools = actions::tool_definitions();

        tracing::debug!(
            provider = self.provider.name(),
            model = self.provider.model(),
            domain = %error.domain,
            pattern = %error.pattern,
            "Requesting AI recovery decision",
        );
        let response = with_deadline(
            "AI recovery decision",
            timeout,
            self.provider.chat_with_tools(&messages, &tools),
        )
        .await?;

        let plan = parse_response(&response);
        tracing::info!(
            domain = %error.domain,
            pattern = %error.pattern,
            action = %plan.action,
            reason = %plan.reason,
            "AI recovery decision",
        );
        Ok(plan)
    }
}

// ── Prompt ─────────────────────────────────────────────────────────

fn build_messages(error: &DetectedError, history: &[RecoveryAttempt]) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT)];
    if let Some(summary) = summarize_history(history) {
        messages.push(ChatMessage::user(summary));
    }
    messages.push(ChatMessage::user(describe_error(error)));
    messages
}

fn summarize_history(history: &[RecoveryAttempt]) -> Option<String> {
    if history.is_empty() {
        return None;
    }
    let start = history.len().saturating_sub(MAX_HISTORY);
    let mut out = String::from("Previous recovery attempts for this task:\n");
    for (i, attempt) in history[start..].iter().enumerate() {
        let _ = writeln!(
            out,
            "{}. {} on {} -> {} ({})",
            i + 1,
            attempt.plan.action,
            attempt.detected_error.pattern,
            if attempt.success { "succeeded" } else { "failed" },
            truncate(&attempt.plan.reason, 120),
        );
    }
    Some(out)
}

fn describe_error(error: &DetectedError) -> String {
    let mut out = String::from("Current failure:\n");
    let _ = writeln!(out, "pattern: {} (confidence {:.2})", error.pattern, error.confidence);
    let _ = writeln!(out, "domain: {}", error.domain);
    let _ = writeln!(out, "url: {}", error.url);
    if let Some(code) = error.status_code {
        let _ = writeln!(out, "status: {code}");
    }
    if !error.raw_error.is_empty() {
        let _ = writeln!(out, "error: {}", truncate(&error.raw_error, MAX_FIELD_CHARS));
    }
    if let Some(ref excerpt) = error.page_content_excerpt {
        let _ = writeln!(out, "page excerpt: {}", truncate(excerpt, MAX_FIELD_CHARS));
    }
    out
}

// ── Response parsing ───────────────────────────────────────────────

/// Tool call first, then JSON in the text, then a plain retry.
pub fn parse_response(response: &LlmResponse) -> RecoveryPlan {
    if let Some(call) = response.tool_calls.first() {
        match parse_tool_call(&call.name, &call.arguments) {
            Ok(plan) => return plan,
            Err(e) => tracing::warn!(tool = %call.name, error = %e, "Rejected AI tool call"),
        }
    }

    if let Some(ref content) = response.content {
        match parse_text(content) {
            Some(Ok(plan)) => return plan,
            Some(Err(e)) => tracing::warn!(error = %e, "Rejected AI text decision"),
            None => {}
        }
    }

    let mut plan = RecoveryPlan::retry(FALLBACK_DELAY, UNPARSEABLE_REASON);
    plan.source = PlanSource::Ai;
    plan
}

fn parse_tool_call(name: &str, arguments: &str) -> Result<RecoveryPlan, AppError> {
    let args: ActionParams = if arguments.trim().is_empty() {
        ActionParams::new()
    } else {
        serde_json::from_str(arguments)?
    };
    let reason = args
        .get("reason")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("AI selected {name}"));
    actions::build_plan(name, &args, reason, PlanSource::Ai)
}

/// `None` when the text holds no JSON object at all.
fn parse_text(content: &str) -> Option<Result<RecoveryPlan, AppError>> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end <= start {
        return None;
    }
    let decision: TextDecision = match serde_json::from_str(&content[start..=end]) {
        Ok(d) => d,
        Err(_) => return None,
    };
    let reason = decision
        .reason
        .unwrap_or_else(|| format!("AI selected {}", decision.action));
    Some(actions::build_plan(&decision.action, &decision.params, reason, PlanSource::Ai))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::db::settings_keys as keys;
    use crate::engine::detector;
    use crate::engine::provider::scripted::ScriptedProvider;
    use crate::engine::types::{ActionType, FetchFailure};
    use serde_json::json;

    fn agent(provider: Arc<ScriptedProvider>) -> RecoveryAgent {
        let config = Arc::new(ConfigManager::new(init_test_db().unwrap()));
        RecoveryAgent::new(provider, config)
    }

    fn blocked() -> DetectedError {
        detector::detect(&FetchFailure::status(403), "https://shop.com/p/1", Some("Access denied"))
    }

    #[tokio::test]
    async fn test_tool_call_becomes_plan() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_tool_call("add_delay", json!({"seconds": 45, "reason": "rate limited"}));
        let plan = agent(provider).decide(&blocked(), &[]).await.unwrap();
        assert_eq!(plan.action, ActionType::AddDelay);
        assert_eq!(plan.retry_delay, Duration::from_secs(45));
        assert_eq!(plan.reason, "rate limited");
        assert_eq!(plan.source, PlanSource::Ai);
    }

    #[test]
    fn test_text_json_fallback() {
        let response = LlmResponse {
            tool_calls: Vec::new(),
            content: Some(
                "Here you go:\n```json\n{\"action\":\"skip_domain\",\"params\":{\"minutes\":10},\"reason\":\"hard block\"}\n```"
                    .into(),
            ),
        };
        let plan = parse_response(&response);
        assert_eq!(plan.action, ActionType::SkipDomain);
        assert_eq!(plan.retry_delay, Duration::from_secs(600));
        assert_eq!(plan.reason, "hard block");
    }

    #[test]
    fn test_unparseable_defaults_to_retry() {
        let response = LlmResponse { tool_calls: Vec::new(), content: Some("I am not sure.".into()) };
        let plan = parse_response(&response);
        assert_eq!(plan.action, ActionType::Retry);
        assert_eq!(plan.retry_delay, FALLBACK_DELAY);
        assert_eq!(plan.reason, UNPARSEABLE_REASON);

        let unknown_tool = LlmResponse {
            tool_calls: vec![crate::engine::provider::ToolCall {
                name: "reboot".into(),
                arguments: "{}".into(),
            }],
            content: None,
        };
        assert_eq!(parse_response(&unknown_tool).reason, UNPARSEABLE_REASON);
    }

    #[test]
    fn test_dlq_never_retries() {
        let response = LlmResponse {
            tool_calls: vec![crate::engine::provider::ToolCall {
                name: "send_to_dlq".into(),
                arguments: String::new(),
            }],
            content: None,
        };
        let plan = parse_response(&response);
        assert_eq!(plan.action, ActionType::SendToDlq);
        assert!(!plan.should_retry);
    }

    #[tokio::test]
    async fn test_provider_error_surfaces() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_error("quota exceeded");
        let err = agent(provider).decide(&blocked(), &[]).await.unwrap_err();
        assert!(matches!(err, AppError::Ai(_)));
    }

    #[tokio::test]
    async fn test_timeout_is_bounded() {
        let provider = Arc::new(ScriptedProvider::new().with_delay(Duration::from_secs(5)));
        provider.push_tool_call("retry", json!({}));
        let a = agent(provider);
        a.config.set(keys::AI_TIMEOUT_SECS, json!(1)).unwrap();
        let started = std::time::Instant::now();
        let err = a.decide(&blocked(), &[]).await.unwrap_err();
        assert!(matches!(err, AppError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_prompt_carries_last_three_attempts() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_tool_call("retry", json!({}));
        let error = blocked();
        let history: Vec<RecoveryAttempt> = (0..5)
            .map(|i| RecoveryAttempt {
                id: format!("a{i}"),
                task_id: "t".into(),
                execution_id: "e".into(),
                detected_error: error.clone(),
                plan: RecoveryPlan::retry(Duration::from_secs(1), format!("attempt-{i}")),
                success: false,
                duration: Duration::from_millis(10),
                timestamp: chrono::Utc::now(),
            })
            .collect();
        agent(provider.clone()).decide(&error, &history).await.unwrap();

        let calls = provider.calls();
        let messages = &calls[0];
        assert_eq!(messages.len(), 3);
        assert!(messages[1].content.contains("attempt-4"));
        assert!(messages[1].content.contains("attempt-2"));
        assert!(!messages[1].content.contains("attempt-1"));
        assert!(messages[2].content.contains("pattern: blocked"));
        assert!(messages[2].content.contains("shop.com"));
    }
}
