use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ChatMessage, LlmProvider, LlmResponse, Pingable, ToolCall, ToolDefinition};
use crate::error::AppError;

const PROVIDER_NAME: &str = "openai_compat";
const PING_TIMEOUT: Duration = Duration::from_secs(5);

fn ai_err(e: reqwest::Error) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(format!("LLM request: {e}"))
    } else {
        AppError::Ai(e.to_string())
    }
}

// ============================================================================
// Request / response bodies
// ============================================================================

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    tools: &'a [ToolDefinition],
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ResponseToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    function: ResponseFunction,
}

#[derive(Debug, Deserialize)]
struct ResponseFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn into_llm_response(body: CompletionResponse) -> Result<LlmResponse, AppError> {
    let choice = body
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| AppError::Ai("completion returned no choices".into()))?;
    Ok(LlmResponse {
        tool_calls: choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|c| ToolCall { name: c.function.name, arguments: c.function.arguments })
            .collect(),
        content: choice.message.content.filter(|c| !c.trim().is_empty()),
    })
}

// ============================================================================
// Provider
// ============================================================================

/// Any endpoint speaking the OpenAI `/chat/completions` dialect.
pub struct OpenAiCompatProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatProvider {
    pub fn new(base_url: &str, api_key: String, model: &str, timeout: Duration) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<LlmResponse, AppError> {
        let body = CompletionRequest {
            model: &self.model,
            messages,
            tools,
            tool_choice: if tools.is_empty() { None } else { Some("auto") },
            temperature: 0.2,
        };
        let response: CompletionResponse = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(ai_err)?
            .error_for_status()
            .map_err(ai_err)?
            .json()
            .await
            .map_err(ai_err)?;
        into_llm_response(response)
    }

    fn pingable(&self) -> Option<&dyn Pingable> {
        Some(self)
    }
}

#[async_trait]
impl Pingable for OpenAiCompatProvider {
    async fn is_available(&self) -> bool {
        let res = self
            .http
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(PING_TIMEOUT)
            .send()
            .await;
        match res {
            Ok(r) => r.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, "LLM ping failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<LlmResponse, AppError> {
        into_llm_response(serde_json::from_str(raw).unwrap())
    }

    #[test]
    fn test_parses_tool_calls() {
        let raw = r#"{"choices":[{"message":{"content":null,"tool_calls":[
            {"id":"c1","type":"function","function":{"name":"add_delay","arguments":"{\"seconds\":60}"}}
        ]}}]}"#;
        let res = parse(raw).unwrap();
        assert_eq!(res.tool_calls.len(), 1);
        assert_eq!(res.tool_calls[0].name, "add_delay");
        assert_eq!(res.tool_calls[0].arguments, r#"{"seconds":60}"#);
        assert!(res.content.is_none());
    }

    #[test]
    fn test_parses_plain_content() {
        let res = parse(r#"{"choices":[{"message":{"content":"retry please"}}]}"#).unwrap();
        assert!(res.tool_calls.is_empty());
        assert_eq!(res.content.as_deref(), Some("retry please"));
    }

    #[test]
    fn test_no_choices_is_ai_error() {
        assert!(matches!(parse(r#"{"choices":[]}"#), Err(AppError::Ai(_))));
    }

    #[test]
    fn test_request_body_shape() {
        let messages = vec![ChatMessage::system("s"), ChatMessage::user("u")];
        let tools = vec![ToolDefinition::function("retry", "r", serde_json::json!({}))];
        let body = CompletionRequest {
            model: "m",
            messages: &messages,
            tools: &tools,
            tool_choice: Some("auto"),
            temperature: 0.2,
        };
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["tool_choice"], "auto");
        assert_eq!(v["messages"][1]["role"], "user");
        assert_eq!(v["tools"][0]["function"]["name"], "retry");
    }
}
