pub mod openai;
pub mod scripted;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::AppError;

// =============================================================================
// Wire types
// =============================================================================

/// A function the model may call. Serialises in the OpenAI `tools` shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            kind: "function".into(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }
}

/// A function call requested by the model. `arguments` is raw JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: String,
}

/// Either tool calls, free text, or both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub content: Option<String>,
}

// =============================================================================
// Provider traits
// =============================================================================

/// Chat model with function calling.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    async fn chat_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<LlmResponse, AppError>;

    /// Optional availability check. Providers that support one return `Some(self)`.
    fn pingable(&self) -> Option<&dyn Pingable> {
        None
    }
}

/// Cheap reachability check, offered by providers that have one.
#[async_trait]
pub trait Pingable: Send + Sync {
    async fn is_available(&self) -> bool;
}

// =============================================================================
// Factory
// =============================================================================

/// Build the configured provider. `None` when the LLM is disabled or has no key.
pub fn resolve_provider(config: &LlmConfig) -> Result<Option<Arc<dyn LlmProvider>>, AppError> {
    if !config.enabled {
        return Ok(None);
    }
    let Some(api_key) = config.api_key.clone().filter(|k| !k.trim().is_empty()) else {
        tracing::warn!("LLM enabled but no API key configured, AI recovery disabled");
        return Ok(None);
    };
    let provider = openai::OpenAiCompatProvider::new(
        &config.base_url,
        api_key,
        &config.model,
        config.timeout(),
    )?;
    tracing::info!(model = %config.model, base_url = %config.base_url, "LLM provider ready");
    Ok(Some(Arc::new(provider)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_definition_shape() {
        let tool = ToolDefinition::function("retry", "Retry it", serde_json::json!({"type": "object"}));
        let v = serde_json::to_value(&tool).unwrap();
        assert_eq!(v["type"], "function");
        assert_eq!(v["function"]["name"], "retry");
        assert_eq!(tool.name(), "retry");
    }

    #[test]
    fn test_disabled_config_yields_no_provider() {
        let config = LlmConfig::default();
        assert!(resolve_provider(&config).unwrap().is_none());

        let config = LlmConfig { enabled: true, api_key: None, ..LlmConfig::default() };
        assert!(resolve_provider(&config).unwrap().is_none());

        let config = LlmConfig { enabled: true, api_key: Some("sk-test".into()), ..LlmConfig::default() };
        let provider = resolve_provider(&config).unwrap().unwrap();
        assert_eq!(provider.name(), "openai_compat");
        assert!(provider.pingable().is_some());
    }
}
