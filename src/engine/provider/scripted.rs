use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{ChatMessage, LlmProvider, LlmResponse, ToolCall, ToolDefinition};
use crate::error::AppError;

/// Replays queued responses in order. Used by tests and dry runs.
///
/// An empty queue yields an `AppError::Ai`, so a test that expects no AI call
/// fails loudly if one happens.
pub struct ScriptedProvider {
    queue: Mutex<VecDeque<Result<LlmResponse, String>>>,
    delay: Option<Duration>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self { queue: Mutex::new(VecDeque::new()), delay: None, calls: Mutex::new(Vec::new()) }
    }

    /// Sleep this long before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, response: LlmResponse) -> &Self {
        let mut q = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        q.push_back(Ok(response));
        self
    }

    pub fn push_tool_call(&self, name: &str, arguments: serde_json::Value) -> &Self {
        self.push(LlmResponse {
            tool_calls: vec![ToolCall { name: name.into(), arguments: arguments.to_string() }],
            content: None,
        })
    }

    pub fn push_content(&self, content: &str) -> &Self {
        self.push(LlmResponse { tool_calls: Vec::new(), content: Some(content.into()) })
    }

    pub fn push_error(&self, message: &str) -> &Self {
        let mut q = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        q.push_back(Err(message.into()));
        self
    }

    /// Message lists received so far, one entry per call.
    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted"
    }

    async fn chat_with_tools(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<LlmResponse, AppError> {
        {
            let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
            calls.push(messages.to_vec());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = {
            let mut q = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            q.pop_front()
        };
        match next {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(AppError::Ai(message)),
            None => Err(AppError::Ai("scripted provider has no queued response".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replays_in_order() {
        let p = ScriptedProvider::new();
        p.push_tool_call("retry", serde_json::json!({})).push_content("hello").push_error("boom");

        let r = p.chat_with_tools(&[ChatMessage::user("a")], &[]).await.unwrap();
        assert_eq!(r.tool_calls[0].name, "retry");
        let r = p.chat_with_tools(&[], &[]).await.unwrap();
        assert_eq!(r.content.as_deref(), Some("hello"));
        assert!(matches!(p.chat_with_tools(&[], &[]).await, Err(AppError::Ai(_))));
        assert!(matches!(p.chat_with_tools(&[], &[]).await, Err(AppError::Ai(_))));
        assert_eq!(p.calls().len(), 4);
        assert!(p.pingable().is_none());
    }
}
