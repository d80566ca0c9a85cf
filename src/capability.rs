//! The two capabilities the core consumes but never implements (§6.2,
//! §6.3, §6.4): an LLM completion call and a per-agent tool catalog. An
//! embedding application supplies concrete implementations; this module
//! only defines the shapes and ships mocks for tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single LLM message. `tool_call_id` is set only on a `Tool`-role
/// message, correlating it back to the assistant's [`ToolCall::id`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into(), tool_call_id: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into(), tool_call_id: None }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into(), tool_call_id: None }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: Role::Tool, content: content.into(), tool_call_id: Some(call_id.into()) }
    }
}

/// A tool invocation requested by the LLM in a completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Schema for a tool the LLM may call, forwarded verbatim with each
/// request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
}

/// Single-method LLM capability (§6.2). The core never relies on
/// streaming; tool selection is entirely the provider's concern, and the
/// core only executes whatever `tool_calls` come back.
#[async_trait]
pub trait LlmCapability: Send + Sync {
    async fn complete(&self, messages: &[Message], tools: &[ToolDefinition]) -> Result<LlmResponse>;
}

/// A single callable tool (§6.3). Arguments are forwarded verbatim; the
/// core never parses them.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;
    async fn call(&self, arguments: Value) -> std::result::Result<String, String>;
}

/// Returns the tools a given agent is allowed to call (§6.3).
#[async_trait]
pub trait ToolCatalog: Send + Sync {
    async fn tools_for(&self, agent_name: &str) -> Vec<Arc<dyn Tool>>;
}

/// Opaque-to-the-core accessor contract for an agent's settings (§6.4).
#[derive(Debug, Clone)]
pub struct AgentDescriptor {
    pub name: String,
    pub model: String,
    pub temperature: f32,
    pub system_prompt: String,
}

/// A fixed-response [`LlmCapability`] for tests.
pub struct MockLlmCapability {
    pub response: LlmResponse,
}

impl MockLlmCapability {
    pub fn text(content: impl Into<String>) -> Self {
        Self { response: LlmResponse { content: content.into(), tool_calls: Vec::new(), usage: None } }
    }
}

#[async_trait]
impl LlmCapability for MockLlmCapability {
    async fn complete(&self, _messages: &[Message], _tools: &[ToolDefinition]) -> Result<LlmResponse> {
        Ok(self.response.clone())
    }
}

/// A static per-agent tool map for tests.
#[derive(Default)]
pub struct MockToolCatalog {
    tools: HashMap<String, Vec<Arc<dyn Tool>>>,
}

impl MockToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tools(mut self, agent_name: impl Into<String>, tools: Vec<Arc<dyn Tool>>) -> Self {
        self.tools.insert(agent_name.into(), tools);
        self
    }
}

#[async_trait]
impl ToolCatalog for MockToolCatalog {
    async fn tools_for(&self, agent_name: &str) -> Vec<Arc<dyn Tool>> {
        self.tools.get(agent_name).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "echo".into(),
                description: "echoes its input".into(),
                parameters_schema: serde_json::json!({"type": "object"}),
            }
        }

        async fn call(&self, arguments: Value) -> std::result::Result<String, String> {
            Ok(arguments.to_string())
        }
    }

    #[tokio::test]
    async fn mock_llm_returns_fixed_response() {
        let llm = MockLlmCapability::text("pong");
        let response = llm.complete(&[Message::user("ping")], &[]).await.unwrap();
        assert_eq!(response.content, "pong");
    }

    #[tokio::test]
    async fn mock_catalog_returns_tools_for_known_agent_only() {
        let catalog = MockToolCatalog::new().with_tools("coder", vec![Arc::new(EchoTool)]);
        assert_eq!(catalog.tools_for("coder").await.len(), 1);
        assert!(catalog.tools_for("unknown").await.is_empty());
    }

    #[tokio::test]
    async fn tool_call_roundtrips_through_definition() {
        let tool = EchoTool;
        let result = tool.call(serde_json::json!({"x": 1})).await.unwrap();
        assert_eq!(result, "{\"x\":1}");
        assert_eq!(tool.definition().name, "echo");
    }
}
