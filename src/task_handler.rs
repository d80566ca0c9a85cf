//! The Task Handler capability (§4.3): executes a single task on a named
//! agent. Injected into the Task Executor and Step Executor rather than
//! owned by either.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::capability::{AgentDescriptor, LlmCapability, Message, ToolCatalog};
use crate::error::Result;
use crate::event_bus::EventBus;
use crate::models::{event_type, Event, ResultCombinationMode, Task};

const INPUT_RESULTS_KEY: &str = "input_task_results";

/// Single operation the executors drive a task through.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute_task(&self, agent_name: &str, task: &Task) -> Result<String>;
}

/// The one concrete [`TaskHandler`] this crate ships: assembles a prompt
/// (§4.3.1), calls the LLM capability with the agent's tools, and resolves
/// any tool calls the LLM asks for.
pub struct DefaultTaskHandler {
    llm: Arc<dyn LlmCapability>,
    tool_catalog: Arc<dyn ToolCatalog>,
    event_bus: Arc<EventBus>,
    descriptors: HashMap<String, AgentDescriptor>,
}

impl DefaultTaskHandler {
    pub fn new(
        llm: Arc<dyn LlmCapability>,
        tool_catalog: Arc<dyn ToolCatalog>,
        event_bus: Arc<EventBus>,
        descriptors: HashMap<String, AgentDescriptor>,
    ) -> Self {
        Self { llm, tool_catalog, event_bus, descriptors }
    }

    fn descriptor_for(&self, agent_name: &str) -> AgentDescriptor {
        self.descriptors.get(agent_name).cloned().unwrap_or_else(|| AgentDescriptor {
            name: agent_name.to_string(),
            model: String::new(),
            temperature: 0.7,
            system_prompt: String::new(),
        })
    }
}

#[async_trait]
impl TaskHandler for DefaultTaskHandler {
    async fn execute_task(&self, agent_name: &str, task: &Task) -> Result<String> {
        self.event_bus
            .publish(Event::new(event_type::TASK_THINKING, task.workspace_id, "task-handler").with_data("task_id", task.id.to_string()))
            .await;

        let descriptor = self.descriptor_for(agent_name);
        let prompt = build_prompt(task);

        let mut messages = Vec::new();
        if !descriptor.system_prompt.is_empty() {
            messages.push(Message::system(descriptor.system_prompt.clone()));
        }
        messages.push(Message::user(prompt));

        let tools = self.tool_catalog.tools_for(agent_name).await;
        let tool_defs = tools.iter().map(|t| t.definition()).collect::<Vec<_>>();

        let response = self.llm.complete(&messages, &tool_defs).await?;

        let mut result = response.content;

        for call in &response.tool_calls {
            self.event_bus
                .publish(
                    Event::new(event_type::TASK_TOOL_CALL, task.workspace_id, "task-handler")
                        .with_data("task_id", task.id.to_string())
                        .with_data("tool", call.name.clone()),
                )
                .await;

            let tool = tools.iter().find(|t| t.definition().name == call.name);
            let outcome = match tool {
                Some(tool) => tool.call(call.arguments.clone()).await,
                None => {
                    warn!(tool = %call.name, "LLM requested an unknown tool for agent {agent_name}");
                    Err(format!("tool '{}' is not available to agent '{agent_name}'", call.name))
                }
            };

            self.event_bus
                .publish(
                    Event::new(event_type::TASK_TOOL_RESULT, task.workspace_id, "task-handler")
                        .with_data("task_id", task.id.to_string())
                        .with_data("tool", call.name.clone()),
                )
                .await;

            match outcome {
                Ok(output) => {
                    let _ = write!(result, "\n\n[{}] {}", call.name, output);
                }
                Err(err) => {
                    let _ = write!(result, "\n\n[{}] error: {}", call.name, err);
                }
            }
        }

        Ok(result)
    }
}

/// Builds the prompt sent to the LLM, in the fixed section order of §4.3.1.
pub fn build_prompt(task: &Task) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# Task Assignment");
    let _ = writeln!(out, "**Task ID**: {}", task.id);
    let _ = writeln!(out, "**From**: {}", task.from);
    let _ = writeln!(out, "**Priority**: {}", task.priority);
    let _ = writeln!(out);

    let _ = writeln!(out, "## Task Description");
    let _ = writeln!(out, "{}", task.description);
    let _ = writeln!(out);

    if let Some(input_results) = task.context.get(INPUT_RESULTS_KEY).and_then(|v| v.as_object()) {
        if !input_results.is_empty() {
            let _ = writeln!(out, "## Input from Previous Tasks");
            for (task_id, result) in input_results {
                let _ = writeln!(out, "### Task {task_id}");
                let _ = writeln!(out, "```\n{}\n```", result.as_str().unwrap_or(&result.to_string()));
            }
            let _ = writeln!(out, "{}", combination_instruction_line(task));
            let _ = writeln!(out);
        }
    }

    let other_context: Vec<(&String, &serde_json::Value)> =
        task.context.iter().filter(|(k, _)| k.as_str() != INPUT_RESULTS_KEY).collect();
    if !other_context.is_empty() {
        let _ = writeln!(out, "## Additional Context");
        for (key, value) in other_context {
            let _ = writeln!(out, "- **{key}**: {value}");
        }
        let _ = writeln!(out);
    }

    if task.timeout_secs > 0 {
        let _ = writeln!(out, "Time Limit: {} seconds", task.timeout_secs);
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "Please complete this task concisely and return your final result.");

    out
}

fn combination_instruction_line(task: &Task) -> String {
    match task.result_combination_mode {
        ResultCombinationMode::Default => String::new(),
        ResultCombinationMode::Append => {
            "Use the above results as additional context for this task. Build upon these results.".to_string()
        }
        ResultCombinationMode::Merge => {
            "Merge and synthesize the above results into a single, unified output.".to_string()
        }
        ResultCombinationMode::Summarize => {
            "Create a comprehensive summary of the above results in a concise, organized format.".to_string()
        }
        ResultCombinationMode::Compare => {
            "Compare and contrast the above results, noting similarities, differences, contradictions, and complementary information.".to_string()
        }
        ResultCombinationMode::Custom => {
            let instruction = task.combination_instruction.as_deref().unwrap_or("");
            if instruction.is_empty() {
                String::new()
            } else {
                instruction.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{LlmResponse, MockLlmCapability, MockToolCatalog};
    use crate::models::SYSTEM_AGENT;
    use serde_json::json;
    use uuid::Uuid;

    fn base_task() -> Task {
        Task::new(Uuid::new_v4(), SYSTEM_AGENT, "agent-a", "ping", 5)
    }

    #[test]
    fn prompt_contains_header_and_description() {
        let task = base_task();
        let prompt = build_prompt(&task);
        assert!(prompt.contains("# Task Assignment"));
        assert!(prompt.contains(&task.id.to_string()));
        assert!(prompt.contains("## Task Description"));
        assert!(prompt.contains("ping"));
    }

    #[test]
    fn prompt_frames_append_mode_results() {
        let mut task = base_task();
        task.result_combination_mode = ResultCombinationMode::Append;
        task.context.insert(INPUT_RESULTS_KEY.into(), json!({ "t1": "alpha" }));

        let prompt = build_prompt(&task);
        assert!(prompt.contains("## Input from Previous Tasks"));
        assert!(prompt.contains("alpha"));
        assert!(prompt.contains("Build upon these results."));
    }

    #[test]
    fn prompt_lists_additional_context_keys() {
        let mut task = base_task();
        task.context.insert("repo".into(), json!("studio-orchestrator"));
        let prompt = build_prompt(&task);
        assert!(prompt.contains("## Additional Context"));
        assert!(prompt.contains("repo"));
    }

    #[test]
    fn prompt_includes_time_limit_only_when_set() {
        let mut task = base_task();
        assert!(!build_prompt(&task).contains("Time Limit"));
        task.timeout_secs = 120;
        assert!(build_prompt(&task).contains("Time Limit: 120 seconds"));
    }

    #[tokio::test]
    async fn execute_task_returns_llm_content() {
        let llm = Arc::new(MockLlmCapability::text("pong"));
        let tools = Arc::new(MockToolCatalog::new());
        let bus = Arc::new(EventBus::new(crate::config::EventBusConfig { buffer_size: 8, history_size: 8 }));
        let handler = DefaultTaskHandler::new(llm, tools, bus, HashMap::new());

        let task = base_task();
        let result = handler.execute_task("agent-a", &task).await.unwrap();
        assert_eq!(result, "pong");
    }

    #[tokio::test]
    async fn execute_task_appends_tool_output_after_content() {
        struct FixedTool;
        #[async_trait]
        impl crate::capability::Tool for FixedTool {
            fn definition(&self) -> crate::capability::ToolDefinition {
                crate::capability::ToolDefinition {
                    name: "lookup".into(),
                    description: "looks things up".into(),
                    parameters_schema: json!({"type": "object"}),
                }
            }
            async fn call(&self, _arguments: serde_json::Value) -> std::result::Result<String, String> {
                Ok("found it".to_string())
            }
        }

        let llm = Arc::new(MockLlmCapability {
            response: LlmResponse {
                content: "let me check".into(),
                tool_calls: vec![crate::capability::ToolCall {
                    id: "call_1".into(),
                    name: "lookup".into(),
                    arguments: json!({}),
                }],
                usage: None,
            },
        });
        let tools = Arc::new(MockToolCatalog::new().with_tools("agent-a", vec![Arc::new(FixedTool)]));
        let bus = Arc::new(EventBus::new(crate::config::EventBusConfig { buffer_size: 8, history_size: 8 }));
        let handler = DefaultTaskHandler::new(llm, tools, bus, HashMap::new());

        let task = base_task();
        let result = handler.execute_task("agent-a", &task).await.unwrap();
        assert!(result.starts_with("let me check"));
        assert!(result.contains("found it"));
    }
}
