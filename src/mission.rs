//! Decomposes a free-text mission into a task sequence via an LLM call and
//! drives sequential execution (§4.7).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, warn};
use uuid::Uuid;

use crate::capability::{LlmCapability, Message};
use crate::constants;
use crate::error::Result;
use crate::event_bus::EventBus;
use crate::models::{event_type, Event, Task, TaskStatus, ORCHESTRATOR_AGENT, UNASSIGNED};
use crate::store::WorkspaceStore;

#[derive(Debug, Deserialize)]
struct TaskSpec {
    description: String,
    assigned_to: String,
    #[serde(default = "default_priority")]
    priority: i32,
    #[serde(default)]
    dependencies: Vec<Value>,
}

fn default_priority() -> i32 {
    constants::STEP_TASK_DEFAULT_PRIORITY
}

pub struct MissionOrchestrator {
    store: Arc<dyn WorkspaceStore>,
    event_bus: Arc<EventBus>,
    llm: Arc<dyn LlmCapability>,
    stopped: AtomicBool,
}

impl MissionOrchestrator {
    pub fn new(store: Arc<dyn WorkspaceStore>, event_bus: Arc<EventBus>, llm: Arc<dyn LlmCapability>) -> Arc<Self> {
        Arc::new(Self { store, event_bus, llm, stopped: AtomicBool::new(false) })
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Decomposes `mission_text` into tasks, inserts them, and spawns a
    /// background activity that runs them in LLM-emitted order.
    pub async fn execute_mission(self: &Arc<Self>, workspace_id: Uuid, mission_text: &str) -> Result<()> {
        let mut ws = self.store.get(workspace_id).await?;

        let decomposition_prompt = "Break the following mission into a JSON array of tasks. Each element must be an \
object with the fields \"description\" (string), \"assigned_to\" (agent name string), \"priority\" (integer, \
higher is more urgent), and \"dependencies\" (array of indices into this same array). Respond with only the JSON \
array and no surrounding prose.";
        let messages = vec![Message::system(decomposition_prompt), Message::user(mission_text)];
        let response = self.llm.complete(&messages, &[]).await?;

        let specs = parse_task_specs(&response.content).unwrap_or_else(|| {
            warn!(
                "mission orchestrator: could not parse task decomposition for workspace {workspace_id}, falling back to a \
single task. LLM content: {}",
                response.content
            );
            vec![TaskSpec {
                description: mission_text.to_string(),
                assigned_to: ws.agents.first().cloned().unwrap_or_else(|| UNASSIGNED.to_string()),
                priority: constants::STEP_TASK_DEFAULT_PRIORITY,
                dependencies: Vec::new(),
            }]
        });

        let mut task_ids = Vec::with_capacity(specs.len());
        for (index, spec) in specs.iter().enumerate() {
            let mut task = Task::new(ws.id, ORCHESTRATOR_AGENT, spec.assigned_to.clone(), spec.description.clone(), spec.priority);
            task.context.insert("original_mission".into(), Value::String(mission_text.to_string()));
            task.context.insert("dependencies".into(), Value::Array(spec.dependencies.clone()));
            task.context.insert("task_index".into(), Value::from(index));
            task.status = TaskStatus::Pending;
            task_ids.push(task.id);
            ws.tasks.push(task);
        }

        ws.touch();
        self.store.save(&ws).await?;

        for task_id in &task_ids {
            self.event_bus
                .publish(Event::new(event_type::TASK_CREATED, ws.id, "mission-orchestrator").with_data("task_id", task_id.to_string()))
                .await;
        }

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.run_sequence(workspace_id, task_ids).await;
        });

        Ok(())
    }

    async fn run_sequence(self: Arc<Self>, workspace_id: Uuid, task_ids: Vec<Uuid>) {
        let total = task_ids.len();
        for task_id in task_ids {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            self.run_task(workspace_id, task_id).await;
        }

        self.event_bus
            .publish(Event::new(event_type::MISSION_COMPLETED, workspace_id, "mission-orchestrator").with_data("total_tasks", total as i64))
            .await;
    }

    /// Executes one mission task directly against the LLM capability,
    /// bypassing the Task Handler's tool loop — the mission orchestrator's
    /// own internal execution path, distinct from the Task Executor's.
    async fn run_task(&self, workspace_id: Uuid, task_id: Uuid) {
        let description = {
            let mut ws = match self.store.get(workspace_id).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("mission orchestrator: failed to load workspace {workspace_id}: {e}");
                    return;
                }
            };
            let Some(task) = ws.find_task_mut(task_id) else {
                warn!("mission orchestrator: task {task_id} missing from workspace {workspace_id} before it could start");
                return;
            };
            task.status = TaskStatus::InProgress;
            task.started_at = Some(Utc::now());
            let description = task.description.clone();
            ws.touch();
            if let Err(e) = self.store.save(&ws).await {
                error!("mission orchestrator: failed to persist workspace {workspace_id} before task {task_id}: {e}");
            }
            description
        };

        self.event_bus
            .publish(Event::new(event_type::TASK_STARTED, workspace_id, "mission-orchestrator").with_data("task_id", task_id.to_string()))
            .await;

        let outcome = self.llm.complete(&[Message::user(description)], &[]).await;

        let mut ws = match self.store.get(workspace_id).await {
            Ok(ws) => ws,
            Err(e) => {
                error!("mission orchestrator: failed to reload workspace {workspace_id} after task {task_id}: {e}");
                return;
            }
        };
        let Some(task) = ws.find_task_mut(task_id) else {
            return;
        };
        let completion_event = match outcome {
            Ok(response) => {
                task.status = TaskStatus::Completed;
                task.result = Some(response.content);
                task.completed_at = Some(Utc::now());
                event_type::TASK_COMPLETED
            }
            Err(e) => {
                task.status = TaskStatus::Failed;
                task.error = Some(e.to_string());
                task.completed_at = Some(Utc::now());
                event_type::TASK_FAILED
            }
        };
        ws.touch();
        if let Err(e) = self.store.save(&ws).await {
            error!("mission orchestrator: failed to persist workspace {workspace_id} after task {task_id} finished: {e}");
        }

        self.event_bus
            .publish(Event::new(completion_event, workspace_id, "mission-orchestrator").with_data("task_id", task_id.to_string()))
            .await;
    }
}

fn parse_task_specs(content: &str) -> Option<Vec<TaskSpec>> {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end_matches("```").trim())
        .unwrap_or(trimmed);
    serde_json::from_str(unfenced).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{LlmResponse, ToolDefinition};
    use crate::models::{Workspace, SYSTEM_AGENT};
    use crate::store::InMemoryWorkspaceStore;
    use async_trait::async_trait;
    use tokio::time::{sleep, Duration};

    struct ScriptedLlm {
        decomposition: String,
    }

    #[async_trait]
    impl LlmCapability for ScriptedLlm {
        async fn complete(&self, messages: &[Message], _tools: &[ToolDefinition]) -> Result<LlmResponse> {
            if messages.iter().any(|m| matches!(m.role, crate::capability::Role::System)) {
                Ok(LlmResponse { content: self.decomposition.clone(), tool_calls: Vec::new(), usage: None })
            } else {
                Ok(LlmResponse { content: "task done".into(), tool_calls: Vec::new(), usage: None })
            }
        }
    }

    #[tokio::test]
    async fn decomposes_and_executes_tasks_in_order() {
        let mut ws = Workspace::new("demo", "d", SYSTEM_AGENT);
        ws.agents = vec!["agent-a".into(), "agent-b".into()];
        let store = Arc::new(InMemoryWorkspaceStore::new());
        store.save(&ws).await.unwrap();

        let decomposition = serde_json::json!([
            {"description": "first", "assigned_to": "agent-a", "priority": 8, "dependencies": []},
            {"description": "second", "assigned_to": "agent-b", "priority": 5, "dependencies": [0]},
        ])
        .to_string();

        let llm = Arc::new(ScriptedLlm { decomposition });
        let bus = Arc::new(EventBus::new(crate::config::EventBusConfig { buffer_size: 32, history_size: 32 }));
        let orchestrator = MissionOrchestrator::new(store.clone(), bus, llm);

        orchestrator.execute_mission(ws.id, "ship the feature").await.unwrap();
        sleep(Duration::from_millis(50)).await;

        let reloaded = store.get(ws.id).await.unwrap();
        assert_eq!(reloaded.tasks.len(), 2);
        assert!(reloaded.tasks.iter().all(|t| t.status == TaskStatus::Completed));
        assert_eq!(reloaded.tasks[0].description, "first");
        assert_eq!(reloaded.tasks[1].description, "second");
    }

    #[tokio::test]
    async fn unparseable_decomposition_falls_back_to_single_task() {
        let mut ws = Workspace::new("demo", "d", SYSTEM_AGENT);
        ws.agents = vec!["agent-a".into()];
        let store = Arc::new(InMemoryWorkspaceStore::new());
        store.save(&ws).await.unwrap();

        let llm = Arc::new(ScriptedLlm { decomposition: "not json at all".into() });
        let bus = Arc::new(EventBus::new(crate::config::EventBusConfig { buffer_size: 32, history_size: 32 }));
        let orchestrator = MissionOrchestrator::new(store.clone(), bus, llm);

        orchestrator.execute_mission(ws.id, "do the thing").await.unwrap();
        sleep(Duration::from_millis(50)).await;

        let reloaded = store.get(ws.id).await.unwrap();
        assert_eq!(reloaded.tasks.len(), 1);
        assert_eq!(reloaded.tasks[0].description, "do the thing");
        assert_eq!(reloaded.tasks[0].to, "agent-a");
    }
}
