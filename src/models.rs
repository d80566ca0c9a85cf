//! The Workspace aggregate and everything it is made of: messages, tasks,
//! scheduled tasks, workflows, and events. See [`crate::store`] for how a
//! `Workspace` is persisted and [`crate::event_bus`] for how `Event`s flow.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Sentinel sender/recipient names that are valid even though they never
/// appear in `Workspace.agents`.
pub const SYSTEM_AGENT: &str = "system";
pub const ORCHESTRATOR_AGENT: &str = "orchestrator";
pub const USER_AGENT: &str = "user";
/// Sentinel `Task.to` value meaning "no agent picked yet".
pub const UNASSIGNED: &str = "unassigned";

/// Maximum `execution_history` entries retained per [`ScheduledTask`].
pub const MAX_EXECUTION_HISTORY: usize = 20;

/// The wire-level event type strings recognized by the event bus. Closed
/// set per the studio's event vocabulary.
pub mod event_type {
    pub const STUDIO_CREATED: &str = "studio.created";
    pub const STUDIO_UPDATED: &str = "studio.updated";
    pub const STUDIO_COMPLETED: &str = "studio.completed";
    pub const STUDIO_DELETED: &str = "studio.deleted";

    pub const TASK_CREATED: &str = "task.created";
    pub const TASK_ASSIGNED: &str = "task.assigned";
    pub const TASK_STARTED: &str = "task.started";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_TIMEOUT: &str = "task.timeout";
    pub const TASK_THINKING: &str = "task.thinking";
    pub const TASK_TOOL_CALL: &str = "task.tool_call";
    pub const TASK_TOOL_RESULT: &str = "task.tool_result";

    pub const WORKFLOW_STARTED: &str = "workflow.started";
    pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
    pub const WORKFLOW_FAILED: &str = "workflow.failed";
    pub const STEP_STARTED: &str = "step.started";
    pub const STEP_COMPLETED: &str = "step.completed";
    pub const STEP_FAILED: &str = "step.failed";
    pub const STEP_SKIPPED: &str = "step.skipped";

    pub const AGENT_JOINED: &str = "agent.joined";
    pub const AGENT_LEFT: &str = "agent.left";
    pub const MESSAGE_SENT: &str = "message.sent";

    pub const ERROR: &str = "error";
    pub const WARNING: &str = "warning";

    pub const MISSION_COMPLETED: &str = "mission_completed";
}

/// Status of a [`Workspace`]. Terminal once set to anything but `Active`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Active,
    Completed,
    Failed,
    Cancelled,
}

/// The aggregate root. All mutation goes through a single owning instance;
/// see [`crate::store::WorkspaceStore`] for the load-modify-save discipline
/// that serializes concurrent writers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workspace {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub parent_agent: String,
    pub agents: Vec<String>,
    #[serde(default)]
    pub shared_data: HashMap<String, Value>,
    #[serde(default)]
    pub messages: Vec<AgentMessage>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub scheduled_tasks: Vec<ScheduledTask>,
    #[serde(default)]
    pub workflows: HashMap<Uuid, Workflow>,
    pub status: WorkspaceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workspace {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parent_agent: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: description.into(),
            parent_agent: parent_agent.into(),
            agents: Vec::new(),
            shared_data: HashMap::new(),
            messages: Vec::new(),
            tasks: Vec::new(),
            scheduled_tasks: Vec::new(),
            workflows: HashMap::new(),
            status: WorkspaceStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == WorkspaceStatus::Active
    }

    /// Bumps `updated_at`. Called by every mutating operation so the
    /// `updated_at >= created_at` invariant holds.
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = now.max(self.updated_at);
    }

    pub fn find_task(&self, id: Uuid) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn find_task_mut(&mut self, id: Uuid) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    pub fn find_scheduled_mut(&mut self, id: Uuid) -> Option<&mut ScheduledTask> {
        self.scheduled_tasks.iter_mut().find(|s| s.id == id)
    }
}

/// A message exchanged between agents (or the system/orchestrator) inside
/// a workspace. Append-only once added to `Workspace.messages`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskRequest,
    Result,
    Question,
    Status,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentMessage {
    pub id: Uuid,
    pub from: String,
    /// `""` means broadcast to every agent in the workspace.
    pub to: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub content: String,
    #[serde(default)]
    pub metadata: Option<HashMap<String, Value>>,
    pub timestamp: DateTime<Utc>,
}

impl AgentMessage {
    pub fn new(from: impl Into<String>, to: impl Into<String>, message_type: MessageType, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            from: from.into(),
            to: to.into(),
            message_type,
            content: content.into(),
            metadata: None,
            timestamp: Utc::now(),
        }
    }
}

/// Lifecycle of a [`Task`]. The executor only auto-picks tasks whose
/// status is exactly `Assigned`; `Pending` requires an explicit user
/// action, giving the UI an approval gate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Timeout
        )
    }
}

/// How injected upstream results are framed in the downstream prompt. See
/// [`crate::task_handler`] for the wording each mode produces.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResultCombinationMode {
    #[default]
    Default,
    Append,
    Merge,
    Summarize,
    Compare,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskProgress {
    pub percentage: f32,
    pub current_step: Option<String>,
    pub total_steps: Option<u32>,
    pub completed_steps: Option<u32>,
    pub elapsed_ms: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub from: String,
    pub to: String,
    pub description: String,
    pub priority: i32,
    #[serde(default)]
    pub context: HashMap<String, Value>,
    /// Seconds; `0` means "use the component default".
    #[serde(default)]
    pub timeout_secs: u64,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub progress: Option<TaskProgress>,
    #[serde(default)]
    pub input_task_ids: Vec<Uuid>,
    #[serde(default)]
    pub result_combination_mode: ResultCombinationMode,
    pub combination_instruction: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(workspace_id: Uuid, from: impl Into<String>, to: impl Into<String>, description: impl Into<String>, priority: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            from: from.into(),
            to: to.into(),
            description: description.into(),
            priority,
            context: HashMap::new(),
            timeout_secs: 0,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            progress: None,
            input_task_ids: Vec::new(),
            result_combination_mode: ResultCombinationMode::default(),
            combination_instruction: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Outcome of one scheduled-task materialization attempt, kept in the
/// template's bounded `execution_history`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskExecution {
    pub task_id: Uuid,
    pub executed_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// The recurrence rule of a [`ScheduledTask`]. `Cron` is validated away at
/// insertion time (see [`crate::scheduler`]) rather than silently accepted
/// and never fired.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleKind {
    Once { execute_at: DateTime<Utc> },
    Interval { interval_secs: i64 },
    Daily { time_of_day: String },
    Weekly { time_of_day: String, day_of_week: u8 },
    Cron { cron_expr: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleConfig {
    #[serde(flatten)]
    pub kind: ScheduleKind,
    /// `0` means unlimited.
    #[serde(default)]
    pub max_runs: u32,
    pub end_date: Option<DateTime<Utc>>,
}

/// Template for recurring/future task materialization. Fields mirror
/// [`Task`] (`from`, `to`, `prompt`, `priority`, `context`) plus planner
/// bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledTask {
    pub id: Uuid,
    pub from: String,
    pub to: String,
    pub prompt: String,
    pub priority: i32,
    #[serde(default)]
    pub context: HashMap<String, Value>,
    pub schedule: ScheduleConfig,
    pub enabled: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_count: u64,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub execution_history: VecDeque<TaskExecution>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledTask {
    pub fn push_execution(&mut self, execution: TaskExecution) {
        self.execution_history.push_back(execution);
        while self.execution_history.len() > MAX_EXECUTION_HISTORY {
            self.execution_history.pop_front();
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Task,
    Aggregate,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Waiting,
    Ready,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped | StepStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    PreviousResult,
    StepStatus,
    ContextValue,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Eq,
    Ne,
    Contains,
    Exists,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOutcome {
    Execute,
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepCondition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub step_id: String,
    pub operator: ConditionOperator,
    pub value: Value,
    pub on_true: ConditionOutcome,
    pub on_false: ConditionOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub depends_on: HashSet<String>,
    pub condition: Option<StepCondition>,
    #[serde(default)]
    pub context: HashMap<String, Value>,
    #[serde(default)]
    pub timeout_secs: u64,
    pub status: StepStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub task_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub steps: Vec<WorkflowStep>,
    pub status: WorkflowStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut WorkflowStep> {
        self.steps.iter_mut().find(|s| s.id == id)
    }
}

/// A lifecycle event published through [`crate::event_bus::EventBus`]. The
/// wire name for `workspace_id` is `studio_id` (§6.5).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(rename = "studio_id")]
    pub workspace_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(default)]
    pub data: HashMap<String, Value>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, workspace_id: Uuid, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            workspace_id,
            timestamp: Utc::now(),
            source: source.into(),
            data: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_new_is_active_and_empty() {
        let ws = Workspace::new("demo", "desc", SYSTEM_AGENT);
        assert!(ws.is_active());
        assert!(ws.tasks.is_empty());
        assert_eq!(ws.updated_at, ws.created_at);
    }

    #[test]
    fn scheduled_task_history_is_bounded() {
        let now = Utc::now();
        let mut sched = ScheduledTask {
            id: Uuid::new_v4(),
            from: SYSTEM_AGENT.into(),
            to: "agent-a".into(),
            prompt: "do it".into(),
            priority: 5,
            context: HashMap::new(),
            schedule: ScheduleConfig {
                kind: ScheduleKind::Interval { interval_secs: 60 },
                max_runs: 0,
                end_date: None,
            },
            enabled: true,
            next_run: Some(now),
            last_run: None,
            execution_count: 0,
            failure_count: 0,
            execution_history: VecDeque::new(),
            created_at: now,
            updated_at: now,
        };
        for _ in 0..25 {
            sched.push_execution(TaskExecution {
                task_id: Uuid::new_v4(),
                executed_at: now,
                status: ExecutionStatus::Success,
                error: None,
                duration_ms: 1,
            });
        }
        assert_eq!(sched.execution_history.len(), MAX_EXECUTION_HISTORY);
    }

    #[test]
    fn task_status_terminal_set() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Timeout.is_terminal());
        assert!(!TaskStatus::Assigned.is_terminal());
    }

    #[test]
    fn event_round_trips_workspace_id_as_studio_id() {
        let ws_id = Uuid::new_v4();
        let event = Event::new(event_type::TASK_CREATED, ws_id, "task-executor");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"studio_id\""));
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.workspace_id, ws_id);
    }

    #[test]
    fn task_round_trips_losslessly() {
        let mut task = Task::new(Uuid::new_v4(), "agent-a", "agent-b", "do the thing", 3);
        task.context.insert("k".into(), serde_json::json!("v"));
        task.timeout_secs = 30;
        task.status = TaskStatus::InProgress;
        task.result = Some("partial".into());
        task.progress = Some(TaskProgress {
            percentage: 0.5,
            current_step: Some("step-1".into()),
            total_steps: Some(4),
            completed_steps: Some(2),
            elapsed_ms: 1200,
            updated_at: Utc::now(),
        });
        task.input_task_ids = vec![Uuid::new_v4(), Uuid::new_v4()];
        task.result_combination_mode = ResultCombinationMode::Merge;
        task.combination_instruction = Some("merge carefully".into());
        task.started_at = Some(Utc::now());

        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn workspace_round_trips_losslessly_with_nested_collections() {
        let mut ws = Workspace::new("demo", "desc", SYSTEM_AGENT);
        ws.agents = vec!["agent-a".into(), "agent-b".into()];
        ws.shared_data.insert("notes".into(), serde_json::json!("hello"));

        let task = Task::new(ws.id, SYSTEM_AGENT, "agent-a", "do it", 1);
        ws.tasks.push(task);

        let now = Utc::now();
        ws.scheduled_tasks.push(ScheduledTask {
            id: Uuid::new_v4(),
            from: SYSTEM_AGENT.into(),
            to: "agent-a".into(),
            prompt: "recurring thing".into(),
            priority: 2,
            context: HashMap::new(),
            schedule: ScheduleConfig {
                kind: ScheduleKind::Daily { time_of_day: "09:00".into() },
                max_runs: 0,
                end_date: None,
            },
            enabled: true,
            next_run: Some(now),
            last_run: None,
            execution_count: 1,
            failure_count: 0,
            execution_history: VecDeque::new(),
            created_at: now,
            updated_at: now,
        });

        let step = WorkflowStep {
            id: "s1".into(),
            name: "s1".into(),
            description: "do s1".into(),
            step_type: StepType::Task,
            assigned_to: Some("agent-b".into()),
            depends_on: HashSet::new(),
            condition: None,
            context: HashMap::new(),
            timeout_secs: 0,
            status: StepStatus::Pending,
            result: None,
            error: None,
            task_id: None,
            started_at: None,
            completed_at: None,
        };
        let workflow = Workflow {
            id: Uuid::new_v4(),
            name: "wf".into(),
            steps: vec![step],
            status: WorkflowStatus::Pending,
            started_at: None,
            completed_at: None,
        };
        ws.workflows.insert(workflow.id, workflow);

        let json = serde_json::to_string(&ws).unwrap();
        let back: Workspace = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ws);
    }
}
