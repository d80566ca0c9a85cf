//! Drives workflow DAGs: dependency resolution, condition evaluation, and
//! per-step execution via the Task Handler capability (§4.5).

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, Notify, RwLock};
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, Duration};
use tracing::{error, warn};
use uuid::Uuid;

use crate::config::StepExecutorConfig;
use crate::constants;
use crate::event_bus::EventBus;
use crate::models::{
    event_type, ConditionOperator, ConditionOutcome, ConditionType, Event, StepStatus, StepType, Task, Workflow,
    WorkflowStatus, WorkflowStep, Workspace,
};
use crate::store::WorkspaceStore;
use crate::task_handler::TaskHandler;
use serde_json::Value;

type StepKey = (Uuid, Uuid, String);

pub struct StepExecutor {
    store: Arc<dyn WorkspaceStore>,
    event_bus: Arc<EventBus>,
    handler: Arc<dyn TaskHandler>,
    config: StepExecutorConfig,
    running: RwLock<HashMap<StepKey, Arc<Notify>>>,
    bodies: AsyncMutex<JoinSet<()>>,
    stopped: Notify,
}

impl StepExecutor {
    pub fn new(
        store: Arc<dyn WorkspaceStore>,
        event_bus: Arc<EventBus>,
        handler: Arc<dyn TaskHandler>,
        config: StepExecutorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            event_bus,
            handler,
            config,
            running: RwLock::new(HashMap::new()),
            bodies: AsyncMutex::new(JoinSet::new()),
            stopped: Notify::new(),
        })
    }

    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll_once().await,
                _ = self.stopped.notified() => break,
            }
        }
    }

    async fn poll_once(self: &Arc<Self>) {
        let ids = match self.store.list().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("step executor: failed to list workspaces: {e}");
                return;
            }
        };

        for id in ids {
            let mut ws = match self.store.get(id).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("step executor: failed to load workspace {id}: {e}");
                    continue;
                }
            };
            if !ws.is_active() {
                continue;
            }
            let workflow_ids: Vec<Uuid> = ws.workflows.keys().copied().collect();
            for workflow_id in workflow_ids {
                self.process_workflow(&mut ws, workflow_id).await;
            }
        }
    }

    async fn process_workflow(self: &Arc<Self>, ws: &mut Workspace, workflow_id: Uuid) {
        let ws_id = ws.id;
        let mut events_to_publish: Vec<(&'static str, Option<String>)> = Vec::new();

        let started_now = {
            let workflow = match ws.workflows.get_mut(&workflow_id) {
                Some(w) => w,
                None => return,
            };
            if workflow.status.is_terminal() {
                return;
            }
            if workflow.status == WorkflowStatus::Pending {
                workflow.status = WorkflowStatus::InProgress;
                workflow.started_at = Some(Utc::now());
                true
            } else {
                false
            }
        };
        if started_now {
            events_to_publish.push((event_type::WORKFLOW_STARTED, None));
        }

        let step_ids: Vec<String> = ws
            .workflows
            .get(&workflow_id)
            .map(|w| w.steps.iter().map(|s| s.id.clone()).collect())
            .unwrap_or_default();

        let mut any_status_change = started_now;
        for step_id in &step_ids {
            let new_status = {
                let workflow = match ws.workflows.get(&workflow_id) {
                    Some(w) => w,
                    None => continue,
                };
                let step = match workflow.step(step_id) {
                    Some(s) => s,
                    None => continue,
                };
                next_step_status(workflow, step)
            };
            let Some(new_status) = new_status else { continue };

            let Some(workflow) = ws.workflows.get_mut(&workflow_id) else { continue };
            if let Some(step) = workflow.step_mut(step_id) {
                if step.status != new_status {
                    step.status = new_status;
                    any_status_change = true;
                    if new_status == StepStatus::Skipped {
                        events_to_publish.push((event_type::STEP_SKIPPED, Some(step_id.clone())));
                    }
                }
            }
        }

        if any_status_change {
            ws.touch();
            if let Err(e) = self.store.save(ws).await {
                error!("step executor: failed to persist workspace {ws_id} after status update: {e}");
            }
        }

        for (evt, step_id) in events_to_publish {
            let mut event = Event::new(evt, ws_id, "step-executor");
            if let Some(sid) = step_id {
                event = event.with_data("step_id", sid);
            }
            self.event_bus.publish(event).await;
        }

        let ready_step_ids: Vec<String> = ws
            .workflows
            .get(&workflow_id)
            .map(|w| w.steps.iter().filter(|s| s.status == StepStatus::Ready).map(|s| s.id.clone()).collect())
            .unwrap_or_default();

        for step_id in ready_step_ids {
            let key = (ws_id, workflow_id, step_id.clone());
            if self.running.read().await.contains_key(&key) {
                continue;
            }
            self.start_step(ws.clone(), workflow_id, step_id).await;
        }

        self.check_workflow_completion(ws, workflow_id).await;
    }

    async fn start_step(self: &Arc<Self>, mut ws: Workspace, workflow_id: Uuid, step_id: String) {
        let ws_id = ws.id;
        let key = (ws_id, workflow_id, step_id.clone());
        let notify = Arc::new(Notify::new());
        self.running.write().await.insert(key.clone(), notify.clone());

        let timeout_duration = {
            let workflow = match ws.workflows.get_mut(&workflow_id) {
                Some(w) => w,
                None => {
                    self.running.write().await.remove(&key);
                    return;
                }
            };
            let step = match workflow.step_mut(&step_id) {
                Some(s) => s,
                None => {
                    self.running.write().await.remove(&key);
                    return;
                }
            };
            step.status = StepStatus::InProgress;
            step.started_at = Some(Utc::now());
            if step.timeout_secs > 0 {
                Duration::from_secs(step.timeout_secs)
            } else {
                constants::DEFAULT_STEP_TIMEOUT
            }
        };

        ws.touch();
        if let Err(e) = self.store.save(&ws).await {
            error!("step executor: failed to persist workspace {ws_id} before starting step {step_id}: {e}");
        }

        self.event_bus
            .publish(Event::new(event_type::STEP_STARTED, ws_id, "step-executor").with_data("step_id", step_id.clone()))
            .await;

        let Some(workflow_snapshot) = ws.workflows.get(&workflow_id).cloned() else {
            self.running.write().await.remove(&key);
            return;
        };
        let Some(step) = workflow_snapshot.step(&step_id).cloned() else {
            self.running.write().await.remove(&key);
            return;
        };
        let parent_agent = ws.parent_agent.clone();

        let executor = Arc::clone(self);
        self.bodies.lock().await.spawn(async move {
            executor.run_step_body(ws_id, workflow_id, step, workflow_snapshot, parent_agent, notify, timeout_duration).await;
        });
    }

    async fn run_step_body(
        self: Arc<Self>,
        ws_id: Uuid,
        workflow_id: Uuid,
        step: WorkflowStep,
        workflow_snapshot: Workflow,
        parent_agent: String,
        notify: Arc<Notify>,
        timeout_duration: Duration,
    ) {
        let step_id = step.id.clone();
        let key = (ws_id, workflow_id, step_id.clone());
        let handler = self.handler.clone();

        let body = async move {
            match step.step_type {
                StepType::Task => {
                    let mut task = Task::new(
                        ws_id,
                        parent_agent,
                        step.assigned_to.clone().unwrap_or_default(),
                        step.description.clone(),
                        constants::STEP_TASK_DEFAULT_PRIORITY,
                    );
                    task.context = step.context.clone();
                    task.timeout_secs = step.timeout_secs;
                    let task_id = task.id;
                    let agent = task.to.clone();
                    let result = handler.execute_task(&agent, &task).await.map_err(|e| e.to_string());
                    (Some(task_id), result)
                }
                StepType::Aggregate => (None, aggregate_step(&workflow_snapshot, &step)),
            }
        };

        let (task_id, outcome) = tokio::select! {
            result = timeout(timeout_duration, body) => match result {
                Ok(r) => r,
                Err(_) => (None, Err("timed out".to_string())),
            },
            _ = notify.notified() => (None, Err("cancelled".to_string())),
        };

        let mut ws = match self.store.get(ws_id).await {
            Ok(ws) => ws,
            Err(e) => {
                error!("step executor: failed to reload workspace {ws_id} after step {step_id}: {e}");
                self.running.write().await.remove(&key);
                return;
            }
        };

        let changed = {
            let workflow = match ws.workflows.get_mut(&workflow_id) {
                Some(w) => w,
                None => {
                    self.running.write().await.remove(&key);
                    return;
                }
            };
            match workflow.step_mut(&step_id) {
                Some(step) => {
                    if let Some(tid) = task_id {
                        step.task_id = Some(tid);
                    }
                    match &outcome {
                        Ok(result) => {
                            step.status = StepStatus::Completed;
                            step.result = Some(result.clone());
                            step.completed_at = Some(Utc::now());
                        }
                        Err(err) => {
                            step.status = StepStatus::Failed;
                            step.error = Some(err.clone());
                            step.completed_at = Some(Utc::now());
                        }
                    }
                    true
                }
                None => false,
            }
        };

        if changed {
            ws.touch();
            if let Err(e) = self.store.save(&ws).await {
                error!("step executor: failed to persist workspace {ws_id} after step {step_id} finished: {e}");
            }
            let evt = if outcome.is_ok() { event_type::STEP_COMPLETED } else { event_type::STEP_FAILED };
            self.event_bus
                .publish(Event::new(evt, ws_id, "step-executor").with_data("step_id", step_id.clone()))
                .await;
            self.check_workflow_completion(&mut ws, workflow_id).await;
        }

        self.running.write().await.remove(&key);
    }

    async fn check_workflow_completion(self: &Arc<Self>, ws: &mut Workspace, workflow_id: Uuid) {
        let ws_id = ws.id;
        let failed = {
            let workflow = match ws.workflows.get(&workflow_id) {
                Some(w) => w,
                None => return,
            };
            if workflow.status.is_terminal() {
                return;
            }
            if workflow.steps.is_empty() || !workflow.steps.iter().all(|s| s.status.is_terminal()) {
                return;
            }
            workflow.steps.iter().any(|s| s.status == StepStatus::Failed)
        };

        if let Some(workflow) = ws.workflows.get_mut(&workflow_id) {
            workflow.completed_at = Some(Utc::now());
            workflow.status = if failed { WorkflowStatus::Failed } else { WorkflowStatus::Completed };
        }
        ws.touch();
        if let Err(e) = self.store.save(ws).await {
            error!("step executor: failed to persist workspace {ws_id} after workflow {workflow_id} completed: {e}");
        }
        let evt = if failed { event_type::WORKFLOW_FAILED } else { event_type::WORKFLOW_COMPLETED };
        self.event_bus.publish(Event::new(evt, ws_id, "step-executor")).await;
    }

    pub async fn stop(&self) {
        self.stopped.notify_one();
        for notify in self.running.read().await.values() {
            notify.notify_one();
        }
        let mut bodies = self.bodies.lock().await;
        while bodies.join_next().await.is_some() {}
    }
}

/// §4.5.1: unknown dependency -> not met, not skipped; `failed` predecessor
/// -> skip-cascade; anything else not `completed`/`skipped` -> not met yet.
fn check_dependencies(workflow: &Workflow, step: &WorkflowStep) -> (bool, bool) {
    for dep_id in &step.depends_on {
        match workflow.step(dep_id) {
            None => {
                warn!("workflow {}: step {} depends on unknown step {dep_id}", workflow.id, step.id);
                return (false, false);
            }
            Some(dep) => {
                if dep.status == StepStatus::Failed {
                    return (false, true);
                }
                if dep.status != StepStatus::Completed && dep.status != StepStatus::Skipped {
                    return (false, false);
                }
            }
        }
    }
    (true, false)
}

/// §4.5.2. `exists` is broadened from a strict non-nil check to "present and,
/// if a string, non-empty" so that empty-string context lookups read as
/// absent rather than satisfying `exists`.
fn evaluate_condition(workflow: &Workflow, step: &WorkflowStep) -> ConditionOutcome {
    let Some(condition) = &step.condition else {
        return ConditionOutcome::Execute;
    };

    let actual: Value = match condition.condition_type {
        ConditionType::PreviousResult => workflow
            .step(&condition.step_id)
            .and_then(|s| s.result.clone())
            .map(Value::String)
            .unwrap_or(Value::Null),
        ConditionType::StepStatus => workflow
            .step(&condition.step_id)
            .and_then(|s| serde_json::to_value(s.status).ok())
            .unwrap_or(Value::Null),
        ConditionType::ContextValue => step.context.get(&condition.step_id).cloned().unwrap_or(Value::Null),
    };

    let result = match condition.operator {
        ConditionOperator::Eq => stringify(&actual) == stringify(&condition.value),
        ConditionOperator::Ne => stringify(&actual) != stringify(&condition.value),
        ConditionOperator::Contains => stringify(&actual).contains(&stringify(&condition.value)),
        ConditionOperator::Exists => match &actual {
            Value::Null => false,
            Value::String(s) => !s.is_empty(),
            _ => true,
        },
    };

    if result {
        condition.on_true
    } else {
        condition.on_false
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn next_step_status(workflow: &Workflow, step: &WorkflowStep) -> Option<StepStatus> {
    if step.status != StepStatus::Pending && step.status != StepStatus::Waiting {
        return None;
    }
    let (met, should_skip) = check_dependencies(workflow, step);
    if should_skip {
        return Some(StepStatus::Skipped);
    }
    if !met {
        return Some(StepStatus::Waiting);
    }
    Some(match evaluate_condition(workflow, step) {
        ConditionOutcome::Execute => StepStatus::Ready,
        ConditionOutcome::Skip => StepStatus::Skipped,
    })
}

/// §4.5.3 `aggregate` body: concatenates every completed dependency's name
/// and result under Markdown headers.
fn aggregate_step(workflow: &Workflow, step: &WorkflowStep) -> Result<String, String> {
    if step.depends_on.is_empty() {
        return Err("aggregate step has no dependencies to aggregate".to_string());
    }
    let mut out = String::new();
    for dep_id in &step.depends_on {
        if let Some(dep) = workflow.step(dep_id) {
            if dep.status == StepStatus::Completed {
                let _ = writeln!(out, "## {}", dep.name);
                let _ = writeln!(out, "{}", dep.result.clone().unwrap_or_default());
                let _ = writeln!(out);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as OrchResult;
    use crate::models::{ConditionOperator as Op, StepCondition, SYSTEM_AGENT};
    use crate::store::InMemoryWorkspaceStore;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use tokio::time::sleep;

    fn test_config() -> StepExecutorConfig {
        StepExecutorConfig { poll_interval: Duration::from_millis(20) }
    }

    fn test_bus() -> Arc<EventBus> {
        Arc::new(EventBus::new(crate::config::EventBusConfig { buffer_size: 32, history_size: 32 }))
    }

    struct FixedHandler(String);

    #[async_trait]
    impl TaskHandler for FixedHandler {
        async fn execute_task(&self, _agent_name: &str, _task: &Task) -> OrchResult<String> {
            Ok(self.0.clone())
        }
    }

    fn bare_step(id: &str, deps: &[&str]) -> WorkflowStep {
        WorkflowStep {
            id: id.to_string(),
            name: id.to_string(),
            description: format!("do {id}"),
            step_type: StepType::Task,
            assigned_to: Some("agent-b".into()),
            depends_on: deps.iter().map(|s| s.to_string()).collect::<HashSet<_>>(),
            condition: None,
            context: HashMap::new(),
            timeout_secs: 0,
            status: StepStatus::Pending,
            result: None,
            error: None,
            task_id: None,
            started_at: None,
            completed_at: None,
        }
    }

    fn workspace_with_workflow(steps: Vec<WorkflowStep>) -> (Workspace, Uuid) {
        let mut ws = Workspace::new("demo", "d", SYSTEM_AGENT);
        ws.agents = vec!["agent-a".into(), "agent-b".into()];
        let workflow = Workflow { id: Uuid::new_v4(), name: "wf".into(), steps, status: WorkflowStatus::Pending, started_at: None, completed_at: None };
        let wf_id = workflow.id;
        ws.workflows.insert(wf_id, workflow);
        (ws, wf_id)
    }

    #[tokio::test]
    async fn runs_independent_step_to_completion() {
        let (mut ws, wf_id) = workspace_with_workflow(vec![bare_step("s1", &[])]);
        let store = Arc::new(InMemoryWorkspaceStore::new());
        store.save(&ws).await.unwrap();

        let executor = StepExecutor::new(store.clone(), test_bus(), Arc::new(FixedHandler("done".into())), test_config());
        executor.poll_once_pub_test(&mut ws).await;
        sleep(Duration::from_millis(40)).await;

        let reloaded = store.get(ws.id).await.unwrap();
        let workflow = reloaded.workflows.get(&wf_id).unwrap();
        let step = workflow.step("s1").unwrap();
        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.result.as_deref(), Some("done"));
        assert_eq!(workflow.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn failed_predecessor_cascades_as_skip_and_fails_workflow() {
        let mut s1 = bare_step("s1", &[]);
        s1.status = StepStatus::Failed;
        let condition = StepCondition {
            condition_type: ConditionType::StepStatus,
            step_id: "s1".into(),
            operator: Op::Eq,
            value: serde_json::json!("completed"),
            on_true: ConditionOutcome::Execute,
            on_false: ConditionOutcome::Skip,
        };
        let mut s2 = bare_step("s2", &["s1"]);
        s2.condition = Some(condition);

        let (mut ws, wf_id) = workspace_with_workflow(vec![s1, s2]);
        let store = Arc::new(InMemoryWorkspaceStore::new());
        store.save(&ws).await.unwrap();

        let executor = StepExecutor::new(store.clone(), test_bus(), Arc::new(FixedHandler("done".into())), test_config());
        executor.poll_once_pub_test(&mut ws).await;
        sleep(Duration::from_millis(20)).await;
        let mut ws2 = store.get(ws.id).await.unwrap();
        executor.poll_once_pub_test(&mut ws2).await;
        sleep(Duration::from_millis(20)).await;

        let reloaded = store.get(ws.id).await.unwrap();
        let workflow = reloaded.workflows.get(&wf_id).unwrap();
        assert_eq!(workflow.step("s2").unwrap().status, StepStatus::Skipped);
        assert_eq!(workflow.status, WorkflowStatus::Failed);
    }

    #[test]
    fn exists_operator_treats_empty_string_as_absent() {
        let (ws, wf_id) = workspace_with_workflow(vec![bare_step("s1", &[])]);
        let workflow = ws.workflows.get(&wf_id).unwrap();
        let mut step = bare_step("s2", &[]);
        step.context.insert("k".into(), Value::String(String::new()));
        step.condition = Some(StepCondition {
            condition_type: ConditionType::ContextValue,
            step_id: "k".into(),
            operator: Op::Exists,
            value: Value::Null,
            on_true: ConditionOutcome::Execute,
            on_false: ConditionOutcome::Skip,
        });
        assert_eq!(evaluate_condition(workflow, &step), ConditionOutcome::Skip);
    }

    #[test]
    fn aggregate_requires_dependencies() {
        let (ws, wf_id) = workspace_with_workflow(vec![bare_step("s1", &[])]);
        let workflow = ws.workflows.get(&wf_id).unwrap();
        let mut agg = bare_step("agg", &[]);
        agg.step_type = StepType::Aggregate;
        assert!(aggregate_step(workflow, &agg).is_err());
    }

    impl StepExecutor {
        async fn poll_once_pub_test(self: &Arc<Self>, ws: &mut Workspace) {
            self.process_workflow(ws, *ws.workflows.keys().next().unwrap()).await;
        }
    }
}
