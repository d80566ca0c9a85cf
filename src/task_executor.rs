//! Polls every active workspace for `assigned` tasks and runs them with
//! bounded concurrency (§4.4).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, Duration};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::TaskExecutorConfig;
use crate::constants;
use crate::event_bus::EventBus;
use crate::models::{event_type, Event, Task, TaskStatus, Workspace};
use crate::store::WorkspaceStore;
use crate::task_handler::TaskHandler;

const INPUT_RESULTS_KEY: &str = "input_task_results";

pub struct TaskExecutor {
    store: Arc<dyn WorkspaceStore>,
    event_bus: Arc<EventBus>,
    handler: Arc<dyn TaskHandler>,
    config: TaskExecutorConfig,
    running: RwLock<HashMap<Uuid, Arc<Notify>>>,
    bodies: tokio::sync::Mutex<JoinSet<()>>,
    stopped: Notify,
}

impl TaskExecutor {
    pub fn new(
        store: Arc<dyn WorkspaceStore>,
        event_bus: Arc<EventBus>,
        handler: Arc<dyn TaskHandler>,
        config: TaskExecutorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            event_bus,
            handler,
            config,
            running: RwLock::new(HashMap::new()),
            bodies: tokio::sync::Mutex::new(JoinSet::new()),
            stopped: Notify::new(),
        })
    }

    /// Runs the polling loop until [`TaskExecutor::stop`] is called.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll_once().await,
                _ = self.stopped.notified() => break,
            }
        }
    }

    /// One pass over every workspace. Stops scanning entirely, not just the
    /// current workspace, once `max_concurrent` running bodies are in
    /// flight, so saturation on one busy workspace doesn't starve fairness
    /// across workspaces on the same tick.
    async fn poll_once(self: &Arc<Self>) {
        let ids = match self.store.list().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("task executor: failed to list workspaces: {e}");
                return;
            }
        };

        for id in ids {
            let ws = match self.store.get(id).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("task executor: failed to load workspace {id}: {e}");
                    continue;
                }
            };
            if !ws.is_active() {
                continue;
            }

            for task in ws.tasks.clone() {
                if task.status != TaskStatus::Assigned {
                    continue;
                }
                if self.running.read().await.contains_key(&task.id) {
                    continue;
                }
                if self.running.read().await.len() >= self.config.max_concurrent {
                    info!(
                        "task executor saturated at max_concurrent={}, deferring remaining work",
                        self.config.max_concurrent
                    );
                    return;
                }
                self.start_execution(ws.clone(), task).await;
            }
        }
    }

    async fn start_execution(self: &Arc<Self>, mut ws: Workspace, task: Task) {
        let task_id = task.id;
        let workspace_id = ws.id;
        let notify = Arc::new(Notify::new());
        self.running.write().await.insert(task_id, notify.clone());

        let mut context = task.context.clone();
        if !task.input_task_ids.is_empty() {
            let mut input_results = Map::new();
            for input_id in &task.input_task_ids {
                if let Some(input_task) = ws.find_task(*input_id) {
                    if let Some(result) = &input_task.result {
                        if !result.is_empty() {
                            input_results.insert(input_id.to_string(), Value::String(result.clone()));
                        }
                    }
                }
            }
            context.insert(INPUT_RESULTS_KEY.to_string(), Value::Object(input_results));
        }

        let timeout_duration = if task.timeout_secs > 0 {
            Duration::from_secs(task.timeout_secs)
        } else {
            constants::DEFAULT_TASK_TIMEOUT
        };

        if let Some(t) = ws.find_task_mut(task_id) {
            t.context = context.clone();
            t.status = TaskStatus::InProgress;
            t.started_at = Some(Utc::now());
        }
        ws.touch();
        if let Err(e) = self.store.save(&ws).await {
            error!("task executor: failed to persist workspace {workspace_id} before starting task {task_id}: {e}");
        }

        self.event_bus
            .publish(Event::new(event_type::TASK_STARTED, workspace_id, "task-executor").with_data("task_id", task_id.to_string()))
            .await;

        let mut body_task = task;
        body_task.context = context;

        let executor = Arc::clone(self);
        self.bodies.lock().await.spawn(async move {
            executor.run_body(workspace_id, body_task, notify, timeout_duration).await;
        });
    }

    async fn run_body(self: Arc<Self>, workspace_id: Uuid, task: Task, notify: Arc<Notify>, timeout_duration: Duration) {
        let task_id = task.id;
        let agent_name = task.to.clone();

        let outcome: Result<String, String> = tokio::select! {
            result = timeout(timeout_duration, self.handler.execute_task(&agent_name, &task)) => match result {
                Ok(Ok(text)) => Ok(text),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err("timed out".to_string()),
            },
            _ = notify.notified() => Err("cancelled".to_string()),
        };

        let mut ws = match self.store.get(workspace_id).await {
            Ok(ws) => ws,
            Err(e) => {
                error!("task executor: failed to reload workspace {workspace_id} after task {task_id}: {e}");
                self.running.write().await.remove(&task_id);
                return;
            }
        };

        if ws.find_task(task_id).is_none() {
            warn!("task {task_id} vanished from workspace {workspace_id} before completion could be recorded");
            self.running.write().await.remove(&task_id);
            return;
        }

        let (completion_event, status_label) = match &outcome {
            Ok(result) => {
                if let Some(t) = ws.find_task_mut(task_id) {
                    t.status = TaskStatus::Completed;
                    t.result = Some(result.clone());
                    t.completed_at = Some(Utc::now());
                }
                (event_type::TASK_COMPLETED, "completed")
            }
            Err(err) => {
                if let Some(t) = ws.find_task_mut(task_id) {
                    t.status = TaskStatus::Failed;
                    t.error = Some(err.clone());
                    t.completed_at = Some(Utc::now());
                }
                (event_type::TASK_FAILED, "failed")
            }
        };

        ws.touch();
        if let Err(e) = self.store.save(&ws).await {
            error!("task executor: failed to persist workspace {workspace_id} after task {task_id} finished: {e}");
        }

        self.event_bus
            .publish(Event::new(completion_event, workspace_id, "task-executor").with_data("task_id", task_id.to_string()))
            .await;
        self.event_bus
            .publish(
                Event::new(event_type::STUDIO_UPDATED, workspace_id, "task-executor")
                    .with_data("task_id", task_id.to_string())
                    .with_data("status", status_label),
            )
            .await;

        self.running.write().await.remove(&task_id);
    }

    /// Cancels the execution context for a running task. Returns `false` if
    /// the task was not running.
    pub async fn cancel_task(&self, task_id: Uuid) -> bool {
        match self.running.read().await.get(&task_id) {
            Some(notify) => {
                notify.notify_one();
                true
            }
            None => false,
        }
    }

    /// Stops the polling loop, cancels every in-flight body, and waits for
    /// all of them to return.
    pub async fn stop(&self) {
        self.stopped.notify_one();
        for notify in self.running.read().await.values() {
            notify.notify_one();
        }
        let mut bodies = self.bodies.lock().await;
        while bodies.join_next().await.is_some() {}
    }
}
