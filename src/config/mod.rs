
use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{OrchestratorError, Result};

/// Root configuration, one sub-struct per component per §6.6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub event_bus: EventBusConfig,
    pub task_executor: TaskExecutorConfig,
    pub step_executor: StepExecutorConfig,
    pub scheduler: SchedulerConfig,
    pub notifications: NotificationConfig,
    /// Base directory for the file-backed workspace store (§6.1).
    pub workspace_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    pub buffer_size: usize,
    pub history_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecutorConfig {
    pub poll_interval: Duration,
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutorConfig {
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub buffer_size: usize,
}

impl Config {
    /// Loads configuration from the environment, falling back to the
    /// defaults in [`crate::constants`]. `.env` is read first via
    /// `dotenvy` when present; a missing file is not an error.
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!("loaded .env file from {:?}", path),
            Err(e) => tracing::debug!("no .env file loaded: {e}"),
        }

        let event_bus = EventBusConfig {
            buffer_size: env_parse("EVENT_BUS_BUFFER_SIZE", constants::DEFAULT_EVENT_BUFFER_SIZE)?,
            history_size: env_parse("EVENT_BUS_HISTORY_SIZE", constants::DEFAULT_EVENT_HISTORY_SIZE)?,
        };

        let task_executor = TaskExecutorConfig {
            poll_interval: env_parse_secs("TASK_EXECUTOR_POLL_INTERVAL_SECS", constants::DEFAULT_TASK_POLL_INTERVAL)?,
            max_concurrent: env_parse("TASK_EXECUTOR_MAX_CONCURRENT", constants::DEFAULT_MAX_CONCURRENT_TASKS)?,
        };

        let step_executor = StepExecutorConfig {
            poll_interval: env_parse_secs("STEP_EXECUTOR_POLL_INTERVAL_SECS", constants::DEFAULT_STEP_POLL_INTERVAL)?,
        };

        let scheduler = SchedulerConfig {
            poll_interval: env_parse_secs("SCHEDULER_POLL_INTERVAL_SECS", constants::DEFAULT_SCHEDULER_POLL_INTERVAL)?,
        };

        let notifications = NotificationConfig {
            buffer_size: env_parse("NOTIFICATION_BUFFER_SIZE", constants::DEFAULT_NOTIFICATION_BUFFER_SIZE)?,
        };

        let workspace_dir = env::var("WORKSPACE_DIR").unwrap_or_else(|_| "./data/workspaces".to_string());

        Ok(Config {
            event_bus,
            task_executor,
            step_executor,
            scheduler,
            notifications,
            workspace_dir,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| OrchestratorError::validation(format!("{key} is not a valid value"))),
        Err(_) => Ok(default),
    }
}

fn env_parse_secs(key: &str, default: Duration) -> Result<Duration> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}
