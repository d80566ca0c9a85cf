//! Default values for every configurable component. See [`crate::config`]
//! for how these are overridden from the environment.

use std::time::Duration;

/// Event Bus ring-buffer capacity (§6.6).
pub const DEFAULT_EVENT_HISTORY_SIZE: usize = 1000;
/// Event Bus per-subscriber in-flight publish buffer (§6.6).
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

/// Task Executor polling cadence (§4.4).
pub const DEFAULT_TASK_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Task Executor concurrent body cap (§4.4).
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 5;
/// Task body timeout when `Task.timeout_secs == 0` (§4.4, §5).
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Step Executor polling cadence (§4.5).
pub const DEFAULT_STEP_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Step body timeout when `WorkflowStep.timeout_secs == 0` (§4.5.3, §5).
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Task Scheduler polling cadence (§4.6).
pub const DEFAULT_SCHEDULER_POLL_INTERVAL: Duration = Duration::from_secs(60);
/// Consecutive materialization failures before a `ScheduledTask` auto-disables (§4.6 step 5).
pub const SCHEDULER_MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Notification Service FIFO depth (§6.6).
pub const DEFAULT_NOTIFICATION_BUFFER_SIZE: usize = 500;

/// Default priority assigned to synthetic step tasks (§4.5.3).
pub const STEP_TASK_DEFAULT_PRIORITY: i32 = 5;
