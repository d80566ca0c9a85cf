//! Evaluates `ScheduledTask` templates and materializes `Task` instances on
//! schedule (§4.6).

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDateTime, NaiveTime, Utc};
use tokio::sync::Notify;
use tokio::time::interval;
use tracing::{error, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::constants;
use crate::error::{OrchestratorError, Result};
use crate::event_bus::EventBus;
use crate::models::{event_type, Event, ExecutionStatus, ScheduleConfig, ScheduleKind, ScheduledTask, Task, TaskExecution, TaskStatus};
use crate::store::WorkspaceStore;

/// Rejects `cron` schedules at insertion time rather than silently
/// accepting a template that never fires (§9 Open Question 4).
pub fn validate_schedule(config: &ScheduleConfig) -> Result<()> {
    if matches!(config.kind, ScheduleKind::Cron { .. }) {
        return Err(OrchestratorError::validation("cron schedules are not supported; use interval, daily, or weekly"));
    }
    Ok(())
}

pub struct TaskScheduler {
    store: Arc<dyn WorkspaceStore>,
    event_bus: Arc<EventBus>,
    config: SchedulerConfig,
    stopped: Notify,
}

impl TaskScheduler {
    pub fn new(store: Arc<dyn WorkspaceStore>, event_bus: Arc<EventBus>, config: SchedulerConfig) -> Arc<Self> {
        Arc::new(Self { store, event_bus, config, stopped: Notify::new() })
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

    pub fn stop(&self) {
        self.stopped.notify_one();
    }

    async fn poll_once(&self) {
        let ids = match self.store.list().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("scheduler: failed to list workspaces: {e}");
                return;
            }
        };

        for id in ids {
            let mut ws = match self.store.get(id).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("scheduler: failed to load workspace {id}: {e}");
                    continue;
                }
            };
            if !ws.is_active() {
                continue;
            }

            let now = Utc::now();
            let agents = ws.agents.clone();
            let ws_id = ws.id;
            let sched_ids: Vec<Uuid> = ws.scheduled_tasks.iter().map(|s| s.id).collect();

            let mut changed = false;
            let mut materialized = Vec::new();

            for sched_id in sched_ids {
                let Some(sched) = ws.scheduled_tasks.iter_mut().find(|s| s.id == sched_id) else { continue };
                match materialize(sched, &agents, ws_id, now) {
                    MaterializeOutcome::Skipped => {}
                    MaterializeOutcome::Failed => changed = true,
                    MaterializeOutcome::Materialized(task) => {
                        changed = true;
                        materialized.push((sched_id, sched.execution_count, sched.failure_count, task));
                    }
                }
            }

            for (_, _, _, task) in &materialized {
                ws.tasks.push(task.clone());
            }

            if changed {
                ws.touch();
                if let Err(e) = self.store.save(&ws).await {
                    error!("scheduler: failed to persist workspace {ws_id} after evaluating schedules: {e}");
                }
            }

            for (sched_id, execution_count, failure_count, task) in materialized {
                self.event_bus
                    .publish(
                        Event::new(event_type::STUDIO_UPDATED, ws_id, "scheduler")
                            .with_data("scheduled_task_id", sched_id.to_string())
                            .with_data("task_id", task.id.to_string())
                            .with_data("execution_count", execution_count.to_string())
                            .with_data("failure_count", failure_count.to_string()),
                    )
                    .await;
            }
        }
    }
}

enum MaterializeOutcome {
    Skipped,
    Failed,
    Materialized(Task),
}

/// §4.6 steps 1-6 for a single `ScheduledTask`, given the workspace's
/// current agent roster for validation.
fn materialize(sched: &mut ScheduledTask, ws_agents: &[String], ws_id: Uuid, now: DateTime<Utc>) -> MaterializeOutcome {
    if !sched.enabled {
        return MaterializeOutcome::Skipped;
    }
    let Some(next_run) = sched.next_run else { return MaterializeOutcome::Skipped };
    if next_run > now {
        return MaterializeOutcome::Skipped;
    }

    if sched.schedule.max_runs > 0 && sched.execution_count >= sched.schedule.max_runs as u64 {
        sched.enabled = false;
        sched.next_run = None;
        sched.updated_at = now;
        return MaterializeOutcome::Skipped;
    }
    if let Some(end_date) = sched.schedule.end_date {
        if now > end_date {
            sched.enabled = false;
            sched.updated_at = now;
            return MaterializeOutcome::Skipped;
        }
    }

    if !(ws_agents.contains(&sched.to) || sched.to == crate::models::UNASSIGNED) {
        sched.failure_count += 1;
        sched.push_execution(TaskExecution {
            task_id: Uuid::nil(),
            executed_at: now,
            status: ExecutionStatus::Failed,
            error: Some(format!("agent '{}' is not a participant in this studio", sched.to)),
            duration_ms: 0,
        });
        if sched.failure_count >= constants::SCHEDULER_MAX_CONSECUTIVE_FAILURES {
            sched.enabled = false;
        }
        sched.updated_at = now;
        return MaterializeOutcome::Failed;
    }

    let mut task = Task::new(ws_id, sched.from.clone(), sched.to.clone(), sched.prompt.clone(), sched.priority);
    task.context = sched.context.clone();
    task.status = TaskStatus::Pending;

    sched.last_run = Some(now);
    sched.execution_count += 1;
    sched.failure_count = 0;
    sched.push_execution(TaskExecution { task_id: task.id, executed_at: now, status: ExecutionStatus::Success, error: None, duration_ms: 0 });

    match compute_next_run(&sched.schedule.kind, sched.last_run, sched.schedule.end_date) {
        Some(next) => sched.next_run = Some(next),
        None => {
            sched.next_run = None;
            sched.enabled = false;
        }
    }
    sched.updated_at = now;

    MaterializeOutcome::Materialized(task)
}

/// §4.6.1. All arithmetic operates on the stored UTC timestamps directly; no
/// separate ambient-zone field exists in this data model, so "ambient zone"
/// collapses to UTC here (see the DST caveat in the design notes).
fn compute_next_run(kind: &ScheduleKind, last_run: Option<DateTime<Utc>>, end_date: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    let candidate = match kind {
        ScheduleKind::Once { .. } => return None,
        ScheduleKind::Interval { interval_secs } => {
            let base = last_run.unwrap_or_else(Utc::now);
            base + ChronoDuration::seconds(*interval_secs)
        }
        ScheduleKind::Daily { time_of_day } => {
            let base = last_run.unwrap_or_else(Utc::now);
            let Some((hour, minute)) = parse_hhmm(time_of_day) else {
                warn!("scheduler: malformed daily time_of_day '{time_of_day}'");
                return None;
            };
            let Some(next_date) = base.date_naive().succ_opt() else { return None };
            let Some(next_time) = NaiveTime::from_hms_opt(hour, minute, 0) else { return None };
            DateTime::<Utc>::from_naive_utc_and_offset(NaiveDateTime::new(next_date, next_time), Utc)
        }
        ScheduleKind::Weekly { time_of_day, day_of_week } => {
            let base = last_run.unwrap_or_else(Utc::now);
            let Some((hour, minute)) = parse_hhmm(time_of_day) else {
                warn!("scheduler: malformed weekly time_of_day '{time_of_day}'");
                return None;
            };
            let current_weekday = base.weekday().num_days_from_sunday() as i64;
            let target_weekday = i64::from(*day_of_week);
            let mut days_until = (target_weekday - current_weekday).rem_euclid(7);
            if days_until == 0 {
                days_until = 7;
            }
            let next_date = base.date_naive() + ChronoDuration::days(days_until);
            let Some(next_time) = NaiveTime::from_hms_opt(hour, minute, 0) else { return None };
            DateTime::<Utc>::from_naive_utc_and_offset(NaiveDateTime::new(next_date, next_time), Utc)
        }
        ScheduleKind::Cron { .. } => {
            warn!("scheduler: cron schedules are not implemented");
            return None;
        }
    };

    match end_date {
        Some(end) if candidate > end => None,
        _ => Some(candidate),
    }
}

fn parse_hhmm(value: &str) -> Option<(u32, u32)> {
    let (h, m) = value.split_once(':')?;
    let hour: u32 = h.trim().parse().ok()?;
    let minute: u32 = m.trim().parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}
