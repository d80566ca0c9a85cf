//! # Studio Orchestrator
//!
//! A multi-agent orchestration core: a durable workspace store, a
//! publish/subscribe event bus, bounded-concurrency task and workflow-step
//! executors, a polling schedule, a mission decomposer, and a notification
//! feed over the same event stream.
//!
//! ## Architecture
//!
//! - **Workspace Store** (§4.1): durable home for agents, tasks, workflows,
//!   messages, and schedules, backed by one JSON file per workspace.
//! - **Event Bus** (§4.2): in-process publish/subscribe with a bounded
//!   history ring buffer.
//! - **Task Handler** (§4.3): the capability that actually runs one task
//!   against an LLM and its tool catalog.
//! - **Task Executor** (§4.4): polls for `assigned` tasks and drives them to
//!   completion with bounded concurrency.
//! - **Step Executor** (§4.5): walks workflow DAGs, evaluating dependencies
//!   and conditions between steps.
//! - **Task Scheduler** (§4.6): materializes tasks from recurring
//!   schedules.
//! - **Mission Orchestrator** (§4.7): decomposes a free-text mission into a
//!   task sequence via an LLM call and runs it end to end.
//! - **Notification Service** (§4.8): a bounded recent-notifications feed
//!   with both pull and push access.
//!
//! The LLM completion call and the per-agent tool catalog are capabilities
//! the core consumes but never implements; an embedding application
//! supplies both (§6.2-§6.4).

/// LLM completion and tool-catalog capability contracts, plus test mocks.
pub mod capability;
/// Runtime configuration loaded from the environment.
pub mod config;
/// System-wide constants and defaults.
pub mod constants;
/// Error types and the crate-wide `Result` alias.
pub mod error;
/// In-process publish/subscribe event bus.
pub mod event_bus;
/// Mission decomposition and sequential execution.
pub mod mission;
/// Core data models: workspaces, agents, tasks, workflows, messages, schedules.
pub mod models;
/// Bounded recent-notifications feed over the event bus.
pub mod notification;
/// Recurring schedule materialization.
pub mod scheduler;
/// Workflow DAG execution.
pub mod step_executor;
/// Durable workspace persistence.
pub mod store;
/// Task-polling execution loop.
pub mod task_executor;
/// The Task Handler capability: runs one task against an LLM.
pub mod task_handler;

pub use error::{OrchestratorError, Result};
