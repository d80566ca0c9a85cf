use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, Level};

use studio_orchestrator::capability::{MockLlmCapability, MockToolCatalog};
use studio_orchestrator::config::Config;
use studio_orchestrator::event_bus::EventBus;
use studio_orchestrator::mission::MissionOrchestrator;
use studio_orchestrator::notification::NotificationService;
use studio_orchestrator::scheduler::TaskScheduler;
use studio_orchestrator::step_executor::StepExecutor;
use studio_orchestrator::store::FileWorkspaceStore;
use studio_orchestrator::task_executor::TaskExecutor;
use studio_orchestrator::task_handler::DefaultTaskHandler;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("starting studio orchestrator");

    let config = Config::load()?;

    let store = Arc::new(FileWorkspaceStore::new(config.workspace_dir.clone()).await?);
    let event_bus = Arc::new(EventBus::new(config.event_bus.clone()));
    let _notifications = NotificationService::new(&event_bus, config.notifications.buffer_size).await;

    // An embedding application supplies real LLM and tool-catalog capabilities
    // (§6.2-§6.4); these mocks keep the binary runnable on its own.
    let llm = Arc::new(MockLlmCapability::text("no LLM capability configured"));
    let tool_catalog = Arc::new(MockToolCatalog::new());
    let handler: Arc<DefaultTaskHandler> =
        Arc::new(DefaultTaskHandler::new(llm.clone(), tool_catalog, event_bus.clone(), HashMap::new()));

    let task_executor = TaskExecutor::new(store.clone(), event_bus.clone(), handler.clone(), config.task_executor.clone());
    let step_executor = StepExecutor::new(store.clone(), event_bus.clone(), handler.clone(), config.step_executor.clone());
    let scheduler = TaskScheduler::new(store.clone(), event_bus.clone(), config.scheduler.clone());
    let _mission_orchestrator = MissionOrchestrator::new(store.clone(), event_bus.clone(), llm.clone());

    tokio::select! {
        _ = task_executor.clone().run() => error!("task executor loop exited"),
        _ = step_executor.clone().run() => error!("step executor loop exited"),
        _ = scheduler.clone().run() => error!("scheduler loop exited"),
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
    }

    task_executor.stop().await;
    step_executor.stop().await;
    scheduler.stop();

    Ok(())
}
