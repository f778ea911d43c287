//! `kubechain run`: the controller manager
//!
//! Opens the SQLite store, connects the clients, registers every reconciler
//! and runs until ctrl+c.

use anyhow::{Context as _, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use kubechain_core::approval::HumanLayerClientFactory;
use kubechain_core::config::KubechainConfig;
use kubechain_core::controller::{
    AgentReconciler, ContactChannelReconciler, Context, LlmReconciler, McpServerReconciler,
    TaskReconciler, TaskRunReconciler, TaskRunToolCallReconciler, ToolReconciler,
};
use kubechain_core::events::EventRecorder;
use kubechain_core::llm::OpenAiClientFactory;
use kubechain_core::mcp::McpServerManager;
use kubechain_core::runtime::ControllerManager;
use kubechain_core::secrets::{SecretStore, StoreSecrets};
use kubechain_core::store::{ResourceStore, SqliteStore};
use kubechain_core::tools::ToolBackendRegistry;

/// Interval at which writes from other processes are picked up
const CHANGE_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub async fn run(config: KubechainConfig) -> Result<()> {
    let sqlite = Arc::new(
        SqliteStore::open(&config.database_path)
            .with_context(|| format!("Failed to open store {:?}", config.database_path))?,
    );
    let poller = Arc::clone(&sqlite).spawn_change_poller(CHANGE_POLL_INTERVAL);
    let store: Arc<dyn ResourceStore> = sqlite;

    let secrets: Arc<dyn SecretStore> = Arc::new(StoreSecrets::new(Arc::clone(&store)));
    let mcp = Arc::new(McpServerManager::new(
        Arc::clone(&secrets),
        config.mcp_working_dir(),
    ));

    let ctx = Arc::new(Context {
        store: Arc::clone(&store),
        events: Arc::new(EventRecorder::default()),
        secrets,
        llm_factory: Arc::new(OpenAiClientFactory::new(config.llm.clone())),
        tool_backend: mcp.clone(),
        approvals: Arc::new(HumanLayerClientFactory::new(
            config.humanlayer.api_base.clone(),
        )),
        external_apis: ToolBackendRegistry::with_http_default(),
        config: config.clone(),
    });

    let workers = config.workers;
    let manager = Arc::new(
        ControllerManager::new(store)
            .register(Arc::new(TaskReconciler::new(ctx.clone())), workers)
            .register(Arc::new(TaskRunReconciler::new(ctx.clone())), workers)
            .register(Arc::new(TaskRunToolCallReconciler::new(ctx.clone())), workers)
            .register(Arc::new(AgentReconciler::new(ctx.clone())), workers)
            .register(Arc::new(LlmReconciler::new(ctx.clone())), workers)
            .register(Arc::new(ToolReconciler::new(ctx.clone())), workers)
            .register(Arc::new(ContactChannelReconciler::new(ctx.clone())), workers)
            .register(
                Arc::new(McpServerReconciler::new(ctx.clone(), mcp.clone())),
                workers,
            ),
    );

    info!(
        "Controller manager starting with {} workers per controller, store {:?}",
        workers, config.database_path
    );
    let mut running = tokio::spawn(Arc::clone(&manager).run());

    let stopped = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for ctrl+c")?;
            None
        }
        finished = &mut running => Some(finished),
    };
    let finished = match stopped {
        Some(finished) => finished,
        None => {
            info!("Shutting down");
            manager.shutdown();
            running.await
        }
    };
    match finished {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Controller manager stopped with error: {:#}", e),
        Err(e) => warn!("Controller manager task failed: {}", e),
    }
    poller.abort();
    mcp.disconnect_all().await;
    Ok(())
}
