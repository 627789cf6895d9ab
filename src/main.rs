use anyhow::Result;
use clap::Parser;
use fabric_core::{
    api::{ApiServer, AppState},
    composer::OutputComposer,
    config::Config,
    cortex::ProjectStore,
    cost_guard::CostGuard,
    decomposer::TaskDecomposer,
    dispatcher::{Dispatcher, LocalWorker},
    gate::DecisionGate,
    maintenance,
    registry::{scaler::AutoScaler, AgentRegistry},
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fabric-core", about = "Distributed AI task-orchestration fabric")]
struct Args {
    /// Bind address override
    #[arg(long)]
    host: Option<String>,

    /// Listen port override
    #[arg(long)]
    port: Option<u16>,

    /// Directory for persisted project state
    #[arg(long)]
    data_dir: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("Starting Fabric Core orchestration fabric");

    let args = Args::parse();
    let mut config = Config::load()?;
    if let Some(host) = args.host {
        config.api.host = host;
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.store.data_dir = data_dir;
    }

    let registry = Arc::new(AgentRegistry::new(config.registry.clone()).await);
    let scaler = Arc::new(AutoScaler::new(
        registry.clone(),
        config.registry.scale_up_threshold,
        config.registry.scale_down_threshold,
    ));
    let gate = DecisionGate::new(config.gate.approval_timeout_hours);
    let store = ProjectStore::new(config.store.data_dir.clone());
    let cost_guard = CostGuard::new(&config.cost_guard);
    let dispatcher = Dispatcher::new(registry.clone(), cost_guard.clone(), Arc::new(LocalWorker));

    let state = AppState::new(
        registry,
        scaler,
        Arc::new(TaskDecomposer::new()),
        gate.clone(),
        store,
        cost_guard.clone(),
        dispatcher.clone(),
        Arc::new(OutputComposer::new()),
    )?;
    let api_server = ApiServer::new(&config, state);

    tokio::select! {
        result = api_server.run() => {
            if let Err(e) = result {
                error!("API server failed: {e}");
                std::process::exit(1);
            }
        }
        _ = maintenance::run(gate, cost_guard, dispatcher) => {
            error!("Maintenance loop exited unexpectedly");
            std::process::exit(1);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    info!("Fabric Core shutdown complete");
    Ok(())
}
