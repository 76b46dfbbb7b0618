use std::sync::Arc;

use adi_core::{init_tracing, AgentDeps, ExecutionTracker, OrchestratorConfig, METRICS};
use adi_state::SurrealExecutionStore;
use adi_worker::{router, WorkerState};
use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "adi-worker")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Runs dispatched ADI slow agents behind a bounded work queue", long_about = None)]
struct Args {
    /// Address to bind
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to bind (0 picks a free port)
    #[arg(long, env = "PORT", default_value_t = 8787)]
    port: u16,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(args.json, level);

    let config = OrchestratorConfig::from_env().context("invalid ADI_* configuration")?;
    let store = SurrealExecutionStore::from_env()
        .await
        .context("Failed to connect to execution store")?;
    let tracker = ExecutionTracker::with_policy(Arc::new(store), config.verify);
    let deps = AgentDeps::from_config(&config);
    info!(
        providers = deps.providers.len(),
        max_concurrent = config.max_concurrent,
        max_queue_size = config.max_queue_size,
        "worker configured"
    );

    let app = router(WorkerState::from_config(&config, deps, tracker));
    let listener = tokio::net::TcpListener::bind(format!("{}:{}", args.host, args.port))
        .await
        .with_context(|| format!("could not bind {}:{}", args.host, args.port))?;
    info!("Worker listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    METRICS.flush();
    Ok(())
}
