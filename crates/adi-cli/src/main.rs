//! ADI command-line driver.
//!
//! ## Commands
//!
//! - `evaluate`: run an evaluation, then poll its status until every slow
//!   agent has finished, printing progress
//! - `status`: evaluation status from a running worker
//! - `cancel`: cancel an evaluation on a running worker
//! - `agents`: list the agent catalogue
//!
//! Without `--worker-url` slow agents run in this process on the built-in
//! work queue. With it they are posted to an `adi-worker`, and both sides
//! must share the execution store named by `SURREALDB_URL`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use adi_core::{
    AgentDeps, AgentKind, EvaluationContext, EvaluationStatus, EvaluationTier, FinalResults,
    HybridOrchestrator, LlmProvider, OrchestratorConfig, ScriptedProvider,
};
use adi_state::{ExecutionStore, MemoryExecutionStore, SurrealExecutionStore};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "adi")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "AI Discoverability Index evaluation driver", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Result format on stdout
    #[arg(long, global = true, value_enum, default_value = "text")]
    output: OutputFormat,

    /// Base URL of an adi-worker; slow agents run in-process when unset
    #[arg(long, global = true, env = "ADI_WORKER_URL")]
    worker_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an evaluation and wait for every agent to finish
    Evaluate {
        /// Website to evaluate
        #[arg(long)]
        url: String,

        /// Brand name to look for
        #[arg(long)]
        brand: String,

        /// Evaluation id (generated when omitted)
        #[arg(long)]
        evaluation_id: Option<String>,

        /// Read page content from a file instead of fetching it
        #[arg(long, conflicts_with = "fetch")]
        content_file: Option<PathBuf>,

        /// Fetch page content from --url
        #[arg(long)]
        fetch: bool,

        /// Commercial tier; shifts slow-agent priority
        #[arg(long, value_enum, default_value = "professional")]
        tier: TierArg,

        /// Dispatch every slow agent at critical priority
        #[arg(long)]
        urgent: bool,

        /// Query to probe providers with (repeatable)
        #[arg(long = "query")]
        queries: Vec<String>,

        /// Status polling interval
        #[arg(long, env = "ADI_POLL_INTERVAL_MS", default_value_t = 1000)]
        poll_interval_ms: u64,

        /// Give up (and cancel) after this many seconds
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,

        /// Use a scripted provider instead of ADI_PROVIDERS
        #[arg(long)]
        offline: bool,
    },

    /// Show an evaluation's status from a worker
    Status {
        evaluation_id: String,
    },

    /// Cancel an evaluation on a worker
    Cancel {
        evaluation_id: String,
    },

    /// List the agent catalogue
    Agents,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TierArg {
    Free,
    Professional,
    Enterprise,
}

impl From<TierArg> for EvaluationTier {
    fn from(tier: TierArg) -> Self {
        match tier {
            TierArg::Free => EvaluationTier::Free,
            TierArg::Professional => EvaluationTier::Professional,
            TierArg::Enterprise => EvaluationTier::Enterprise,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    adi_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Evaluate {
            url,
            brand,
            evaluation_id,
            content_file,
            fetch,
            tier,
            urgent,
            queries,
            poll_interval_ms,
            timeout_secs,
            offline,
        } => {
            let mut config = OrchestratorConfig::from_env().context("invalid ADI_* configuration")?;
            if cli.worker_url.is_some() {
                config.worker_url = cli.worker_url.clone();
            }
            let mut ctx = EvaluationContext::new(
                evaluation_id.unwrap_or_else(|| format!("eval-{}", uuid::Uuid::new_v4())),
                url,
                brand,
            )
            .with_tier(tier.into());
            ctx.urgent = urgent;
            ctx.queries = queries;
            ctx.crawl_content = load_content(&ctx.website_url, content_file.as_deref(), fetch).await?;

            let deps = if offline {
                offline_deps(&config, &ctx.brand_name)
            } else {
                AgentDeps::from_config(&config)
            };
            let store = open_store(&config).await?;
            let orchestrator = HybridOrchestrator::from_config(config, deps, store);

            let finals = cmd_evaluate(
                &orchestrator,
                ctx,
                Duration::from_millis(poll_interval_ms),
                Duration::from_secs(timeout_secs),
                cli.output,
            )
            .await?;
            print_final(&finals, cli.output)
        }
        Commands::Status { evaluation_id } => {
            let status = cmd_status(&require_worker(cli.worker_url)?, &evaluation_id).await?;
            print_status(&status, cli.output)
        }
        Commands::Cancel { evaluation_id } => {
            cmd_cancel(&require_worker(cli.worker_url)?, &evaluation_id, cli.output).await
        }
        Commands::Agents => print_agents(cli.output),
    }
}

fn require_worker(worker_url: Option<String>) -> Result<String> {
    worker_url
        .map(|u| u.trim_end_matches('/').to_string())
        .context("--worker-url (or ADI_WORKER_URL) is required for this command")
}

/// Execution store shared with the worker in HTTP mode, process-local otherwise.
async fn open_store(config: &OrchestratorConfig) -> Result<Arc<dyn ExecutionStore>> {
    if config.worker_url.is_none() {
        return Ok(Arc::new(MemoryExecutionStore::new()));
    }
    if std::env::var("SURREALDB_URL").is_err() {
        bail!("SURREALDB_URL must point at the worker's store when --worker-url is set");
    }
    let store = SurrealExecutionStore::from_env()
        .await
        .context("Failed to connect to execution store")?;
    Ok(Arc::new(store))
}

fn offline_deps(config: &OrchestratorConfig, brand: &str) -> AgentDeps {
    let provider: Arc<dyn LlmProvider> = Arc::new(ScriptedProvider::answering(
        "scripted",
        format!("{brand} is a trusted and popular brand. You can buy {brand} products online."),
    ));
    AgentDeps::in_memory(vec![provider], config.breaker, config.cache_ttl)
}

async fn load_content(url: &str, file: Option<&Path>, fetch: bool) -> Result<Option<String>> {
    if let Some(path) = file {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read content file {}", path.display()))?;
        return Ok(Some(text));
    }
    if !fetch {
        return Ok(None);
    }
    let resp = reqwest::get(url)
        .await
        .with_context(|| format!("Failed to fetch {url}"))?;
    if !resp.status().is_success() {
        bail!("fetching {url} returned HTTP {}", resp.status());
    }
    Ok(Some(resp.text().await?))
}

async fn cmd_evaluate(
    orchestrator: &HybridOrchestrator,
    ctx: EvaluationContext,
    interval: Duration,
    timeout: Duration,
    output: OutputFormat,
) -> Result<FinalResults> {
    let evaluation_id = ctx.evaluation_id.clone();
    let partial = orchestrator.execute_evaluation(ctx).await?;
    let fast_ok = partial.fast_results.values().filter(|o| o.is_completed()).count();
    if output == OutputFormat::Text {
        println!("Evaluation {evaluation_id}");
        println!(
            "Fast phase: {fast_ok}/{} agents completed in {}ms",
            partial.fast_results.len(),
            partial.fast_phase_ms
        );
        println!("Slow phase: {} agents dispatched", partial.slow_agents.iter().filter(|t| t.dispatched).count());
    }

    let deadline = Instant::now() + timeout;
    let mut last_progress = None;
    loop {
        let status = orchestrator.get_evaluation_status(&evaluation_id).await?;
        if output == OutputFormat::Text && last_progress != Some(status.progress.to_bits()) {
            println!("{}", progress_line(&status));
            last_progress = Some(status.progress.to_bits());
        }
        if status.overall_status.is_finished() {
            info!(evaluation_id = %evaluation_id, status = %status.overall_status, "evaluation finished");
            break;
        }
        if Instant::now() >= deadline {
            warn!(evaluation_id = %evaluation_id, "timed out waiting for slow agents; cancelling");
            orchestrator.cancel_evaluation(&evaluation_id).await?;
            bail!("evaluation {evaluation_id} did not finish within {}s", timeout.as_secs());
        }
        tokio::time::sleep(interval).await;
    }

    Ok(orchestrator.final_results(&evaluation_id, &partial.fast_results).await?)
}

fn progress_line(status: &EvaluationStatus) -> String {
    format!(
        "[{:>3.0}%] {}/{} slow agents done ({} running, {} pending, {} failed)",
        status.progress * 100.0,
        status.completed_agents + status.failed_agents,
        status.total_agents,
        status.running_agents,
        status.pending_agents,
        status.failed_agents,
    )
}

async fn cmd_status(worker: &str, evaluation_id: &str) -> Result<EvaluationStatus> {
    let resp = reqwest::get(format!("{worker}/evaluations/{evaluation_id}"))
        .await
        .context("Failed to reach worker")?;
    if !resp.status().is_success() {
        bail!("worker returned HTTP {}: {}", resp.status(), resp.text().await.unwrap_or_default());
    }
    Ok(resp.json().await?)
}

async fn cmd_cancel(worker: &str, evaluation_id: &str, output: OutputFormat) -> Result<()> {
    let resp = reqwest::Client::new()
        .delete(format!("{worker}/evaluations/{evaluation_id}"))
        .send()
        .await
        .context("Failed to reach worker")?;
    if !resp.status().is_success() {
        bail!("worker returned HTTP {}: {}", resp.status(), resp.text().await.unwrap_or_default());
    }
    let body: serde_json::Value = resp.json().await?;
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&body)?),
        OutputFormat::Text => println!(
            "Cancelled {evaluation_id}: {} records failed, {} queued jobs dropped",
            body["recordsCancelled"], body["dropped"]
        ),
    }
    Ok(())
}

fn print_status(status: &EvaluationStatus, output: OutputFormat) -> Result<()> {
    if output == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(status)?);
        return Ok(());
    }
    println!("Evaluation {} is {}", status.evaluation_id, status.overall_status);
    println!("{}", progress_line(status));
    for agent in &status.agents {
        let mut line = format!("  {:<24} {}", agent.agent_name, agent.status);
        if let Some(ms) = agent.duration_ms {
            line.push_str(&format!(" in {ms}ms"));
        }
        if agent.degraded {
            line.push_str(" (degraded)");
        }
        if let Some(err) = &agent.error {
            line.push_str(&format!(": {err}"));
        }
        println!("{line}");
    }
    Ok(())
}

fn print_final(finals: &FinalResults, output: OutputFormat) -> Result<()> {
    if output == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(finals)?);
        return Ok(());
    }
    println!();
    println!("Results ({}):", finals.status.overall_status);
    for (name, out) in &finals.results {
        let score = out
            .results
            .first()
            .map(|r| format!("{:>5.1}", r.normalized_score))
            .unwrap_or_else(|| "    -".to_string());
        let tier = out.tier().unwrap_or("-");
        println!("  {name:<26} {:<9} {score}  tier={tier}", out.status.as_str());
    }
    match &finals.aggregate {
        Some(agg) => {
            println!();
            println!("Overall score: {:.1} (confidence {:.2})", agg.score, agg.confidence);
            if !agg.degraded_agents.is_empty() {
                println!("Degraded: {}", agg.degraded_agents.join(", "));
            }
        }
        None => println!("No agent produced a score"),
    }
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentRow {
    name: &'static str,
    latency: &'static str,
    priority: &'static str,
    timeout_ms: u64,
    retry_limit: u32,
    dependencies: &'static [&'static str],
}

fn agent_catalogue() -> Vec<AgentRow> {
    AgentKind::ALL
        .iter()
        .map(|kind| {
            let config = kind.config();
            AgentRow {
                name: config.name,
                latency: match config.latency {
                    adi_core::Latency::Fast => "fast",
                    adi_core::Latency::Slow => "slow",
                },
                priority: config.priority.as_str(),
                timeout_ms: config.timeout_ms,
                retry_limit: config.retry_limit,
                dependencies: config.dependencies,
            }
        })
        .collect()
}

fn print_agents(output: OutputFormat) -> Result<()> {
    let rows = agent_catalogue();
    if output == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    for row in rows {
        println!(
            "{:<26} {:<4} {:<8} {:>6}ms retries={} deps=[{}]",
            row.name,
            row.latency,
            row.priority,
            row.timeout_ms,
            row.retry_limit,
            row.dependencies.join(", ")
        );
    }
    Ok(())
}
