//! Proctor Server
//!
//! Axum server exposing the evaluation orchestrator over HTTP, SSE and
//! WebSocket, plus a small CLI for one-off recovery and status checks.

mod api;

use anyhow::Context;
use clap::{Parser, Subcommand};
use proctor_core::config::DEFAULT_CONFIG_PATH;
use proctor_core::{Orchestrator, ProctorConfig, ProctorDb};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use api::AppState;

/// Upper bound on draining background tasks at shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser, Clone)]
#[command(author, version, about = "Proctor - Evaluation Workflow Orchestrator")]
struct Args {
    /// Path to the JSON config file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand, Clone)]
enum CliCommand {
    /// Start the Proctor server (default)
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },
    /// Resume interrupted generations and summaries, then exit
    Recover,
    /// Write the effective configuration (file + environment) to --config
    InitConfig,
    /// Print the status snapshot of one evaluation
    Status {
        /// Evaluation id
        id: i64,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,proctor_core=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

async fn run_server(
    orchestrator: Arc<Orchestrator>,
    config: Arc<ProctorConfig>,
    host: &str,
    port: u16,
) -> anyhow::Result<()> {
    let report = orchestrator.recover().await?;
    if !report.is_empty() {
        tracing::info!("Startup recovery: {:?}", report);
    }

    let state = AppState {
        orchestrator: Arc::clone(&orchestrator),
        config,
    };
    let app = api::router(state);

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!("Proctor server running at http://{}", addr);
    tracing::info!("  Evaluations: /api/v1/evaluations");
    tracing::info!("  Executors:   /api/v1/testcases/next");
    tracing::info!("  Live status: /api/v1/events/ws (WebSocket)");
    tracing::info!("  OpenAPI:     /api/v1/openapi.json");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!(
        "Waiting for {} background task(s)",
        orchestrator.supervisor().in_flight()
    );
    if tokio::time::timeout(SHUTDOWN_GRACE, orchestrator.wait_idle())
        .await
        .is_err()
    {
        tracing::warn!("Background tasks still running after {:?}", SHUTDOWN_GRACE);
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let args = Args::parse();
    let config = ProctorConfig::load(&args.config).await?;

    if let Some(CliCommand::InitConfig) = args.command {
        config.save(&args.config).await?;
        println!("Wrote {}", args.config.display());
        return Ok(());
    }

    let db = ProctorDb::open_at(&config.database_path)?;
    let orchestrator = Arc::new(Orchestrator::with_llm(&db, &config)?);
    let config = Arc::new(config);

    match args.command {
        Some(CliCommand::Serve { port, host }) => {
            run_server(orchestrator, config, &host, port).await
        }
        None => run_server(orchestrator, config, "127.0.0.1", 8080).await,
        Some(CliCommand::Recover) => {
            let report = orchestrator.recover().await?;
            orchestrator.wait_idle().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Some(CliCommand::InitConfig) => Ok(()),
        Some(CliCommand::Status { id }) => {
            let snapshot = orchestrator.get_status(id)?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
    }
}
