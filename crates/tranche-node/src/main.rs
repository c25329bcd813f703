//! # Tranche Node
//!
//! HTTP API over the release pipeline, plus the monitoring sweeps.

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod state;

use config::NodeConfig;
use state::AppState;

/// Command line arguments. Flags override the configuration file.
#[derive(Parser, Debug)]
#[command(name = "tranche-node", version, about = "Milestone-gated escrow release node")]
struct Args {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log level used when RUST_LOG is unset.
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,
}

impl Args {
    fn into_config(self) -> anyhow::Result<NodeConfig> {
        let mut config = NodeConfig::load(self.config.as_deref())?;
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if self.json_logs {
            config.json_logs = true;
        }
        Ok(config)
    }
}

fn init_tracing(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to initialise logging: {}", e))
}

/// Run the node until ctrl-c.
pub async fn run_server(config: NodeConfig) -> anyhow::Result<()> {
    info!(listen = %config.listen, "Tranche node starting");

    let state = AppState::new(&config)?;
    let sweeps = state.pipeline.spawn_sweeps();
    let app = create_router(state);

    let listener = TcpListener::bind(config.listen).await?;
    info!("Listening on http://{}", config.listen);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    sweeps.shutdown().await;
    served?;
    info!("Tranche node stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

/// Create the API router.
fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(api::health::health_check))
        // Contracts
        .route("/api/v1/contracts", post(api::contracts::register_contract))
        .route("/api/v1/contracts/validate", post(api::contracts::validate_contract))
        .route("/api/v1/contracts/:id", get(api::contracts::get_contract))
        .route("/api/v1/contracts/:id/schedule", get(api::contracts::get_schedule))
        .route("/api/v1/contracts/:id/reoptimize", get(api::contracts::reoptimize))
        // Milestones
        .route("/api/v1/milestones/overdue", post(api::milestones::mark_overdue))
        .route("/api/v1/milestones/:id", get(api::milestones::get_milestone))
        .route("/api/v1/milestones/:id/progress", post(api::milestones::record_progress))
        .route("/api/v1/milestones/:id/complete", post(api::milestones::complete_milestone))
        .route("/api/v1/milestones/:id/cancel", post(api::milestones::cancel_milestone))
        .route("/api/v1/milestones/:id/authorization", post(api::milestones::request_authorization))
        .route("/api/v1/milestones/:id/history", get(api::milestones::milestone_history))
        // Escrows
        .route("/api/v1/escrows", post(api::escrows::create_escrow))
        .route("/api/v1/escrows/:id", get(api::escrows::get_escrow))
        // Authorizations
        .route(
            "/api/v1/authorizations",
            post(api::authorizations::create_authorization).get(api::authorizations::list_authorizations),
        )
        .route("/api/v1/authorizations/bulk-approve", post(api::authorizations::bulk_approve))
        .route("/api/v1/authorizations/:id", get(api::authorizations::get_authorization))
        .route("/api/v1/authorizations/:id/approve", post(api::authorizations::approve))
        .route("/api/v1/authorizations/:id/reject", post(api::authorizations::reject))
        .route("/api/v1/authorizations/:id/time-lock", post(api::authorizations::create_time_lock))
        .route("/api/v1/authorizations/:id/history", get(api::authorizations::authorization_history))
        .route("/api/v1/authorizations/:id/execution", get(api::authorizations::authorization_execution))
        // Time-locks
        .route("/api/v1/time-locks/:id", get(api::timelocks::get_time_lock))
        .route("/api/v1/time-locks/:id/release", post(api::timelocks::release_early))
        .route("/api/v1/time-locks/:id/cancel", post(api::timelocks::cancel_time_lock))
        // Executions
        .route("/api/v1/executions", post(api::executions::execute))
        .route("/api/v1/executions/bulk", post(api::executions::bulk_execute))
        .route("/api/v1/executions/dead-letters", get(api::executions::dead_letters))
        .route("/api/v1/executions/:id", get(api::executions::get_execution))
        .route("/api/v1/executions/:id/history", get(api::executions::execution_history))
        .route("/api/v1/executions/:id/trace", get(api::executions::execution_trace))
        .route("/api/v1/executions/:id/retry", post(api::executions::retry_execution))
        .route("/api/v1/executions/:id/redrive", post(api::executions::redrive))
        .route("/api/v1/executions/:id/cancel", post(api::executions::cancel_execution))
        // Events
        .route("/api/v1/events", get(api::events::recent_events))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Args::parse().into_config()?;
    init_tracing(&config.log_level, config.json_logs)?;
    run_server(config).await
}
