//! Pipewright command-line entry point.
//!
//! Binary name: `pw`

mod cli;
mod demos;
mod state;

use clap::Parser;
use pipewright_observe::tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info,pipewright=debug",
        _ => "trace",
    };
    init_tracing(TracingOptions {
        default_filter: Some(filter.to_string()),
        json: cli.log_json,
        otel: cli.otel,
        span_timing: cli.verbose > 1,
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let state = AppState::init().await?;

    let result = match cli.command {
        Commands::Run {
            pipeline,
            key,
            wait,
        } => cli::run::handle_run(&state, pipeline, key, wait, cli.json).await,
        Commands::List { limit } => cli::inspect::handle_list(&state, limit, cli.json).await,
        Commands::Inspect { stage_id } => {
            cli::inspect::handle_inspect(&state, &stage_id, cli.json).await
        }
        Commands::Resume {
            stage_id,
            payload,
            anonymous,
            wait,
        } => cli::signal::handle_resume(&state, &stage_id, &payload, anonymous, wait, cli.json).await,
        Commands::Abort { stage_id, reason } => {
            cli::signal::handle_abort(&state, &stage_id, &reason, cli.json).await
        }
    };

    shutdown_tracing();
    result
}
