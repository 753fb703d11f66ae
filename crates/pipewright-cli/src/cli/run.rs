//! `pw run`: start a demo pipeline.

use std::time::Duration;

use anyhow::Result;
use clap::Subcommand;
use console::style;
use pipewright_core::engine::StartOptions;
use serde_json::json;

use crate::cli::inspect;
use crate::state::{AppState, Settled};

/// Quiet period after which a workflow counts as settled.
pub const IDLE_AFTER: Duration = Duration::from_secs(2);

#[derive(Subcommand)]
pub enum Pipeline {
    /// Sum of the lengths of the given words.
    SumLengths {
        #[arg(required = true)]
        words: Vec<String>,
    },

    /// Greatest common divisor by recursive delegation.
    Gcd { a: u64, b: u64 },

    /// A stage that waits for an external approval.
    Approval { request: String },
}

impl Pipeline {
    fn into_start(self) -> (&'static str, StartOptions) {
        match self {
            Pipeline::SumLengths { words } => ("sum_lengths", StartOptions::new().arg(json!(words))),
            Pipeline::Gcd { a, b } => ("gcd", StartOptions::new().arg(a).arg(b)),
            Pipeline::Approval { request } => ("approval", StartOptions::new().arg(request)),
        }
    }
}

pub async fn handle_run(
    state: &AppState,
    pipeline: Pipeline,
    key: Option<String>,
    wait: u64,
    json: bool,
) -> Result<()> {
    let (kind, mut options) = pipeline.into_start();
    if let Some(key) = key {
        options = options.idempotence_key(key);
    }

    let events = state.engine.subscribe();
    let root = state.engine.start(kind, options).await?;
    if !json {
        println!();
        println!(
            "  {} Started {} {}",
            style("▶").green().bold(),
            style(kind).cyan(),
            style(root).dim()
        );
    }

    let settled = state
        .drive(root, events, Duration::from_secs(wait), IDLE_AFTER)
        .await?;
    if !json && settled == Settled::TimedOut {
        println!("  {} Gave up waiting after {wait}s", style("!").yellow().bold());
    }

    inspect::print_tree(state, root, json).await
}
