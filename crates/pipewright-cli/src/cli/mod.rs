//! CLI command definitions and dispatch for the `pw` binary.

pub mod inspect;
pub mod run;
pub mod signal;

use clap::{Parser, Subcommand};

/// Run and inspect Pipewright stage pipelines.
#[derive(Parser)]
#[command(name = "pw", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Detailed output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans to stdout via OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a demo pipeline and drive it until it settles.
    Run {
        #[command(subcommand)]
        pipeline: run::Pipeline,

        /// Reuse the workflow started earlier with the same key.
        #[arg(long)]
        key: Option<String>,

        /// Seconds to wait before giving up.
        #[arg(long, default_value = "30")]
        wait: u64,
    },

    /// List recent workflows.
    #[command(alias = "ls")]
    List {
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show the stage tree of a workflow.
    Inspect {
        /// Any stage id in the tree.
        stage_id: String,
    },

    /// Deliver a resumption signal to a suspended stage.
    Resume {
        stage_id: String,

        /// JSON payload passed to the stage's callback.
        #[arg(long, default_value = "{}")]
        payload: String,

        /// Send without credentials, even if a callback secret is configured.
        #[arg(long)]
        anonymous: bool,

        #[arg(long, default_value = "30")]
        wait: u64,
    },

    /// Abort the workflow containing a stage.
    Abort {
        stage_id: String,

        #[arg(long, default_value = "aborted from the command line")]
        reason: String,
    },
}

pub fn parse_stage_id(raw: &str) -> anyhow::Result<pipewright_types::stage::StageId> {
    raw.parse()
        .map_err(|_| anyhow::anyhow!("'{raw}' is not a stage id"))
}
