//! `pw resume` and `pw abort`.

use std::time::Duration;

use anyhow::{Context, Result};
use console::style;
use pipewright_core::engine::ResumeResult;
use pipewright_infra::callback::{ResumptionSignal, deliver_signal};
use pipewright_types::stage::Caller;
use serde_json::Value;

use crate::cli::{inspect, parse_stage_id, run::IDLE_AFTER};
use crate::state::AppState;

pub async fn handle_resume(
    state: &AppState,
    raw_id: &str,
    payload: &str,
    anonymous: bool,
    wait: u64,
    json: bool,
) -> Result<()> {
    let id = parse_stage_id(raw_id)?;
    let payload: Value = serde_json::from_str(payload).context("--payload is not valid JSON")?;
    let record = state
        .engine
        .get(id)
        .await?
        .with_context(|| format!("No stage {id}"))?;

    let events = state.engine.subscribe();
    let result = if anonymous || state.gate.is_configured() {
        // Same path an external sender takes.
        let body = ResumptionSignal::new(record.kind.clone(), id, payload).to_body()?;
        let signature = if anonymous {
            None
        } else {
            Some(state.gate.sign(&body)?)
        };
        deliver_signal(state.engine.as_ref(), &state.gate, &body, signature.as_deref(), None).await?
    } else {
        tracing::debug!(stage_id = %id, "no callback secret configured, resuming in-process");
        state.engine.resume(id, payload, Caller::Internal).await?
    };

    match result {
        ResumeResult::Resumed(stage_state) if !json => {
            println!();
            println!(
                "  {} Resumed {} ({})",
                style("✓").green().bold(),
                style(id).cyan(),
                stage_state
            );
        }
        ResumeResult::AlreadyCompleted if !json => {
            println!();
            println!("  {} Stage {} had already completed", style("•").dim(), id);
        }
        _ => {}
    }

    state
        .drive(record.root_id, events, Duration::from_secs(wait), IDLE_AFTER)
        .await?;
    inspect::print_tree(state, record.root_id, json).await
}

pub async fn handle_abort(state: &AppState, raw_id: &str, reason: &str, json: bool) -> Result<()> {
    let id = parse_stage_id(raw_id)?;
    let result = state.engine.abort(id, reason).await?;

    if json {
        let ids: Vec<String> = result.aborted.iter().map(|s| s.to_string()).collect();
        println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "aborted": ids }))?);
        return Ok(());
    }

    println!();
    if result.aborted.is_empty() {
        println!("  {} Nothing to abort; the workflow already finished", style("•").dim());
    } else {
        println!(
            "  {} Aborted {} stage(s)",
            style("✗").red().bold(),
            result.aborted.len()
        );
    }
    println!();
    Ok(())
}
