//! `pw list` and `pw inspect`.

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use pipewright_types::stage::{DEFAULT_OUTPUT, StageId, StageRecord, StageState};

use crate::cli::parse_stage_id;
use crate::state::AppState;

pub async fn handle_list(state: &AppState, limit: u32, json: bool) -> Result<()> {
    let roots = state
        .engine
        .store()
        .list_roots(limit)
        .await
        .context("Failed to list workflows")?;

    if json {
        let out: Vec<_> = roots.iter().map(summary_json).collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if roots.is_empty() {
        println!();
        println!("  No workflows yet. Start one with `pw run`.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Root").fg(Color::Cyan),
            Cell::new("Kind"),
            Cell::new("State"),
            Cell::new("Output"),
            Cell::new("Started"),
        ]);
    for record in &roots {
        table.add_row(vec![
            Cell::new(record.id.to_string()),
            Cell::new(&record.kind),
            state_cell(record.state),
            Cell::new(output_text(record)),
            Cell::new(record.created_at.format("%Y-%m-%d %H:%M:%S").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

pub async fn handle_inspect(state: &AppState, raw_id: &str, json: bool) -> Result<()> {
    let id = parse_stage_id(raw_id)?;
    let record = state
        .engine
        .get(id)
        .await?
        .with_context(|| format!("No stage {id}"))?;
    print_tree(state, record.root_id, json).await
}

/// Print every stage of the tree rooted at `root_id`.
pub async fn print_tree(state: &AppState, root_id: StageId, json: bool) -> Result<()> {
    let tree = state.engine.tree(root_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tree)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Stage").fg(Color::Cyan),
            Cell::new("Parent"),
            Cell::new("Kind"),
            Cell::new("State"),
            Cell::new("Attempt"),
            Cell::new("Output"),
            Cell::new("Error"),
        ]);
    for record in &tree {
        table.add_row(vec![
            Cell::new(record.id.short()),
            Cell::new(record.parent_id.map(|p| p.short()).unwrap_or_else(|| "-".to_string())),
            Cell::new(&record.kind),
            state_cell(record.state),
            Cell::new(record.attempt),
            Cell::new(output_text(record)),
            Cell::new(
                record
                    .last_error
                    .as_deref()
                    .or(record.abort_reason.as_deref())
                    .unwrap_or("-"),
            ),
        ]);
    }

    println!();
    println!("  Workflow {}", style(root_id).cyan());
    println!("{table}");

    let suspended: Vec<&StageRecord> = tree
        .iter()
        .filter(|r| r.state == StageState::AsyncSuspended)
        .collect();
    for record in suspended {
        println!(
            "  {} {} is waiting: pw resume {} --payload '{{...}}'",
            style("⏸").yellow(),
            record.kind,
            record.id
        );
    }
    println!();
    Ok(())
}

fn summary_json(record: &StageRecord) -> serde_json::Value {
    serde_json::json!({
        "root_id": record.id.to_string(),
        "kind": record.kind,
        "state": record.state.as_str(),
        "output": record.output(DEFAULT_OUTPUT),
        "created_at": record.created_at.to_rfc3339(),
    })
}

fn output_text(record: &StageRecord) -> String {
    record
        .output(DEFAULT_OUTPUT)
        .map(|v| v.to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn state_cell(state: StageState) -> Cell {
    let color = match state {
        StageState::Finalized => Color::Green,
        StageState::Completed | StageState::Finalizing => Color::DarkGreen,
        StageState::AsyncSuspended | StageState::Retrying => Color::Yellow,
        StageState::Aborted => Color::Red,
        StageState::Running => Color::Blue,
        StageState::Created | StageState::Ready => Color::Grey,
    };
    Cell::new(state.as_str()).fg(color)
}
