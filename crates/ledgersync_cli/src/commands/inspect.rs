//! Read-only commands: `status`, `pending` and `conflicts`.

use super::{format_time, open_store, CliResult};
use ledgersync_sync_engine::StatusAggregator;
use std::path::Path;

/// Output format of the read-only commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

impl Format {
    /// Parses `text` or `json`.
    pub fn parse(format: &str) -> CliResult<Self> {
        match format {
            "text" => Ok(Format::Text),
            "json" => Ok(Format::Json),
            other => Err(format!("Unknown format: {other}").into()),
        }
    }
}

/// Runs the status command.
pub fn status(path: &Path, format: Format) -> CliResult<()> {
    let store = open_store(path)?;
    let aggregator = StatusAggregator::new(true);
    aggregator.rehydrate(&store)?;
    let status = aggregator.snapshot();

    if format == Format::Json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let by_type = status
        .pending_by_type
        .iter()
        .map(|(entity_type, count)| format!("{entity_type}: {count}"))
        .collect::<Vec<_>>()
        .join(", ");

    println!("Store: {}", path.display());
    println!();
    println!("  State:      {}", status.phase());
    if by_type.is_empty() {
        println!("  Pending:    {}", status.pending_count);
    } else {
        println!("  Pending:    {} ({by_type})", status.pending_count);
    }
    println!("  Failed:     {}", status.failed_count);
    println!("  Conflicts:  {}", status.conflict_count);
    println!(
        "  Last sync:  {}",
        status
            .last_sync_time
            .map_or_else(|| "never".to_string(), format_time)
    );
    println!("  Entities:   {}", store.entities()?.len());
    Ok(())
}

/// Runs the pending command.
pub fn pending(path: &Path, format: Format) -> CliResult<()> {
    let store = open_store(path)?;
    let changes = store.pending_changes()?;

    if format == Format::Json {
        println!("{}", serde_json::to_string_pretty(&changes)?);
        return Ok(());
    }
    if changes.is_empty() {
        println!("No pending changes");
        return Ok(());
    }

    println!(
        "{:>6}  {:<8}  {:<14}  {:<24}  {:>8}",
        "SEQ", "OP", "TYPE", "ENTITY", "ATTEMPTS"
    );
    for change in &changes {
        println!(
            "{:>6}  {:<8}  {:<14}  {:<24}  {:>8}{}",
            change.seq,
            change.operation.as_str(),
            change.entity_type,
            change.entity_id,
            change.attempts,
            change
                .failure
                .as_ref()
                .map_or_else(String::new, |reason| format!("  failed: {reason}"))
        );
    }
    Ok(())
}

/// Runs the conflicts command.
pub fn conflicts(path: &Path, format: Format) -> CliResult<()> {
    let store = open_store(path)?;
    let conflicts = store.conflicts()?;

    if format == Format::Json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
        return Ok(());
    }
    if conflicts.is_empty() {
        println!("No unresolved conflicts");
        return Ok(());
    }

    for conflict in &conflicts {
        println!("{}", conflict.id);
        println!(
            "  entity:   {} {}",
            conflict.entity_type, conflict.entity_id
        );
        println!("  fields:   {}", conflict.changed_fields().join(", "));
        println!("  local:    {}", conflict.local_change.data);
        println!("  server:   {}", conflict.server_change.data);
        println!("  detected: {}", format_time(conflict.detected_at));
    }
    Ok(())
}
