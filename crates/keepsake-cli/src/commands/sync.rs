use std::path::Path;

use chrono::{DateTime, Utc};
use keepsake_core::sync::{SyncMode, SyncResult};
use keepsake_core::RecordStore;
use serde::Serialize;

use crate::cli::SyncCommands;
use crate::commands::common::{
    build_engine, format_conflict_lines, format_error_lines, format_optional_timestamp,
    load_settings, open_store,
};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct SyncStatusReport {
    pub configured: bool,
    pub api_base_url: Option<String>,
    pub schema_version: u32,
    pub pending_changes: usize,
    pub unsynced_records: usize,
    pub last_pull_at: Option<DateTime<Utc>>,
    pub last_full_sync_at: Option<DateTime<Utc>>,
    pub dropped_changes: usize,
}

pub async fn run_sync_command(
    command: Option<SyncCommands>,
    full: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    match command {
        None => run_sync(full, db_path).await,
        Some(SyncCommands::Status { json }) => run_sync_status(json, db_path).await,
        Some(SyncCommands::Errors { limit, json, clear }) => {
            run_sync_errors(limit, json, clear, db_path).await
        }
        Some(SyncCommands::Conflicts { limit, json }) => {
            run_sync_conflicts(limit, json, db_path).await
        }
        Some(SyncCommands::Reset) => {
            open_store(db_path).await?.reset_checkpoint().await?;
            println!("Sync checkpoint cleared; the next sync downloads everything.");
            Ok(())
        }
        Some(SyncCommands::Purge) => {
            let purged = open_store(db_path).await?.purge_tombstones().await?;
            println!("Purged {purged} deleted record(s).");
            Ok(())
        }
    }
}

pub async fn run_sync(full: bool, db_path: &Path) -> Result<(), CliError> {
    let settings = load_settings()?;
    let engine = build_engine(open_store(db_path).await?, &settings)?;
    let mode = if full { SyncMode::Full } else { SyncMode::Quick };

    let result = engine.perform_sync(mode).await?;
    for line in format_sync_result(&result) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_sync_result(result: &SyncResult) -> Vec<String> {
    let mut lines = vec![format!(
        "Sync completed ({}): pushed {}, pulled {}, failed {}",
        result.mode, result.processed_count, result.pulled_count, result.error_count
    )];
    if result.pull.kept_local > 0 {
        lines.push(format!(
            "  kept {} local version(s) newer than the server's",
            result.pull.kept_local
        ));
    }
    if result.pull.superseded > 0 {
        lines.push(format!(
            "  discarded {} pending change(s) replaced by newer server versions",
            result.pull.superseded
        ));
    }
    for error in &result.errors {
        lines.push(format!(
            "  {} {}: {}",
            error.kind.as_str(),
            error.record_id,
            error.message
        ));
    }
    lines
}

pub async fn collect_status(
    store: &RecordStore,
    api_base_url: Option<String>,
) -> Result<SyncStatusReport, CliError> {
    let checkpoint = store.load_checkpoint().await?;
    Ok(SyncStatusReport {
        configured: api_base_url.is_some(),
        api_base_url,
        schema_version: store.schema_version().await,
        pending_changes: store.pending_count().await?,
        unsynced_records: store.count_unsynced().await?,
        last_pull_at: checkpoint.last_pull_at,
        last_full_sync_at: checkpoint.last_full_sync_at,
        dropped_changes: store.list_errors(usize::MAX).await?.len(),
    })
}

async fn run_sync_status(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let settings = load_settings()?;
    let store = open_store(db_path).await?;
    let api_base_url = settings
        .is_sync_configured()
        .then(|| settings.api_base_url.clone())
        .flatten();
    let report = collect_status(&store, api_base_url).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "remote:          {}",
        report.api_base_url.as_deref().unwrap_or("not configured")
    );
    println!("schema version:  {}", report.schema_version);
    println!("pending changes: {}", report.pending_changes);
    println!("unsynced:        {}", report.unsynced_records);
    println!(
        "last pull:       {}",
        format_optional_timestamp(report.last_pull_at)
    );
    println!(
        "last full sync:  {}",
        format_optional_timestamp(report.last_full_sync_at)
    );
    if report.dropped_changes > 0 {
        println!(
            "dropped:         {} (see `keepsake sync errors`)",
            report.dropped_changes
        );
    }
    Ok(())
}

async fn run_sync_errors(
    limit: usize,
    as_json: bool,
    clear: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let errors = store.list_errors(limit).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&errors)?);
    } else if errors.is_empty() {
        println!("No sync errors recorded.");
    } else {
        for line in format_error_lines(&errors) {
            println!("{line}");
        }
    }

    if clear {
        let cleared = store.clear_errors().await?;
        if !as_json {
            println!("Cleared {cleared} sync error(s).");
        }
    }
    Ok(())
}

pub async fn run_sync_conflicts(
    limit: usize,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let conflicts = open_store(db_path).await?.list_conflicts(limit).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}
