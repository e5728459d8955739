use std::env;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use keepsake_core::models::{fields_from_value, SyncConflict, SyncErrorRecord};
use keepsake_core::remote::HttpRemoteGateway;
use keepsake_core::{Record, RecordFields, RecordStore, SyncEngine, SyncSettings};
use serde::Serialize;
use serde_json::Value;

use crate::auth::{KeyringCredentials, TokenStore};
use crate::error::CliError;

pub type CliEngine =
    SyncEngine<HttpRemoteGateway<Arc<KeyringCredentials>>, Arc<KeyringCredentials>>;

#[derive(Debug, Serialize)]
pub struct RecordListItem {
    pub id: String,
    pub preview: String,
    pub fields: RecordFields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub relative_time: String,
    pub synced: bool,
    pub deleted: bool,
}

pub fn record_to_list_item(record: &Record) -> RecordListItem {
    RecordListItem {
        id: record.id.to_string(),
        preview: record_preview(record, 80),
        fields: record.fields.clone(),
        created_at: record.created_at,
        updated_at: record.updated_at,
        relative_time: format_relative_time(record.updated_at, Utc::now()),
        synced: record.is_synced(),
        deleted: record.is_deleted(),
    }
}

pub fn format_record_lines(records: &[Record]) -> Vec<String> {
    let now = Utc::now();
    records
        .iter()
        .map(|record| {
            let id = record.id.to_string();
            let short_id = id.chars().take(13).collect::<String>();
            let preview = record_preview(record, 40);
            let relative_time = format_relative_time(record.updated_at, now);
            let marker = sync_marker(record);

            if marker.is_empty() {
                format!("{short_id:<13}  {preview:<40}  {relative_time}")
            } else {
                format!("{short_id:<13}  {preview:<40}  {relative_time:<10}  {marker}")
            }
        })
        .collect()
}

pub fn sync_marker(record: &Record) -> &'static str {
    match (record.is_deleted(), record.is_synced()) {
        (true, _) => "[deleted]",
        (false, false) => "[pending]",
        (false, true) => "",
    }
}

pub fn record_preview(record: &Record, max_chars: usize) -> String {
    let collapsed = record
        .preview(usize::MAX)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = collapsed.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn format_conflict_lines(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{}  {:<6}  record={}  local={} incoming={}",
                format_timestamp(conflict.resolved_at),
                conflict.winner.as_str(),
                conflict.record_id,
                format_timestamp(conflict.local_updated_at),
                format_timestamp(conflict.incoming_updated_at)
            )
        })
        .collect()
}

pub fn format_error_lines(errors: &[SyncErrorRecord]) -> Vec<String> {
    errors
        .iter()
        .map(|error| {
            format!(
                "{}  {:<15}  {} record={}  {}",
                format_timestamp(error.occurred_at),
                error.kind,
                error.operation,
                error.record_id,
                error.message
            )
        })
        .collect()
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

pub fn format_optional_timestamp(at: Option<DateTime<Utc>>) -> String {
    at.map_or_else(|| "never".to_string(), format_timestamp)
}

pub fn format_relative_time(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let diff = now
        .signed_duration_since(at)
        .num_milliseconds()
        .max(0);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}

/// Parse CLI arguments into record fields.
///
/// Accepts either a single JSON object or `key=value` pairs. Values that parse
/// as JSON (numbers, booleans, `null`, arrays, objects) keep their type; anything
/// else is stored as a string.
pub fn parse_fields(parts: &[String]) -> Result<RecordFields, CliError> {
    let joined = parts.join(" ");
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        return Err(CliError::EmptyFields);
    }
    if trimmed.starts_with('{') {
        let value: Value = serde_json::from_str(trimmed)?;
        return Ok(fields_from_value(value)?);
    }

    let mut fields = RecordFields::new();
    for part in parts {
        let Some((key, raw)) = part.split_once('=') else {
            return Err(CliError::InvalidField(part.clone()));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(CliError::InvalidField(part.clone()));
        }
        let value = serde_json::from_str::<Value>(raw.trim())
            .unwrap_or_else(|_| Value::String(raw.to_string()));
        fields.insert(key.to_string(), value);
    }
    Ok(fields)
}

/// Fields from arguments, falling back to piped stdin.
pub fn resolve_fields(parts: &[String]) -> Result<RecordFields, CliError> {
    if !parts.is_empty() {
        return parse_fields(parts);
    }
    if let Some(content) = read_piped_stdin()? {
        return parse_fields(&[content]);
    }
    Err(CliError::EmptyFields)
}

/// Partial update turning `current` into `edited`; removed keys become `null`.
pub fn fields_diff(current: &RecordFields, edited: &RecordFields) -> RecordFields {
    let mut partial = RecordFields::new();
    for (key, value) in edited {
        if current.get(key) != Some(value) {
            partial.insert(key.clone(), value.clone());
        }
    }
    for key in current.keys() {
        if !edited.contains_key(key) {
            partial.insert(key.clone(), Value::Null);
        }
    }
    partial
}

pub fn normalize_content(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn normalize_record_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyRecordId)
    } else {
        Ok(trimmed.to_string())
    }
}

pub async fn resolve_record(query: &str, store: &RecordStore) -> Result<Record, CliError> {
    let query = normalize_record_identifier(query)?;
    let mut matches = store.find_by_prefix(&query).await?;

    match matches.len() {
        0 => Err(CliError::RecordNotFound(query)),
        1 => Ok(matches.remove(0)),
        _ => {
            let options = matches
                .iter()
                .take(3)
                .map(|record| record.id.to_string().chars().take(13).collect::<String>())
                .collect::<Vec<_>>()
                .join(", ");

            Err(CliError::AmbiguousRecordId(format!(
                "ID prefix '{query}' is ambiguous; matches: {options}"
            )))
        }
    }
}

pub fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    Ok(normalize_content(&buffer))
}

pub fn capture_editor_input_with_initial(
    initial_content: &str,
) -> Result<Option<String>, CliError> {
    let editor = preferred_editor();
    let temp_file = create_temp_record_file_path();
    std::fs::write(&temp_file, initial_content)?;

    let launch_result = launch_editor(&editor, &temp_file);
    let content = std::fs::read_to_string(&temp_file)?;
    let _ = std::fs::remove_file(&temp_file);

    launch_result?;
    Ok(normalize_content(&content))
}

pub fn launch_editor(editor: &str, file_path: &Path) -> Result<(), CliError> {
    match Command::new(editor).arg(file_path).status() {
        Ok(status) => {
            if status.success() {
                Ok(())
            } else {
                Err(CliError::EditorFailed(format!(
                    "`{editor}` exited with status {status}"
                )))
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let mut parts = editor.split_whitespace();
            let Some(program) = parts.next() else {
                return Err(CliError::EditorFailed("empty EDITOR command".into()));
            };

            let mut command = Command::new(program);
            command.args(parts).arg(file_path);

            let status = command.status()?;
            if status.success() {
                Ok(())
            } else {
                Err(CliError::EditorFailed(format!(
                    "`{editor}` exited with status {status}"
                )))
            }
        }
        Err(err) => Err(CliError::Io(err)),
    }
}

pub fn preferred_editor() -> String {
    env::var("VISUAL")
        .or_else(|_| env::var("EDITOR"))
        .unwrap_or_else(|_| default_editor().to_string())
}

pub const fn default_editor() -> &'static str {
    if cfg!(windows) {
        "notepad"
    } else {
        "vi"
    }
}

fn create_temp_record_file_path() -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_nanos());
    env::temp_dir().join(format!("keepsake-record-{}-{now}.json", std::process::id()))
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> Result<PathBuf, CliError> {
    if let Some(path) = cli_db_path.or_else(|| env::var_os("KEEPSAKE_DB_PATH").map(PathBuf::from))
    {
        return Ok(path);
    }
    dirs::data_dir()
        .map(|dir| dir.join("keepsake").join("keepsake.db"))
        .ok_or_else(|| CliError::Config("failed to resolve the data directory".to_string()))
}

pub fn config_path() -> Result<PathBuf, CliError> {
    if let Some(path) = env::var_os("KEEPSAKE_CONFIG").map(PathBuf::from) {
        return Ok(path);
    }
    dirs::config_dir()
        .map(|dir| dir.join("keepsake").join("config.json"))
        .ok_or_else(|| CliError::Config("failed to resolve the config directory".to_string()))
}

pub fn load_settings() -> Result<SyncSettings, CliError> {
    Ok(SyncSettings::resolve(&config_path()?)?)
}

pub async fn open_store(path: &Path) -> Result<RecordStore, CliError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let (store, migration_failure) = RecordStore::open_path_lenient(path)?;
    if let Some(failure) = migration_failure {
        tracing::warn!(
            "Database stays at schema version {}: {}",
            store.schema_version().await,
            failure
        );
    }
    Ok(store)
}

pub fn build_engine(store: RecordStore, settings: &SyncSettings) -> Result<CliEngine, CliError> {
    let Some(base_url) = settings.api_base_url.clone().filter(|_| settings.is_sync_configured())
    else {
        return Err(CliError::SyncNotConfigured);
    };

    let credentials = Arc::new(KeyringCredentials::new(TokenStore::default()));
    let gateway = HttpRemoteGateway::new(base_url, credentials.clone(), settings.request_timeout)?;
    Ok(SyncEngine::new(store, gateway, credentials, settings))
}
