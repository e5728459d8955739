use std::path::Path;

use serde_json::Value;

use crate::commands::common::{
    capture_editor_input_with_initial, fields_diff, open_store, parse_fields, resolve_record,
};
use crate::error::CliError;

pub async fn run_edit(id: &str, parts: &[String], db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let record = resolve_record(id, &store).await?;

    let partial = if parts.is_empty() {
        let initial = serde_json::to_string_pretty(&Value::Object(record.fields.clone()))?;
        let Some(edited) = capture_editor_input_with_initial(&initial)? else {
            return Err(CliError::EmptyFields);
        };
        fields_diff(&record.fields, &parse_fields(&[edited])?)
    } else {
        parse_fields(parts)?
    };

    if partial.is_empty() {
        println!("{}", record.id);
        return Ok(());
    }

    let updated = store.update(&record.id, partial).await?;
    println!("{}", updated.id);
    Ok(())
}
