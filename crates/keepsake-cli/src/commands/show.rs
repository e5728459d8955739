use std::path::Path;

use crate::commands::common::{
    format_optional_timestamp, format_timestamp, open_store, record_to_list_item, resolve_record,
    sync_marker,
};
use crate::error::CliError;

pub async fn run_show(id: &str, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let record = resolve_record(id, &store).await?;

    if as_json {
        println!(
            "{}",
            serde_json::to_string_pretty(&record_to_list_item(&record))?
        );
        return Ok(());
    }

    println!("id:       {}", record.id);
    println!("created:  {}", format_timestamp(record.created_at));
    println!("updated:  {}", format_timestamp(record.updated_at));
    println!("synced:   {}", format_optional_timestamp(record.synced_at));
    if let Some(deleted_at) = record.deleted_at {
        println!("deleted:  {}", format_timestamp(deleted_at));
    }
    let marker = sync_marker(&record);
    if !marker.is_empty() {
        println!("status:   {marker}");
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::Value::Object(record.fields))?
    );
    Ok(())
}
