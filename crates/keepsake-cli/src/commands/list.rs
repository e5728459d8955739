use std::path::Path;

use keepsake_core::Record;

use crate::commands::common::{
    format_record_lines, open_store, record_to_list_item, RecordListItem,
};
use crate::error::CliError;

pub async fn run_list(
    limit: usize,
    include_deleted: bool,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let mut records: Vec<Record> = if include_deleted {
        store.changes_since(None).await?
    } else {
        store.list_active().await?
    };
    records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    records.truncate(limit);

    if as_json {
        let json_items = records
            .iter()
            .map(record_to_list_item)
            .collect::<Vec<RecordListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
    } else if records.is_empty() {
        println!("No records yet.");
    } else {
        for line in format_record_lines(&records) {
            println!("{line}");
        }
    }

    Ok(())
}
