use std::path::Path;

use crate::commands::common::{open_store, resolve_record};
use crate::error::CliError;

pub async fn run_delete(id: &str, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let record = resolve_record(id, &store).await?;

    store.soft_delete(&record.id).await?;
    println!("{}", record.id);
    Ok(())
}
