use std::path::Path;

use crate::commands::common::{open_store, resolve_fields};
use crate::error::CliError;

pub async fn run_add(parts: &[String], db_path: &Path) -> Result<(), CliError> {
    let fields = resolve_fields(parts)?;

    let store = open_store(db_path).await?;
    let record = store.create(fields).await?;

    println!("{}", record.id);
    Ok(())
}
