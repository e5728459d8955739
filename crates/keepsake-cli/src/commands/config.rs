use std::path::Path;

use keepsake_core::util::normalize_text_option;
use keepsake_core::SyncSettings;

use crate::cli::ConfigCommands;
use crate::commands::common::{config_path, load_settings};
use crate::error::CliError;

pub fn run_config(command: ConfigCommands) -> Result<(), CliError> {
    match command {
        ConfigCommands::Show { json } => run_config_show(json),
        ConfigCommands::Init { api_url, force } => {
            let path = config_path()?;
            run_config_init(&path, api_url, force)?;
            println!("{}", path.display());
            Ok(())
        }
    }
}

fn run_config_show(as_json: bool) -> Result<(), CliError> {
    let settings = load_settings()?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&settings)?);
        return Ok(());
    }

    println!("config file:          {}", config_path()?.display());
    println!(
        "api_base_url:         {}",
        settings.api_base_url.as_deref().unwrap_or("(not set)")
    );
    println!(
        "auto_sync:            {} every {}s",
        on_off(settings.auto_sync_enabled),
        settings.auto_sync_interval.as_secs()
    );
    println!(
        "retry:                {}s base, {}s max, {} attempts, jitter {}",
        settings.retry_interval.as_secs(),
        settings.max_retry_delay.as_secs(),
        settings.max_retries,
        on_off(settings.backoff_jitter)
    );
    println!("max_entry_retries:    {}", settings.max_entry_retries);
    println!("batch_size:           {}", settings.batch_size);
    println!(
        "request_timeout:      {}s",
        settings.request_timeout.as_secs()
    );
    println!(
        "full_sync_freshness:  {}s",
        settings.full_sync_freshness.as_secs()
    );
    Ok(())
}

/// Write a config file at `path`, keeping existing values unless `force` is set.
pub fn run_config_init(
    path: &Path,
    api_url: Option<String>,
    force: bool,
) -> Result<SyncSettings, CliError> {
    let mut settings = if force {
        SyncSettings::default()
    } else {
        SyncSettings::load_from_path(path)?
    };
    if let Some(url) = normalize_text_option(api_url) {
        settings.api_base_url = Some(url);
    }
    settings.validate()?;
    settings.save_to_path(path)?;
    Ok(settings)
}

const fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}
