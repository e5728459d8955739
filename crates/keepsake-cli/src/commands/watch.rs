use std::path::Path;
use std::sync::Arc;

use keepsake_core::clock::system_clock;
use keepsake_core::sync::{SyncMode, SyncNotification, SyncScheduler};
use tokio::sync::broadcast::error::RecvError;

use crate::commands::common::{build_engine, load_settings, open_store};
use crate::commands::sync::format_sync_result;
use crate::error::CliError;

pub async fn run_watch(db_path: &Path) -> Result<(), CliError> {
    let settings = load_settings()?;
    let engine = Arc::new(build_engine(open_store(db_path).await?, &settings)?);
    let mut notifications = engine.events().subscribe_notifications();

    let (scheduler, handle) = SyncScheduler::new(engine.clone(), &settings, system_clock());
    let scheduler_task = tokio::spawn(scheduler.run());
    handle.sync_now(SyncMode::Quick);

    println!(
        "Watching for changes every {}s. Press Ctrl-C to stop.",
        settings.auto_sync_interval.as_secs()
    );

    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res?;
                break;
            }
            notification = notifications.recv() => match notification {
                Ok(notification) => print_notification(&notification),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Missed sync notifications");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    handle.shutdown();
    if let Err(error) = scheduler_task.await {
        tracing::warn!("Sync scheduler task failed: {}", error);
    }
    Ok(())
}

fn print_notification(notification: &SyncNotification) {
    match notification {
        SyncNotification::SyncStart { mode } => tracing::debug!(%mode, "Sync started"),
        SyncNotification::SyncComplete(result) => {
            for line in format_sync_result(result) {
                println!("{line}");
            }
        }
        SyncNotification::SyncError { message } => eprintln!("Sync failed: {message}"),
        SyncNotification::NetworkChange { online } => {
            println!("Network {}", if *online { "online" } else { "offline" });
        }
    }
}
