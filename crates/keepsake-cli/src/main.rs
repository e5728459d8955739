//! Keepsake CLI - offline-first records from the command line
//!
//! Every change is stored locally first and replayed to the sync API by
//! `keepsake sync` or the long-running `keepsake watch`.

mod auth;
mod cli;
mod commands;
mod error;

use std::io::{self, Write};
use std::path::Path;

use clap::{CommandFactory, Parser};

use crate::cli::{Cli, Commands, CompletionShell};
use crate::commands::add::run_add;
use crate::commands::auth_cmd::run_auth;
use crate::commands::common::resolve_db_path;
use crate::commands::config::run_config;
use crate::commands::delete::run_delete;
use crate::commands::edit::run_edit;
use crate::commands::list::run_list;
use crate::commands::show::run_show;
use crate::commands::sync::run_sync_command;
use crate::commands::watch::run_watch;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("keepsake=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    let db_path = || resolve_db_path(cli.db_path.clone());
    match command {
        Commands::Add { fields } => run_add(&fields, &db_path()?).await,
        Commands::List { limit, all, json } => run_list(limit, all, json, &db_path()?).await,
        Commands::Show { id, json } => run_show(&id, json, &db_path()?).await,
        Commands::Edit { id, fields } => run_edit(&id, &fields, &db_path()?).await,
        Commands::Delete { id } => run_delete(&id, &db_path()?).await,
        Commands::Sync { full, command } => run_sync_command(command, full, &db_path()?).await,
        Commands::Watch => run_watch(&db_path()?).await,
        Commands::Auth { command } => run_auth(command),
        Commands::Config { command } => run_config(command),
        Commands::Completions { shell, output } => write_completions(shell, output.as_deref()),
    }
}

fn write_completions(shell: CompletionShell, output: Option<&Path>) -> Result<(), CliError> {
    let script = shell.script();
    if let Some(path) = output {
        std::fs::write(path, &script)?;
        println!("{}", path.display());
    } else {
        io::stdout().write_all(&script)?;
    }
    Ok(())
}
