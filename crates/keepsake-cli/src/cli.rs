use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, shells};

#[derive(Parser)]
#[command(name = "keepsake")]
#[command(about = "Offline-first records with background sync")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a record from a JSON object or key=value pairs
    #[command(alias = "new")]
    Add {
        /// `{"name":"milk"}` or `name=milk qty=2`
        fields: Vec<String>,
    },
    /// List records
    #[command(alias = "ls")]
    List {
        /// Number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Include deleted records
        #[arg(long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one record
    Show {
        /// Record ID or unique ID prefix
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Update fields of a record (opens $EDITOR when no fields are given)
    Edit {
        /// Record ID or unique ID prefix
        id: String,
        /// key=value pairs; `key=null` removes a field
        fields: Vec<String>,
    },
    /// Delete a record
    #[command(alias = "rm")]
    Delete {
        /// Record ID or unique ID prefix
        id: String,
    },
    /// Push local changes and pull remote ones
    Sync {
        /// Pull everything instead of changes since the last checkpoint
        #[arg(long)]
        full: bool,
        #[command(subcommand)]
        command: Option<SyncCommands>,
    },
    /// Keep syncing in the background until interrupted
    Watch,
    /// Manage the API credential
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },
    /// Inspect or initialize configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

impl CompletionShell {
    /// Completion script for the `keepsake` binary.
    pub fn script(self) -> Vec<u8> {
        let mut command = Cli::command();
        let name = command.get_name().to_string();
        let mut buffer = Vec::new();
        match self {
            Self::Bash => generate(shells::Bash, &mut command, name, &mut buffer),
            Self::Zsh => generate(shells::Zsh, &mut command, name, &mut buffer),
            Self::Fish => generate(shells::Fish, &mut command, name, &mut buffer),
        }
        buffer
    }
}

#[derive(Subcommand)]
pub enum SyncCommands {
    /// Show pending changes and checkpoint state
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List changes that were dropped by sync
    Errors {
        /// Number of errors to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
        /// Delete the error log after printing it
        #[arg(long)]
        clear: bool,
    },
    /// List recently resolved sync conflicts
    Conflicts {
        /// Number of conflicts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Forget the pull checkpoint so the next sync downloads everything
    Reset,
    /// Remove deleted records that the server already acknowledged
    Purge,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Write a config file with defaults
    Init {
        /// Remote sync API base URL
        #[arg(long, value_name = "URL")]
        api_url: Option<String>,
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
pub enum AuthCommands {
    /// Store an API token in the OS keychain
    Login {
        /// API token (read from stdin when omitted)
        #[arg(long, value_name = "TOKEN")]
        token: Option<String>,
    },
    /// Show where the active credential comes from
    Status,
    /// Remove the stored API token
    Logout,
}
