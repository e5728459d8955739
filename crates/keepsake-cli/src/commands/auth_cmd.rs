use crate::auth::{resolve_token, TokenStore, TOKEN_ENV_VAR};
use crate::cli::AuthCommands;
use crate::commands::common::read_piped_stdin;
use crate::error::CliError;

pub fn run_auth(command: AuthCommands) -> Result<(), CliError> {
    let store = TokenStore::default();
    match command {
        AuthCommands::Login { token } => {
            let token = match token {
                Some(token) => token,
                None => read_piped_stdin()?.ok_or_else(|| {
                    CliError::Config(
                        "Provide a token with --token or pipe it on stdin".to_string(),
                    )
                })?,
            };
            store.save(&token)?;
            println!("API token stored in the OS keychain");
            Ok(())
        }
        AuthCommands::Status => {
            match resolve_token(&store, |key| std::env::var(key).ok())? {
                Some((_, source)) => println!("Using API token from {}", source.label()),
                None => println!("Not signed in. Run `keepsake auth login --token <TOKEN>`."),
            }
            Ok(())
        }
        AuthCommands::Logout => {
            store.clear()?;
            println!("API token removed from the OS keychain");
            if std::env::var_os(TOKEN_ENV_VAR).is_some() {
                println!("Note: {TOKEN_ENV_VAR} is still set in the environment");
            }
            Ok(())
        }
    }
}
