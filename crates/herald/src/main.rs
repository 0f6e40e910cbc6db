// SPDX-FileCopyrightText: 2026 Herald Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Herald - multi-session chat client multiplexer.
//!
//! This is the binary entry point for the Herald service.

mod bridge;
mod serve;
mod webhook;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use herald_config::model::HeraldConfig;
use herald_core::{HeraldError, SessionIdentityStore};
use herald_session::DiskIdentityStore;

/// Herald - multi-session chat client multiplexer.
#[derive(Parser, Debug)]
#[command(name = "herald", version, about, long_about = None)]
struct Cli {
    /// Read configuration from this file instead of the standard locations.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the session service until SIGINT/SIGTERM.
    Serve,
    /// List the sessions persisted in the credential directory.
    Sessions,
    /// Validate and print the effective configuration.
    Config,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let loaded = match &cli.config {
        Some(path) => herald_config::load_and_validate_path(path),
        None => herald_config::load_and_validate(),
    };
    let config = match loaded {
        Ok(config) => config,
        Err(errors) => {
            herald_config::render_errors(&errors);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Some(Commands::Serve) => serve::run_serve(config).await,
        Some(Commands::Sessions) => list_sessions(&config).await,
        Some(Commands::Config) => print_config(&config),
        None => {
            println!("herald: use --help for available commands");
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("herald: {e}");
        std::process::exit(1);
    }
}

async fn list_sessions(config: &HeraldConfig) -> Result<(), HeraldError> {
    let store = DiskIdentityStore::new(&config.service.auth_dir);
    let ids = store.list().await?;
    if ids.is_empty() {
        println!("no persisted sessions in {}", store.auth_dir().display());
        return Ok(());
    }
    for id in ids {
        println!("{id}\t{}", store.session_dir(&id).display());
    }
    Ok(())
}

fn print_config(config: &HeraldConfig) -> Result<(), HeraldError> {
    let rendered = toml::to_string_pretty(config)
        .map_err(|e| HeraldError::Internal(format!("failed to render config: {e}")))?;
    print!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_loads_config_defaults() {
        // Verify config loads with defaults (no config file needed)
        let config = herald_config::load_and_validate().expect("default config should be valid");
        assert_eq!(config.service.name, "herald");
    }

    #[test]
    fn cli_parses_subcommands_and_global_config() {
        let cli = Cli::try_parse_from(["herald", "serve", "--config", "/tmp/herald.toml"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Serve)));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/herald.toml")));

        let cli = Cli::try_parse_from(["herald", "sessions"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Sessions)));
        assert!(Cli::try_parse_from(["herald", "bogus"]).is_err());
    }

    #[test]
    fn printed_config_round_trips() {
        let config = HeraldConfig::default();
        let rendered = toml::to_string_pretty(&config).unwrap();
        let parsed = herald_config::load_config_from_str(&rendered).unwrap();
        assert_eq!(parsed.delivery.chunk_size, config.delivery.chunk_size);
        assert_eq!(parsed.reconnect.permanent_reasons, config.reconnect.permanent_reasons);
    }
}
