//! ZBroker -- reverse-tunnel HTTP broker.
//!
//! `zbroker server` accepts public requests and tunnel connections;
//! `zbroker client` runs next to private services and dials out to the server.

mod cli;
mod commands;
mod config;

use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::process::ExitCode;

use cli::{Cli, Commands};
use config::FileConfig;
use zbroker_observability::{init_observability, LogFormat, LogLevel};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let file = match FileConfig::load(cli.config.as_deref()) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let mut obs_config = file.observability.clone();
    if cli.verbose > 0 {
        obs_config.logging.level = LogLevel::from_verbosity(cli.verbose);
        obs_config.logging.filter_directives = None;
    }
    // Use pretty format for terminals, JSON for piped output
    obs_config.logging.format = match cli.log_format {
        Some(format) => format.into(),
        None if std::io::stdout().is_terminal() => LogFormat::Pretty,
        None => LogFormat::Json,
    };

    // Hold the guard for the lifetime of the process
    let _guard = match init_observability(&obs_config).context("Failed to initialize observability") {
        Ok(g) => g,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")
    {
        Ok(rt) => match rt.block_on(run(cli, file)) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "zbroker exited with error");
                eprintln!("Error: {e:#}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Dispatch CLI commands to their handlers.
async fn run(cli: Cli, file: FileConfig) -> Result<()> {
    match cli.command {
        Commands::Server {
            bind,
            tunnel_bind,
            accept,
        } => {
            let args = commands::server::ServerArgs {
                bind,
                tunnel_bind,
                accept,
            };
            commands::server::serve(args, file).await
        }
        Commands::Client {
            token,
            server_url,
            tunnel_url,
            accept,
            connection_type,
            role,
        } => {
            let args = commands::client::ClientArgs {
                token,
                server_url,
                tunnel_url,
                accept,
                connection_type,
                role: role.map(Into::into),
            };
            commands::client::run_client(args, file).await
        }
    }
}
