//! CLI entry point for the onedrive tool.

use clap::Parser;
use tracing::debug;

mod app;
mod app_config;
mod cli;
mod commands;

use app::exit::{ProcessExit, exit_for_error};
use cli::Cli;

#[tokio::main]
async fn main() {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let cli = Cli::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // stdout carries command results only
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?cli, "CLI arguments parsed");

    let exit = match app::run(cli).await {
        Ok(exit) => exit,
        Err(error) => {
            eprintln!("Error: {error:#}");
            let exit = exit_for_error(&error);
            if exit == ProcessExit::ReauthRequired {
                eprintln!("Run `onedrive login` to sign in again.");
            }
            exit
        }
    };
    std::process::exit(exit.code());
}
