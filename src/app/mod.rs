//! Command dispatch and shared runtime pieces for the binary.

pub(crate) mod context;
pub(crate) mod exit;
pub(crate) mod progress;

use anyhow::Result;

use crate::cli::{Cli, Command};
use crate::commands;
use context::AppContext;
use exit::ProcessExit;

/// Runs the parsed command and returns the exit outcome.
pub(crate) async fn run(cli: Cli) -> Result<ProcessExit> {
    let ctx = AppContext::load(cli.config.clone())?;
    let quiet = cli.quiet;

    match cli.command {
        Command::Login(args) => commands::run_login(&ctx, &args).await,
        Command::Logout => commands::run_logout(&ctx),
        Command::Upload(args) => commands::run_upload(&ctx, &args, quiet).await,
        Command::Download(args) => commands::run_download(&ctx, &args, quiet).await,
        Command::UploadStatus(args) => commands::run_upload_status(&ctx, &args).await,
        Command::UploadCancel(args) => commands::run_upload_cancel(&ctx, &args).await,
        Command::Sessions(args) => commands::run_sessions(&ctx, &args),
    }
}
