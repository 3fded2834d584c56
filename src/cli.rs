//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Command-line client for Microsoft OneDrive.
///
/// Large uploads and downloads are chunked and resumable: re-run the same
/// command after an interruption to continue where it stopped.
#[derive(Parser, Debug)]
#[command(name = "onedrive")]
#[command(author, version, about)]
pub struct Cli {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the config file (default: $XDG_CONFIG_HOME/onedrive/config.json)
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Sign in with a device code and store the token
    Login(LoginArgs),
    /// Forget the stored token
    Logout,
    /// Upload a local file, resuming an interrupted upload
    Upload(UploadArgs),
    /// Download a drive file, resuming an interrupted download
    Download(DownloadArgs),
    /// Show server-side progress of an interrupted upload
    UploadStatus(SessionPairArgs),
    /// Cancel an interrupted upload and forget its session
    UploadCancel(SessionPairArgs),
    /// List persisted transfer sessions
    Sessions(SessionsArgs),
}

/// Arguments for `login`.
#[derive(Args, Debug)]
pub struct LoginArgs {
    /// Application (client) id; saved to the config file
    #[arg(long)]
    pub client_id: Option<String>,

    /// Tenant id or `common`, `organizations`, `consumers`
    #[arg(long)]
    pub tenant: Option<String>,
}

/// Tuning shared by transfer commands.
#[derive(Args, Debug, Default)]
pub struct TransferArgs {
    /// Maximum retry attempts per chunk for transient failures (0-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u32).range(0..=10))]
    pub max_retries: Option<u32>,

    /// Chunk size in bytes (uploads: multiple of 327680, at most 62914560)
    #[arg(long, value_name = "BYTES", value_parser = clap::value_parser!(u64).range(327_680..=62_914_560))]
    pub chunk_size: Option<u64>,
}

/// Arguments for `upload`.
#[derive(Args, Debug)]
pub struct UploadArgs {
    /// Local file to upload
    pub local: PathBuf,

    /// Destination path in the drive, e.g. /Documents/report.pdf
    pub remote: String,

    #[command(flatten)]
    pub transfer: TransferArgs,
}

/// Arguments for `download`.
#[derive(Args, Debug)]
pub struct DownloadArgs {
    /// Drive path of the file, e.g. /Documents/report.pdf
    pub remote: String,

    /// Destination file (default: the remote file name in the current directory)
    pub local: Option<PathBuf>,

    /// Convert on the server before downloading (e.g. pdf); not resumable
    #[arg(long)]
    pub format: Option<String>,

    #[command(flatten)]
    pub transfer: TransferArgs,
}

/// A (local, remote) pair naming one persisted upload.
#[derive(Args, Debug)]
pub struct SessionPairArgs {
    /// Local file given to `upload`
    pub local: PathBuf,

    /// Drive path given to `upload`
    pub remote: String,
}

/// Arguments for `sessions`.
#[derive(Args, Debug)]
pub struct SessionsArgs {
    /// Delete expired session records
    #[arg(long)]
    pub purge_expired: bool,
}
