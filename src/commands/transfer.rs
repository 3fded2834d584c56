//! Transfer command handlers: upload, download, upload-status, upload-cancel.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use onedrive_core::transfer::{
    CancelFlag, DownloadEngine, RetryPolicy, TransferOutcome, TransferRunner, UploadChunkSize,
    UploadEngine,
};
use tracing::info;

use crate::app::context::AppContext;
use crate::app::exit::{ProcessExit, exit_for_outcome};
use crate::app::progress::TransferProgress;
use crate::app_config::validate_upload_chunk_size;
use crate::cli::{DownloadArgs, SessionPairArgs, UploadArgs};

pub(crate) async fn run_upload(
    ctx: &AppContext,
    args: &UploadArgs,
    quiet: bool,
) -> Result<ProcessExit> {
    validate_upload_chunk_size(args.transfer.chunk_size)?;
    let chunk_size = match args.transfer.chunk_size.or(ctx.config.upload_chunk_size) {
        Some(bytes) => UploadChunkSize::new(bytes)?,
        None => UploadChunkSize::default(),
    };
    let engine = UploadEngine::new(ctx.graph_client()?, ctx.session_store()?)
        .with_chunk_size(chunk_size);

    let progress = TransferProgress::new(&display_name(&args.local), quiet);
    let runner = runner(ctx, args.transfer.max_retries).with_progress(progress.callback());
    let result = runner.upload(&engine, &args.local, &args.remote).await;
    progress.finish();
    let outcome =
        result.with_context(|| format!("Upload of '{}' failed", args.local.display()))?;

    match &outcome {
        TransferOutcome::Completed { bytes, item } => {
            let name = item.as_ref().map_or(args.remote.as_str(), |item| item.name.as_str());
            println!("Uploaded {} ({bytes} bytes) as {name}", args.local.display());
        }
        TransferOutcome::Interrupted { offset, total } => report_interrupted(*offset, *total),
    }
    Ok(exit_for_outcome(&outcome))
}

pub(crate) async fn run_download(
    ctx: &AppContext,
    args: &DownloadArgs,
    quiet: bool,
) -> Result<ProcessExit> {
    let local = match &args.local {
        Some(path) => path.clone(),
        None => default_local_path(&args.remote)?,
    };
    let mut engine = DownloadEngine::new(ctx.graph_client()?, ctx.session_store()?);
    if let Some(size) = args.transfer.chunk_size.or(ctx.config.download_chunk_size) {
        engine = engine.with_chunk_size(size);
    }
    if let Some(ttl) = ctx.config.download_session_ttl_secs {
        engine = engine.with_session_ttl(Duration::from_secs(ttl));
    }

    if let Some(format) = args.format.as_deref() {
        let written = engine
            .download_whole(&args.remote, &local, Some(format))
            .await
            .with_context(|| format!("Download of '{}' failed", args.remote))?;
        println!("Downloaded {} ({written} bytes) to {}", args.remote, local.display());
        return Ok(ProcessExit::Success);
    }

    let progress = TransferProgress::new(&args.remote, quiet);
    let runner = runner(ctx, args.transfer.max_retries).with_progress(progress.callback());
    let result = runner.download(&engine, &args.remote, &local).await;
    progress.finish();
    let outcome = result.with_context(|| format!("Download of '{}' failed", args.remote))?;

    match &outcome {
        TransferOutcome::Completed { bytes, .. } => {
            println!("Downloaded {} ({bytes} bytes) to {}", args.remote, local.display());
        }
        TransferOutcome::Interrupted { offset, total } => report_interrupted(*offset, *total),
    }
    Ok(exit_for_outcome(&outcome))
}

pub(crate) async fn run_upload_status(
    ctx: &AppContext,
    args: &SessionPairArgs,
) -> Result<ProcessExit> {
    let engine = UploadEngine::new(ctx.graph_client()?, ctx.session_store()?);
    let Some(handle) = engine.find(&args.local, &args.remote).await? else {
        eprintln!(
            "No upload session for {} -> {}",
            args.local.display(),
            args.remote
        );
        return Ok(ProcessExit::Failure);
    };

    let status = engine
        .status(&handle)
        .await
        .context("Could not read upload status")?;
    println!("remote:   {}", handle.session().remote_path);
    println!("progress: {}/{} bytes", status.offset, status.total);
    if let Some(expires_at) = status.expires_at {
        println!("expires:  {expires_at}");
    }
    if !status.next_expected_ranges.is_empty() {
        println!("missing:  {}", status.next_expected_ranges.join(", "));
    }
    Ok(ProcessExit::Success)
}

pub(crate) async fn run_upload_cancel(
    ctx: &AppContext,
    args: &SessionPairArgs,
) -> Result<ProcessExit> {
    let engine = UploadEngine::new(ctx.graph_client()?, ctx.session_store()?);
    let Some(handle) = engine.find(&args.local, &args.remote).await? else {
        info!("No upload session to cancel");
        return Ok(ProcessExit::Success);
    };
    engine
        .cancel(handle)
        .await
        .context("Could not cancel upload")?;
    println!("Cancelled upload of {} -> {}", args.local.display(), args.remote);
    Ok(ProcessExit::Success)
}

fn runner(ctx: &AppContext, max_retries: Option<u32>) -> TransferRunner {
    let cancel = CancelFlag::new();
    cancel.cancel_on_ctrl_c();
    TransferRunner::new(
        RetryPolicy::with_max_retries(ctx.max_retries(max_retries)),
        cancel,
    )
}

fn report_interrupted(offset: u64, total: u64) {
    eprintln!("Interrupted at {offset}/{total} bytes; run the same command again to resume");
}

fn display_name(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.display().to_string(),
        |name| name.to_string_lossy().into_owned(),
    )
}

/// Last segment of the drive path, in the current directory.
fn default_local_path(remote: &str) -> Result<PathBuf> {
    let Some(name) = remote.rsplit('/').find(|segment| !segment.is_empty()) else {
        bail!("Cannot derive a file name from '{remote}'; pass a destination path");
    };
    Ok(PathBuf::from(name))
}
