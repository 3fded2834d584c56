//! The chunk loop: retry, progress reporting, and cancellation between chunks.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{info, instrument, warn};

use super::download::DownloadEngine;
use super::retry::{RetryDecision, RetryPolicy};
use super::upload::UploadEngine;
use crate::drive::DriveItem;
use crate::error::{ApiError, ErrorKind};

/// Granularity at which a backoff wait notices cancellation.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Progress callback: `(bytes confirmed, total bytes)`.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Shared cancellation flag, checked between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// A flag that is not set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sets the flag on the first Ctrl-C.
    pub fn cancel_on_ctrl_c(&self) {
        let flag = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, stopping after the current chunk");
                flag.cancel();
            }
        });
    }
}

/// How a transfer run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Every byte was transferred.
    Completed {
        /// File size.
        bytes: u64,
        /// Created item, for uploads.
        item: Option<DriveItem>,
    },
    /// Cancelled between chunks; the session record is kept for a later resume.
    Interrupted {
        /// Bytes confirmed.
        offset: u64,
        /// File size.
        total: u64,
    },
}

/// Drives an engine until the transfer completes, fails, or is cancelled.
#[derive(Clone)]
pub struct TransferRunner {
    retry: RetryPolicy,
    cancel: CancelFlag,
    progress: Option<ProgressFn>,
}

impl std::fmt::Debug for TransferRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferRunner")
            .field("retry", &self.retry)
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

impl TransferRunner {
    /// Creates a runner.
    #[must_use]
    pub fn new(retry: RetryPolicy, cancel: CancelFlag) -> Self {
        Self {
            retry,
            cancel,
            progress: None,
        }
    }

    /// Reports progress after the session is opened and after every chunk.
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Uploads `local_path` to `remote_path`, resuming a persisted session.
    ///
    /// Empty files go through a simple upload.
    ///
    /// # Errors
    ///
    /// The first non-retryable failure, or the last transient one once
    /// retries are exhausted. The session record is kept for a later resume.
    #[instrument(level = "debug", skip(self, engine), fields(local = %local_path.display()))]
    pub async fn upload(
        &self,
        engine: &UploadEngine,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<TransferOutcome, ApiError> {
        let size = tokio::fs::metadata(local_path)
            .await
            .map_err(|e| ApiError::io(format!("reading {}", local_path.display()), e))?
            .len();
        if size == 0 {
            let mut attempt = 1;
            let item = loop {
                match engine.simple_upload(local_path, remote_path).await {
                    Ok(item) => break item,
                    Err(error) => self.backoff(error, &mut attempt).await?,
                }
            };
            self.report(0, 0);
            return Ok(TransferOutcome::Completed {
                bytes: 0,
                item: Some(item),
            });
        }

        let mut attempt = 1;
        let mut handle = loop {
            match engine.resume_or_create(local_path, remote_path).await {
                Ok(handle) => break handle,
                Err(error) => self.backoff(error, &mut attempt).await?,
            }
        };
        self.report(handle.offset(), handle.total());

        loop {
            if self.cancel.is_cancelled() {
                return Ok(self.interrupted(handle.offset(), handle.total()));
            }
            let mut attempt = 1;
            let outcome = loop {
                match engine.upload_next_chunk(&mut handle).await {
                    Ok(outcome) => break outcome,
                    Err(error) => self.backoff(error, &mut attempt).await?,
                }
                if self.cancel.is_cancelled() {
                    return Ok(self.interrupted(handle.offset(), handle.total()));
                }
            };
            self.report(outcome.offset, outcome.total);
            if !outcome.more {
                return Ok(TransferOutcome::Completed {
                    bytes: outcome.total,
                    item: handle.item().cloned(),
                });
            }
        }
    }

    /// Downloads `remote_path` to `local_path`, resuming a persisted session.
    ///
    /// # Errors
    ///
    /// As for [`upload`](Self::upload).
    #[instrument(level = "debug", skip(self, engine), fields(local = %local_path.display()))]
    pub async fn download(
        &self,
        engine: &DownloadEngine,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<TransferOutcome, ApiError> {
        let mut attempt = 1;
        let mut handle = loop {
            match engine.resume_or_create(remote_path, local_path).await {
                Ok(handle) => break handle,
                Err(error) => self.backoff(error, &mut attempt).await?,
            }
        };
        self.report(handle.offset(), handle.total());

        loop {
            if self.cancel.is_cancelled() {
                return Ok(self.interrupted(handle.offset(), handle.total()));
            }
            let mut attempt = 1;
            let outcome = loop {
                match engine.download_next_chunk(&mut handle).await {
                    Ok(outcome) => break outcome,
                    Err(error) => self.backoff(error, &mut attempt).await?,
                }
                if self.cancel.is_cancelled() {
                    return Ok(self.interrupted(handle.offset(), handle.total()));
                }
            };
            self.report(outcome.offset, outcome.total);
            if !outcome.more {
                return Ok(TransferOutcome::Completed {
                    bytes: outcome.total,
                    item: None,
                });
            }
        }
    }

    /// Waits before the next attempt, or hands the error back when it must surface.
    async fn backoff(&self, error: ApiError, attempt: &mut u32) -> Result<(), ApiError> {
        match self.retry.should_retry(&error, *attempt) {
            RetryDecision::Retry {
                delay,
                attempt: next,
            } => {
                warn!(
                    kind = %error.kind(),
                    attempt = next,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "transient failure, retrying: {}",
                    error.detail()
                );
                self.sleep(delay).await;
                *attempt = next;
                Ok(())
            }
            RetryDecision::DoNotRetry { reason } => {
                if error.kind() != ErrorKind::ReauthRequired {
                    warn!(kind = %error.kind(), %reason, "giving up");
                }
                Err(error)
            }
        }
    }

    async fn sleep(&self, delay: Duration) {
        let deadline = tokio::time::Instant::now() + delay;
        while !self.cancel.is_cancelled() {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep((deadline - now).min(CANCEL_POLL_INTERVAL)).await;
        }
    }

    fn report(&self, offset: u64, total: u64) {
        if let Some(progress) = &self.progress {
            progress(offset, total);
        }
    }

    fn interrupted(&self, offset: u64, total: u64) -> TransferOutcome {
        info!(offset, total, "transfer interrupted, session kept for resume");
        TransferOutcome::Interrupted { offset, total }
    }
}
