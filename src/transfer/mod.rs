//! Resumable chunked transfers.
//!
//! This module provides:
//! - [`UploadEngine`] - upload-session lifecycle and chunked `PUT`s
//! - [`DownloadEngine`] - ranged `GET`s against pre-authenticated URLs
//! - [`TransferRunner`] - the chunk loop with retry, progress and cancellation
//! - [`RetryPolicy`] - exponential backoff for transient failures
//!
//! Both engines persist their offset through the
//! [`SessionStore`](crate::session::SessionStore) after every confirmed chunk,
//! so a killed process repeats at most one chunk when it is run again.

mod chunk;
mod download;
mod retry;
mod runner;
mod upload;

pub use chunk::{
    ChunkPlan, DEFAULT_DOWNLOAD_CHUNK_SIZE, DEFAULT_UPLOAD_CHUNK_SIZE, MAX_UPLOAD_CHUNK_SIZE,
    UPLOAD_CHUNK_ALIGNMENT, UploadChunkSize, parse_content_range, parse_range_start,
};
pub use download::{DEFAULT_DOWNLOAD_SESSION_TTL, DownloadEngine, DownloadHandle};
pub use retry::{DEFAULT_MAX_RETRIES, RetryDecision, RetryPolicy};
pub use runner::{CancelFlag, ProgressFn, TransferOutcome, TransferRunner};
pub use upload::{
    ChunkResponse, ProgressInfo, SIMPLE_UPLOAD_LIMIT, UploadEngine, UploadHandle,
    UploadSessionDescriptor,
};

use crate::error::{ApiError, ErrorKind};
use crate::session::{SessionError, SessionKey, SessionLock, SessionStore};

/// Result of one chunk step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkOutcome {
    /// Whether another chunk call is needed.
    pub more: bool,
    /// Bytes confirmed so far.
    pub offset: u64,
    /// Total bytes.
    pub total: u64,
}

/// Runs a blocking session-store operation off the async worker threads.
///
/// Lock acquisition can wait on another process for as long as that process
/// holds the key, so it must not block the runtime.
pub(crate) async fn store_op<T, F>(store: &SessionStore, op: F) -> Result<T, ApiError>
where
    F: FnOnce(&SessionStore) -> Result<T, SessionError> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || op(&store))
        .await
        .map_err(|e| ApiError::new(ErrorKind::Internal, "session store task failed").with_source(e))?
        .map_err(ApiError::from)
}

/// Takes the per-key lock without blocking the runtime.
pub(crate) async fn lock_key(store: &SessionStore, key: SessionKey) -> Result<SessionLock, ApiError> {
    store_op(store, move |store| store.lock(&key)).await
}
