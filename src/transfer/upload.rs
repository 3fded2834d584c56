//! Upload-session lifecycle and chunked uploads.
//!
//! States per transfer: no session, creating, uploading, then completed or
//! cancelled. An interrupted upload is picked up again by
//! [`UploadEngine::resume_or_create`], which asks the server where to continue.

use std::io::SeekFrom;
use std::path::Path;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Method;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, instrument, warn};

use super::chunk::{ChunkPlan, UploadChunkSize, parse_range_start};
use super::{ChunkOutcome, lock_key, store_op};
use crate::drive::{DriveItem, create_upload_session_url, item_url};
use crate::error::{ApiError, ErrorKind};
use crate::http::{GraphClient, GraphRequest, decode_json};
use crate::session::{LoadOutcome, SessionKey, SessionStore, TransferKind, TransferSession};

/// Largest file sent with a single `PUT` instead of an upload session.
pub const SIMPLE_UPLOAD_LIMIT: u64 = 4 * 1024 * 1024;

/// Lifetime assumed when the service omits `expirationDateTime`.
const FALLBACK_SESSION_TTL_HOURS: i64 = 24;

/// Server view of an upload session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSessionDescriptor {
    /// Capability URL for chunk `PUT`s; only present on creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_url: Option<String>,
    /// When the server will discard the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_date_time: Option<DateTime<Utc>>,
    /// Ranges still missing, e.g. `["26214400-"]`.
    #[serde(default)]
    pub next_expected_ranges: Vec<String>,
}

impl UploadSessionDescriptor {
    /// First byte the server still expects, if it reported any ranges.
    #[must_use]
    pub fn next_offset(&self) -> Option<u64> {
        self.next_expected_ranges
            .iter()
            .filter_map(|range| parse_range_start(range))
            .min()
    }
}

/// Outcome of one accepted chunk `PUT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkResponse {
    /// `202`: more bytes expected, starting at `next_offset`.
    Accepted {
        /// Server's next expected byte.
        next_offset: u64,
    },
    /// `200`/`201`: the item is complete.
    Completed(DriveItem),
}

/// Progress reported by the upload URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressInfo {
    /// First byte the server still expects.
    pub offset: u64,
    /// Total bytes.
    pub total: u64,
    /// Server expiry, if reported.
    pub expires_at: Option<DateTime<Utc>>,
    /// Raw missing ranges.
    pub next_expected_ranges: Vec<String>,
}

/// An upload in progress.
#[derive(Debug, Clone)]
pub struct UploadHandle {
    session: TransferSession,
    resumed: bool,
    item: Option<DriveItem>,
}

impl UploadHandle {
    /// Persisted state of this upload.
    #[must_use]
    pub fn session(&self) -> &TransferSession {
        &self.session
    }

    /// Bytes confirmed so far.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.session.offset()
    }

    /// File size.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.session.total_size
    }

    /// Whether this handle continues a session from an earlier run.
    #[must_use]
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    /// The created item, once the final chunk was accepted.
    #[must_use]
    pub fn item(&self) -> Option<&DriveItem> {
        self.item.as_ref()
    }
}

/// Drives upload sessions against the Graph API.
#[derive(Debug, Clone)]
pub struct UploadEngine {
    client: GraphClient,
    store: SessionStore,
    chunk_size: UploadChunkSize,
}

impl UploadEngine {
    /// Creates an engine with the default chunk size.
    #[must_use]
    pub fn new(client: GraphClient, store: SessionStore) -> Self {
        Self {
            client,
            store,
            chunk_size: UploadChunkSize::default(),
        }
    }

    /// Overrides the chunk size.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: UploadChunkSize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Configured chunk size.
    #[must_use]
    pub fn chunk_size(&self) -> UploadChunkSize {
        self.chunk_size
    }

    /// Starts a new server-side session and persists it at offset 0,
    /// replacing any record for the pair.
    ///
    /// # Errors
    ///
    /// Classified failure of the create call, or [`ErrorKind::Internal`] for
    /// local file or session store failures.
    pub async fn create_session(
        &self,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<UploadHandle, ApiError> {
        let total = upload_size(local_path).await?;
        let guard = lock_key(&self.store, session_key(local_path, remote_path)?).await?;
        let session = self.open_session(local_path, remote_path, total).await?;
        guard.save(&session)?;
        Ok(UploadHandle {
            session,
            resumed: false,
            item: None,
        })
    }

    /// Continues the persisted upload for the pair, or starts a new one.
    ///
    /// The per-key lock is held from the lookup until the resulting record is
    /// saved, so concurrent callers on the same pair create one session.
    ///
    /// # Errors
    ///
    /// Classified failure of the status probe or create call;
    /// [`ErrorKind::InvalidRequest`] for empty or non-regular files;
    /// [`ErrorKind::Internal`] for local failures.
    #[instrument(level = "debug", skip(self), fields(local = %local_path.display()))]
    pub async fn resume_or_create(
        &self,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<UploadHandle, ApiError> {
        let total = upload_size(local_path).await?;
        if total == 0 {
            return Err(ApiError::new(
                ErrorKind::InvalidRequest,
                "upload sessions cannot carry an empty file; use a simple upload",
            ));
        }

        let guard = lock_key(&self.store, session_key(local_path, remote_path)?).await?;
        match guard.load()? {
            LoadOutcome::Found(mut session)
                if session.kind == TransferKind::Upload && session.total_size == total =>
            {
                match self.probe(&session.transfer_url).await {
                    Ok(descriptor) => {
                        reconcile(&mut session, &descriptor)?;
                        guard.save(&session)?;
                        info!(
                            remote = %session.remote_path,
                            offset = session.offset(),
                            total,
                            "resuming upload session"
                        );
                        return Ok(UploadHandle {
                            session,
                            resumed: true,
                            item: None,
                        });
                    }
                    Err(error) if error.matches(ErrorKind::ResourceNotFound) => {
                        warn!(remote = %session.remote_path, "upload session gone on server, starting over");
                        guard.delete()?;
                    }
                    Err(error) => return Err(error),
                }
            }
            LoadOutcome::Found(stale) => {
                warn!(
                    remote = %stale.remote_path,
                    recorded = stale.total_size,
                    actual = total,
                    "local file changed since the session was created, starting over"
                );
                if stale.kind == TransferKind::Upload {
                    if let Err(error) = self.cancel_url(&stale.transfer_url).await {
                        debug!(%error, "could not cancel stale upload session");
                    }
                }
                guard.delete()?;
            }
            LoadOutcome::Expired => {
                debug!("upload session expired, starting over");
            }
            LoadOutcome::NotFound => {}
        }

        let session = self.open_session(local_path, remote_path, total).await?;
        guard.save(&session)?;
        Ok(UploadHandle {
            session,
            resumed: false,
            item: None,
        })
    }

    /// Uploads the chunk at the handle's offset and persists the new offset
    /// before returning. The record is deleted once the item is complete.
    ///
    /// # Errors
    ///
    /// Classified chunk failure; the record is left untouched so the chunk
    /// can be retried or the upload resumed later.
    #[instrument(level = "debug", skip_all, fields(remote = %handle.session.remote_path, offset = handle.offset()))]
    pub async fn upload_next_chunk(
        &self,
        handle: &mut UploadHandle,
    ) -> Result<ChunkOutcome, ApiError> {
        let total = handle.total();
        if handle.item.is_some() {
            return Ok(ChunkOutcome {
                more: false,
                offset: total,
                total,
            });
        }
        let Some(plan) = ChunkPlan::next(handle.offset(), self.chunk_size.get(), total) else {
            return Err(ApiError::new(
                ErrorKind::OperationFailed,
                "every byte was accepted but the server never finalized the item",
            ));
        };

        let data = read_window(&handle.session.local_path, &plan).await?;
        let response = self
            .upload_chunk(&handle.session.transfer_url, &plan, data)
            .await?;
        match response {
            ChunkResponse::Accepted { next_offset } => {
                if next_offset < handle.offset() {
                    return Err(ApiError::new(
                        ErrorKind::OperationFailed,
                        format!(
                            "server moved the upload back from {} to {next_offset}",
                            handle.offset()
                        ),
                    ));
                }
                // An accepted chunk must move the offset; otherwise the retry budget bounds the loop.
                if next_offset == handle.offset() {
                    return Err(ApiError::new(
                        ErrorKind::RetryLater,
                        format!("server accepted the chunk but still expects offset {next_offset}"),
                    ));
                }
                handle.session.advance_to(next_offset)?;
                let snapshot = handle.session.clone();
                store_op(&self.store, move |store| store.save(&snapshot)).await?;
                debug!(next_offset, total, "chunk accepted");
                Ok(ChunkOutcome {
                    more: true,
                    offset: next_offset,
                    total,
                })
            }
            ChunkResponse::Completed(item) => {
                handle.session.advance_to(total)?;
                let local = handle.session.local_path.clone();
                let remote = handle.session.remote_path.clone();
                store_op(&self.store, move |store| store.delete(&local, &remote)).await?;
                info!(id = %item.id, name = %item.name, size = item.size, "upload complete");
                handle.item = Some(item);
                Ok(ChunkOutcome {
                    more: false,
                    offset: total,
                    total,
                })
            }
        }
    }

    /// Sends one chunk to an upload URL.
    ///
    /// # Errors
    ///
    /// Classified failure for statuses >= 400; [`ErrorKind::OperationFailed`]
    /// for any success status other than 200, 201 or 202;
    /// [`ErrorKind::DecodingFailed`] for a malformed body.
    pub async fn upload_chunk(
        &self,
        upload_url: &str,
        plan: &ChunkPlan,
        data: Vec<u8>,
    ) -> Result<ChunkResponse, ApiError> {
        let request = GraphRequest::new(Method::PUT, upload_url, "upload chunk")
            .capability()
            .header(CONTENT_RANGE, plan.content_range())
            .header(CONTENT_LENGTH, plan.len().to_string())
            .body(data, Some("application/octet-stream"));
        let response = self.client.send(request).await?;

        match response.status().as_u16() {
            202 => {
                let descriptor: UploadSessionDescriptor =
                    decode_json(response, "upload chunk").await?;
                Ok(ChunkResponse::Accepted {
                    next_offset: descriptor.next_offset().unwrap_or(plan.next_offset()),
                })
            }
            200 | 201 => Ok(ChunkResponse::Completed(
                decode_json(response, "upload final chunk").await?,
            )),
            status => Err(ApiError::unexpected_status("upload chunk", status)),
        }
    }

    /// Cancels the server session and deletes the local record.
    ///
    /// A session the server no longer knows counts as cancelled.
    ///
    /// # Errors
    ///
    /// Classified failure of the `DELETE`, or [`ErrorKind::Internal`] if the
    /// record cannot be removed.
    #[instrument(level = "debug", skip_all, fields(remote = %handle.session.remote_path))]
    pub async fn cancel(&self, handle: UploadHandle) -> Result<(), ApiError> {
        match self.cancel_url(&handle.session.transfer_url).await {
            Ok(()) => {}
            Err(error) if error.matches(ErrorKind::ResourceNotFound) => {
                debug!("upload session already gone on server");
            }
            Err(error) => return Err(error),
        }
        let local = handle.session.local_path.clone();
        let remote = handle.session.remote_path.clone();
        store_op(&self.store, move |store| store.delete(&local, &remote)).await?;
        info!(remote = %handle.session.remote_path, "upload cancelled");
        Ok(())
    }

    /// Reads the server's progress without touching local state.
    ///
    /// # Errors
    ///
    /// Classified failure of the probe; [`ErrorKind::ResourceNotFound`] once
    /// the session has been cancelled or has expired.
    pub async fn status(&self, handle: &UploadHandle) -> Result<ProgressInfo, ApiError> {
        let descriptor = self.probe(&handle.session.transfer_url).await?;
        Ok(ProgressInfo {
            offset: descriptor.next_offset().unwrap_or(handle.offset()),
            total: handle.total(),
            expires_at: descriptor.expiration_date_time,
            next_expected_ranges: descriptor.next_expected_ranges,
        })
    }

    /// Looks up the persisted upload for a pair without contacting the server.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Internal`] on session store failure.
    pub async fn find(
        &self,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<Option<UploadHandle>, ApiError> {
        let local = local_path.to_path_buf();
        let remote = remote_path.to_string();
        let outcome = store_op(&self.store, move |store| store.load(&local, &remote)).await?;
        Ok(match outcome {
            LoadOutcome::Found(session) if session.kind == TransferKind::Upload => {
                Some(UploadHandle {
                    session,
                    resumed: true,
                    item: None,
                })
            }
            _ => None,
        })
    }

    /// Uploads a small file in one request, renaming on name collision.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::InvalidRequest`] above [`SIMPLE_UPLOAD_LIMIT`]; classified
    /// failure of the `PUT`; [`ErrorKind::Internal`] if the file cannot be read.
    #[instrument(level = "debug", skip(self), fields(local = %local_path.display()))]
    pub async fn simple_upload(
        &self,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<DriveItem, ApiError> {
        let total = upload_size(local_path).await?;
        if total > SIMPLE_UPLOAD_LIMIT {
            return Err(ApiError::new(
                ErrorKind::InvalidRequest,
                format!("{total} bytes is too large for a simple upload"),
            ));
        }
        let data = tokio::fs::read(local_path)
            .await
            .map_err(|e| ApiError::io(format!("reading {}", local_path.display()), e))?;
        let remote = crate::session::normalize_remote_path(remote_path);
        let url = format!(
            "{}/content?@microsoft.graph.conflictBehavior=rename",
            item_url(self.client.base_url(), &remote)
        );
        let request = GraphRequest::new(Method::PUT, url, "simple upload")
            .body(data, Some("application/octet-stream"));
        let item: DriveItem = self.client.send_json(request).await?;
        info!(id = %item.id, name = %item.name, size = item.size, "upload complete");
        Ok(item)
    }

    async fn open_session(
        &self,
        local_path: &Path,
        remote_path: &str,
        total: u64,
    ) -> Result<TransferSession, ApiError> {
        let remote = crate::session::normalize_remote_path(remote_path);
        let url = create_upload_session_url(self.client.base_url(), &remote);
        let request = GraphRequest::new(Method::POST, url, "create upload session").json(
            &json!({ "item": { "@microsoft.graph.conflictBehavior": "rename" } }),
        )?;
        let descriptor: UploadSessionDescriptor = self.client.send_json(request).await?;
        let Some(upload_url) = descriptor.upload_url else {
            return Err(ApiError::new(
                ErrorKind::DecodingFailed,
                "create upload session: response has no uploadUrl",
            ));
        };
        let expires_at = descriptor
            .expiration_date_time
            .unwrap_or_else(|| Utc::now() + ChronoDuration::hours(FALLBACK_SESSION_TTL_HOURS));

        let session = TransferSession::new(
            TransferKind::Upload,
            local_path,
            &remote,
            upload_url,
            total,
            expires_at,
        )
        .map_err(|e| ApiError::io("resolving local path", e))?;
        info!(remote = %session.remote_path, total, %expires_at, "upload session created");
        Ok(session)
    }

    async fn probe(&self, upload_url: &str) -> Result<UploadSessionDescriptor, ApiError> {
        self.client
            .send_json(GraphRequest::new(Method::GET, upload_url, "upload status").capability())
            .await
    }

    async fn cancel_url(&self, upload_url: &str) -> Result<(), ApiError> {
        self.client
            .send(GraphRequest::new(Method::DELETE, upload_url, "cancel upload").capability())
            .await?;
        Ok(())
    }
}

fn reconcile(
    session: &mut TransferSession,
    descriptor: &UploadSessionDescriptor,
) -> Result<(), ApiError> {
    if let Some(expires_at) = descriptor.expiration_date_time {
        session.expires_at = expires_at;
    }
    let Some(server_offset) = descriptor.next_offset() else {
        return Ok(());
    };
    if server_offset != session.offset() {
        warn!(
            local = session.offset(),
            server = server_offset,
            "local offset differs from server, using server offset"
        );
    }
    session.reconcile(server_offset)?;
    Ok(())
}

fn session_key(local_path: &Path, remote_path: &str) -> Result<SessionKey, ApiError> {
    SessionKey::new(local_path, remote_path).map_err(|e| ApiError::io("resolving local path", e))
}

async fn upload_size(local_path: &Path) -> Result<u64, ApiError> {
    let metadata = tokio::fs::metadata(local_path)
        .await
        .map_err(|e| ApiError::io(format!("reading {}", local_path.display()), e))?;
    if !metadata.is_file() {
        return Err(ApiError::new(
            ErrorKind::InvalidRequest,
            format!("{} is not a regular file", local_path.display()),
        ));
    }
    Ok(metadata.len())
}

async fn read_window(local_path: &Path, plan: &ChunkPlan) -> Result<Vec<u8>, ApiError> {
    let context = || format!("reading {} at {}", local_path.display(), plan);
    let mut file = tokio::fs::File::open(local_path)
        .await
        .map_err(|e| ApiError::io(context(), e))?;
    file.seek(SeekFrom::Start(plan.start))
        .await
        .map_err(|e| ApiError::io(context(), e))?;
    let len = usize::try_from(plan.len())
        .map_err(|_| ApiError::new(ErrorKind::Internal, "chunk does not fit in memory"))?;
    let mut data = vec![0_u8; len];
    file.read_exact(&mut data)
        .await
        .map_err(|e| ApiError::io(context(), e))?;
    Ok(data)
}
