//! Ranged downloads against pre-authenticated URLs.
//!
//! The content endpoint answers with a `302` to a capability URL; every range
//! request goes to that URL without a bearer token. When the content endpoint
//! answers `401` or `404` instead, the item's `@microsoft.graph.downloadUrl`
//! is used.

use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use futures_util::StreamExt;
use reqwest::Method;
use reqwest::header::{CONTENT_RANGE, LOCATION, RANGE};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::chunk::{ChunkPlan, DEFAULT_DOWNLOAD_CHUNK_SIZE, parse_content_range};
use super::{ChunkOutcome, lock_key, store_op};
use crate::drive::{DriveItem, content_url, item_url};
use crate::error::{ApiError, ErrorKind};
use crate::http::{GraphClient, GraphRequest};
use crate::session::{
    LoadOutcome, SessionKey, SessionStore, TransferKind, TransferSession, normalize_remote_path,
};

/// How long a download record may be resumed. Capability URLs are short-lived.
pub const DEFAULT_DOWNLOAD_SESSION_TTL: Duration = Duration::from_secs(3600);

/// A download in progress.
#[derive(Debug)]
pub struct DownloadHandle {
    session: TransferSession,
    file: File,
    resumed: bool,
    url_refreshed: bool,
}

impl DownloadHandle {
    /// Persisted state of this download.
    #[must_use]
    pub fn session(&self) -> &TransferSession {
        &self.session
    }

    /// Bytes written so far.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.session.offset()
    }

    /// Remote file size.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.session.total_size
    }

    /// Whether this handle continues a session from an earlier run.
    #[must_use]
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }
}

/// Drives chunked downloads.
#[derive(Debug, Clone)]
pub struct DownloadEngine {
    client: GraphClient,
    store: SessionStore,
    chunk_size: u64,
    session_ttl: Duration,
}

impl DownloadEngine {
    /// Creates an engine with default chunk size and session lifetime.
    #[must_use]
    pub fn new(client: GraphClient, store: SessionStore) -> Self {
        Self {
            client,
            store,
            chunk_size: DEFAULT_DOWNLOAD_CHUNK_SIZE,
            session_ttl: DEFAULT_DOWNLOAD_SESSION_TTL,
        }
    }

    /// Overrides the range size (minimum 1 byte).
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Overrides how long a record stays resumable.
    #[must_use]
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Continues the persisted download for the pair, or starts a new one.
    ///
    /// On resume the destination is truncated to the persisted offset, so
    /// bytes written after the last saved offset are fetched again.
    ///
    /// # Errors
    ///
    /// Classified failure of the metadata or URL resolution calls;
    /// [`ErrorKind::InvalidRequest`] for folders; [`ErrorKind::Internal`] for
    /// local failures.
    #[instrument(level = "debug", skip(self), fields(local = %local_path.display()))]
    pub async fn resume_or_create(
        &self,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<DownloadHandle, ApiError> {
        let key = SessionKey::new(local_path, remote_path)
            .map_err(|e| ApiError::io("resolving local path", e))?;
        let guard = lock_key(&self.store, key).await?;

        match guard.load()? {
            LoadOutcome::Found(mut session) if session.kind == TransferKind::Download => {
                let on_disk = match tokio::fs::metadata(&session.local_path).await {
                    Ok(metadata) => metadata.len(),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
                    Err(e) => return Err(ApiError::io("inspecting destination", e)),
                };
                if on_disk < session.offset() {
                    warn!(
                        recorded = session.offset(),
                        on_disk, "destination shorter than recorded offset"
                    );
                    session.reconcile(on_disk)?;
                    guard.save(&session)?;
                }
                let file = open_destination(&session.local_path, Some(session.offset())).await?;
                info!(
                    remote = %session.remote_path,
                    offset = session.offset(),
                    total = session.total_size,
                    "resuming download"
                );
                return Ok(DownloadHandle {
                    session,
                    file,
                    resumed: true,
                    url_refreshed: false,
                });
            }
            LoadOutcome::Found(_) => guard.delete()?,
            LoadOutcome::Expired => debug!("download session expired, starting over"),
            LoadOutcome::NotFound => {}
        }

        let remote = normalize_remote_path(remote_path);
        let item = self.item_metadata(&remote).await?;
        if item.is_folder() {
            return Err(ApiError::new(
                ErrorKind::InvalidRequest,
                format!("{remote} is a folder"),
            ));
        }
        let url = self.resolve_with(&remote, None, Some(&item)).await?;
        let ttl = ChronoDuration::from_std(self.session_ttl)
            .unwrap_or_else(|_| ChronoDuration::hours(1));
        let session = TransferSession::new(
            TransferKind::Download,
            local_path,
            &remote,
            url,
            item.size,
            Utc::now() + ttl,
        )
        .map_err(|e| ApiError::io("resolving local path", e))?;
        let file = open_destination(&session.local_path, None).await?;
        guard.save(&session)?;
        info!(remote = %session.remote_path, total = session.total_size, "download started");

        Ok(DownloadHandle {
            session,
            file,
            resumed: false,
            url_refreshed: false,
        })
    }

    /// Fetches the range at the handle's offset, writes it durably, and
    /// persists the new offset. The record is deleted once the file is complete.
    ///
    /// An expired capability URL (`401`/`403`/`404`) is resolved again once per handle.
    ///
    /// # Errors
    ///
    /// Classified failure of the range request; [`ErrorKind::Internal`] for
    /// local write or session store failures.
    #[instrument(level = "debug", skip_all, fields(remote = %handle.session.remote_path, offset = handle.offset()))]
    pub async fn download_next_chunk(
        &self,
        handle: &mut DownloadHandle,
    ) -> Result<ChunkOutcome, ApiError> {
        let total = handle.total();
        let Some(plan) = ChunkPlan::next(handle.offset(), self.chunk_size, total) else {
            self.finish(handle).await?;
            return Ok(ChunkOutcome {
                more: false,
                offset: total,
                total,
            });
        };

        let first = self
            .download_chunk(&handle.session.transfer_url, plan.start, plan.end)
            .await;
        let data = match first {
            Err(error) if !handle.url_refreshed && is_stale_url(&error) => {
                debug!(%error, "download URL rejected, resolving a fresh one");
                handle.url_refreshed = true;
                handle.session.transfer_url =
                    self.resolve_download_url(&handle.session.remote_path, None).await?;
                self.download_chunk(&handle.session.transfer_url, plan.start, plan.end)
                    .await?
            }
            other => other?,
        };

        let path = handle.session.local_path.clone();
        let write_error = |e| ApiError::io(format!("writing {}", path.display()), e);
        handle
            .file
            .seek(SeekFrom::Start(plan.start))
            .await
            .map_err(write_error)?;
        handle.file.write_all(&data).await.map_err(write_error)?;
        handle.file.flush().await.map_err(write_error)?;
        handle.file.sync_data().await.map_err(write_error)?;

        handle.session.advance_to(plan.next_offset())?;
        let snapshot = handle.session.clone();
        store_op(&self.store, move |store| store.save(&snapshot)).await?;
        debug!(offset = plan.next_offset(), total, "range written");

        if handle.session.is_complete() {
            self.finish(handle).await?;
            return Ok(ChunkOutcome {
                more: false,
                offset: total,
                total,
            });
        }
        Ok(ChunkOutcome {
            more: true,
            offset: plan.next_offset(),
            total,
        })
    }

    /// Fetches `start..=end` from a capability URL.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::OperationFailed`] unless the answer is `206` with a
    /// matching `Content-Range` and exactly the requested number of bytes;
    /// classified failure for statuses >= 400.
    pub async fn download_chunk(
        &self,
        download_url: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>, ApiError> {
        let request = GraphRequest::new(Method::GET, download_url, "download range")
            .capability()
            .header(RANGE, format!("bytes={start}-{end}"));
        let response = self.client.send(request).await?;

        let status = response.status().as_u16();
        if status != 206 {
            let detail = if status == 200 {
                "download range: server ignored the Range header".to_string()
            } else {
                format!("download range: unexpected HTTP {status}")
            };
            return Err(ApiError::new(ErrorKind::OperationFailed, detail).with_status(status));
        }

        let window = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range);
        if !matches!(window, Some((s, e, _)) if s == start && e == end) {
            return Err(ApiError::new(
                ErrorKind::OperationFailed,
                format!("download range: Content-Range {window:?} does not match {start}-{end}"),
            )
            .with_status(status));
        }

        let body = response.bytes().await.map_err(|e| {
            ApiError::new(ErrorKind::NetworkFailed, "download range: reading body").with_source(e)
        })?;
        let expected = end - start + 1;
        if body.len() as u64 != expected {
            return Err(ApiError::new(
                ErrorKind::OperationFailed,
                format!("download range: got {} bytes, expected {expected}", body.len()),
            ));
        }
        Ok(body.to_vec())
    }

    /// Resolves the capability URL for an item's content.
    ///
    /// # Errors
    ///
    /// Classified failure of the content or metadata request;
    /// [`ErrorKind::OperationFailed`] if neither yields a URL.
    pub async fn resolve_download_url(
        &self,
        remote_path: &str,
        format: Option<&str>,
    ) -> Result<String, ApiError> {
        self.resolve_with(&normalize_remote_path(remote_path), format, None)
            .await
    }

    /// Downloads the whole item with one unranged request, streaming to disk.
    ///
    /// Used for format conversion, where ranges are not available. A partial
    /// destination is removed on failure. Returns the bytes written.
    ///
    /// # Errors
    ///
    /// Classified request failure; [`ErrorKind::NetworkFailed`] if the body
    /// stream breaks; [`ErrorKind::Internal`] for local write failures.
    #[instrument(level = "debug", skip(self), fields(local = %local_path.display()))]
    pub async fn download_whole(
        &self,
        remote_path: &str,
        local_path: &Path,
        format: Option<&str>,
    ) -> Result<u64, ApiError> {
        let url = self.resolve_download_url(remote_path, format).await?;
        let response = self
            .client
            .send(GraphRequest::new(Method::GET, url, "download").capability())
            .await?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(ApiError::unexpected_status("download", status));
        }

        let mut file = open_destination(local_path, None).await?;
        let result = stream_to_file(&mut file, response, local_path).await;
        drop(file);
        match result {
            Ok(written) => {
                info!(remote = remote_path, written, "download complete");
                Ok(written)
            }
            Err(error) => {
                let _ = tokio::fs::remove_file(local_path).await;
                Err(error)
            }
        }
    }

    async fn item_metadata(&self, remote: &str) -> Result<DriveItem, ApiError> {
        let url = item_url(self.client.base_url(), remote);
        self.client
            .send_json(GraphRequest::new(Method::GET, url, "get item"))
            .await
    }

    async fn resolve_with(
        &self,
        remote: &str,
        format: Option<&str>,
        metadata: Option<&DriveItem>,
    ) -> Result<String, ApiError> {
        let url = content_url(self.client.base_url(), remote, format);
        let request = GraphRequest::new(Method::GET, url.clone(), "download content");
        match self.client.send(request).await {
            Ok(response) if response.status().is_redirection() => {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        ApiError::new(
                            ErrorKind::OperationFailed,
                            "download content: redirect without Location",
                        )
                    })?;
                return absolute_location(&url, location);
            }
            Ok(response) => {
                debug!(
                    status = response.status().as_u16(),
                    "content endpoint did not redirect, using item metadata"
                );
            }
            Err(error) if matches!(error.status(), Some(401 | 404)) => {
                debug!(%error, "content endpoint refused, using item metadata");
            }
            Err(error) => return Err(error),
        }

        if format.is_some() {
            return Err(ApiError::new(
                ErrorKind::OperationFailed,
                "download content: no converted download URL available",
            ));
        }
        let fetched;
        let item = match metadata {
            Some(item) => item,
            None => {
                fetched = self.item_metadata(remote).await?;
                &fetched
            }
        };
        item.download_url.clone().ok_or_else(|| {
            ApiError::new(
                ErrorKind::OperationFailed,
                format!("{remote} has no download URL"),
            )
        })
    }

    async fn finish(&self, handle: &DownloadHandle) -> Result<(), ApiError> {
        let local = handle.session.local_path.clone();
        let remote = handle.session.remote_path.clone();
        store_op(&self.store, move |store| store.delete(&local, &remote)).await?;
        info!(remote = %handle.session.remote_path, total = handle.total(), "download complete");
        Ok(())
    }
}

fn is_stale_url(error: &ApiError) -> bool {
    matches!(error.status(), Some(401 | 403 | 404 | 410))
}

fn absolute_location(request_url: &str, location: &str) -> Result<String, ApiError> {
    let base = Url::parse(request_url).map_err(|e| {
        ApiError::new(ErrorKind::Internal, "download content: invalid request URL").with_source(e)
    })?;
    base.join(location).map(String::from).map_err(|e| {
        ApiError::new(ErrorKind::OperationFailed, "download content: invalid Location")
            .with_source(e)
    })
}

/// Opens the destination for writing. `Some(len)` keeps the first `len`
/// bytes and positions the cursor there; `None` truncates.
async fn open_destination(path: &Path, keep: Option<u64>) -> Result<File, ApiError> {
    let context = || format!("opening {}", path.display());
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ApiError::io(context(), e))?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(keep.is_none())
        .open(path)
        .await
        .map_err(|e| ApiError::io(context(), e))?;
    if let Some(len) = keep {
        file.set_len(len).await.map_err(|e| ApiError::io(context(), e))?;
        file.seek(SeekFrom::Start(len))
            .await
            .map_err(|e| ApiError::io(context(), e))?;
    }
    Ok(file)
}

async fn stream_to_file(
    file: &mut File,
    response: reqwest::Response,
    path: &Path,
) -> Result<u64, ApiError> {
    let write_error = |e| ApiError::io(format!("writing {}", path.display()), e);
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            ApiError::new(ErrorKind::NetworkFailed, "download: body interrupted").with_source(e)
        })?;
        writer.write_all(&chunk).await.map_err(write_error)?;
        written += chunk.len() as u64;
    }
    writer.flush().await.map_err(write_error)?;
    writer.get_mut().sync_data().await.map_err(write_error)?;
    Ok(written)
}
