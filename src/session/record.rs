//! Persisted state of one resumable transfer.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::SessionError;

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    /// Local file to drive.
    Upload,
    /// Drive item to local file.
    Download,
}

impl TransferKind {
    /// Stable lowercase label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }
}

/// Deterministic identity of a transfer: SHA-256 over the absolute local path
/// and the normalized remote path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey(String);

impl SessionKey {
    /// Derives the key for a (local, remote) pair.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the current directory is needed and unavailable.
    pub fn new(local_path: &Path, remote_path: &str) -> io::Result<Self> {
        let local = absolute_local_path(local_path)?;
        Ok(Self::from_normalized(&local, &normalize_remote_path(remote_path)))
    }

    pub(crate) fn from_normalized(local: &Path, remote: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(local.to_string_lossy().as_bytes());
        // NUL cannot appear in either path, so the pair encoding is unambiguous.
        hasher.update([0_u8]);
        hasher.update(remote.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Lowercase hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn record_file_name(&self) -> String {
        format!("{}.json", self.0)
    }

    pub(crate) fn lock_file_name(&self) -> String {
        format!("{}.lock", self.0)
    }
}

/// One in-flight resumable transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSession {
    /// Upload or download.
    pub kind: TransferKind,
    /// Absolute local path.
    pub local_path: PathBuf,
    /// Normalized drive path (leading `/`, no trailing `/`).
    pub remote_path: String,
    /// Upload session URL or pre-authenticated download URL.
    pub transfer_url: String,
    /// Total bytes of the file.
    pub total_size: u64,
    /// Exclusive upper bound of bytes durably transferred.
    offset: u64,
    /// When the record was first created.
    pub created_at: DateTime<Utc>,
    /// After this instant the record must not be resumed.
    pub expires_at: DateTime<Utc>,
}

impl TransferSession {
    /// Creates a record at offset 0.
    ///
    /// `local_path` is made absolute and `remote_path` normalized so the
    /// record's key matches [`SessionKey::new`] for the same pair.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if `local_path` cannot be made absolute.
    pub fn new(
        kind: TransferKind,
        local_path: &Path,
        remote_path: &str,
        transfer_url: impl Into<String>,
        total_size: u64,
        expires_at: DateTime<Utc>,
    ) -> io::Result<Self> {
        Ok(Self {
            kind,
            local_path: absolute_local_path(local_path)?,
            remote_path: normalize_remote_path(remote_path),
            transfer_url: transfer_url.into(),
            total_size,
            offset: 0,
            created_at: Utc::now(),
            expires_at,
        })
    }

    /// The key this record is stored under.
    #[must_use]
    pub fn key(&self) -> SessionKey {
        SessionKey::from_normalized(&self.local_path, &self.remote_path)
    }

    /// Bytes confirmed so far.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes still to transfer.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.total_size - self.offset
    }

    /// Whether every byte has been confirmed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.offset == self.total_size
    }

    /// Whether the record has expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Records a confirmed chunk. The offset never moves backwards.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidOffset`] if `offset` is behind the current
    /// offset or beyond the total size.
    pub fn advance_to(&mut self, offset: u64) -> Result<(), SessionError> {
        if offset < self.offset || offset > self.total_size {
            return Err(SessionError::InvalidOffset {
                current: self.offset,
                requested: offset,
                total: self.total_size,
            });
        }
        self.offset = offset;
        Ok(())
    }

    /// Replaces the cached offset with the server's authoritative one.
    ///
    /// Unlike [`advance_to`](Self::advance_to) this may move backwards: the
    /// server is the source of truth when resuming.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidOffset`] if `offset` is beyond the total size.
    pub fn reconcile(&mut self, offset: u64) -> Result<(), SessionError> {
        if offset > self.total_size {
            return Err(SessionError::InvalidOffset {
                current: self.offset,
                requested: offset,
                total: self.total_size,
            });
        }
        self.offset = offset;
        Ok(())
    }

    pub(crate) fn is_consistent(&self) -> bool {
        self.offset <= self.total_size
    }
}

/// Makes `path` absolute without resolving symlinks, so the same argument
/// maps to the same key whether or not the file exists yet.
///
/// # Errors
///
/// Returns an I/O error if the current directory is unavailable.
pub fn absolute_local_path(path: &Path) -> io::Result<PathBuf> {
    std::path::absolute(path)
}

/// Normalizes a drive path: leading `/`, single separators, no `.` segments,
/// no trailing `/`. The drive root is `/`.
#[must_use]
pub fn normalize_remote_path(remote: &str) -> String {
    let segments: Vec<&str> = remote
        .trim()
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect();
    format!("/{}", segments.join("/"))
}
