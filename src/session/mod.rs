//! Durable, crash-safe, process-safe storage of transfer sessions.
//!
//! Each session lives in its own file `<key>.json` inside the sessions
//! directory. Writes go to a temporary file in the same directory and are
//! renamed over the target, so a crash never leaves a half-written record.
//!
//! Concurrency between processes is guarded by an advisory lock on a sidecar
//! file `<key>.lock`. The lock is scoped per key, so unrelated transfers never
//! contend. Lock files are never removed: deleting one while another process
//! waits on it would let a third process lock a fresh inode concurrently.
//!
//! # Example
//!
//! ```no_run
//! use onedrive_core::session::{LoadOutcome, SessionStore};
//! use std::path::Path;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SessionStore::open("/tmp/onedrive-sessions")?;
//! match store.load(Path::new("video.mp4"), "/Videos/video.mp4")? {
//!     LoadOutcome::Found(session) => println!("resume at {}", session.offset()),
//!     LoadOutcome::NotFound | LoadOutcome::Expired => println!("start fresh"),
//! }
//! # Ok(())
//! # }
//! ```

mod record;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{ApiError, ErrorKind};

pub use record::{
    SessionKey, TransferKind, TransferSession, absolute_local_path, normalize_remote_path,
};

/// Errors from the session store.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Filesystem failure on a session, lock, or temporary file.
    #[error("session store I/O error at {path}: {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The record could not be serialized.
    #[error("failed to encode session record {path}: {source}")]
    Encode {
        /// Target record path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// A requested offset would break the offset invariants.
    #[error("invalid session offset {requested} (current {current}, total {total})")]
    InvalidOffset {
        /// Offset before the update.
        current: u64,
        /// Offset that was rejected.
        requested: u64,
        /// Total transfer size.
        total: u64,
    },
}

impl SessionError {
    fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(error: SessionError) -> Self {
        ApiError::new(ErrorKind::Internal, error.to_string()).with_source(error)
    }
}

/// Result of looking up a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A live record exists.
    Found(TransferSession),
    /// No record exists.
    NotFound,
    /// A record existed but had expired; it has been deleted.
    Expired,
}

/// Directory of session records.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// Opens (creating if needed) a session directory.
    ///
    /// A directory created here is owner-only. An existing directory keeps
    /// its permissions.
    ///
    /// # Errors
    ///
    /// [`SessionError::Io`] if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, SessionError> {
        let dir = dir.into();
        if dir.is_dir() {
            warn_if_shared_dir(&dir);
        } else {
            create_owner_only_dir(&dir)?;
        }
        Ok(Self { dir })
    }

    /// The session directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record file for `key`.
    #[must_use]
    pub fn record_path(&self, key: &SessionKey) -> PathBuf {
        self.dir.join(key.record_file_name())
    }

    /// Takes the exclusive per-key lock, blocking until it is available.
    ///
    /// Hold the returned guard across a read-decide-write sequence (such as
    /// "load, else create a server session and save") so that concurrent
    /// processes serialize on the same pair.
    ///
    /// # Errors
    ///
    /// [`SessionError::Io`] if the lock file cannot be opened or locked.
    pub fn lock(&self, key: &SessionKey) -> Result<SessionLock, SessionError> {
        let file = self.open_lock_file(key)?;
        FileExt::lock_exclusive(&file)
            .map_err(|e| SessionError::io(self.lock_path(key), e))?;
        debug!(key = key.as_str(), "session lock acquired");
        Ok(SessionLock {
            store: self.clone(),
            key: key.clone(),
            file,
        })
    }

    /// Atomically writes `session` under its key.
    ///
    /// # Errors
    ///
    /// [`SessionError`] on lock, encode, or write failure.
    pub fn save(&self, session: &TransferSession) -> Result<(), SessionError> {
        self.lock(&session.key())?.save(session)
    }

    /// Loads the session for a (local, remote) pair.
    ///
    /// Expired records are deleted and reported as [`LoadOutcome::Expired`].
    /// Unreadable records are deleted and reported as [`LoadOutcome::NotFound`].
    ///
    /// # Errors
    ///
    /// [`SessionError::Io`] on lock or read failure.
    pub fn load(&self, local_path: &Path, remote_path: &str) -> Result<LoadOutcome, SessionError> {
        let key = self.key_for(local_path, remote_path)?;

        {
            let file = self.open_lock_file(&key)?;
            FileExt::lock_shared(&file)
                .map_err(|e| SessionError::io(self.lock_path(&key), e))?;
            let path = self.record_path(&key);
            match read_record_file(&path) {
                Ok(Some(session)) if !session.is_expired_at(Utc::now()) => {
                    return Ok(LoadOutcome::Found(session));
                }
                Ok(None) => return Ok(LoadOutcome::NotFound),
                Err(RecordReadError::Io(source)) => return Err(SessionError::io(path, source)),
                Ok(Some(_)) | Err(RecordReadError::Corrupt(_)) => {}
            }
            // Shared lock is released when `file` drops; deleting needs the exclusive one.
        }

        self.lock(&key)?.load()
    }

    /// Removes the session for a (local, remote) pair. Absent records are fine.
    ///
    /// # Errors
    ///
    /// [`SessionError::Io`] on lock or remove failure.
    pub fn delete(&self, local_path: &Path, remote_path: &str) -> Result<(), SessionError> {
        let key = self.key_for(local_path, remote_path)?;
        self.lock(&key)?.delete()
    }

    /// Lists every readable record, live or expired.
    ///
    /// # Errors
    ///
    /// [`SessionError::Io`] if the directory cannot be read.
    pub fn list(&self) -> Result<Vec<TransferSession>, SessionError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| SessionError::io(&self.dir, e))?;
        let mut sessions = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| SessionError::io(&self.dir, e))?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match read_record_file(&path) {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {}
                Err(error) => warn!(path = %path.display(), %error, "skipping unreadable session"),
            }
        }
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    /// Deletes every expired record and returns how many were removed.
    ///
    /// # Errors
    ///
    /// [`SessionError`] on directory, lock, or remove failure.
    pub fn purge_expired(&self) -> Result<usize, SessionError> {
        let now = Utc::now();
        let mut removed = 0;
        for session in self.list()? {
            if !session.is_expired_at(now) {
                continue;
            }
            if matches!(self.lock(&session.key())?.load()?, LoadOutcome::Expired) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn key_for(&self, local_path: &Path, remote_path: &str) -> Result<SessionKey, SessionError> {
        SessionKey::new(local_path, remote_path).map_err(|e| SessionError::io(local_path, e))
    }

    fn lock_path(&self, key: &SessionKey) -> PathBuf {
        self.dir.join(key.lock_file_name())
    }

    fn open_lock_file(&self, key: &SessionKey) -> Result<File, SessionError> {
        let path = self.lock_path(key);
        owner_only_options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| SessionError::io(path, e))
    }

    fn read_record(&self, key: &SessionKey) -> Result<Option<TransferSession>, SessionError> {
        let path = self.record_path(key);
        match read_record_file(&path) {
            Ok(record) => Ok(record),
            Err(RecordReadError::Io(source)) => Err(SessionError::io(path, source)),
            Err(RecordReadError::Corrupt(reason)) => {
                warn!(path = %path.display(), %reason, "discarding unreadable session record");
                remove_if_present(&path)?;
                Ok(None)
            }
        }
    }
}

/// Exclusive lock on one session key.
///
/// The guard owns a handle to its store so it can be held across `.await`
/// points. The lock is released when the guard is dropped.
#[derive(Debug)]
pub struct SessionLock {
    store: SessionStore,
    key: SessionKey,
    file: File,
}

impl SessionLock {
    /// The locked key.
    #[must_use]
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Loads the record while holding the lock, deleting it if expired or
    /// unreadable.
    ///
    /// # Errors
    ///
    /// [`SessionError::Io`] on read or remove failure.
    pub fn load(&self) -> Result<LoadOutcome, SessionError> {
        match self.store.read_record(&self.key)? {
            None => Ok(LoadOutcome::NotFound),
            Some(session) if session.is_expired_at(Utc::now()) => {
                debug!(key = self.key.as_str(), expires_at = %session.expires_at, "session expired");
                remove_if_present(&self.store.record_path(&self.key))?;
                Ok(LoadOutcome::Expired)
            }
            Some(session) => Ok(LoadOutcome::Found(session)),
        }
    }

    /// Writes the record atomically with owner-only permissions.
    ///
    /// # Errors
    ///
    /// [`SessionError`] if `session` belongs to a different key, or on
    /// encode/write/rename failure.
    pub fn save(&self, session: &TransferSession) -> Result<(), SessionError> {
        let target = self.store.record_path(&self.key);
        if session.key() != self.key {
            return Err(SessionError::io(
                &target,
                io::Error::new(io::ErrorKind::InvalidInput, "session does not belong to this lock"),
            ));
        }

        let bytes = serde_json::to_vec_pretty(session).map_err(|e| SessionError::Encode {
            path: target.clone(),
            source: e,
        })?;
        let temp = self.store.dir.join(format!(
            ".{}.tmp-{}-{:08x}",
            self.key.record_file_name(),
            std::process::id(),
            rand::thread_rng().r#gen::<u32>()
        ));

        let write_result = write_synced(&temp, &bytes).and_then(|()| {
            fs::rename(&temp, &target).map_err(|e| SessionError::io(&target, e))
        });
        if write_result.is_err() {
            let _ = fs::remove_file(&temp);
        }
        write_result?;
        sync_dir(&self.store.dir);

        debug!(
            key = self.key.as_str(),
            offset = session.offset(),
            total = session.total_size,
            "session saved"
        );
        Ok(())
    }

    /// Removes the record; an absent record is not an error.
    ///
    /// # Errors
    ///
    /// [`SessionError::Io`] if removal fails for another reason.
    pub fn delete(&self) -> Result<(), SessionError> {
        remove_if_present(&self.store.record_path(&self.key))?;
        debug!(key = self.key.as_str(), "session deleted");
        Ok(())
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

enum RecordReadError {
    Io(io::Error),
    Corrupt(String),
}

fn read_record_file(path: &Path) -> Result<Option<TransferSession>, RecordReadError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(RecordReadError::Io(e)),
    };
    let session: TransferSession =
        serde_json::from_slice(&bytes).map_err(|e| RecordReadError::Corrupt(e.to_string()))?;
    if !session.is_consistent() {
        return Err(RecordReadError::Corrupt(format!(
            "offset {} exceeds total {}",
            session.offset(),
            session.total_size
        )));
    }
    Ok(Some(session))
}

impl std::fmt::Display for RecordReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(error) => write!(f, "{error}"),
            Self::Corrupt(reason) => f.write_str(reason),
        }
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), SessionError> {
    let mut file = owner_only_options()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| SessionError::io(path, e))?;
    file.write_all(bytes).map_err(|e| SessionError::io(path, e))?;
    file.sync_all().map_err(|e| SessionError::io(path, e))
}

fn remove_if_present(path: &Path) -> Result<(), SessionError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SessionError::io(path, e)),
    }
}

#[cfg(unix)]
fn owner_only_options() -> OpenOptions {
    use std::os::unix::fs::OpenOptionsExt;

    let mut options = OpenOptions::new();
    options.mode(0o600);
    options
}

#[cfg(not(unix))]
fn owner_only_options() -> OpenOptions {
    OpenOptions::new()
}

#[cfg(unix)]
fn create_owner_only_dir(dir: &Path) -> Result<(), SessionError> {
    use std::os::unix::fs::DirBuilderExt;

    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .map_err(|e| SessionError::io(dir, e))
}

#[cfg(not(unix))]
fn create_owner_only_dir(dir: &Path) -> Result<(), SessionError> {
    fs::create_dir_all(dir).map_err(|e| SessionError::io(dir, e))
}

#[cfg(unix)]
fn warn_if_shared_dir(dir: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(metadata) = fs::metadata(dir) {
        let mode = metadata.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            warn!(
                dir = %dir.display(),
                mode = %format!("{mode:o}"),
                "session directory is accessible to other users"
            );
        }
    }
}

#[cfg(not(unix))]
fn warn_if_shared_dir(_dir: &Path) {}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
