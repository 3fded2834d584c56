//! OneDrive Core Library
//!
//! Resumable transfers against the Microsoft Graph API, for the `onedrive`
//! command-line client.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`error`] - the closed [`ErrorKind`] taxonomy and [`ApiError`]
//! - [`http`] - the single request chokepoint and response classification
//! - [`auth`] - bearer-token providers, token refresh, device-code login
//! - [`session`] - locked, atomic on-disk records of in-flight transfers
//! - [`transfer`] - upload and download engines and the chunk loop
//! - [`drive`] - drive item model and path-addressed URLs
//!
//! Logging goes through `tracing`; nothing is emitted unless the embedding
//! program installs a subscriber.

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod drive;
pub mod error;
pub mod http;
pub mod session;
pub mod transfer;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use auth::{AccessTokenProvider, RefreshingTokenProvider, StaticToken, Token};
pub use drive::DriveItem;
pub use error::{ApiError, ErrorKind};
pub use http::{GraphClient, GraphRequest, HttpSettings};
pub use session::{LoadOutcome, SessionStore, TransferKind, TransferSession};
pub use transfer::{
    CancelFlag, ChunkOutcome, DownloadEngine, RetryPolicy, TransferOutcome, TransferRunner,
    UploadEngine,
};
