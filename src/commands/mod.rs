//! CLI command handlers.

mod auth;
mod sessions;
mod transfer;

pub(crate) use auth::{run_login, run_logout};
pub(crate) use sessions::run_sessions;
pub(crate) use transfer::{run_download, run_upload, run_upload_cancel, run_upload_status};
