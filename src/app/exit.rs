//! Exit code logic for the onedrive process.
//!
//! Single responsibility: map a command result to the process exit outcome.

use onedrive_core::{ApiError, ErrorKind, TransferOutcome};

/// Process exit outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessExit {
    /// Command finished.
    Success,
    /// Command failed.
    Failure,
    /// Transfer stopped by the user; re-run the command to resume.
    Interrupted,
    /// Stored credentials are unusable; run `onedrive login`.
    ReauthRequired,
}

impl ProcessExit {
    /// Numeric process exit code.
    pub(crate) fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::Interrupted => 2,
            Self::ReauthRequired => 3,
        }
    }
}

/// Exit outcome for a finished transfer run.
pub(crate) fn exit_for_outcome(outcome: &TransferOutcome) -> ProcessExit {
    match outcome {
        TransferOutcome::Completed { .. } => ProcessExit::Success,
        TransferOutcome::Interrupted { .. } => ProcessExit::Interrupted,
    }
}

/// Exit outcome for a failed command, looking through `anyhow` context for an [`ApiError`].
pub(crate) fn exit_for_error(error: &anyhow::Error) -> ProcessExit {
    let reauth = error
        .chain()
        .filter_map(|cause| cause.downcast_ref::<ApiError>())
        .any(|api| api.matches(ErrorKind::ReauthRequired));
    if reauth {
        ProcessExit::ReauthRequired
    } else {
        ProcessExit::Failure
    }
}
