//! `sessions`: list or purge persisted transfer sessions.

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

use crate::app::context::AppContext;
use crate::app::exit::ProcessExit;
use crate::cli::SessionsArgs;

pub(crate) fn run_sessions(ctx: &AppContext, args: &SessionsArgs) -> Result<ProcessExit> {
    let store = ctx.session_store()?;

    if args.purge_expired {
        let removed = store
            .purge_expired()
            .context("Failed to purge expired sessions")?;
        info!(removed, dir = %store.dir().display(), "Purged expired sessions");
        println!("Removed {removed} expired session(s)");
        return Ok(ProcessExit::Success);
    }

    let sessions = store.list().context("Failed to list sessions")?;
    if sessions.is_empty() {
        println!("No transfer sessions");
        return Ok(ProcessExit::Success);
    }

    let now = Utc::now();
    for session in sessions {
        let state = if session.is_expired_at(now) {
            "expired"
        } else {
            "resumable"
        };
        println!(
            "{:<8} {:>5.1}%  {}  {} <-> {}  ({state}, expires {})",
            session.kind.as_str(),
            percent(session.offset(), session.total_size),
            session.key().as_str().get(..12).unwrap_or_default(),
            session.local_path.display(),
            session.remote_path,
            session.expires_at.format("%Y-%m-%d %H:%M UTC"),
        );
    }
    Ok(ProcessExit::Success)
}

fn percent(offset: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        offset as f64 * 100.0 / total as f64
    }
}
