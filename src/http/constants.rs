//! Constants for the Graph HTTP layer (endpoints, timeouts).

use std::time::Duration;

/// Microsoft Graph v1.0 root.
pub const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

/// Microsoft identity platform authority.
pub const DEFAULT_AUTH_BASE_URL: &str = "https://login.microsoftonline.com";

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default per-request timeout (5 minutes, long enough for one 60 MiB chunk).
pub const REQUEST_TIMEOUT_SECS: u64 = 300;

/// Maximum honoured Retry-After value (1 hour).
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// User-Agent sent on every request.
pub const USER_AGENT: &str = concat!("onedrive/", env!("CARGO_PKG_VERSION"));
