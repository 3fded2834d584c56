//! Helpers shared by integration tests.

#![allow(dead_code)]

use std::net::TcpListener;
use std::panic::Location;
use std::path::Path;
use std::sync::Arc;

use onedrive_core::auth::StaticToken;
use onedrive_core::http::{GraphClient, HttpSettings};
use wiremock::MockServer;

const REQUIRE_ENV: &str = "ONEDRIVE_REQUIRE_SOCKET_TESTS";

fn socket_tests_required() -> bool {
    std::env::var(REQUIRE_ENV)
        .ok()
        .is_some_and(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

#[track_caller]
fn should_skip_socket_bound_test() -> bool {
    if TcpListener::bind("127.0.0.1:0").is_ok() {
        return false;
    }
    let location = Location::caller();
    let message = format!(
        "[socket-bound-test] cannot bind localhost socket at {}:{}",
        location.file(),
        location.line()
    );
    assert!(
        !socket_tests_required(),
        "{message}. Unset {REQUIRE_ENV} to allow skipping."
    );
    eprintln!("{message}. Skipping test. Set {REQUIRE_ENV}=1 to fail instead.");
    true
}

pub async fn start_mock_server_or_skip() -> Option<MockServer> {
    if should_skip_socket_bound_test() {
        None
    } else {
        Some(MockServer::start().await)
    }
}

/// Graph client rooted at the mock server with a fixed bearer token.
pub fn graph_client(server: &MockServer) -> GraphClient {
    GraphClient::new(
        server.uri(),
        HttpSettings::default(),
        Arc::new(StaticToken::new("test-token")),
    )
    .unwrap()
}

/// Deterministic, non-repeating-looking file content.
pub fn patterned_bytes(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| u8::try_from((i * 31 + i / 251) % 256).unwrap())
        .collect()
}

pub fn write_file(path: &Path, bytes: &[u8]) {
    std::fs::write(path, bytes).unwrap();
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(bytes))
}
