//! Integration tests for chunked uploads against a mock Graph server.

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use onedrive_core::transfer::{
    CancelFlag, RetryPolicy, TransferOutcome, TransferRunner, UploadChunkSize, UploadEngine,
};
use onedrive_core::{ErrorKind, LoadOutcome, SessionStore};
use serde_json::json;
use support::{graph_client, patterned_bytes, sha256_hex, start_mock_server_or_skip, write_file};
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const TOTAL: usize = 10_000_000;
const CHUNK: u64 = 4 * 327_680;
const REMOTE: &str = "/Docs/big.bin";
const CREATE_PATH: &str = "/me/drive/root:/Docs/big.bin:/createUploadSession";
const SESSION_PATH: &str = "/upload/session-1";

/// Stateful upload URL: assembles chunk bodies and reports the next expected byte.
#[derive(Clone)]
struct UploadTarget {
    received: Arc<Mutex<Vec<u8>>>,
    next: Arc<Mutex<u64>>,
    ranges: Arc<Mutex<Vec<String>>>,
}

impl UploadTarget {
    fn new(total: usize) -> Self {
        Self {
            received: Arc::new(Mutex::new(vec![0; total])),
            next: Arc::new(Mutex::new(0)),
            ranges: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn bytes(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }

    fn ranges(&self) -> Vec<String> {
        self.ranges.lock().unwrap().clone()
    }
}

impl Respond for UploadTarget {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        if request.headers.get("authorization").is_some() {
            return ResponseTemplate::new(400);
        }
        let mut next = self.next.lock().unwrap();
        if request.method.as_str() == "GET" {
            return ResponseTemplate::new(200).set_body_json(json!({
                "expirationDateTime": "2099-01-01T00:00:00Z",
                "nextExpectedRanges": [format!("{}-", *next)],
            }));
        }

        let range = request
            .headers
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .unwrap()
            .to_string();
        let (start, end, total) = onedrive_core::transfer::parse_content_range(&range).unwrap();
        let total = total.unwrap();
        assert_eq!(request.body.len() as u64, end - start + 1, "{range}");
        let start_idx = usize::try_from(start).unwrap();
        self.received.lock().unwrap()[start_idx..start_idx + request.body.len()]
            .copy_from_slice(&request.body);
        self.ranges.lock().unwrap().push(range);
        *next = end + 1;

        if end + 1 == total {
            ResponseTemplate::new(201).set_body_json(json!({
                "id": "ITEM1",
                "name": "big.bin",
                "size": total,
                "file": {}
            }))
        } else {
            ResponseTemplate::new(202).set_body_json(json!({
                "expirationDateTime": "2099-01-01T00:00:00Z",
                "nextExpectedRanges": [format!("{}-", end + 1)],
            }))
        }
    }
}

async fn mount_create(server: &MockServer, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path(CREATE_PATH))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "uploadUrl": format!("{}{SESSION_PATH}", server.uri()),
            "expirationDateTime": "2099-01-01T00:00:00Z",
            "nextExpectedRanges": ["0-"],
        })))
        .expect(expected_calls)
        .mount(server)
        .await;
}

async fn mount_target(server: &MockServer, target: &UploadTarget) {
    Mock::given(path(SESSION_PATH))
        .respond_with(target.clone())
        .mount(server)
        .await;
}

fn engine(server: &MockServer, sessions: &TempDir) -> UploadEngine {
    UploadEngine::new(graph_client(server), SessionStore::open(sessions.path()).unwrap())
        .with_chunk_size(UploadChunkSize::new(CHUNK).unwrap())
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5), 2.0)
        .with_max_jitter(Duration::ZERO)
}

#[tokio::test]
async fn test_fresh_upload_sends_aligned_chunks_in_order() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let target = UploadTarget::new(TOTAL);
    mount_create(&server, 1).await;
    mount_target(&server, &target).await;

    let dir = TempDir::new().unwrap();
    let sessions = TempDir::new().unwrap();
    let local = dir.path().join("big.bin");
    let content = patterned_bytes(TOTAL);
    write_file(&local, &content);

    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reported);
    let runner = TransferRunner::new(fast_retry(), CancelFlag::new())
        .with_progress(Arc::new(move |offset, total| sink.lock().unwrap().push((offset, total))));
    let outcome = runner
        .upload(&engine(&server, &sessions), &local, REMOTE)
        .await
        .unwrap();

    let TransferOutcome::Completed { bytes, item } = outcome else {
        panic!("expected completion");
    };
    assert_eq!(bytes, TOTAL as u64);
    assert_eq!(item.unwrap().id, "ITEM1");

    let ranges = target.ranges();
    assert_eq!(ranges.len(), 8);
    assert_eq!(ranges[0], "bytes 0-1310719/10000000");
    assert_eq!(ranges[7], "bytes 9175040-9999999/10000000");
    assert_eq!(sha256_hex(&target.bytes()), sha256_hex(&content));

    let reported = reported.lock().unwrap();
    assert_eq!(reported.first(), Some(&(0, TOTAL as u64)));
    assert_eq!(reported.last(), Some(&(TOTAL as u64, TOTAL as u64)));
    assert!(reported.windows(2).all(|w| w[0].0 <= w[1].0));

    let store = SessionStore::open(sessions.path()).unwrap();
    assert!(matches!(store.load(&local, REMOTE).unwrap(), LoadOutcome::NotFound));
}

#[tokio::test]
async fn test_interrupted_upload_resumes_from_server_offset() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let target = UploadTarget::new(TOTAL);
    mount_create(&server, 1).await;
    mount_target(&server, &target).await;

    let dir = TempDir::new().unwrap();
    let sessions = TempDir::new().unwrap();
    let local = dir.path().join("big.bin");
    let content = patterned_bytes(TOTAL);
    write_file(&local, &content);

    // Stop after three confirmed chunks.
    let cancel = CancelFlag::new();
    let trigger = cancel.clone();
    let runner = TransferRunner::new(fast_retry(), cancel).with_progress(Arc::new(
        move |offset, _| {
            if offset >= 3 * CHUNK {
                trigger.cancel();
            }
        },
    ));
    let outcome = runner
        .upload(&engine(&server, &sessions), &local, REMOTE)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        TransferOutcome::Interrupted {
            offset: 3 * CHUNK,
            total: TOTAL as u64
        }
    );

    let store = SessionStore::open(sessions.path()).unwrap();
    let LoadOutcome::Found(record) = store.load(&local, REMOTE).unwrap() else {
        panic!("session record should survive an interruption");
    };
    assert_eq!(record.offset(), 3 * CHUNK);

    // A new process resumes at 3 * CHUNK without creating another session.
    let runner = TransferRunner::new(fast_retry(), CancelFlag::new());
    let outcome = runner
        .upload(&engine(&server, &sessions), &local, REMOTE)
        .await
        .unwrap();
    assert!(matches!(outcome, TransferOutcome::Completed { .. }));

    let ranges = target.ranges();
    assert_eq!(ranges.len(), 8);
    assert_eq!(ranges[3], "bytes 3932160-5242879/10000000");
    assert_eq!(sha256_hex(&target.bytes()), sha256_hex(&content));
}

#[tokio::test]
async fn test_resume_uses_server_offset_when_local_record_lags() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let target = UploadTarget::new(TOTAL);
    mount_create(&server, 1).await;
    mount_target(&server, &target).await;

    let dir = TempDir::new().unwrap();
    let sessions = TempDir::new().unwrap();
    let local = dir.path().join("big.bin");
    write_file(&local, &patterned_bytes(TOTAL));

    let engine = engine(&server, &sessions);
    let mut handle = engine.resume_or_create(&local, REMOTE).await.unwrap();
    let stale = handle.clone();
    engine.upload_next_chunk(&mut handle).await.unwrap();
    engine.upload_next_chunk(&mut handle).await.unwrap();

    // Roll the record back as if the process died before saving.
    SessionStore::open(sessions.path())
        .unwrap()
        .save(stale.session())
        .unwrap();

    let resumed = engine.resume_or_create(&local, REMOTE).await.unwrap();
    assert!(resumed.is_resumed());
    assert_eq!(resumed.offset(), 2 * CHUNK);
}

#[tokio::test]
async fn test_transient_chunk_failure_is_retried() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let target = UploadTarget::new(TOTAL);
    mount_create(&server, 1).await;
    Mock::given(method("PUT"))
        .and(path(SESSION_PATH))
        .respond_with(ResponseTemplate::new(503).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_target(&server, &target).await;

    let dir = TempDir::new().unwrap();
    let sessions = TempDir::new().unwrap();
    let local = dir.path().join("big.bin");
    let content = patterned_bytes(TOTAL);
    write_file(&local, &content);

    let runner = TransferRunner::new(fast_retry(), CancelFlag::new());
    let outcome = runner
        .upload(&engine(&server, &sessions), &local, REMOTE)
        .await
        .unwrap();
    assert!(matches!(outcome, TransferOutcome::Completed { .. }));
    assert_eq!(sha256_hex(&target.bytes()), sha256_hex(&content));
}

#[tokio::test]
async fn test_fatal_chunk_failure_keeps_session_record() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_create(&server, 1).await;
    Mock::given(method("PUT"))
        .and(path(SESSION_PATH))
        .respond_with(ResponseTemplate::new(507).set_body_json(json!({
            "error": { "code": "quotaLimitReached", "message": "drive is full" }
        })))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let sessions = TempDir::new().unwrap();
    let local = dir.path().join("big.bin");
    write_file(&local, &patterned_bytes(TOTAL));

    let runner = TransferRunner::new(fast_retry(), CancelFlag::new());
    let error = runner
        .upload(&engine(&server, &sessions), &local, REMOTE)
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::QuotaExceeded);

    let store = SessionStore::open(sessions.path()).unwrap();
    assert!(matches!(store.load(&local, REMOTE).unwrap(), LoadOutcome::Found(_)));
}

#[tokio::test]
async fn test_cancel_then_status_is_not_found() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_create(&server, 1).await;
    Mock::given(method("DELETE"))
        .and(path(SESSION_PATH))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(SESSION_PATH))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": { "code": "itemNotFound", "message": "session gone" }
        })))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let sessions = TempDir::new().unwrap();
    let local = dir.path().join("big.bin");
    write_file(&local, &patterned_bytes(TOTAL));

    let engine = engine(&server, &sessions);
    let handle = engine.create_session(&local, REMOTE).await.unwrap();
    let copy = handle.clone();
    engine.cancel(handle).await.unwrap();

    let error = engine.status(&copy).await.unwrap_err();
    assert!(error.matches(ErrorKind::ResourceNotFound));
    assert!(engine.find(&local, REMOTE).await.unwrap().is_none());
}

#[tokio::test]
async fn test_vanished_server_session_is_recreated() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_create(&server, 2).await;
    Mock::given(method("GET"))
        .and(path(SESSION_PATH))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let sessions = TempDir::new().unwrap();
    let local = dir.path().join("big.bin");
    write_file(&local, &patterned_bytes(TOTAL));

    let engine = engine(&server, &sessions);
    engine.create_session(&local, REMOTE).await.unwrap();
    let handle = engine.resume_or_create(&local, REMOTE).await.unwrap();
    assert!(!handle.is_resumed());
    assert_eq!(handle.offset(), 0);
}

#[tokio::test]
async fn test_concurrent_resume_or_create_creates_one_session() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let target = UploadTarget::new(TOTAL);
    mount_create(&server, 1).await;
    mount_target(&server, &target).await;

    let dir = TempDir::new().unwrap();
    let sessions = TempDir::new().unwrap();
    let local = dir.path().join("big.bin");
    write_file(&local, &patterned_bytes(TOTAL));

    let first = engine(&server, &sessions);
    let second = first.clone();
    let (a, b) = tokio::join!(
        first.resume_or_create(&local, REMOTE),
        second.resume_or_create(&local, REMOTE)
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.session().transfer_url, b.session().transfer_url);
    assert_ne!(a.is_resumed(), b.is_resumed());
}

#[tokio::test]
async fn test_changed_local_file_starts_a_new_session() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_create(&server, 2).await;
    Mock::given(method("DELETE"))
        .and(path(SESSION_PATH))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let sessions = TempDir::new().unwrap();
    let local = dir.path().join("big.bin");
    write_file(&local, &patterned_bytes(TOTAL));

    let engine = engine(&server, &sessions);
    engine.create_session(&local, REMOTE).await.unwrap();

    write_file(&local, &patterned_bytes(TOTAL / 2));
    let handle = engine.resume_or_create(&local, REMOTE).await.unwrap();
    assert!(!handle.is_resumed());
    assert_eq!(handle.total(), (TOTAL / 2) as u64);
}

#[tokio::test]
async fn test_empty_file_uses_simple_upload() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("PUT"))
        .and(path("/me/drive/root:/Docs/empty.txt:/content"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "EMPTY1",
            "name": "empty.txt",
            "size": 0,
            "file": {}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let sessions = TempDir::new().unwrap();
    let local = dir.path().join("empty.txt");
    write_file(&local, b"");

    let engine = engine(&server, &sessions);
    let error = engine
        .resume_or_create(&local, "/Docs/empty.txt")
        .await
        .unwrap_err();
    assert!(error.matches(ErrorKind::InvalidRequest));

    let runner = TransferRunner::new(fast_retry(), CancelFlag::new());
    let outcome = runner
        .upload(&engine, &local, "/Docs/empty.txt")
        .await
        .unwrap();
    let TransferOutcome::Completed { bytes, item } = outcome else {
        panic!("expected completion");
    };
    assert_eq!(bytes, 0);
    assert_eq!(item.unwrap().id, "EMPTY1");
}

#[tokio::test]
async fn test_expired_token_surfaces_reauth_required() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("POST"))
        .and(path(CREATE_PATH))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": { "code": "unauthenticated", "message": "token expired" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let sessions = TempDir::new().unwrap();
    let local = dir.path().join("big.bin");
    write_file(&local, &patterned_bytes(TOTAL));

    let runner = TransferRunner::new(fast_retry(), CancelFlag::new());
    let error = runner
        .upload(&engine(&server, &sessions), &local, REMOTE)
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::ReauthRequired);
}

#[tokio::test]
async fn test_accepted_chunk_without_progress_gives_up_after_retries() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_create(&server, 1).await;
    Mock::given(method("PUT"))
        .and(path(SESSION_PATH))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({
            "expirationDateTime": "2099-01-01T00:00:00Z",
            "nextExpectedRanges": ["0-"],
        })))
        .expect(3)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let sessions = TempDir::new().unwrap();
    let local = dir.path().join("big.bin");
    write_file(&local, &patterned_bytes(TOTAL));

    let runner = TransferRunner::new(fast_retry(), CancelFlag::new());
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        runner.upload(&engine(&server, &sessions), &local, REMOTE),
    )
    .await
    .expect("upload that never advances must terminate");
    let error = result.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::RetryLater);

    let store = SessionStore::open(sessions.path()).unwrap();
    match store.load(&local, REMOTE).unwrap() {
        LoadOutcome::Found(session) => assert_eq!(session.offset(), 0),
        other => panic!("expected the session record to survive, got {other:?}"),
    }
}
