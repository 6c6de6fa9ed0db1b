//! Integration tests for tagsync
//!
//! These tests use wiremock to simulate the remote tagging/storage
//! service and exercise full upload and download runs including
//! chunking, retry, dedup and integrity verification.

use std::sync::Arc;
use tagsync::{
    EngineConfig, RecordingObserver, RunReport, StreamingDigest, Terminal, TransferCoordinator,
    TransferEvent,
};
use tempfile::TempDir;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MIB: u64 = 1024 * 1024;

/// Config with fast retries suitable for tests
fn test_config(temp_dir: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::new()
        .base_dir(temp_dir.path())
        .max_connections(2);
    config.http.retry_delay_ms = 10;
    config.http.max_retry_delay_ms = 20;
    config
}

fn service_url(server: &MockServer) -> Url {
    Url::parse(&format!("{}/tagfiler/", server.uri())).expect("Invalid service URL")
}

/// Mount a login endpoint that accepts any credentials
async fn mount_login_ok(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/webauthn/login"))
        .respond_with(
            ResponseTemplate::new(303)
                .insert_header("Set-Cookie", "webauthn=test-session; Path=/"),
        )
        .mount(server)
        .await;
}

fn sha256_hex(data: &[u8]) -> String {
    let digest = StreamingDigest::new();
    digest.update(0, data);
    digest.finalize().to_hex()
}

fn terminal_of(report: &RunReport) -> Terminal {
    report.terminal
}

// =============================================================================
// Upload Tests
// =============================================================================

#[tokio::test]
async fn test_upload_three_files_chunk_counts_and_totals() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let server = MockServer::start().await;
    mount_login_ok(&server).await;

    // Three files: 0 bytes, exactly one chunk, and two full chunks
    // plus a remainder.
    tokio::fs::write(temp_dir.path().join("empty.bin"), b"")
        .await
        .unwrap();
    tokio::fs::write(temp_dir.path().join("one.bin"), vec![0xAA; MIB as usize])
        .await
        .unwrap();
    tokio::fs::create_dir_all(temp_dir.path().join("sub"))
        .await
        .unwrap();
    tokio::fs::write(temp_dir.path().join("sub/two.bin"), vec![0xBB; 2_500_000])
        .await
        .unwrap();

    // The single-chunk file carries the full range in one PUT.
    Mock::given(method("PUT"))
        .and(path("/tagfiler/file/study/one.bin"))
        .and(header("Content-Range", "bytes 0-1048575/1048576"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    // The 2.5 MB file splits into three chunks.
    Mock::given(method("PUT"))
        .and(path("/tagfiler/file/study/sub/two.bin"))
        .respond_with(ResponseTemplate::new(201))
        .expect(3)
        .mount(&server)
        .await;

    let observer = Arc::new(RecordingObserver::new());
    let coordinator = TransferCoordinator::new(test_config(&temp_dir), observer.clone())
        .expect("Failed to create coordinator");
    let report = coordinator
        .upload(service_url(&server), "study", "alice", "secret")
        .await
        .expect("Upload run should succeed");

    assert_eq!(terminal_of(&report), Terminal::Success);
    assert_eq!(report.bytes_transferred, 3_548_576);
    assert_eq!(report.files_completed, 3);
    assert_eq!(report.files_skipped, 0);

    let events = observer.events();
    assert!(matches!(
        events.first(),
        Some(TransferEvent::RunStarted {
            total_bytes: 3_548_576,
            total_files: 3,
            ..
        })
    ));

    // One trivial chunk for the empty file, one for one.bin, three
    // for two.bin; chunk byte notifications add up to the total.
    let chunk_events: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            TransferEvent::ChunkTransferred { bytes, .. } => Some(*bytes),
            _ => None,
        })
        .collect();
    assert_eq!(chunk_events.len(), 5);
    assert_eq!(chunk_events.iter().sum::<u64>(), 3_548_576);

    assert_eq!(
        observer.terminal_events().len(),
        1,
        "Exactly one terminal event"
    );
    assert!(matches!(
        observer.terminal_events()[0],
        TransferEvent::RunSuccess { .. }
    ));

    // The zero-byte file never touches the network.
    let empty_requests: Vec<_> = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.url.path().contains("empty.bin"))
        .collect();
    assert!(empty_requests.is_empty());
}

#[tokio::test]
async fn test_wrong_password_is_fatal_before_any_chunk_request() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/webauthn/login"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    tokio::fs::write(temp_dir.path().join("a.bin"), b"payload")
        .await
        .unwrap();

    let observer = Arc::new(RecordingObserver::new());
    let coordinator = TransferCoordinator::new(test_config(&temp_dir), observer.clone())
        .expect("Failed to create coordinator");
    let result = coordinator
        .upload(service_url(&server), "study", "alice", "wrong")
        .await;

    assert!(result.is_err(), "Run should abort");
    let terminals = observer.terminal_events();
    assert_eq!(terminals.len(), 1);
    assert!(matches!(terminals[0], TransferEvent::RunFatal { .. }));

    // The only request on the wire is the login attempt.
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].url.path(), "/webauthn/login");
}

#[tokio::test]
async fn test_transient_server_errors_are_retried() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let server = MockServer::start().await;
    mount_login_ok(&server).await;

    tokio::fs::write(temp_dir.path().join("a.bin"), b"retry me")
        .await
        .unwrap();

    // Two failures, then the chunk lands.
    Mock::given(method("PUT"))
        .and(path("/tagfiler/file/study/a.bin"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/tagfiler/file/study/a.bin"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let observer = Arc::new(RecordingObserver::new());
    let coordinator = TransferCoordinator::new(test_config(&temp_dir), observer.clone())
        .expect("Failed to create coordinator");
    let report = coordinator
        .upload(service_url(&server), "study", "alice", "secret")
        .await
        .expect("Upload run should succeed");

    assert_eq!(terminal_of(&report), Terminal::Success);
    assert_eq!(report.files_completed, 1);
    assert_eq!(report.bytes_transferred, 8);
}

#[tokio::test]
async fn test_exhausted_retries_fail_only_the_affected_file() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let server = MockServer::start().await;
    mount_login_ok(&server).await;

    tokio::fs::write(temp_dir.path().join("bad.bin"), b"never lands")
        .await
        .unwrap();
    tokio::fs::write(temp_dir.path().join("good.bin"), b"lands fine")
        .await
        .unwrap();

    Mock::given(method("PUT"))
        .and(path("/tagfiler/file/study/bad.bin"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/tagfiler/file/study/good.bin"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let observer = Arc::new(RecordingObserver::new());
    let coordinator = TransferCoordinator::new(test_config(&temp_dir), observer.clone())
        .expect("Failed to create coordinator");
    let report = coordinator
        .upload(service_url(&server), "study", "alice", "secret")
        .await
        .expect("Recoverable failures still yield a report");

    assert_eq!(terminal_of(&report), Terminal::Failure);
    assert_eq!(report.files_completed, 1);
    // The failed file contributes nothing to the byte tally.
    assert_eq!(report.bytes_transferred, 10);

    let terminals = observer.terminal_events();
    assert_eq!(terminals.len(), 1);
    match &terminals[0] {
        TransferEvent::RunFailure { code, .. } => assert_eq!(code, "protocol"),
        other => panic!("Expected RunFailure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_upload_dedup_skips_files_with_matching_digest() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let server = MockServer::start().await;
    mount_login_ok(&server).await;

    let content = b"already on the server";
    tokio::fs::write(temp_dir.path().join("dup.bin"), content)
        .await
        .unwrap();

    Mock::given(method("GET"))
        .and(path("/tagfiler/tags/study/dup.bin/sha256"))
        .respond_with(ResponseTemplate::new(200).set_body_string(sha256_hex(content)))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = test_config(&temp_dir);
    config.enable_checksum = true;
    let observer = Arc::new(RecordingObserver::new());
    let coordinator = TransferCoordinator::new(config, observer.clone())
        .expect("Failed to create coordinator");
    let report = coordinator
        .upload(service_url(&server), "study", "alice", "secret")
        .await
        .expect("Upload run should succeed");

    assert_eq!(terminal_of(&report), Terminal::Success);
    assert_eq!(report.files_completed, 0);
    assert_eq!(report.files_skipped, 1);
    assert_eq!(report.bytes_transferred, 0);

    assert!(observer
        .events()
        .iter()
        .any(|e| matches!(e, TransferEvent::FileSkipped { name } if name == "dup.bin")));

    // No file data moved at all.
    let puts: Vec<_> = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.method.as_str() == "PUT")
        .collect();
    assert!(puts.is_empty());
}

#[tokio::test]
async fn test_upload_stores_digest_tag_when_checksums_enabled() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let server = MockServer::start().await;
    mount_login_ok(&server).await;

    let content = b"fresh content";
    tokio::fs::write(temp_dir.path().join("new.bin"), content)
        .await
        .unwrap();

    Mock::given(method("GET"))
        .and(path("/tagfiler/tags/study/new.bin/sha256"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/tagfiler/file/study/new.bin"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/tagfiler/tags/study/new.bin/sha256"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = test_config(&temp_dir);
    config.enable_checksum = true;
    let coordinator = TransferCoordinator::new(config, Arc::new(RecordingObserver::new()))
        .expect("Failed to create coordinator");
    let report = coordinator
        .upload(service_url(&server), "study", "alice", "secret")
        .await
        .expect("Upload run should succeed");

    assert_eq!(terminal_of(&report), Terminal::Success);
    assert_eq!(report.files_completed, 1);

    // The stored tag is the hex digest of the file's content.
    let tag_put = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.method.as_str() == "PUT" && r.url.path().ends_with("/sha256"))
        .expect("Digest tag should be stored");
    assert_eq!(String::from_utf8_lossy(&tag_put.body), sha256_hex(content));
}

#[tokio::test]
async fn test_failed_digest_store_backs_out_job_bytes() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let server = MockServer::start().await;
    mount_login_ok(&server).await;

    let content = b"chunks land, tag store fails";
    tokio::fs::write(temp_dir.path().join("new.bin"), content)
        .await
        .unwrap();

    Mock::given(method("GET"))
        .and(path("/tagfiler/tags/study/new.bin/sha256"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/tagfiler/file/study/new.bin"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/tagfiler/tags/study/new.bin/sha256"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut config = test_config(&temp_dir);
    config.enable_checksum = true;
    let observer = Arc::new(RecordingObserver::new());
    let coordinator = TransferCoordinator::new(config, observer.clone())
        .expect("Failed to create coordinator");
    let report = coordinator
        .upload(service_url(&server), "study", "alice", "secret")
        .await
        .expect("Recoverable failures still yield a report");

    assert_eq!(terminal_of(&report), Terminal::Failure);
    assert_eq!(report.files_completed, 0);
    // The uploaded chunk bytes are backed out when the job fails after
    // transfer, so the tally stays equal to the completed jobs' sizes.
    assert_eq!(report.bytes_transferred, 0);

    let terminals = observer.terminal_events();
    assert_eq!(terminals.len(), 1);
    match &terminals[0] {
        TransferEvent::RunFailure { code, .. } => assert_eq!(code, "protocol"),
        other => panic!("Expected RunFailure, got {:?}", other),
    }
}

// =============================================================================
// Download Tests
// =============================================================================

#[tokio::test]
async fn test_download_chunked_file_and_empty_file() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let server = MockServer::start().await;
    mount_login_ok(&server).await;

    let content: Vec<u8> = (0u8..10).collect();
    Mock::given(method("GET"))
        .and(path("/tagfiler/dataset/study"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"[
                {"bytes": 10, "name": "img/a.bin"},
                {"bytes": null, "name": "configuration tags"},
                {"bytes": 0, "name": "empty.bin"}
            ]"#,
        ))
        .expect(1)
        .mount(&server)
        .await;

    // 10 bytes at a 4-byte chunk size: ranges 0-3, 4-7 and 8-9.
    for (range, slice) in [
        ("bytes=0-3", &content[0..4]),
        ("bytes=4-7", &content[4..8]),
        ("bytes=8-9", &content[8..10]),
    ] {
        Mock::given(method("GET"))
            .and(path("/tagfiler/file/study/img/a.bin"))
            .and(header("Range", range))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(slice.to_vec()))
            .expect(1)
            .mount(&server)
            .await;
    }

    let mut config = test_config(&temp_dir);
    config.chunk_size = 4;
    let observer = Arc::new(RecordingObserver::new());
    let coordinator = TransferCoordinator::new(config, observer.clone())
        .expect("Failed to create coordinator");
    let report = coordinator
        .download(service_url(&server), "study", "alice", "secret")
        .await
        .expect("Download run should succeed");

    assert_eq!(terminal_of(&report), Terminal::Success);
    assert_eq!(report.files_completed, 2);
    assert_eq!(report.bytes_transferred, 10);

    let downloaded = tokio::fs::read(temp_dir.path().join("img/a.bin"))
        .await
        .expect("Downloaded file should exist");
    assert_eq!(downloaded, content);

    let empty = tokio::fs::metadata(temp_dir.path().join("empty.bin"))
        .await
        .expect("Empty file should exist");
    assert_eq!(empty.len(), 0);

    // No half-finished file left behind.
    assert!(!temp_dir.path().join("img/a.bin.part").exists());
}

#[tokio::test]
async fn test_download_integrity_mismatch_fails_the_file() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let server = MockServer::start().await;
    mount_login_ok(&server).await;

    let expected = b"pristine content";
    let corrupt = b"corrupted conten";

    Mock::given(method("GET"))
        .and(path("/tagfiler/dataset/study"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            r#"[{{"bytes": {}, "name": "a.bin"}}]"#,
            expected.len()
        )))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tagfiler/tags/study/a.bin/sha256"))
        .respond_with(ResponseTemplate::new(200).set_body_string(sha256_hex(expected)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tagfiler/file/study/a.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(corrupt.to_vec()))
        .mount(&server)
        .await;

    let mut config = test_config(&temp_dir);
    config.enable_checksum = true;
    let observer = Arc::new(RecordingObserver::new());
    let coordinator = TransferCoordinator::new(config, observer.clone())
        .expect("Failed to create coordinator");
    let report = coordinator
        .download(service_url(&server), "study", "alice", "secret")
        .await
        .expect("Recoverable failures still yield a report");

    assert_eq!(terminal_of(&report), Terminal::Failure);
    assert_eq!(report.files_completed, 0);
    assert_eq!(report.bytes_transferred, 0);

    let terminals = observer.terminal_events();
    assert_eq!(terminals.len(), 1);
    match &terminals[0] {
        TransferEvent::RunFailure { code, .. } => assert_eq!(code, "integrity"),
        other => panic!("Expected RunFailure, got {:?}", other),
    }

    // Neither the final file nor the partial survives the mismatch.
    assert!(!temp_dir.path().join("a.bin").exists());
    assert!(!temp_dir.path().join("a.bin.part").exists());
}

#[tokio::test]
async fn test_download_dedup_skips_local_file_with_matching_digest() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let server = MockServer::start().await;
    mount_login_ok(&server).await;

    let content = b"already here";
    tokio::fs::write(temp_dir.path().join("a.bin"), content)
        .await
        .unwrap();

    Mock::given(method("GET"))
        .and(path("/tagfiler/dataset/study"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            r#"[{{"bytes": {}, "name": "a.bin"}}]"#,
            content.len()
        )))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tagfiler/tags/study/a.bin/sha256"))
        .respond_with(ResponseTemplate::new(200).set_body_string(sha256_hex(content)))
        .mount(&server)
        .await;

    let mut config = test_config(&temp_dir);
    config.enable_checksum = true;
    let observer = Arc::new(RecordingObserver::new());
    let coordinator = TransferCoordinator::new(config, observer.clone())
        .expect("Failed to create coordinator");
    let report = coordinator
        .download(service_url(&server), "study", "alice", "secret")
        .await
        .expect("Download run should succeed");

    assert_eq!(terminal_of(&report), Terminal::Success);
    assert_eq!(report.files_skipped, 1);
    assert_eq!(report.bytes_transferred, 0);

    // No ranged GET hit the file endpoint.
    let file_gets: Vec<_> = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.url.path().starts_with("/tagfiler/file/"))
        .collect();
    assert!(file_gets.is_empty());
}
