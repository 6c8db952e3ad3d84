//! Integration tests for whole-file acquisition over HTTP.
//!
//! These tests drive `DownloadEngine` with real HTTP adapters against a mock
//! server, covering fallback between mirrors, reassembly and quarantine.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mirrordl_core::{
    AcquireConfig, AcquireOutcome, DirectSource, DownloadEvent, EventSink, FileDescriptor,
    HttpClient, RecordingSink, SourceRegistry, UnfulfillableReason, parse_records,
};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod support;
use support::socket_guard::start_mock_server_or_skip;

// md5("hello, mirrored world")
const HELLO_MD5: &str = "1a79e779c83c46841353cda857ba517d";

fn md5_hex(bytes: &[u8]) -> String {
    let mut hasher = mirrordl_core::download::Fingerprinter::for_expected("");
    hasher.update(bytes);
    hasher.finalize()
}

fn config(dir: &TempDir) -> AcquireConfig {
    AcquireConfig {
        concurrency: 3,
        retry_attempts: 2,
        retry_delay: Duration::ZERO,
        output_dir: dir.path().join("out"),
        working_dir: dir.path().join("work"),
        ..AcquireConfig::default()
    }
}

fn registry(client: &HttpClient) -> SourceRegistry {
    SourceRegistry::new()
        .with(Arc::new(DirectSource::named("mirror-a", client.clone())))
        .with(Arc::new(DirectSource::named("mirror-b", client.clone())))
}

fn files_under(root: &Path) -> Vec<std::path::PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                found.push(path);
            }
        }
    }
    found
}

async fn mount_body(server: &MockServer, route: &str, body: &'static [u8]) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(server)
        .await;
}

async fn mount_status(server: &MockServer, route: &str, status: u16) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

#[test]
fn test_fixture_fingerprint_is_md5_of_payload() {
    assert_eq!(md5_hex(b"hello, mirrored world"), HELLO_MD5);
}

#[tokio::test]
async fn test_pieces_join_in_declared_order() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    // Slow first piece so completion order differs from join order.
    Mock::given(method("GET"))
        .and(path("/a/1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"hello, ".as_slice())
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&server)
        .await;
    mount_body(&server, "/a/2", b"mirrored ").await;
    mount_body(&server, "/a/3", b"world").await;

    let dir = TempDir::new().unwrap();
    let client = HttpClient::new().unwrap();
    let sink = Arc::new(RecordingSink::new());
    let engine = config(&dir).engine(registry(&client), Arc::clone(&sink) as Arc<dyn EventSink>);
    let file = FileDescriptor::new("hello.txt", HELLO_MD5).with_source(
        "mirror-a",
        ["/a/1", "/a/2", "/a/3"].map(|p| format!("{}{p}", server.uri())),
    );

    let outcome = engine.acquire(&file).await;

    let final_path = dir.path().join("out/hello.txt");
    assert_eq!(
        outcome,
        AcquireOutcome::Downloaded {
            path: final_path.clone(),
            fingerprint: HELLO_MD5.to_string(),
        }
    );
    assert_eq!(std::fs::read(&final_path).unwrap(), b"hello, mirrored world");
    assert!(files_under(&dir.path().join("work")).is_empty());
}

#[tokio::test]
async fn test_dead_mirror_falls_back_and_leaves_no_pieces() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_body(&server, "/a/1", b"hello, mirrored ").await;
    mount_status(&server, "/a/2", 404).await;
    mount_body(&server, "/b/1", b"hello, mirrored ").await;
    mount_body(&server, "/b/2", b"world").await;

    let dir = TempDir::new().unwrap();
    let client = HttpClient::new().unwrap();
    let sink = Arc::new(RecordingSink::new());
    let engine = config(&dir).engine(registry(&client), Arc::clone(&sink) as Arc<dyn EventSink>);
    let file = FileDescriptor::new("hello.txt", HELLO_MD5)
        .with_source(
            "mirror-a",
            ["/a/1", "/a/2"].map(|p| format!("{}{p}", server.uri())),
        )
        .with_source(
            "mirror-b",
            ["/b/1", "/b/2"].map(|p| format!("{}{p}", server.uri())),
        );

    let outcome = engine.acquire(&file).await;

    assert!(matches!(outcome, AcquireOutcome::Downloaded { .. }), "{outcome}");
    assert_eq!(
        std::fs::read(dir.path().join("out/hello.txt")).unwrap(),
        b"hello, mirrored world"
    );
    assert!(files_under(&dir.path().join("work")).is_empty());
    // Source order is random: mirror-a is abandoned only when it went first.
    assert!(sink.count(|e| matches!(e, DownloadEvent::SourceAbandoned { .. })) <= 1);
}

#[tokio::test]
async fn test_every_mirror_dead_is_unfulfillable() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_status(&server, "/a/1", 404).await;
    mount_status(&server, "/b/1", 503).await;

    let dir = TempDir::new().unwrap();
    let client = HttpClient::new().unwrap();
    let sink = Arc::new(RecordingSink::new());
    let engine = config(&dir).engine(registry(&client), Arc::clone(&sink) as Arc<dyn EventSink>);
    let file = FileDescriptor::new("hello.txt", HELLO_MD5)
        .with_source("mirror-a", [format!("{}/a/1", server.uri())])
        .with_source("mirror-b", [format!("{}/b/1", server.uri())]);

    let outcome = engine.acquire(&file).await;

    assert_eq!(
        outcome,
        AcquireOutcome::Unfulfillable {
            reason: UnfulfillableReason::AllSourcesExhausted
        }
    );
    assert_eq!(
        sink.count(|e| matches!(e, DownloadEvent::SourceAbandoned { .. })),
        2
    );
    // 503 is transient: retried up to the attempt ceiling before giving up.
    assert_eq!(
        sink.count(|e| matches!(e, DownloadEvent::AttemptRetry { name, .. } if name.ends_with("/b/1"))),
        2
    );
    assert!(files_under(dir.path()).is_empty());
}

#[tokio::test]
async fn test_corrupt_payload_is_quarantined_then_not_reported_present() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_body(&server, "/a/1", b"hello, corrupted world").await;

    let dir = TempDir::new().unwrap();
    let client = HttpClient::new().unwrap();
    let engine = config(&dir).engine(registry(&client), Arc::new(RecordingSink::new()));
    let file = FileDescriptor::new("hello.txt", HELLO_MD5)
        .in_bundle("Release")
        .with_source("mirror-a", [format!("{}/a/1", server.uri())]);

    let first = engine.acquire(&file).await;
    let second = engine.acquire(&file).await;

    let quarantined = dir.path().join("out/Release/badsum-hello.txt");
    for outcome in [first, second] {
        assert_eq!(
            outcome,
            AcquireOutcome::Unfulfillable {
                reason: UnfulfillableReason::FingerprintMismatch {
                    quarantined: quarantined.clone()
                }
            }
        );
    }
    assert_eq!(std::fs::read(&quarantined).unwrap(), b"hello, corrupted world");
    assert!(!dir.path().join("out/Release/hello.txt").exists());
}

#[tokio::test]
async fn test_records_drive_acquisition_of_every_file() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_body(&server, "/a/one", b"one").await;
    mount_body(&server, "/a/two", b"two").await;

    let records = format!(
        r#"{{
            "title": "Pack",
            "status": "complete",
            "files": [
                {{"filename": "one.bin", "md5": "{}", "links": {{"Mirror-A": "{uri}/a/one"}}}},
                {{"filename": "two.bin", "md5": "{}", "links": {{"mirror-a": ["{uri}/a/two"], "unknown": "x"}}}},
                {{"filename": "three.bin", "md5": "00"}}
            ]
        }}"#,
        md5_hex(b"one"),
        md5_hex(b"two"),
        uri = server.uri()
    );
    let descriptors: Vec<FileDescriptor> = parse_records(&records)
        .unwrap()
        .iter()
        .flat_map(mirrordl_core::MetadataRecord::descriptors)
        .collect();

    let dir = TempDir::new().unwrap();
    let client = HttpClient::new().unwrap();
    let engine = config(&dir).engine(registry(&client), Arc::new(RecordingSink::new()));

    let outcomes = engine.acquire_all(descriptors).await;

    assert_eq!(outcomes.len(), 3);
    assert!(outcomes[0].is_success());
    assert!(outcomes[1].is_success());
    assert_eq!(
        outcomes[2],
        AcquireOutcome::Unfulfillable {
            reason: UnfulfillableReason::NoSupportedSource
        }
    );
    assert_eq!(std::fs::read(dir.path().join("out/Pack/one.bin")).unwrap(), b"one");
    assert_eq!(std::fs::read(dir.path().join("out/Pack/two.bin")).unwrap(), b"two");
    assert_eq!(engine.stats().downloaded(), 2);
    assert_eq!(engine.stats().unfulfillable(), 1);
}

#[tokio::test]
async fn test_case_variant_keys_hit_the_mirror_once() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/a/1"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let client = HttpClient::new().unwrap();
    let sink = Arc::new(RecordingSink::new());
    let engine = config(&dir).engine(registry(&client), Arc::clone(&sink) as Arc<dyn EventSink>);
    let file = FileDescriptor::new("hello.txt", HELLO_MD5)
        .with_source("Mirror-A", [format!("{}/a/1", server.uri())])
        .with_source("mirror-a", [format!("{}/a/1", server.uri())]);

    let outcome = engine.acquire(&file).await;

    assert_eq!(
        outcome,
        AcquireOutcome::Unfulfillable {
            reason: UnfulfillableReason::AllSourcesExhausted
        }
    );
    assert_eq!(
        sink.count(|e| matches!(e, DownloadEvent::SourceAbandoned { .. })),
        1
    );
}
