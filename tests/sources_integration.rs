//! Integration tests for the built-in source adapters against a mock server.

mod support;
use support::socket_guard::start_mock_server_or_skip;

use bytes::Bytes;
use futures_util::StreamExt;
use mirrordl_core::source::GoFileEndpoints;
use mirrordl_core::{
    DirectSource, FailureType, GoFileSource, HttpClient, PieceStream, SourceAdapter,
    SourceRegistry, classify_error,
};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SCRIPT: &str = r#"(function(){ var fetchData = { wt: "4fd6sg89d7s6" }; })();"#;

async fn collect(stream: PieceStream) -> Vec<u8> {
    let chunks: Vec<Bytes> = stream.body.map(|chunk| chunk.unwrap()).collect().await;
    chunks.concat()
}

fn client() -> HttpClient {
    HttpClient::new().unwrap()
}

fn gofile(server: &MockServer) -> GoFileSource {
    GoFileSource::with_endpoints(
        client(),
        GoFileEndpoints {
            site: server.uri(),
            api: server.uri(),
            script: format!("{}/dist/js/alljs.js", server.uri()),
        },
    )
}

async fn mount_gofile_tokens(server: &MockServer, expected_fetches: u64) {
    Mock::given(method("GET"))
        .and(path("/dist/js/alljs.js"))
        .respond_with(ResponseTemplate::new(200).set_body_string(SCRIPT))
        .expect(expected_fetches)
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/accounts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "ok",
            "data": { "token": "acct-1" }
        })))
        .expect(expected_fetches)
        .mount(server)
        .await;
}

async fn mount_gofile_file(server: &MockServer, id: &str, body: &'static [u8]) {
    Mock::given(method("GET"))
        .and(path(format!("/contents/{id}")))
        .and(query_param("wt", "4fd6sg89d7s6"))
        .and(header("authorization", "Bearer acct-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "ok",
            "data": {
                "children": {
                    "c1": { "link": format!("{}/download/{id}/file.bin", server.uri()) }
                }
            }
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/download/{id}/file.bin")))
        .and(header("cookie", "accountToken=acct-1"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_direct_source_streams_body_with_size() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/piece.001"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"piece-one"))
        .mount(&server)
        .await;

    let source = DirectSource::new(client());
    let stream = source
        .fetch_piece(&format!("{}/piece.001", server.uri()))
        .await
        .unwrap();

    assert_eq!(stream.total_size, Some(9));
    assert_eq!(collect(stream).await, b"piece-one");
}

#[tokio::test]
async fn test_direct_source_classifies_http_statuses() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    for (status, expected) in [
        (404_u16, FailureType::SourceExhausted),
        (410, FailureType::SourceExhausted),
        (429, FailureType::Transient),
        (503, FailureType::Transient),
    ] {
        Mock::given(method("GET"))
            .and(path(format!("/status/{status}")))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;

        let error = DirectSource::new(client())
            .fetch_piece(&format!("{}/status/{status}", server.uri()))
            .await
            .unwrap_err();
        assert_eq!(classify_error(&error), expected, "HTTP {status}");
    }
}

#[tokio::test]
async fn test_direct_source_connection_refused_is_transient() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0");
        let Ok(listener) = listener else {
            return;
        };
        listener.local_addr().unwrap().port()
    };

    let error = DirectSource::new(client())
        .fetch_piece(&format!("http://127.0.0.1:{port}/piece"))
        .await
        .unwrap_err();

    assert_eq!(classify_error(&error), FailureType::Transient);
}

#[tokio::test]
async fn test_gofile_resolves_and_streams_with_cached_tokens() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_gofile_tokens(&server, 1).await;
    mount_gofile_file(&server, "abc123", b"first").await;
    mount_gofile_file(&server, "def456", b"second").await;

    let source = gofile(&server);
    let first = source
        .fetch_piece(&format!("{}/d/abc123", server.uri()))
        .await
        .unwrap();
    let second = source
        .fetch_piece(&format!("{}/d/def456", server.uri()))
        .await
        .unwrap();

    assert_eq!(collect(first).await, b"first");
    assert_eq!(collect(second).await, b"second");
}

#[tokio::test]
async fn test_gofile_token_rejection_refreshes_tokens() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_gofile_tokens(&server, 2).await;
    Mock::given(method("GET"))
        .and(path("/contents/abc123"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_gofile_file(&server, "abc123", b"payload").await;

    let source = gofile(&server);
    let url = format!("{}/d/abc123", server.uri());

    let error = source.fetch_piece(&url).await.unwrap_err();
    assert_eq!(classify_error(&error), FailureType::Transient);

    let stream = source.fetch_piece(&url).await.unwrap();
    assert_eq!(collect(stream).await, b"payload");
}

#[tokio::test]
async fn test_gofile_missing_file_exhausts_source() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_gofile_tokens(&server, 1).await;
    Mock::given(method("GET"))
        .and(path("/contents/gone"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "error-notFound",
            "data": {}
        })))
        .mount(&server)
        .await;

    let error = gofile(&server)
        .fetch_piece(&format!("{}/d/gone", server.uri()))
        .await
        .unwrap_err();

    assert_eq!(classify_error(&error), FailureType::SourceExhausted);
}

#[tokio::test]
async fn test_gofile_script_without_token_is_protocol_error() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/dist/js/alljs.js"))
        .respond_with(ResponseTemplate::new(200).set_body_string("console.log('redesigned')"))
        .mount(&server)
        .await;

    let error = gofile(&server)
        .fetch_piece(&format!("{}/d/abc123", server.uri()))
        .await
        .unwrap_err();

    assert_eq!(classify_error(&error), FailureType::Protocol);
}

#[test]
fn test_default_registry_knows_builtin_sources() {
    let registry = SourceRegistry::with_defaults(&client());
    assert_eq!(registry.names(), vec!["direct", "gofile"]);
    assert!(registry.supports("GoFile"));
    assert!(!registry.supports("mediafire"));
}
