use chrono::Utc;
use crawl_capture_daemon::correlator::PendingTransaction;
use crawl_capture_daemon::{
    canonicalize, CaptureRecord, HttpReporter, ReportError, Reporter, StartMeta,
};
use crawl_capture_protocol::{CaptureStats, HeaderMap};
use serde_json::json;
use std::time::Duration;
use wiremock::{
    matchers::{body_json, body_partial_json, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn reporter_for(server: &MockServer) -> HttpReporter {
    let base = format!("{}/api", server.uri());
    HttpReporter::new(&base, Duration::from_secs(2)).expect("collector client")
}

fn sample_record() -> CaptureRecord {
    let mut headers = HeaderMap::new();
    headers.insert(
        "Content-Type".to_string(),
        "application/x-www-form-urlencoded".to_string(),
    );
    let transaction = PendingTransaction {
        request_id: "r1".to_string(),
        url: "https://example.com/api/users/42?expand=1".to_string(),
        method: "POST".to_string(),
        request_headers: headers,
        request_body: Some("name=ada&role=admin".to_string()),
        timestamp: Utc::now(),
        status_code: Some(201),
        response_headers: Some(HeaderMap::new()),
        mime_type: Some("application/json".to_string()),
    };
    let endpoint = canonicalize(&transaction.url);
    CaptureRecord::from_transaction("session-7", transaction, &endpoint)
}

#[tokio::test]
async fn notify_start_returns_session_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/capture/start"))
        .and(body_json(json!({
            "targetUrl": "https://example.com",
            "scopeTargetId": "scope-1"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sessionId": "session-7",
            "scopeTargetId": "scope-1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let reporter = reporter_for(&server);
    let ack = reporter
        .notify_start(&StartMeta {
            target_url: "https://example.com".to_string(),
            scope_target_id: Some("scope-1".to_string()),
        })
        .await
        .expect("start ack");

    assert_eq!(ack.session_id, "session-7");
    assert_eq!(ack.scope_target_id.as_deref(), Some("scope-1"));
}

#[tokio::test]
async fn notify_start_without_session_id_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/capture/start"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "sessionId": "" })))
        .mount(&server)
        .await;

    let result = reporter_for(&server)
        .notify_start(&StartMeta {
            target_url: "https://example.com".to_string(),
            scope_target_id: None,
        })
        .await;
    assert!(matches!(result, Err(ReportError::Malformed(_))));
}

#[tokio::test]
async fn notify_start_surfaces_http_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/capture/start"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let result = reporter_for(&server)
        .notify_start(&StartMeta {
            target_url: "https://example.com".to_string(),
            scope_target_id: None,
        })
        .await;
    match result {
        Err(ReportError::Status { status, body }) => {
            assert_eq!(status, 503);
            assert_eq!(body, "maintenance");
        }
        other => panic!("expected status error, got {:?}", other),
    }
}

#[tokio::test]
async fn notify_stop_sends_final_stats() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/capture/stop"))
        .and(body_json(json!({
            "sessionId": "session-7",
            "stats": { "requestCount": 12, "endpointCount": 4 }
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    reporter_for(&server)
        .notify_stop(
            "session-7",
            CaptureStats {
                request_count: 12,
                endpoint_count: 4,
            },
        )
        .await
        .expect("stop");
}

#[tokio::test]
async fn push_transaction_posts_record() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/capture/record"))
        .and(body_partial_json(json!({
            "sessionId": "session-7",
            "endpoint": "/api/users/{id}?expand={value}",
            "method": "POST",
            "statusCode": 201,
            "mimeType": "application/json",
            "postData": "name=ada&role=admin",
            "postParams": { "name": "ada", "role": "admin" },
            "getParams": { "expand": "1" }
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    reporter_for(&server)
        .push_transaction(&sample_record())
        .await
        .expect("push");
}

#[tokio::test]
async fn health_and_base_url_switch() {
    let healthy = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&healthy)
        .await;
    let unhealthy = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/health"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&unhealthy)
        .await;

    let reporter = reporter_for(&healthy);
    reporter.health().await.expect("healthy collector");

    reporter
        .set_base_url(&format!("{}/v2/", unhealthy.uri()))
        .expect("switch collector");
    assert!(reporter.base_url().ends_with("/v2/"));
    assert!(matches!(
        reporter.health().await,
        Err(ReportError::Status { status: 500, .. })
    ));
}

#[tokio::test]
async fn unreachable_collector_is_a_transport_error() {
    let reporter = HttpReporter::new("http://127.0.0.1:9/api", Duration::from_millis(500))
        .expect("collector client");
    assert!(matches!(
        reporter.health().await,
        Err(ReportError::Transport(_))
    ));
}
