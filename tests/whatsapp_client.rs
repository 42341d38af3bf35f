//! Drives the real WhatsApp REST client against a canned HTTP gateway:
//! endpoint paths and methods, request bodies, response parsing, and the
//! status-to-error-kind mapping.

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use whatsignal::config::WhatsAppConfig;
use whatsignal::contacts::ContactSource;
use whatsignal::error::BridgeError;
use whatsignal::whatsapp::{OutgoingWhatsApp, SessionStatus, WhatsAppApi, WhatsAppClient};

// ---------------------------------------------------------------------------
// Canned gateway
// ---------------------------------------------------------------------------

/// Records every request as (method, path, json body). Sessions named
/// `fail-<status>` answer with that status instead.
#[derive(Clone, Default)]
struct Gateway {
    requests: Arc<Mutex<Vec<(String, String, serde_json::Value)>>>,
}

impl Gateway {
    fn record(&self, method: &str, path: String, body: serde_json::Value) {
        self.requests
            .lock()
            .unwrap()
            .push((method.to_owned(), path, body));
    }

    fn requests(&self) -> Vec<(String, String, serde_json::Value)> {
        self.requests.lock().unwrap().clone()
    }
}

fn forced_failure(session: &str) -> Option<Response> {
    Some(match session {
        "fail-401" => StatusCode::UNAUTHORIZED.into_response(),
        "fail-404" => StatusCode::NOT_FOUND.into_response(),
        "fail-429" => StatusCode::TOO_MANY_REQUESTS.into_response(),
        "fail-503" => (StatusCode::SERVICE_UNAVAILABLE, "overloaded").into_response(),
        _ => return None,
    })
}

async fn send_handler(
    State(gw): State<Gateway>,
    Path(session): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    if let Some(resp) = forced_failure(&session) {
        return resp;
    }
    gw.record("POST", format!("/api/sessions/{session}/messages"), body);
    Json(serde_json::json!({ "id": "WA100" })).into_response()
}

async fn edit_handler(
    State(gw): State<Gateway>,
    Path((session, id)): Path<(String, String)>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    gw.record("PUT", format!("/api/sessions/{session}/messages/{id}"), body);
    StatusCode::OK.into_response()
}

async fn delete_handler(
    State(gw): State<Gateway>,
    Path((session, id)): Path<(String, String)>,
) -> Response {
    gw.record(
        "DELETE",
        format!("/api/sessions/{session}/messages/{id}"),
        serde_json::Value::Null,
    );
    StatusCode::OK.into_response()
}

async fn react_handler(
    State(gw): State<Gateway>,
    Path((session, id)): Path<(String, String)>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    gw.record(
        "POST",
        format!("/api/sessions/{session}/messages/{id}/reactions"),
        body,
    );
    StatusCode::OK.into_response()
}

async fn status_handler(Path(session): Path<String>) -> Response {
    let status = match session.as_str() {
        "asleep" => "offline",
        "connecting" => "starting",
        _ => "working",
    };
    Json(serde_json::json!({ "status": status })).into_response()
}

async fn contact_handler(Path(handle): Path<String>) -> Response {
    match handle.as_str() {
        "wa-alice" => Json(serde_json::json!({ "display_name": "Alice" })).into_response(),
        "nameless" => Json(serde_json::json!({ "display_name": null })).into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn start_gateway() -> (Gateway, WhatsAppClient) {
    let gateway = Gateway::default();
    let router = Router::new()
        .route("/api/sessions/{session}/messages", post(send_handler))
        .route(
            "/api/sessions/{session}/messages/{id}",
            put(edit_handler).delete(delete_handler),
        )
        .route(
            "/api/sessions/{session}/messages/{id}/reactions",
            post(react_handler),
        )
        .route("/api/sessions/{session}/status", get(status_handler))
        .route("/api/contacts/{handle}", get(contact_handler))
        .with_state(gateway.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let client = WhatsAppClient::new(&WhatsAppConfig {
        api_url: format!("http://{addr}"),
        webhook_secret: String::new(),
        timeout: Duration::from_secs(5),
    })
    .unwrap();
    (gateway, client)
}

// ---------------------------------------------------------------------------
// Requests and parsing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn send_message_posts_outgoing_fields_and_parses_id() {
    let (gateway, client) = start_gateway().await;
    let out = OutgoingWhatsApp {
        body: "hi there".to_owned(),
        reply_to: Some("A1".to_owned()),
        media_path: None,
        correlation_id: "1700000000002".to_owned(),
    };

    let id = client.send_message("main", &out).await.unwrap();
    assert_eq!(id, "WA100");

    let requests = gateway.requests();
    assert_eq!(requests.len(), 1);
    let (method, path, body) = &requests[0];
    assert_eq!(method, "POST");
    assert_eq!(path, "/api/sessions/main/messages");
    assert_eq!(body["body"], "hi there");
    assert_eq!(body["reply_to"], "A1");
    assert_eq!(body["media_path"], serde_json::Value::Null);
    assert_eq!(body["correlation_id"], "1700000000002");
}

#[tokio::test]
async fn edit_delete_react_hit_their_endpoints() {
    let (gateway, client) = start_gateway().await;

    client.edit_message("main", "WA7", "fixed").await.unwrap();
    client.delete_message("main", "WA7").await.unwrap();
    client.react("main", "WA7", "👍").await.unwrap();

    let requests = gateway.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0].0, "PUT");
    assert_eq!(requests[0].1, "/api/sessions/main/messages/WA7");
    assert_eq!(requests[0].2["body"], "fixed");
    assert_eq!(requests[1].0, "DELETE");
    assert_eq!(requests[1].1, "/api/sessions/main/messages/WA7");
    assert_eq!(requests[2].0, "POST");
    assert_eq!(requests[2].1, "/api/sessions/main/messages/WA7/reactions");
    assert_eq!(requests[2].2["emoji"], "👍");
}

#[tokio::test]
async fn session_health_parses_status_strings() {
    let (_gateway, client) = start_gateway().await;

    assert_eq!(
        client.session_health("main").await.unwrap(),
        SessionStatus::Working
    );
    assert_eq!(
        client.session_health("asleep").await.unwrap(),
        SessionStatus::Offline
    );
    // Anything unrecognized is degraded, not working.
    assert_eq!(
        client.session_health("connecting").await.unwrap(),
        SessionStatus::Degraded
    );
}

#[tokio::test]
async fn contact_fetch_returns_name_none_and_missing() {
    let (_gateway, client) = start_gateway().await;

    assert_eq!(
        client.fetch("wa-alice").await.unwrap(),
        Some("Alice".to_owned())
    );
    assert_eq!(client.fetch("nameless").await.unwrap(), None);
    // Unknown handle is a miss, not an error.
    assert_eq!(client.fetch("wa-ghost").await.unwrap(), None);
}

// ---------------------------------------------------------------------------
// Status mapping
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upstream_statuses_map_to_error_kinds() {
    let (gateway, client) = start_gateway().await;
    let out = OutgoingWhatsApp::default();

    assert!(matches!(
        client.send_message("fail-401", &out).await.unwrap_err(),
        BridgeError::Unauthorized(_)
    ));
    assert!(matches!(
        client.send_message("fail-404", &out).await.unwrap_err(),
        BridgeError::NotFound(_)
    ));
    assert!(matches!(
        client.send_message("fail-429", &out).await.unwrap_err(),
        BridgeError::RateLimited
    ));

    let err = client.send_message("fail-503", &out).await.unwrap_err();
    assert!(err.retryable());
    match err {
        BridgeError::UpstreamWhatsApp {
            status: Some(503),
            message,
        } => assert_eq!(message, "overloaded"),
        other => panic!("expected UpstreamWhatsApp 503, got {other:?}"),
    }

    // Failures never reach the recorder.
    assert!(gateway.requests().is_empty());
}

#[tokio::test]
async fn connection_refused_is_a_retryable_transport_error() {
    // Bind-then-drop guarantees nothing is listening on the port.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = WhatsAppClient::new(&WhatsAppConfig {
        api_url: format!("http://{addr}"),
        webhook_secret: String::new(),
        timeout: Duration::from_secs(2),
    })
    .unwrap();

    let err = client
        .send_message("main", &OutgoingWhatsApp::default())
        .await
        .unwrap_err();
    assert!(err.retryable(), "transport failure must retry, got {err:?}");
}
