//! WhatsApp webhook ingress.
//!
//! `POST /webhook/{session}` with a JSON body, authenticated by
//! `X-Signature: sha256=<hex HMAC>` over `"{timestamp}.{body}"` and an
//! `X-Timestamp` within the configured skew. Checks run in order: body
//! cap (413), signature (401), skew (401), per-remote rate limit (429),
//! parse (400). The 200 is written only after the source id is durably
//! marked seen and the envelope is enqueued; a full channel queue holds
//! the response, which is the back-pressure path (the gateway retries).

use crate::bridge::ChannelIngress;
use crate::config::WebhookConfig;
use crate::envelope::{Direction, Envelope, EnvelopeKind, MediaKind, MediaSource, Platform};
use crate::error::BridgeError;
use crate::storage::MessageStore;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use chrono::{TimeZone, Utc};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// State and router
// ---------------------------------------------------------------------------

pub struct WebhookState {
    secret: String,
    config: WebhookConfig,
    limiter: DefaultKeyedRateLimiter<String>,
    /// session → channel ingress; replaced atomically on config reload.
    routes: RwLock<HashMap<String, ChannelIngress>>,
    store: Arc<Mutex<MessageStore>>,
}

impl WebhookState {
    pub fn new(
        secret: String,
        config: WebhookConfig,
        routes: HashMap<String, ChannelIngress>,
        store: Arc<Mutex<MessageStore>>,
    ) -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(config.rate_limit_per_minute).expect("validated positive"),
        );
        WebhookState {
            secret,
            config,
            limiter: RateLimiter::keyed(quota),
            routes: RwLock::new(routes),
            store,
        }
    }

    /// Swap the channel routing table (config reload).
    pub async fn set_routes(&self, routes: HashMap<String, ChannelIngress>) {
        *self.routes.write().await = routes;
    }
}

pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/webhook/{session}", post(receive_webhook))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

async fn receive_webhook(
    State(state): State<Arc<WebhookState>>,
    Path(session): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    // 1. Body cap.
    let Ok(body) = axum::body::to_bytes(body, state.config.max_body_bytes).await else {
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    };

    // 2. Signature over "{timestamp}.{body}".
    let timestamp_raw = header_str(&headers, "x-timestamp").unwrap_or_default();
    let signature = header_str(&headers, "x-signature").unwrap_or_default();
    if !verify_signature(&state.secret, timestamp_raw, &body, signature) {
        debug!(session = %session, "webhook signature rejected");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    // 3. Signed timestamp within skew (anti-replay).
    let now = Utc::now().timestamp();
    let Ok(timestamp) = timestamp_raw.parse::<i64>() else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    if (now - timestamp).unsigned_abs() > state.config.max_skew.as_secs() {
        debug!(session = %session, timestamp, "webhook timestamp outside skew window");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    // 4. Per-remote rate limit.
    if state.limiter.check_key(&remote_key(&headers)).is_err() {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    // 5. Parse and hand to the channel worker.
    let Some(ingress) = state.routes.read().await.get(&session).cloned() else {
        debug!(session = %session, "webhook for unknown session");
        return StatusCode::BAD_REQUEST.into_response();
    };
    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            debug!(session = %session, error = %e, "webhook body malformed");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    let envelope = match translate_payload(payload, &ingress.channel) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(session = %session, error = %e, "webhook payload invalid");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    // Tombstone: a redelivered id is acknowledged without re-enqueueing.
    {
        let mut store = state.store.lock().await;
        match store.is_seen(&ingress.channel, Platform::WhatsApp, &envelope.source_id) {
            Ok(true) => {
                debug!(channel = %ingress.channel, source_id = %envelope.source_id, "webhook replay, already seen");
                return StatusCode::OK.into_response();
            }
            Ok(false) => {
                if let Err(e) = store.mark_seen(
                    &ingress.channel,
                    Platform::WhatsApp,
                    &envelope.source_id,
                    Utc::now(),
                ) {
                    warn!(channel = %ingress.channel, error = %e, "mark_seen failed");
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }
            }
            Err(e) => {
                warn!(channel = %ingress.channel, error = %e, "seen lookup failed");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        }
    }

    // Back-pressure: this send blocks while the channel queue is full,
    // holding the webhook response open until there is room.
    if ingress.sender.send(envelope).await.is_err() {
        warn!(channel = %ingress.channel, "channel worker gone");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    StatusCode::OK.into_response()
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Rate-limit key for the calling remote. The gateway sits behind a
/// forwarding proxy in every supported deployment, so the first
/// `X-Forwarded-For` hop identifies it; direct callers share one bucket.
fn remote_key(headers: &HeaderMap) -> String {
    header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| "direct".to_owned())
}

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

/// Compute the signature header value for a request. Exposed for the
/// gateway simulator in tests.
pub fn sign(secret: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time verification via `Mac::verify_slice`. An empty secret
/// rejects everything.
fn verify_signature(secret: &str, timestamp: &str, body: &[u8], header: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Some(hex_sig) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(sig) = hex::decode(hex_sig) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    mac.verify_slice(&sig).is_ok()
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Wire format the WhatsApp gateway posts to us.
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    /// Unique event id (message id for new messages, a distinct event id
    /// for edits, deletions, and reactions).
    pub id: String,
    /// `message` | `edited` | `deleted` | `reaction`
    pub event: String,
    pub from: String,
    #[serde(default)]
    pub group: bool,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub quoted_body: Option<String>,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub emoji: Option<String>,
    #[serde(default)]
    pub media: Option<MediaRef>,
    /// Unix seconds.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct MediaRef {
    pub url: String,
    pub kind: String,
}

fn translate_payload(payload: WebhookPayload, channel: &str) -> Result<Envelope, BridgeError> {
    let timestamp = payload
        .timestamp
        .and_then(|t| Utc.timestamp_opt(t, 0).single())
        .unwrap_or_else(Utc::now);

    let require_body = || {
        payload
            .body
            .clone()
            .ok_or_else(|| BridgeError::InvalidInput("missing body".to_owned()))
    };
    let require_target = || {
        payload
            .target_id
            .clone()
            .ok_or_else(|| BridgeError::InvalidInput("missing target_id".to_owned()))
    };

    let kind = match payload.event.as_str() {
        "message" => {
            if let Some(media) = &payload.media {
                let kind = MediaKind::parse(&media.kind).ok_or_else(|| {
                    BridgeError::InvalidInput(format!("unknown media kind '{}'", media.kind))
                })?;
                EnvelopeKind::Media {
                    kind,
                    source: MediaSource::Url(media.url.clone()),
                    caption: payload.body.clone().filter(|b| !b.is_empty()),
                }
            } else if let Some(reply_to) = &payload.reply_to {
                EnvelopeKind::Reply {
                    body: require_body()?,
                    reply_to: reply_to.clone(),
                    quoted: payload.quoted_body.clone(),
                }
            } else {
                EnvelopeKind::Text {
                    body: require_body()?,
                }
            }
        }
        "edited" => EnvelopeKind::Edit {
            target: require_target()?,
            new_body: require_body()?,
        },
        "deleted" => EnvelopeKind::Delete {
            target: require_target()?,
        },
        "reaction" => EnvelopeKind::React {
            target: require_target()?,
            emoji: payload
                .emoji
                .clone()
                .ok_or_else(|| BridgeError::InvalidInput("missing emoji".to_owned()))?,
        },
        other => {
            return Err(BridgeError::InvalidInput(format!(
                "unknown event type '{other}'"
            )));
        }
    };

    Ok(Envelope {
        channel: channel.to_owned(),
        source_id: payload.id,
        sender: payload.from,
        from_group: payload.group,
        direction: Direction::WhatsAppToSignal,
        timestamp,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trips_and_rejects_wrong_secret() {
        let body = br#"{"id":"A1"}"#;
        let header = sign("secret-one", "1700000000", body);
        assert!(verify_signature("secret-one", "1700000000", body, &header));
        assert!(!verify_signature("secret-two", "1700000000", body, &header));
        // Signature covers the timestamp.
        assert!(!verify_signature("secret-one", "1700000001", body, &header));
        // And the body.
        assert!(!verify_signature(
            "secret-one",
            "1700000000",
            br#"{"id":"A2"}"#,
            &header
        ));
    }

    #[test]
    fn malformed_signature_headers_are_rejected() {
        let body = b"{}";
        assert!(!verify_signature("secret", "0", body, ""));
        assert!(!verify_signature("secret", "0", body, "sha256="));
        assert!(!verify_signature("secret", "0", body, "sha256=zzzz"));
        assert!(!verify_signature("secret", "0", body, "md5=abcd"));
    }

    #[test]
    fn empty_secret_rejects_everything() {
        let body = b"{}";
        let header = sign("", "0", body);
        assert!(!verify_signature("", "0", body, &header));
    }

    #[test]
    fn remote_key_prefers_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        assert_eq!(remote_key(&headers), "direct");
        headers.insert(
            "x-forwarded-for",
            "203.0.113.7, 10.0.0.1".parse().unwrap(),
        );
        assert_eq!(remote_key(&headers), "203.0.113.7");
    }

    fn payload(json: serde_json::Value) -> WebhookPayload {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn text_payload_translates() {
        let env = translate_payload(
            payload(serde_json::json!({
                "id": "A1", "event": "message", "from": "wa-alice",
                "group": true, "body": "hello", "timestamp": 1700000000
            })),
            "main",
        )
        .unwrap();
        assert_eq!(env.channel, "main");
        assert_eq!(env.source_id, "A1");
        assert!(env.from_group);
        assert_eq!(env.direction, Direction::WhatsAppToSignal);
        assert_eq!(
            env.kind,
            EnvelopeKind::Text {
                body: "hello".to_owned()
            }
        );
    }

    #[test]
    fn media_payload_translates_with_caption() {
        let env = translate_payload(
            payload(serde_json::json!({
                "id": "A2", "event": "message", "from": "wa-alice",
                "body": "look at this",
                "media": { "url": "http://wa.local/media/A2", "kind": "image" }
            })),
            "main",
        )
        .unwrap();
        assert_eq!(
            env.kind,
            EnvelopeKind::Media {
                kind: MediaKind::Image,
                source: MediaSource::Url("http://wa.local/media/A2".to_owned()),
                caption: Some("look at this".to_owned()),
            }
        );
    }

    #[test]
    fn reply_edit_delete_reaction_translate() {
        let reply = translate_payload(
            payload(serde_json::json!({
                "id": "A3", "event": "message", "from": "wa-alice",
                "body": "agreed", "reply_to": "A1", "quoted_body": "hello"
            })),
            "main",
        )
        .unwrap();
        assert_eq!(
            reply.kind,
            EnvelopeKind::Reply {
                body: "agreed".to_owned(),
                reply_to: "A1".to_owned(),
                quoted: Some("hello".to_owned()),
            }
        );

        let edit = translate_payload(
            payload(serde_json::json!({
                "id": "A4", "event": "edited", "from": "wa-alice",
                "body": "fixed", "target_id": "A1"
            })),
            "main",
        )
        .unwrap();
        assert_eq!(
            edit.kind,
            EnvelopeKind::Edit {
                target: "A1".to_owned(),
                new_body: "fixed".to_owned(),
            }
        );

        let delete = translate_payload(
            payload(serde_json::json!({
                "id": "A5", "event": "deleted", "from": "wa-alice", "target_id": "A1"
            })),
            "main",
        )
        .unwrap();
        assert_eq!(
            delete.kind,
            EnvelopeKind::Delete {
                target: "A1".to_owned()
            }
        );

        let react = translate_payload(
            payload(serde_json::json!({
                "id": "A6", "event": "reaction", "from": "wa-alice",
                "target_id": "A1", "emoji": "👍"
            })),
            "main",
        )
        .unwrap();
        assert_eq!(
            react.kind,
            EnvelopeKind::React {
                target: "A1".to_owned(),
                emoji: "👍".to_owned(),
            }
        );
    }

    #[test]
    fn unknown_event_and_missing_fields_are_invalid() {
        let err = translate_payload(
            payload(serde_json::json!({
                "id": "A7", "event": "typing", "from": "wa-alice"
            })),
            "main",
        )
        .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidInput(_)));

        let err = translate_payload(
            payload(serde_json::json!({
                "id": "A8", "event": "message", "from": "wa-alice"
            })),
            "main",
        )
        .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidInput(_)));
    }
}
