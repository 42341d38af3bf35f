//! Signal adapter.
//!
//! Talks JSON-RPC to the Signal daemon: `receive` long-poll inbound,
//! `send` / `sendReaction` / `remoteDelete` outbound. Signal has no remote
//! edit; the engine falls back to a new message. Message ids on this side
//! are the sender timestamps the protocol uses for correlation, carried as
//! strings.
//!
//! [`run_poll_loop`] drains the whole account and routes each inbound
//! message to the channel whose destination matches the sender; messages
//! from unconfigured peers are ignored.

use crate::bridge::ChannelIngress;
use crate::config::SignalConfig;
use crate::envelope::{Direction, Envelope, EnvelopeKind, MediaKind, MediaSource, Platform};
use crate::error::{BridgeError, signal_http_error};
use crate::retry::{self, RetryPolicy};
use crate::shutdown::Shutdown;
use crate::storage::MessageStore;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// An outbound Signal message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingSignal {
    pub body: String,
    /// Signal timestamp-id of the message this one replies to.
    pub reply_to: Option<String>,
    /// Local path of a cached attachment.
    pub attachment: Option<String>,
}

/// One normalized inbound Signal event, before channel attribution.
#[derive(Debug, Clone)]
pub struct SignalInbound {
    /// Sender phone number.
    pub source: String,
    /// Event timestamp-id, unique per event.
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: EnvelopeKind,
}

/// Outbound operations against the Signal daemon.
#[async_trait]
pub trait SignalApi: Send + Sync {
    /// Send a message; returns the new Signal timestamp-id.
    async fn send(&self, destination: &str, out: &OutgoingSignal) -> Result<String, BridgeError>;

    async fn react(
        &self,
        destination: &str,
        target_id: &str,
        emoji: &str,
    ) -> Result<(), BridgeError>;

    async fn remote_delete(&self, destination: &str, target_id: &str) -> Result<(), BridgeError>;

    /// Long-poll for inbound events across the whole account.
    async fn receive(&self, timeout: Duration) -> Result<Vec<SignalInbound>, BridgeError>;
}

// ---------------------------------------------------------------------------
// JSON-RPC client
// ---------------------------------------------------------------------------

pub struct SignalRpcClient {
    http: reqwest::Client,
    rpc_url: String,
    attachments_dir: PathBuf,
}

impl SignalRpcClient {
    pub fn new(cfg: &SignalConfig) -> Result<Self, BridgeError> {
        let http = reqwest::Client::builder()
            .timeout(cfg.http_timeout)
            .build()
            .map_err(|e| BridgeError::Internal(format!("building http client: {e}")))?;
        Ok(SignalRpcClient {
            http,
            rpc_url: cfg.rpc_url.clone(),
            attachments_dir: cfg.attachments_dir.clone(),
        })
    }

    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, BridgeError> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": uuid::Uuid::new_v4().to_string(),
            "method": method,
            "params": params,
        });
        let resp = self
            .http
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| signal_http_error(&e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BridgeError::UpstreamSignal {
                status: Some(status.as_u16()),
                message: body,
            });
        }
        let body: RpcResponse = resp.json().await.map_err(|e| signal_http_error(&e))?;
        if let Some(err) = body.error {
            return Err(BridgeError::UpstreamSignal {
                status: None,
                message: format!("rpc error {}: {}", err.code, err.message),
            });
        }
        Ok(body.result.unwrap_or(serde_json::Value::Null))
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<serde_json::Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[async_trait]
impl SignalApi for SignalRpcClient {
    async fn send(&self, destination: &str, out: &OutgoingSignal) -> Result<String, BridgeError> {
        let mut params = json!({
            "recipient": [destination],
            "message": out.body,
        });
        if let Some(reply_to) = &out.reply_to {
            params["quoteTimestamp"] = parse_timestamp_id(reply_to)?.into();
        }
        if let Some(attachment) = &out.attachment {
            params["attachments"] = json!([attachment]);
        }
        let result = self.call("send", params).await?;
        let timestamp = result
            .get("timestamp")
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| BridgeError::UpstreamSignal {
                status: None,
                message: "send result missing timestamp".to_owned(),
            })?;
        debug!(destination, signal_id = timestamp, "signal message sent");
        Ok(timestamp.to_string())
    }

    async fn react(
        &self,
        destination: &str,
        target_id: &str,
        emoji: &str,
    ) -> Result<(), BridgeError> {
        self.call(
            "sendReaction",
            json!({
                "recipient": [destination],
                "targetAuthor": destination,
                "targetTimestamp": parse_timestamp_id(target_id)?,
                "emoji": emoji,
            }),
        )
        .await?;
        Ok(())
    }

    async fn remote_delete(&self, destination: &str, target_id: &str) -> Result<(), BridgeError> {
        self.call(
            "remoteDelete",
            json!({
                "recipient": [destination],
                "targetTimestamp": parse_timestamp_id(target_id)?,
            }),
        )
        .await?;
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Result<Vec<SignalInbound>, BridgeError> {
        let result = self
            .call("receive", json!({ "timeout": timeout.as_secs() }))
            .await?;
        let raw: Vec<RawReceiveEntry> = serde_json::from_value(result).map_err(|e| {
            BridgeError::UpstreamSignal {
                status: None,
                message: format!("bad receive payload: {e}"),
            }
        })?;
        let mut inbound = Vec::new();
        for entry in raw {
            match translate_receive_entry(entry, &self.attachments_dir) {
                Some(event) => inbound.push(event),
                None => debug!("ignoring non-message receive entry"),
            }
        }
        Ok(inbound)
    }
}

fn parse_timestamp_id(id: &str) -> Result<i64, BridgeError> {
    id.parse::<i64>()
        .map_err(|_| BridgeError::InvalidInput(format!("not a signal timestamp id: '{id}'")))
}

// ---------------------------------------------------------------------------
// Inbound wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawReceiveEntry {
    envelope: Option<RawEnvelope>,
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    source: Option<String>,
    timestamp: Option<i64>,
    #[serde(rename = "dataMessage")]
    data_message: Option<RawDataMessage>,
    #[serde(rename = "editMessage")]
    edit_message: Option<RawEditMessage>,
}

#[derive(Debug, Deserialize)]
struct RawDataMessage {
    message: Option<String>,
    #[serde(default)]
    attachments: Vec<RawAttachment>,
    quote: Option<RawQuote>,
    reaction: Option<RawReaction>,
    #[serde(rename = "remoteDelete")]
    remote_delete: Option<RawRemoteDelete>,
}

#[derive(Debug, Deserialize)]
struct RawAttachment {
    id: String,
    #[serde(rename = "contentType")]
    content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawQuote {
    id: i64,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawReaction {
    emoji: String,
    #[serde(rename = "targetSentTimestamp")]
    target_sent_timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct RawRemoteDelete {
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct RawEditMessage {
    #[serde(rename = "targetSentTimestamp")]
    target_sent_timestamp: i64,
    #[serde(rename = "dataMessage")]
    data_message: Option<RawDataMessage>,
}

fn media_kind_for(content_type: &str) -> MediaKind {
    if content_type.starts_with("image/") {
        MediaKind::Image
    } else if content_type.starts_with("video/") {
        MediaKind::Video
    } else if content_type.starts_with("audio/") {
        MediaKind::Voice
    } else {
        MediaKind::Document
    }
}

fn translate_receive_entry(
    entry: RawReceiveEntry,
    attachments_dir: &std::path::Path,
) -> Option<SignalInbound> {
    let envelope = entry.envelope?;
    let source = envelope.source?;
    let ts_millis = envelope.timestamp?;
    let timestamp = Utc
        .timestamp_millis_opt(ts_millis)
        .single()
        .unwrap_or_else(Utc::now);
    let id = ts_millis.to_string();

    if let Some(edit) = envelope.edit_message {
        let new_body = edit.data_message.and_then(|d| d.message)?;
        return Some(SignalInbound {
            source,
            id,
            timestamp,
            kind: EnvelopeKind::Edit {
                target: edit.target_sent_timestamp.to_string(),
                new_body,
            },
        });
    }

    let data = envelope.data_message?;
    if let Some(delete) = data.remote_delete {
        return Some(SignalInbound {
            source,
            id,
            timestamp,
            kind: EnvelopeKind::Delete {
                target: delete.timestamp.to_string(),
            },
        });
    }
    if let Some(reaction) = data.reaction {
        return Some(SignalInbound {
            source,
            id,
            timestamp,
            kind: EnvelopeKind::React {
                target: reaction.target_sent_timestamp.to_string(),
                emoji: reaction.emoji,
            },
        });
    }
    if let Some(attachment) = data.attachments.first() {
        let content_type = attachment.content_type.as_deref().unwrap_or("");
        return Some(SignalInbound {
            source,
            id,
            timestamp,
            kind: EnvelopeKind::Media {
                kind: media_kind_for(content_type),
                source: MediaSource::Local(attachments_dir.join(&attachment.id)),
                caption: data.message.filter(|m| !m.is_empty()),
            },
        });
    }
    if let Some(quote) = data.quote {
        let body = data.message?;
        return Some(SignalInbound {
            source,
            id,
            timestamp,
            kind: EnvelopeKind::Reply {
                body,
                reply_to: quote.id.to_string(),
                quoted: quote.text,
            },
        });
    }
    let body = data.message.filter(|m| !m.is_empty())?;
    Some(SignalInbound {
        source,
        id,
        timestamp,
        kind: EnvelopeKind::Text { body },
    })
}

// ---------------------------------------------------------------------------
// Poll loop
// ---------------------------------------------------------------------------

/// Long-poll the account and fan inbound events out to channel queues.
///
/// `routes` maps a Signal destination (peer number) to its channel
/// ingress. The loop honors shutdown within one poll timeout; transient
/// receive failures are retried, and persistent failure flips `degraded`
/// while the loop keeps going.
pub async fn run_poll_loop(
    api: Arc<dyn SignalApi>,
    routes: HashMap<String, ChannelIngress>,
    store: Arc<Mutex<MessageStore>>,
    poll_interval: Duration,
    poll_timeout: Duration,
    retry_policy: RetryPolicy,
    degraded: Arc<AtomicBool>,
    mut shutdown: Shutdown,
) {
    info!(channels = routes.len(), "signal poll loop started");
    loop {
        if shutdown.is_raised() {
            break;
        }

        let batch = retry::retry(&retry_policy, &shutdown, "signal_receive", |_| {
            let api = api.clone();
            async move { api.receive(poll_timeout).await }
        })
        .await;

        match batch {
            Ok(events) => {
                degraded.store(false, Ordering::SeqCst);
                for event in events {
                    route_inbound(&routes, &store, event).await;
                }
            }
            Err(BridgeError::Cancelled) => break,
            Err(e) => {
                error!(error = %e, "signal receive failing persistently");
                degraded.store(true, Ordering::SeqCst);
            }
        }

        tokio::select! {
            biased;
            _ = shutdown.raised() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
    info!("signal poll loop stopped");
}

async fn route_inbound(
    routes: &HashMap<String, ChannelIngress>,
    store: &Arc<Mutex<MessageStore>>,
    event: SignalInbound,
) {
    let Some(ingress) = routes.get(&event.source) else {
        debug!(source = %event.source, "inbound from unconfigured signal peer, ignoring");
        return;
    };

    // Tombstone first: a replayed id is acknowledged without re-enqueueing.
    {
        let mut store = store.lock().await;
        match store.is_seen(&ingress.channel, Platform::Signal, &event.id) {
            Ok(true) => {
                debug!(channel = %ingress.channel, source_id = %event.id, "signal event already seen");
                return;
            }
            Ok(false) => {
                if let Err(e) =
                    store.mark_seen(&ingress.channel, Platform::Signal, &event.id, Utc::now())
                {
                    warn!(channel = %ingress.channel, source_id = %event.id, error = %e, "mark_seen failed");
                }
            }
            Err(e) => {
                warn!(channel = %ingress.channel, source_id = %event.id, error = %e, "seen lookup failed");
            }
        }
    }

    let envelope = Envelope {
        channel: ingress.channel.clone(),
        source_id: event.id,
        sender: event.source,
        from_group: false,
        direction: Direction::SignalToWhatsApp,
        timestamp: event.timestamp,
        kind: event.kind,
    };
    // Back-pressure: a full queue parks the poller here, which also stops
    // the cursor from advancing past unprocessed work.
    if ingress.sender.send(envelope).await.is_err() {
        warn!(channel = %ingress.channel, "channel worker gone, dropping inbound");
    }
}
