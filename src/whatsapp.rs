//! WhatsApp adapter, client half.
//!
//! Talks to the WhatsApp gateway's REST API. The inbound half (webhook
//! receiver) lives in `webhook`. All operations here are single HTTP
//! calls; callers wrap them in the retry executor.
//!
//! The [`WhatsAppApi`] trait is the seam the engine and the tests use; the
//! real client is [`WhatsAppClient`].

use crate::config::WhatsAppConfig;
use crate::contacts::ContactSource;
use crate::error::{BridgeError, whatsapp_http_error};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// An outbound WhatsApp message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutgoingWhatsApp {
    pub body: String,
    /// WhatsApp id of the message this one replies to.
    pub reply_to: Option<String>,
    /// Local path of a cached attachment to upload.
    pub media_path: Option<String>,
    /// Idempotency key; equals the source envelope id.
    pub correlation_id: String,
}

/// Result of the session health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Working,
    Degraded,
    Offline,
}

/// Outbound operations against the WhatsApp gateway.
#[async_trait]
pub trait WhatsAppApi: Send + Sync {
    /// Send a message; returns the new WhatsApp message id.
    async fn send_message(
        &self,
        session: &str,
        out: &OutgoingWhatsApp,
    ) -> Result<String, BridgeError>;

    async fn edit_message(
        &self,
        session: &str,
        wa_id: &str,
        new_body: &str,
    ) -> Result<(), BridgeError>;

    async fn delete_message(&self, session: &str, wa_id: &str) -> Result<(), BridgeError>;

    async fn react(&self, session: &str, wa_id: &str, emoji: &str) -> Result<(), BridgeError>;

    async fn session_health(&self, session: &str) -> Result<SessionStatus, BridgeError>;
}

// ---------------------------------------------------------------------------
// REST client
// ---------------------------------------------------------------------------

pub struct WhatsAppClient {
    http: reqwest::Client,
    base_url: String,
}

impl WhatsAppClient {
    pub fn new(cfg: &WhatsAppConfig) -> Result<Self, BridgeError> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| BridgeError::Internal(format!("building http client: {e}")))?;
        Ok(WhatsAppClient {
            http,
            base_url: cfg.api_url.trim_end_matches('/').to_owned(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Map a non-2xx response to an error kind. Retryability follows from
    /// the kind, so callers can hand failures straight to the retry
    /// executor.
    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, BridgeError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(match status.as_u16() {
            401 | 403 => BridgeError::Unauthorized(body),
            404 => BridgeError::NotFound(body),
            429 => BridgeError::RateLimited,
            code => BridgeError::UpstreamWhatsApp {
                status: Some(code),
                message: body,
            },
        })
    }
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
struct ContactResponse {
    display_name: Option<String>,
}

#[async_trait]
impl WhatsAppApi for WhatsAppClient {
    async fn send_message(
        &self,
        session: &str,
        out: &OutgoingWhatsApp,
    ) -> Result<String, BridgeError> {
        let resp = self
            .http
            .post(self.url(&format!("/api/sessions/{session}/messages")))
            .json(out)
            .send()
            .await
            .map_err(|e| whatsapp_http_error(&e))?;
        let resp = Self::check(resp).await?;
        let parsed: SendResponse = resp
            .json()
            .await
            .map_err(|e| whatsapp_http_error(&e))?;
        debug!(session, wa_id = %parsed.id, "whatsapp message sent");
        Ok(parsed.id)
    }

    async fn edit_message(
        &self,
        session: &str,
        wa_id: &str,
        new_body: &str,
    ) -> Result<(), BridgeError> {
        let resp = self
            .http
            .put(self.url(&format!("/api/sessions/{session}/messages/{wa_id}")))
            .json(&serde_json::json!({ "body": new_body }))
            .send()
            .await
            .map_err(|e| whatsapp_http_error(&e))?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn delete_message(&self, session: &str, wa_id: &str) -> Result<(), BridgeError> {
        let resp = self
            .http
            .delete(self.url(&format!("/api/sessions/{session}/messages/{wa_id}")))
            .send()
            .await
            .map_err(|e| whatsapp_http_error(&e))?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn react(&self, session: &str, wa_id: &str, emoji: &str) -> Result<(), BridgeError> {
        let resp = self
            .http
            .post(self.url(&format!(
                "/api/sessions/{session}/messages/{wa_id}/reactions"
            )))
            .json(&serde_json::json!({ "emoji": emoji }))
            .send()
            .await
            .map_err(|e| whatsapp_http_error(&e))?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn session_health(&self, session: &str) -> Result<SessionStatus, BridgeError> {
        let resp = self
            .http
            .get(self.url(&format!("/api/sessions/{session}/status")))
            .send()
            .await
            .map_err(|e| whatsapp_http_error(&e))?;
        let resp = Self::check(resp).await?;
        let parsed: StatusResponse = resp
            .json()
            .await
            .map_err(|e| whatsapp_http_error(&e))?;
        Ok(match parsed.status.as_str() {
            "working" => SessionStatus::Working,
            "offline" => SessionStatus::Offline,
            _ => SessionStatus::Degraded,
        })
    }
}

#[async_trait]
impl ContactSource for WhatsAppClient {
    async fn fetch(&self, handle: &str) -> Result<Option<String>, BridgeError> {
        let resp = self
            .http
            .get(self.url(&format!("/api/contacts/{handle}")))
            .send()
            .await
            .map_err(|e| whatsapp_http_error(&e))?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        let resp = Self::check(resp).await?;
        let parsed: ContactResponse = resp
            .json()
            .await
            .map_err(|e| whatsapp_http_error(&e))?;
        Ok(parsed.display_name)
    }
}
