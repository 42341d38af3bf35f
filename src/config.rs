//! Bridge configuration loading.
//!
//! JSON is the config source; a fixed set of environment variables
//! override individual fields after parsing. Raw serde structs (all
//! fields optional) are validated into an owned [`BridgeConfig`] with
//! defaults applied during validation.
//!
//! # Required fields
//! - `whatsapp.api_url`
//! - `signal.rpc_url`
//! - At least one `channels` entry; session names and destinations must
//!   each be unique across channels.
//!
//! # Environment overrides (exhaustive)
//! `WHATSAPP_API_URL`, `WHATSIGNAL_WHATSAPP_WEBHOOK_SECRET`,
//! `SIGNAL_RPC_URL`, `DB_PATH`, `MEDIA_DIR`, `WHATSIGNAL_ENV`.
//! `WHATSIGNAL_ENV=production` requires a webhook secret of at least 16
//! characters; any other value is development, where an empty secret is
//! tolerated with a warning.

use crate::error::BridgeError;
use crate::retry::RetryPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub whatsapp: WhatsAppConfig,
    pub signal: SignalConfig,
    pub database_path: PathBuf,
    pub media: MediaConfig,
    pub retention_days: u32,
    pub contact_cache_hours: u32,
    pub cleanup_interval_hours: u32,
    pub webhook: WebhookConfig,
    pub retry: RetryPolicy,
    pub queue_capacity: usize,
    pub shutdown_grace: Duration,
    pub channels: Vec<ChannelSpec>,
}

#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    pub api_url: String,
    pub webhook_secret: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub rpc_url: String,
    pub http_timeout: Duration,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    /// Directory where the Signal RPC daemon stores received attachments.
    pub attachments_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub cache_dir: PathBuf,
    /// Per-kind byte ceilings.
    pub limits: MediaLimits,
    /// Per-kind MIME allow-lists.
    pub allowed: AllowedTypes,
}

#[derive(Debug, Clone)]
pub struct MediaLimits {
    pub image: u64,
    pub video: u64,
    pub document: u64,
    pub voice: u64,
}

impl MediaLimits {
    pub fn for_kind(&self, kind: crate::envelope::MediaKind) -> u64 {
        use crate::envelope::MediaKind;
        match kind {
            MediaKind::Image => self.image,
            MediaKind::Video => self.video,
            MediaKind::Document => self.document,
            MediaKind::Voice => self.voice,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AllowedTypes {
    pub image: Vec<String>,
    pub video: Vec<String>,
    pub document: Vec<String>,
    pub voice: Vec<String>,
}

impl AllowedTypes {
    pub fn for_kind(&self, kind: crate::envelope::MediaKind) -> &[String] {
        use crate::envelope::MediaKind;
        match kind {
            MediaKind::Image => &self.image,
            MediaKind::Video => &self.video,
            MediaKind::Document => &self.document,
            MediaKind::Voice => &self.voice,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub bind: String,
    pub max_skew: Duration,
    pub rate_limit_per_minute: u32,
    pub max_body_bytes: usize,
}

/// One configured bridge channel: a WhatsApp session paired with a Signal
/// destination. Immutable after load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub whatsapp_session: String,
    pub signal_destination: String,
}

// ---------------------------------------------------------------------------
// Raw JSON deserialization types (all fields optional)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    whatsapp: Option<RawWhatsApp>,
    signal: Option<RawSignal>,
    database: Option<RawDatabase>,
    media: Option<RawMedia>,
    retention_days: Option<u32>,
    contact_cache_hours: Option<u32>,
    cleanup_interval_hours: Option<u32>,
    webhook: Option<RawWebhook>,
    retry: Option<RawRetry>,
    queue_capacity: Option<usize>,
    shutdown_grace_secs: Option<u64>,
    channels: Option<Vec<RawChannel>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawWhatsApp {
    api_url: Option<String>,
    webhook_secret: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSignal {
    rpc_url: Option<String>,
    http_timeout_secs: Option<u64>,
    poll_interval_secs: Option<u64>,
    poll_timeout_secs: Option<u64>,
    attachments_dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDatabase {
    path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMedia {
    cache_dir: Option<String>,
    max_size_mb: Option<RawMediaSizes>,
    allowed_types: Option<RawAllowedTypes>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMediaSizes {
    image: Option<u64>,
    video: Option<u64>,
    document: Option<u64>,
    voice: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAllowedTypes {
    image: Option<Vec<String>>,
    video: Option<Vec<String>>,
    document: Option<Vec<String>>,
    voice: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawWebhook {
    bind: Option<String>,
    max_skew_secs: Option<u64>,
    rate_limit_per_minute: Option<u32>,
    max_body_bytes: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRetry {
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    multiplier: Option<f64>,
    max_attempts: Option<u32>,
    jitter: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawChannel {
    whatsapp_session: Option<String>,
    signal_destination: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from a JSON file, applying environment overrides.
pub fn load_config_from_path(path: &Path) -> Result<BridgeConfig, BridgeError> {
    let json = std::fs::read_to_string(path).map_err(|e| {
        BridgeError::InvalidConfig(format!("reading config file '{}': {}", path.display(), e))
    })?;
    load_config_from_str(&json, |name| std::env::var(name).ok())
}

/// Load config from a JSON string with an injectable env lookup.
pub fn load_config_from_str(
    json: &str,
    env: impl Fn(&str) -> Option<String>,
) -> Result<BridgeConfig, BridgeError> {
    let mut raw: RawConfig = serde_json::from_str(json)
        .map_err(|e| BridgeError::InvalidConfig(format!("parse error: {e}")))?;
    apply_env_overrides(&mut raw, &env);
    validate(raw, &env)
}

fn missing(field: &str) -> BridgeError {
    BridgeError::InvalidConfig(format!("missing required field: {field}"))
}

fn invalid(msg: impl Into<String>) -> BridgeError {
    BridgeError::InvalidConfig(msg.into())
}

fn apply_env_overrides(raw: &mut RawConfig, env: &impl Fn(&str) -> Option<String>) {
    if let Some(v) = env("WHATSAPP_API_URL") {
        raw.whatsapp.get_or_insert_with(Default::default).api_url = Some(v);
    }
    if let Some(v) = env("WHATSIGNAL_WHATSAPP_WEBHOOK_SECRET") {
        raw.whatsapp
            .get_or_insert_with(Default::default)
            .webhook_secret = Some(v);
    }
    if let Some(v) = env("SIGNAL_RPC_URL") {
        raw.signal.get_or_insert_with(Default::default).rpc_url = Some(v);
    }
    if let Some(v) = env("DB_PATH") {
        raw.database.get_or_insert_with(Default::default).path = Some(v);
    }
    if let Some(v) = env("MEDIA_DIR") {
        raw.media.get_or_insert_with(Default::default).cache_dir = Some(v);
    }
}

fn validate(
    raw: RawConfig,
    env: &impl Fn(&str) -> Option<String>,
) -> Result<BridgeConfig, BridgeError> {
    // WhatsApp
    let raw_wa = raw.whatsapp.ok_or_else(|| missing("whatsapp"))?;
    let api_url = raw_wa.api_url.ok_or_else(|| missing("whatsapp.api_url"))?;
    let webhook_secret = raw_wa.webhook_secret.unwrap_or_default();
    let production = env("WHATSIGNAL_ENV").as_deref() == Some("production");
    if production && webhook_secret.len() < 16 {
        return Err(invalid(
            "whatsapp.webhook_secret must be at least 16 characters in production",
        ));
    }
    if !production && webhook_secret.is_empty() {
        warn!("webhook secret is empty; all webhook signatures will be rejected");
    }
    let whatsapp = WhatsAppConfig {
        api_url,
        webhook_secret,
        timeout: Duration::from_secs(raw_wa.timeout_secs.unwrap_or(30)),
    };

    // Signal
    let raw_sig = raw.signal.ok_or_else(|| missing("signal"))?;
    let rpc_url = raw_sig.rpc_url.ok_or_else(|| missing("signal.rpc_url"))?;
    let signal = SignalConfig {
        rpc_url,
        http_timeout: Duration::from_secs(raw_sig.http_timeout_secs.unwrap_or(60)),
        poll_interval: Duration::from_secs(raw_sig.poll_interval_secs.unwrap_or(5)),
        poll_timeout: Duration::from_secs(raw_sig.poll_timeout_secs.unwrap_or(10)),
        attachments_dir: PathBuf::from(
            raw_sig
                .attachments_dir
                .unwrap_or_else(|| "signal-attachments".to_owned()),
        ),
    };

    // Database + media
    let database_path = PathBuf::from(
        raw.database
            .and_then(|d| d.path)
            .unwrap_or_else(|| "whatsignal.db".to_owned()),
    );
    let raw_media = raw.media.unwrap_or_default();
    let sizes = raw_media.max_size_mb.unwrap_or_default();
    let mb = |v: Option<u64>, default: u64| v.unwrap_or(default) * 1024 * 1024;
    let limits = MediaLimits {
        image: mb(sizes.image, 8),
        video: mb(sizes.video, 64),
        document: mb(sizes.document, 128),
        voice: mb(sizes.voice, 16),
    };
    if limits.image == 0 || limits.video == 0 || limits.document == 0 || limits.voice == 0 {
        return Err(invalid("media.max_size_mb entries must be positive"));
    }
    let allowed_raw = raw_media.allowed_types.unwrap_or_default();
    let list = |v: Option<Vec<String>>, defaults: &[&str]| {
        v.unwrap_or_else(|| defaults.iter().map(|s| (*s).to_owned()).collect())
    };
    let allowed = AllowedTypes {
        image: list(
            allowed_raw.image,
            &["image/jpeg", "image/png", "image/gif", "image/webp"],
        ),
        video: list(allowed_raw.video, &["video/mp4", "video/quicktime"]),
        document: list(allowed_raw.document, &["application/pdf", "application/zip"]),
        voice: list(allowed_raw.voice, &["audio/ogg", "audio/mpeg", "audio/mp4"]),
    };
    let media = MediaConfig {
        cache_dir: PathBuf::from(
            raw_media
                .cache_dir
                .unwrap_or_else(|| "media-cache".to_owned()),
        ),
        limits,
        allowed,
    };

    // Retention and timers
    let retention_days = raw.retention_days.unwrap_or(30);
    if retention_days == 0 {
        return Err(invalid("retention_days must be positive"));
    }
    let contact_cache_hours = raw.contact_cache_hours.unwrap_or(24);
    let cleanup_interval_hours = raw.cleanup_interval_hours.unwrap_or(6);
    if cleanup_interval_hours == 0 {
        return Err(invalid("cleanup_interval_hours must be positive"));
    }

    // Webhook
    let raw_hook = raw.webhook.unwrap_or_default();
    let rate_limit_per_minute = raw_hook.rate_limit_per_minute.unwrap_or(120);
    if rate_limit_per_minute == 0 {
        return Err(invalid("webhook.rate_limit_per_minute must be positive"));
    }
    let webhook = WebhookConfig {
        bind: raw_hook.bind.unwrap_or_else(|| "0.0.0.0:8080".to_owned()),
        max_skew: Duration::from_secs(raw_hook.max_skew_secs.unwrap_or(300)),
        rate_limit_per_minute,
        max_body_bytes: raw_hook.max_body_bytes.unwrap_or(1024 * 1024),
    };

    // Retry
    let raw_retry = raw.retry.unwrap_or_default();
    let max_attempts = raw_retry.max_attempts.unwrap_or(5);
    if max_attempts == 0 {
        return Err(invalid("retry.max_attempts must be positive"));
    }
    let retry = RetryPolicy {
        initial_backoff: Duration::from_millis(raw_retry.initial_backoff_ms.unwrap_or(500)),
        max_backoff: Duration::from_millis(raw_retry.max_backoff_ms.unwrap_or(30_000)),
        multiplier: raw_retry.multiplier.unwrap_or(2.0),
        max_attempts,
        jitter: raw_retry.jitter.unwrap_or(true),
    };

    // Channels: both halves unique across the set
    let raw_channels = raw.channels.ok_or_else(|| missing("channels"))?;
    if raw_channels.is_empty() {
        return Err(invalid("at least one channels entry is required"));
    }
    let mut channels = Vec::with_capacity(raw_channels.len());
    for (i, c) in raw_channels.into_iter().enumerate() {
        let whatsapp_session = c
            .whatsapp_session
            .ok_or_else(|| missing(&format!("channels[{i}].whatsapp_session")))?;
        let signal_destination = c
            .signal_destination
            .ok_or_else(|| missing(&format!("channels[{i}].signal_destination")))?;
        channels.push(ChannelSpec {
            whatsapp_session,
            signal_destination,
        });
    }
    for i in 0..channels.len() {
        for j in (i + 1)..channels.len() {
            if channels[i].whatsapp_session == channels[j].whatsapp_session {
                return Err(invalid(format!(
                    "duplicate whatsapp_session '{}' across channels",
                    channels[i].whatsapp_session
                )));
            }
            if channels[i].signal_destination == channels[j].signal_destination {
                return Err(invalid(format!(
                    "duplicate signal_destination '{}' across channels",
                    channels[i].signal_destination
                )));
            }
        }
    }

    Ok(BridgeConfig {
        whatsapp,
        signal,
        database_path,
        media,
        retention_days,
        contact_cache_hours,
        cleanup_interval_hours,
        webhook,
        retry,
        queue_capacity: raw.queue_capacity.unwrap_or(64),
        shutdown_grace: Duration::from_secs(raw.shutdown_grace_secs.unwrap_or(20)),
        channels,
    })
}
