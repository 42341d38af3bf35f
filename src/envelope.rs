//! Normalized, platform-neutral representation of one inbound event.
//!
//! Both adapters translate their wire formats into [`Envelope`]; the bridge
//! engine matches exhaustively on [`EnvelopeKind`] and never sees
//! platform-specific payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which platform an id or event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    WhatsApp,
    Signal,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::WhatsApp => "whatsapp",
            Platform::Signal => "signal",
        }
    }
}

/// Forwarding direction of a bridged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    WhatsAppToSignal,
    SignalToWhatsApp,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::WhatsAppToSignal => "wa_to_signal",
            Direction::SignalToWhatsApp => "signal_to_wa",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "wa_to_signal" => Some(Direction::WhatsAppToSignal),
            "signal_to_wa" => Some(Direction::SignalToWhatsApp),
            _ => None,
        }
    }

    /// The platform the event originated on.
    pub fn source(self) -> Platform {
        match self {
            Direction::WhatsAppToSignal => Platform::WhatsApp,
            Direction::SignalToWhatsApp => Platform::Signal,
        }
    }
}

/// Attachment category; each carries its own size cap and MIME allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Document,
    Voice,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Document => "document",
            MediaKind::Voice => "voice",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "image" => Some(MediaKind::Image),
            "video" => Some(MediaKind::Video),
            "document" => Some(MediaKind::Document),
            "voice" => Some(MediaKind::Voice),
            _ => None,
        }
    }
}

/// Where the raw attachment bytes live before the cache ingests them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    /// Download from a URL (WhatsApp serves media over its API).
    Url(String),
    /// Read from a local file (the Signal RPC daemon stores attachments on disk).
    Local(std::path::PathBuf),
}

/// Event payload, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeKind {
    Text {
        body: String,
    },
    Media {
        kind: MediaKind,
        source: MediaSource,
        /// Caption accompanying the attachment, if any.
        caption: Option<String>,
    },
    Reply {
        body: String,
        /// Source-platform id of the message being replied to.
        reply_to: String,
        /// Snippet of the referenced message, if the platform included one.
        quoted: Option<String>,
    },
    Edit {
        /// Source-platform id of the message being edited.
        target: String,
        new_body: String,
    },
    Delete {
        target: String,
    },
    React {
        target: String,
        emoji: String,
    },
}

impl EnvelopeKind {
    pub fn label(&self) -> &'static str {
        match self {
            EnvelopeKind::Text { .. } => "text",
            EnvelopeKind::Media { .. } => "media",
            EnvelopeKind::Reply { .. } => "reply",
            EnvelopeKind::Edit { .. } => "edit",
            EnvelopeKind::Delete { .. } => "delete",
            EnvelopeKind::React { .. } => "react",
        }
    }
}

/// One normalized inbound event, attributed to a channel.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Channel key (the WhatsApp session name; unique across channels).
    pub channel: String,
    /// Platform-native id of the source event.
    pub source_id: String,
    /// Sender handle on the source platform.
    pub sender: String,
    /// True when the originating chat is a multi-party group.
    pub from_group: bool,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    pub kind: EnvelopeKind,
}

impl Envelope {
    /// Dedup key: source platform + native id, scoped per channel by the
    /// caller.
    pub fn dedup_key(&self) -> (Platform, String) {
        (self.direction.source(), self.source_id.clone())
    }
}
