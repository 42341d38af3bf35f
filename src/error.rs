//! Crate-wide error taxonomy.
//!
//! Every failure in the bridge maps to one of these kinds. Each kind knows
//! whether it is worth retrying (`retryable`), which is the default
//! predicate the retry executor uses. Adapters classify upstream HTTP
//! statuses here so the rest of the crate never inspects raw status codes.

use thiserror::Error;

/// Reason a media attachment was refused by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaRejectReason {
    TooLarge,
    DisallowedType,
}

impl std::fmt::Display for MediaRejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaRejectReason::TooLarge => write!(f, "too_large"),
            MediaRejectReason::DisallowedType => write!(f, "disallowed_type"),
        }
    }
}

/// Errors produced anywhere in the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rate limited")]
    RateLimited,

    #[error("timeout: {0}")]
    Timeout(String),

    /// WhatsApp API failure. `status` is `None` for transport-level errors.
    #[error("whatsapp upstream error (status {status:?}): {message}")]
    UpstreamWhatsApp { status: Option<u16>, message: String },

    /// Signal RPC failure. `status` is `None` for transport-level errors.
    #[error("signal upstream error (status {status:?}): {message}")]
    UpstreamSignal { status: Option<u16>, message: String },

    #[error("storage error (transient): {0}")]
    StorageTransient(String),

    #[error("storage error (fatal): {0}")]
    StorageFatal(String),

    #[error("media rejected: {0}")]
    MediaRejected(MediaRejectReason),

    #[error("media io error: {0}")]
    MediaIo(String),

    /// The ambient shutdown signal fired while an operation was in flight.
    #[error("cancelled by shutdown")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Whether a retry of the failed operation could plausibly succeed.
    ///
    /// Upstream errors retry on transport failures and on 408/429/5xx
    /// gateway-ish statuses; other 4xx are deterministic and do not.
    pub fn retryable(&self) -> bool {
        match self {
            BridgeError::RateLimited
            | BridgeError::Timeout(_)
            | BridgeError::StorageTransient(_)
            | BridgeError::MediaIo(_) => true,
            BridgeError::UpstreamWhatsApp { status, .. }
            | BridgeError::UpstreamSignal { status, .. } => match status {
                None => true,
                Some(s) => matches!(s, 408 | 429 | 500 | 502 | 503 | 504),
            },
            _ => false,
        }
    }

    /// Operator-facing message; includes the kind and full detail.
    pub fn operator_message(&self) -> String {
        self.to_string()
    }

    /// User-facing message; never leaks upstream detail.
    pub fn user_message(&self) -> &'static str {
        match self {
            BridgeError::MediaRejected(MediaRejectReason::TooLarge) => "attachment too large",
            BridgeError::MediaRejected(MediaRejectReason::DisallowedType) => {
                "attachment type not allowed"
            }
            _ => "message could not be delivered",
        }
    }
}

impl From<rusqlite::Error> for BridgeError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &e {
            rusqlite::Error::SqliteFailure(code, _) => match code.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    BridgeError::StorageTransient(e.to_string())
                }
                ErrorCode::ConstraintViolation => BridgeError::Conflict(e.to_string()),
                _ => BridgeError::StorageFatal(e.to_string()),
            },
            rusqlite::Error::QueryReturnedNoRows => BridgeError::NotFound(e.to_string()),
            _ => BridgeError::StorageFatal(e.to_string()),
        }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::MediaIo(e.to_string())
    }
}

/// Classify a reqwest failure against the WhatsApp API.
pub fn whatsapp_http_error(e: &reqwest::Error) -> BridgeError {
    if e.is_timeout() {
        return BridgeError::Timeout(e.to_string());
    }
    BridgeError::UpstreamWhatsApp {
        status: e.status().map(|s| s.as_u16()),
        message: e.to_string(),
    }
}

/// Classify a reqwest failure against the Signal RPC endpoint.
pub fn signal_http_error(e: &reqwest::Error) -> BridgeError {
    if e.is_timeout() {
        return BridgeError::Timeout(e.to_string());
    }
    BridgeError::UpstreamSignal {
        status: e.status().map(|s| s.as_u16()),
        message: e.to_string(),
    }
}
