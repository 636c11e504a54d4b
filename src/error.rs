//! # Error Handling
//!
//! Error types for the live session core. Every failure that can end a session
//! attempt is represented here and classified into an [`ErrorKind`], which is what
//! the session phase carries once a session has errored.
//!
//! ## Taxonomy:
//! - **Permission**: microphone access refused
//! - **Device**: no capture or playback device available
//! - **RateLimited**: the connection gate denied the attempt
//! - **Handshake** / **ServiceUnavailable**: the remote channel failed to open
//! - **Network**: the channel failed after it was open
//! - **Config** / **Internal**: local problems
//!
//! Errors never escape `SessionManager::connect()` / `disconnect()`. They are
//! reported once through the status callback and drive teardown instead.

use std::fmt;
use std::time::Duration;

use tokio_tungstenite::tungstenite;

/// Copyable classification of a [`SessionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Permission,
    Device,
    RateLimited,
    Handshake,
    ServiceUnavailable,
    Network,
    Config,
    Internal,
}

impl ErrorKind {
    /// Machine-readable name, stable across persona and locale changes.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Permission => "permission_denied",
            ErrorKind::Device => "device_not_found",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Handshake => "handshake_failed",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::Network => "network_error",
            ErrorKind::Config => "config_error",
            ErrorKind::Internal => "internal_error",
        }
    }
}

/// Errors produced while opening or running a live session.
///
/// ## Usage Example:
/// ```rust
/// use lexai_live::error::{ErrorKind, SessionError};
///
/// let err = SessionError::Device("no microphone attached".to_string());
/// assert_eq!(err.kind(), ErrorKind::Device);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Capture device access was refused
    Permission(String),

    /// No usable capture or playback device
    Device(String),

    /// Too many connection attempts inside the sliding window
    RateLimited { retry_after: Duration },

    /// The remote channel could not be opened
    Handshake(String),

    /// The remote service answered with a busy / unavailable class of error
    ServiceUnavailable(String),

    /// The channel failed after it was open
    Network(String),

    /// Configuration file or environment problems
    Config(String),

    /// Anything else
    Internal(String),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Permission(_) => ErrorKind::Permission,
            SessionError::Device(_) => ErrorKind::Device,
            SessionError::RateLimited { .. } => ErrorKind::RateLimited,
            SessionError::Handshake(_) => ErrorKind::Handshake,
            SessionError::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            SessionError::Network(_) => ErrorKind::Network,
            SessionError::Config(_) => ErrorKind::Config,
            SessionError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// How long the caller should wait before trying again, if known.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SessionError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Permission(msg) => write!(f, "Permission denied: {}", msg),
            SessionError::Device(msg) => write!(f, "Device error: {}", msg),
            SessionError::RateLimited { retry_after } => write!(
                f,
                "Rate limited: retry in {:.1}s",
                retry_after.as_secs_f64()
            ),
            SessionError::Handshake(msg) => write!(f, "Handshake failed: {}", msg),
            SessionError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
            SessionError::Network(msg) => write!(f, "Network error: {}", msg),
            SessionError::Config(msg) => write!(f, "Configuration error: {}", msg),
            SessionError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<anyhow::Error> for SessionError {
    fn from(err: anyhow::Error) -> Self {
        SessionError::Internal(err.to_string())
    }
}

/// Malformed server messages are a channel problem, not a local one.
impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Network(format!("malformed message: {}", err))
    }
}

impl From<base64::DecodeError> for SessionError {
    fn from(err: base64::DecodeError) -> Self {
        SessionError::Network(format!("invalid audio payload encoding: {}", err))
    }
}

impl From<config::ConfigError> for SessionError {
    fn from(err: config::ConfigError) -> Self {
        SessionError::Config(err.to_string())
    }
}

impl From<rubato::ResamplerConstructionError> for SessionError {
    fn from(err: rubato::ResamplerConstructionError) -> Self {
        SessionError::Device(format!("unsupported sample rate conversion: {}", err))
    }
}

impl From<rubato::ResampleError> for SessionError {
    fn from(err: rubato::ResampleError) -> Self {
        SessionError::Internal(format!("resampling failed: {}", err))
    }
}

/// Conversion for failures on an already open channel.
///
/// Handshake failures are classified separately by the connector, see
/// `websocket::classify_handshake_error`.
impl From<tungstenite::Error> for SessionError {
    fn from(err: tungstenite::Error) -> Self {
        match &err {
            tungstenite::Error::Http(response) if is_busy_status(response.status().as_u16()) => {
                SessionError::ServiceUnavailable(format!("HTTP {}", response.status()))
            }
            tungstenite::Error::Url(e) => SessionError::Config(format!("invalid endpoint: {}", e)),
            _ => SessionError::Network(err.to_string()),
        }
    }
}

/// HTTP status codes that mean "try again later" rather than "you did it wrong".
pub(crate) fn is_busy_status(status: u16) -> bool {
    matches!(status, 429 | 502 | 503 | 504)
}

/// Type alias for Results that use [`SessionError`].
pub type SessionResult<T> = Result<T, SessionError>;
