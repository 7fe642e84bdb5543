//! Error types for the APX assistant

use thiserror::Error;

use crate::session::SessionState;

/// Result type alias for infrastructure operations
pub type Result<T> = std::result::Result<T, Error>;

/// Infrastructure errors (configuration, storage, devices, remote services)
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Why a turn submission failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailureKind {
    /// Connection could not be established or was dropped
    Network,
    /// No reply within the configured turn timeout
    Timeout,
    /// Backend answered with a non-success status
    Status(u16),
    /// Reply body could not be decoded
    Malformed,
}

impl std::fmt::Display for TransportFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network => write!(f, "network error"),
            Self::Timeout => write!(f, "timed out"),
            Self::Status(code) => write!(f, "status {code}"),
            Self::Malformed => write!(f, "malformed reply"),
        }
    }
}

/// Recoverable conversation failures reported by the device and transport adapters
///
/// None of these are fatal to a session: capture failures return the
/// controller to `Idle`, a transport failure produces the fallback reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversationError {
    /// No usable input device
    #[error("microphone unavailable: {0}")]
    CaptureUnavailable(String),

    /// Capture finished without any recognizable speech
    #[error("no speech detected")]
    CaptureEmpty,

    /// The platform refused microphone access
    #[error("microphone permission denied")]
    CapturePermissionDenied,

    /// The inference backend could not deliver a reply
    #[error("turn delivery failed: {0}")]
    TransportFailure(TransportFailureKind),

    /// Speech could not be synthesized or played
    #[error("playback unavailable: {0}")]
    PlaybackUnavailable(String),
}

impl ConversationError {
    /// Whether this error came from the capture side
    #[must_use]
    pub const fn is_capture(&self) -> bool {
        matches!(
            self,
            Self::CaptureUnavailable(_) | Self::CaptureEmpty | Self::CapturePermissionDenied
        )
    }
}

/// A session control request that was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ControlError {
    /// Another operation holds the session and this request does not preempt it
    #[error("session is busy ({state})")]
    Busy { state: SessionState },

    /// Submitted text was blank
    #[error("message is empty")]
    EmptyMessage,

    /// The operation named by the request is not the active one
    #[error("nothing to cancel (session is {state})")]
    NothingToCancel { state: SessionState },

    /// The controller has been torn down
    #[error("session closed")]
    SessionClosed,
}
