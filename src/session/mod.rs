//! Conversation session: data model and the controller that drives it
//!
//! A session coordinates three overlapping activities (listening, thinking,
//! speaking) into single conversational turns. Exactly one of them is
//! active at a time; see [`SessionController`].

mod client;
mod controller;

use std::fmt;

use chrono::{DateTime, Utc};

use crate::ConversationError;

pub use client::SessionClient;
pub use controller::{ControllerSettings, SessionController};

/// Assistant text used when a turn could not be delivered
pub const FALLBACK_REPLY: &str = "Connection error. Call emergency services if urgent.";

/// Assistant text used when the backend replies without content
pub const EMPTY_REPLY: &str = "Please call emergency services.";

/// Which activity the session is engaged in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// Resting state, no operation outstanding
    #[default]
    Idle,
    /// Capturing an utterance from the microphone
    Listening,
    /// Waiting for the inference backend
    Submitting,
    /// Playing the assistant reply
    Speaking,
}

impl SessionState {
    /// Name used in logs and the CLI
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Submitting => "submitting",
            Self::Speaking => "speaking",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Author of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// How a user message entered the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputOrigin {
    /// Transcribed from the microphone
    Voice,
    /// Typed by the user
    Text,
}

impl InputOrigin {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Voice => "voice",
            Self::Text => "text",
        }
    }

    /// Parse a stored origin name
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "voice" => Some(Self::Voice),
            "text" => Some(Self::Text),
            _ => None,
        }
    }
}

/// One message in the transcript
///
/// Turns are immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    role: Role,
    content: String,
    timestamp: DateTime<Utc>,
}

impl Turn {
    pub(crate) fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Opaque token identifying one in-flight capture, submission, or playback
///
/// Handles are never reused within a session, so a completion carrying an
/// older handle can always be recognized as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationHandle(u64);

impl OperationHandle {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Per-session context, created at session start and dropped at teardown
///
/// Carries the conversation identifier and the optional user identity used
/// to tag persisted turns.
#[derive(Debug, Clone)]
pub struct SessionContext {
    conversation_id: String,
    user_id: Option<String>,
    started_at: DateTime<Utc>,
}

impl SessionContext {
    /// Start a new conversation, optionally tagged with a user identity
    #[must_use]
    pub fn new(user_id: Option<String>) -> Self {
        let started_at = Utc::now();
        Self {
            conversation_id: format!("conv-{}", started_at.timestamp_millis()),
            user_id,
            started_at,
        }
    }

    /// Resume with an explicit conversation identifier
    #[must_use]
    pub fn with_conversation_id(conversation_id: impl Into<String>, user_id: Option<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            user_id,
            started_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

/// Read-only view of the session for rendering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Conversation this snapshot belongs to
    pub conversation_id: String,

    /// Current state
    pub state: SessionState,

    /// Handle of the operation backing `state`, `None` exactly when idle
    pub active: Option<OperationHandle>,

    /// Transcript in chronological order
    pub transcript: Vec<Turn>,

    /// Most recent recoverable failure, cleared when the next operation starts
    pub notice: Option<ConversationError>,
}

impl SessionSnapshot {
    /// Last assistant turn, if any
    #[must_use]
    pub fn last_reply(&self) -> Option<&Turn> {
        self.transcript
            .iter()
            .rev()
            .find(|t| t.role() == Role::Assistant)
    }
}
