//! APX Assistant - voice and text conversation front-end
//!
//! This library provides the conversation session for the APX assistant:
//! - Session controller coordinating listening, submission and speaking
//! - Microphone and speaker adapters over hosted STT/TTS
//! - HTTP transport to the inference backend
//! - Local conversation history and anonymous identity
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │              Presentation (CLI)                  │
//! └────────────────────────┬─────────────────────────┘
//!                          │ commands / snapshots
//! ┌────────────────────────▼─────────────────────────┐
//! │                Session Controller                │
//! │   Idle  │  Listening  │  Submitting  │  Speaking │
//! └──────┬─────────────┬──────────────┬──────────────┘
//!        │             │              │
//! ┌──────▼─────┐ ┌─────▼──────┐ ┌─────▼──────┐
//! │  Capture   │ │ Transport  │ │  Playback  │
//! │ mic + STT  │ │ HTTP chat  │ │ TTS + spk  │
//! └────────────┘ └────────────┘ └────────────┘
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod session;
pub mod transport;
pub mod voice;

pub use config::Config;
pub use db::{ConversationRecord, ConversationStore, DbConn, DbPool};
pub use error::{ControlError, ConversationError, Error, Result, TransportFailureKind};
pub use identity::LocalIdentity;
pub use session::{
    ControllerSettings, InputOrigin, OperationHandle, Role, SessionClient, SessionContext,
    SessionController, SessionSnapshot, SessionState, Turn,
};
pub use transport::{HttpTransport, TurnTransport};
pub use voice::{CaptureDevice, PlaybackDevice};
