//! Turn transport: one request per user message to the inference backend

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{ConversationError, Result, TransportFailureKind};

/// Delivers a user message and returns the assistant reply
///
/// Implementations never retry and never fail past this boundary: every
/// problem is reported as [`ConversationError::TransportFailure`].
#[async_trait]
pub trait TurnTransport: Send + Sync {
    /// Submit `message` within `conversation_id`
    ///
    /// An empty string means the backend answered without content.
    ///
    /// # Errors
    ///
    /// Returns `TransportFailure` on network errors, non-success status or
    /// an undecodable reply
    async fn submit(&self, conversation_id: &str, message: &str) -> std::result::Result<String, ConversationError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    message: &'a str,
    conversation_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    response: Option<String>,
}

/// JSON-over-HTTP transport for the hosted chat backend
#[derive(Clone)]
pub struct HttpTransport {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport posting to `{base_url}/api/chat`
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            endpoint: format!("{}/api/chat", base_url.trim_end_matches('/')),
            client,
        })
    }

    /// Full URL requests are sent to
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TurnTransport for HttpTransport {
    async fn submit(&self, conversation_id: &str, message: &str) -> std::result::Result<String, ConversationError> {
        tracing::debug!(endpoint = %self.endpoint, conversation_id, "posting turn");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&ChatRequest {
                message,
                conversation_id,
            })
            .send()
            .await
            .map_err(|e| failure(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(%status, body = %body, "backend rejected turn");
            return Err(ConversationError::TransportFailure(
                TransportFailureKind::Status(status.as_u16()),
            ));
        }

        let body = response.bytes().await.map_err(|e| failure(&e))?;
        let reply: ChatResponse = serde_json::from_slice(&body).map_err(|e| {
            tracing::warn!(error = %e, "undecodable backend reply");
            ConversationError::TransportFailure(TransportFailureKind::Malformed)
        })?;

        Ok(reply.response.unwrap_or_default())
    }
}

fn failure(error: &reqwest::Error) -> ConversationError {
    let kind = if error.is_timeout() {
        TransportFailureKind::Timeout
    } else if error.is_decode() {
        TransportFailureKind::Malformed
    } else {
        TransportFailureKind::Network
    };
    tracing::debug!(error = %error, ?kind, "transport error");
    ConversationError::TransportFailure(kind)
}
