//! Anonymous local identity
//!
//! Each installation gets a random user id on first run, stored as JSON in
//! the data directory. It only tags persisted conversation records.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Identity stored on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalIdentity {
    /// Opaque anonymous user identifier
    pub user_id: String,

    /// When the identity was created
    pub created_at: DateTime<Utc>,
}

impl LocalIdentity {
    /// Generate a fresh anonymous identity
    #[must_use]
    pub fn generate() -> Self {
        Self {
            user_id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
        }
    }

    /// Load identity from a file, or create a new one if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns error if file operations fail or JSON is invalid
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let identity: Self = serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("invalid identity file: {e}")))?;
            tracing::debug!(user_id = %identity.user_id, "loaded local identity");
            return Ok(identity);
        }

        let identity = Self::generate();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(&identity)?)?;

        tracing::info!(user_id = %identity.user_id, "created anonymous identity");
        Ok(identity)
    }

    /// Resolve the user id, never failing
    ///
    /// A missing or unreadable identity yields `None`; the session proceeds
    /// without tagging.
    #[must_use]
    pub fn resolve(path: &Path) -> Option<String> {
        match Self::load_or_create(path) {
            Ok(identity) => Some(identity.user_id),
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "identity unavailable, continuing anonymously");
                None
            }
        }
    }
}
