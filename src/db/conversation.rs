//! Conversation repository: completed exchanges keyed by conversation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use super::{ConversationStore, DbPool};
use crate::session::{InputOrigin, SessionContext};
use crate::{Error, Result};

/// One persisted exchange: a user message and the reply it received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: String,
    pub conversation_id: String,
    pub user_id: Option<String>,
    pub message: String,
    pub response: String,
    pub origin: InputOrigin,
    pub timestamp: DateTime<Utc>,
}

impl ConversationRecord {
    /// Build a record for an exchange in `context`'s conversation
    #[must_use]
    pub fn new(
        context: &SessionContext,
        message: impl Into<String>,
        response: impl Into<String>,
        origin: InputOrigin,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: context.conversation_id().to_string(),
            user_id: context.user_id().map(str::to_string),
            message: message.into(),
            response: response.into(),
            origin,
            timestamp: Utc::now(),
        }
    }
}

/// Per-conversation rollup for history listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub exchanges: usize,
    pub last_at: DateTime<Utc>,
}

/// Conversation repository
#[derive(Clone)]
pub struct ConversationRepo {
    pool: DbPool,
}

impl ConversationRepo {
    /// Create a new conversation repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert a record
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn insert(&self, record: &ConversationRecord) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "INSERT INTO conversations (id, conversation_id, user_id, message, response, origin, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id,
                record.conversation_id,
                record.user_id,
                record.message,
                record.response,
                record.origin.as_str(),
                record.timestamp.to_rfc3339(),
            ],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        tracing::debug!(
            id = %record.id,
            conversation_id = %record.conversation_id,
            "conversation record stored"
        );
        Ok(())
    }

    /// Records of one conversation, oldest first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_for_conversation(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationRecord>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT id, conversation_id, user_id, message, response, origin, created_at
                 FROM conversations WHERE conversation_id = ?1
                 ORDER BY created_at ASC, rowid ASC LIMIT ?2",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        let records = stmt
            .query_map(params![conversation_id, sql_limit(limit)], row_to_record)
            .map_err(|e| Error::Database(e.to_string()))?
            .filter_map(std::result::Result::ok)
            .collect();

        Ok(records)
    }

    /// Most recent records across all conversations, newest first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_recent(&self, limit: usize) -> Result<Vec<ConversationRecord>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT id, conversation_id, user_id, message, response, origin, created_at
                 FROM conversations ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        let records = stmt
            .query_map(params![sql_limit(limit)], row_to_record)
            .map_err(|e| Error::Database(e.to_string()))?
            .filter_map(std::result::Result::ok)
            .collect();

        Ok(records)
    }

    /// Conversations ordered by latest activity
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_conversations(&self, limit: usize) -> Result<Vec<ConversationSummary>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT conversation_id, COUNT(*), MAX(created_at)
                 FROM conversations GROUP BY conversation_id
                 ORDER BY MAX(created_at) DESC LIMIT ?1",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        let summaries = stmt
            .query_map(params![sql_limit(limit)], |row| {
                Ok(ConversationSummary {
                    conversation_id: row.get(0)?,
                    exchanges: usize::try_from(row.get::<_, i64>(1)?).unwrap_or_default(),
                    last_at: parse_datetime(&row.get::<_, String>(2)?),
                })
            })
            .map_err(|e| Error::Database(e.to_string()))?
            .filter_map(std::result::Result::ok)
            .collect();

        Ok(summaries)
    }
}

#[async_trait]
impl ConversationStore for ConversationRepo {
    async fn save(&self, record: ConversationRecord) -> Result<()> {
        let repo = self.clone();
        tokio::task::spawn_blocking(move || repo.insert(&record))
            .await
            .map_err(|e| Error::Database(e.to_string()))?
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRecord> {
    let origin: String = row.get(5)?;
    Ok(ConversationRecord {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        user_id: row.get(2)?,
        message: row.get(3)?,
        response: row.get(4)?,
        origin: InputOrigin::from_name(&origin).unwrap_or(InputOrigin::Voice),
        timestamp: parse_datetime(&row.get::<_, String>(6)?),
    })
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
