//! Database schema and migrations

use rusqlite::Connection;

use crate::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
///
/// # Errors
///
/// Returns error if migration fails
pub fn init(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- One row per completed exchange
        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            user_id TEXT,
            message TEXT NOT NULL,
            response TEXT NOT NULL,
            origin TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_conversation
            ON conversations(conversation_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_conversations_created
            ON conversations(created_at);

        PRAGMA user_version = 1;
        ",
    )?;

    tracing::debug!("applied migration v1");
    Ok(())
}
