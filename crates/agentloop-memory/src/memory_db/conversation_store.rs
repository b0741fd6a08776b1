use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, warn};

use crate::error::Result;
use crate::memory_db::fts_index::FullTextIndex;
use crate::memory_db::schema::*;
use crate::memory_db::{DbConn, DbPool};

/// Insert parameters for a single turn.
pub struct MessageParams<'a> {
    pub session_id: &'a str,
    pub role: Role,
    pub content: &'a str,
    pub tokens: usize,
    pub metadata: &'a Metadata,
}

/// Durable per-session message log.
pub struct ConversationStore {
    pool: DbPool,
}

impl ConversationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    /// Insert a turn, its keyword mirror row and the session refresh in one
    /// transaction. The chunk index is derived inside the same transaction.
    ///
    /// The write lock is taken up front: a deferred transaction that reads
    /// first fails with SQLITE_BUSY instead of waiting when another writer
    /// commits in between.
    pub fn append(&self, params: MessageParams, chunk_gap: Duration) -> Result<StoredMessage> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let now = Utc::now();
        let now_str = format_timestamp(&now);
        let chunk_index = next_chunk_index(&tx, params.session_id, params.role, now, chunk_gap)?;
        let metadata_json = serde_json::to_string(params.metadata)?;

        tx.execute(
            "UPDATE sessions SET last_active = ?1 WHERE session_id = ?2",
            params![now_str, params.session_id],
        )?;
        tx.execute(
            "INSERT INTO messages
             (session_id, chunk_index, role, content, tokens, timestamp, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                params.session_id,
                chunk_index,
                params.role.as_str(),
                params.content,
                params.tokens as i64,
                now_str,
                metadata_json,
            ],
        )?;
        let message_id = tx.last_insert_rowid();
        FullTextIndex::insert_with_conn(
            &tx,
            message_id,
            params.content,
            params.session_id,
            &metadata_json,
            params.role.as_str(),
        )?;
        tx.commit()?;

        debug!(
            "Stored message {} ({}, chunk {}, {} tokens) in session {}",
            message_id, params.role, chunk_index, params.tokens, params.session_id
        );
        Ok(StoredMessage {
            message_id,
            session_id: params.session_id.to_string(),
            chunk_index,
            role: params.role,
            content: params.content.to_string(),
            tokens: params.tokens,
            timestamp: now,
            metadata: params.metadata.clone(),
            embedding_model: None,
        })
    }

    /// As many of the most recent turns as fit in `token_limit`, oldest first.
    /// Stops at the first turn that would overflow rather than skipping it.
    pub fn get_recent_within_budget(&self, session_id: &str, token_limit: usize) -> Result<Vec<StoredMessage>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM messages m WHERE m.session_id = ?1 ORDER BY m.message_id DESC",
            MESSAGE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([session_id])?;

        let mut selected = Vec::new();
        let mut total = 0usize;
        while let Some(row) = rows.next()? {
            let message = row_to_stored_message(row)?;
            if total + message.tokens > token_limit {
                break;
            }
            total += message.tokens;
            selected.push(message);
        }
        selected.reverse();
        Ok(selected)
    }

    /// Chronological page of a session's history.
    pub fn get_session_messages(&self, session_id: &str, limit: Option<i64>, offset: Option<i64>) -> Result<Vec<StoredMessage>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM messages m WHERE m.session_id = ?1 ORDER BY m.message_id LIMIT ?2 OFFSET ?3",
            MESSAGE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let messages = stmt
            .query_map(params![session_id, limit.unwrap_or(-1), offset.unwrap_or(0)], row_to_stored_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    pub fn get_message(&self, message_id: i64) -> Result<Option<StoredMessage>> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {} FROM messages m WHERE m.message_id = ?1", MESSAGE_COLUMNS);
        Ok(conn.query_row(&sql, [message_id], row_to_stored_message).optional()?)
    }

    pub fn get_session_message_count(&self, session_id: &str) -> Result<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// User/assistant turns still waiting for an embedding, in id order.
    pub fn pending_embeddings(&self, after_message_id: i64, limit: usize) -> Result<Vec<(i64, String)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT message_id, content FROM messages
             WHERE embedding IS NULL AND role IN ('user', 'assistant') AND message_id > ?1
             ORDER BY message_id LIMIT ?2",
        )?;
        let pending = stmt
            .query_map(params![after_message_id, limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(pending)
    }
}

/// Chunk index for a new turn in `session_id`.
///
/// A user turn opens a new chunk when the session's latest assistant turn is
/// older than `chunk_gap`; every other turn stays in the current chunk.
pub(crate) fn next_chunk_index(
    conn: &Connection,
    session_id: &str,
    role: Role,
    now: DateTime<Utc>,
    chunk_gap: Duration,
) -> rusqlite::Result<i64> {
    let current: i64 = conn
        .query_row(
            "SELECT chunk_index FROM messages WHERE session_id = ?1 ORDER BY message_id DESC LIMIT 1",
            [session_id],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);

    if role != Role::User {
        return Ok(current);
    }

    let last_assistant: Option<(String, i64)> = conn
        .query_row(
            "SELECT timestamp, chunk_index FROM messages
             WHERE session_id = ?1 AND role = 'assistant'
             ORDER BY message_id DESC LIMIT 1",
            [session_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let Some((timestamp, assistant_chunk)) = last_assistant else {
        return Ok(current);
    };
    let Some(assistant_time) = parse_timestamp(&timestamp) else {
        warn!("Unparseable assistant timestamp {:?} in session {}", timestamp, session_id);
        return Ok(current);
    };

    let candidate = if now - assistant_time > chunk_gap {
        assistant_chunk + 1
    } else {
        assistant_chunk
    };
    Ok(candidate.max(current))
}

pub(crate) fn row_to_stored_message(row: &Row) -> rusqlite::Result<StoredMessage> {
    let role_str: String = row.get(3)?;
    let role = role_str.parse::<Role>().unwrap_or_else(|e| {
        warn!("{}; treating as system", e);
        Role::System
    });
    let timestamp = parse_timestamp(&row.get::<_, String>(6)?).unwrap_or_else(|| {
        warn!("Failed parse message timestamp");
        Utc::now()
    });
    let metadata_json: String = row.get(7)?;
    let metadata = serde_json::from_str::<Metadata>(&metadata_json).unwrap_or_else(|e| {
        warn!("Malformed message metadata: {}", e);
        Metadata::new()
    });
    let tokens: i64 = row.get(5)?;

    Ok(StoredMessage {
        message_id: row.get(0)?,
        session_id: row.get(1)?,
        chunk_index: row.get(2)?,
        role,
        content: row.get(4)?,
        tokens: tokens.max(0) as usize,
        timestamp,
        metadata,
        embedding_model: row.get(8)?,
    })
}
