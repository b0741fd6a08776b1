//! Destructive maintenance: filtered clears and the full wipe.
use std::collections::BTreeSet;

use rusqlite::{Transaction, TransactionBehavior};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::memory_db::fts_index::FullTextIndex;
use crate::memory_db::{placeholders, DbConn, DbPool};

/// What a filtered clear removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClearReport {
    pub sessions_deleted: Vec<String>,
    pub messages_deleted: usize,
}

pub struct MemoryAdmin {
    pool: DbPool,
}

impl MemoryAdmin {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    /// Delete everything matching ANY supplied filter:
    /// the session itself, every session owned by `user_id`, and every message
    /// whose metadata carries `agent_id`. Sessions touched only through
    /// `agent_id` keep their rows.
    ///
    /// Returns `None` without touching storage when no filter is supplied.
    pub fn clear(
        &self,
        session_id: Option<&str>,
        agent_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<Option<ClearReport>> {
        let session_id = session_id.filter(|s| !s.is_empty());
        let agent_id = agent_id.filter(|s| !s.is_empty());
        let user_id = user_id.filter(|s| !s.is_empty());
        if session_id.is_none() && agent_id.is_none() && user_id.is_none() {
            warn!("clear called without filters; refusing to delete anything");
            return Ok(None);
        }

        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut sessions: BTreeSet<String> = BTreeSet::new();
        if let Some(session_id) = session_id {
            sessions.insert(session_id.to_string());
        }
        if let Some(user_id) = user_id {
            let mut stmt = tx.prepare("SELECT session_id FROM sessions WHERE user_id = ?1")?;
            let owned = stmt
                .query_map([user_id], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            sessions.extend(owned);
        }
        let sessions: Vec<String> = sessions.into_iter().collect();

        let mut report = ClearReport::default();
        if !sessions.is_empty() {
            let ids = select_ids(
                &tx,
                &format!(
                    "SELECT message_id FROM messages WHERE session_id IN ({})",
                    placeholders(sessions.len())
                ),
                &sessions,
            )?;
            report.messages_deleted += delete_messages(&tx, &ids)?;

            let mut stmt = tx.prepare(&format!(
                "DELETE FROM sessions WHERE session_id IN ({}) RETURNING session_id",
                placeholders(sessions.len())
            ))?;
            let mut deleted = stmt
                .query_map(rusqlite::params_from_iter(&sessions), |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            deleted.sort();
            report.sessions_deleted = deleted;
        }

        if let Some(agent_id) = agent_id {
            let ids = select_ids(
                &tx,
                "SELECT message_id FROM messages
                 WHERE json_type(metadata, '$.agent_id') = 'text'
                   AND json_extract(metadata, '$.agent_id') = ?1",
                &[agent_id],
            )?;
            report.messages_deleted += delete_messages(&tx, &ids)?;
        }

        tx.commit()?;
        info!(
            "Cleared {} messages and {} sessions",
            report.messages_deleted,
            report.sessions_deleted.len()
        );
        Ok(Some(report))
    }

    /// Empty every table. The only path that wipes the whole store.
    pub fn clear_all(&self) -> Result<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(
            "DELETE FROM messages_fts;
             DELETE FROM messages;
             DELETE FROM sessions;",
        )?;
        tx.commit()?;
        info!("Cleared all memory");
        Ok(())
    }
}

fn select_ids<P: rusqlite::ToSql>(tx: &Transaction, sql: &str, params: &[P]) -> rusqlite::Result<Vec<i64>> {
    let mut stmt = tx.prepare(sql)?;
    let ids = stmt
        .query_map(rusqlite::params_from_iter(params), |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

fn delete_messages(tx: &Transaction, ids: &[i64]) -> rusqlite::Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    FullTextIndex::delete_with_conn(tx, ids)?;
    tx.execute(
        &format!("DELETE FROM messages WHERE message_id IN ({})", placeholders(ids.len())),
        rusqlite::params_from_iter(ids),
    )
}
