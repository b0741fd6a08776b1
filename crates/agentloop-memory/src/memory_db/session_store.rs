//! Session lifecycle: create on first use, resume within the timeout,
//! reactivate in place when stale.
use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info, warn};

use crate::error::{MemoryError, Result};
use crate::memory_db::schema::{format_timestamp, parse_timestamp, Session};
use crate::memory_db::{DbConn, DbPool};

/// How `load_or_create` resolved a session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLoad {
    /// Row existed and was active within the timeout.
    Resumed,
    /// Row existed but was stale; same identity, refreshed in place.
    Reactivated,
    Created,
}

pub struct SessionStore {
    pool: DbPool,
}

impl SessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let conn = self.get_conn()?;
        let session = conn
            .query_row(
                "SELECT session_id, user_id, created_at, last_active FROM sessions WHERE session_id = ?1",
                [session_id],
                row_to_session,
            )
            .optional()?;
        Ok(session)
    }

    pub fn list_user_sessions(&self, user_id: &str) -> Result<Vec<Session>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, user_id, created_at, last_active FROM sessions
             WHERE user_id = ?1 ORDER BY last_active DESC",
        )?;
        let sessions = stmt
            .query_map([user_id], row_to_session)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sessions)
    }

    /// Resolve `session_id` to a live row, creating it when absent.
    ///
    /// `user_id` is only required for creation; when supplied for an existing
    /// row it replaces the stored owner.
    pub fn load_or_create(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        timeout: Duration,
    ) -> Result<SessionLoad> {
        if session_id.trim().is_empty() {
            return Err(MemoryError::InvalidArgument("session_id must not be empty".to_string()));
        }
        let user_id = user_id.filter(|u| !u.trim().is_empty());

        match self.get_session(session_id)? {
            Some(existing) => {
                let outcome = if Utc::now() - existing.last_active <= timeout {
                    SessionLoad::Resumed
                } else {
                    SessionLoad::Reactivated
                };
                self.touch(session_id, user_id)?;
                debug!("Session {} {:?}", session_id, outcome);
                Ok(outcome)
            }
            None => {
                let user_id = user_id.ok_or_else(|| {
                    MemoryError::InvalidArgument("user_id is required when creating a new session".to_string())
                })?;
                self.create_session(session_id, user_id)?;
                Ok(SessionLoad::Created)
            }
        }
    }

    pub fn create_session(&self, session_id: &str, user_id: &str) -> Result<Session> {
        let now = Utc::now();
        let now_str = format_timestamp(&now);
        let conn = self.get_conn()?;
        // A concurrent creator may have won; keep its row and just refresh it.
        conn.execute(
            "INSERT INTO sessions (session_id, user_id, created_at, last_active) VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(session_id) DO UPDATE SET last_active = excluded.last_active",
            params![session_id, user_id, now_str],
        )?;
        info!("Created session {} for user {}", session_id, user_id);
        Ok(Session {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            created_at: now,
            last_active: now,
        })
    }

    /// Refresh `last_active`, optionally reassigning the owner.
    pub fn touch(&self, session_id: &str, user_id: Option<&str>) -> Result<()> {
        let conn = self.get_conn()?;
        let now = format_timestamp(&Utc::now());
        match user_id {
            Some(user_id) => conn.execute(
                "UPDATE sessions SET last_active = ?1, user_id = ?2 WHERE session_id = ?3",
                params![now, user_id, session_id],
            )?,
            None => conn.execute(
                "UPDATE sessions SET last_active = ?1 WHERE session_id = ?2",
                params![now, session_id],
            )?,
        };
        Ok(())
    }
}

fn row_to_session(row: &Row) -> rusqlite::Result<Session> {
    let created_at = parse_timestamp(&row.get::<_, String>(2)?).unwrap_or_else(|| {
        warn!("Failed parse session created_at");
        Utc::now()
    });
    let last_active = parse_timestamp(&row.get::<_, String>(3)?).unwrap_or_else(|| {
        warn!("Failed parse session last_active");
        created_at
    });
    Ok(Session {
        session_id: row.get(0)?,
        user_id: row.get(1)?,
        created_at,
        last_active,
    })
}
