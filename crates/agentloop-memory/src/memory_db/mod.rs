//! Memory database module - SQLite-backed sessions, messages, keyword mirror and embeddings
pub mod admin;
pub mod conversation_store;
pub mod embedding_store;
pub mod fts_index;
pub mod migration;
pub mod schema;
pub mod session_store;

pub use admin::{ClearReport, MemoryAdmin};
pub use conversation_store::{ConversationStore, MessageParams};
pub use embedding_store::{cosine_similarity, decode_embedding, encode_embedding, EmbeddingStore};
pub use fts_index::FullTextIndex;
pub use migration::MigrationManager;
pub use schema::*;
pub use session_store::{SessionLoad, SessionStore};

use std::path::Path;
use std::sync::Arc;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::ToSql;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::Result;

pub(crate) type DbPool = Arc<Pool<SqliteConnectionManager>>;
pub(crate) type DbConn = PooledConnection<SqliteConnectionManager>;

/// Storage root. Every calling thread checks out its own pooled connection,
/// so no `rusqlite::Connection` is ever shared between threads.
pub struct MemoryDatabase {
    pub sessions: SessionStore,
    pub conversations: ConversationStore,
    pub fts: FullTextIndex,
    pub embeddings: EmbeddingStore,
    pub admin: MemoryAdmin,
    pool: DbPool,
}

impl MemoryDatabase {
    pub fn open(db_path: &Path, pool_size: u32) -> Result<Self> {
        info!("Opening memory database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .with_init(|conn| {
                conn.execute_batch(
                    "PRAGMA foreign_keys = ON;
                     PRAGMA synchronous = NORMAL;
                     PRAGMA busy_timeout = 5000;",
                )
            });
        let pool = Pool::builder().max_size(pool_size.max(1)).build(manager)?;

        {
            let mut conn = pool.get()?;
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            let mut migrator = MigrationManager::new(&mut conn);
            migrator.initialize_database()?;
        }

        let pool = Arc::new(pool);
        info!("Memory database initialized successfully");
        Ok(Self {
            sessions: SessionStore::new(Arc::clone(&pool)),
            conversations: ConversationStore::new(Arc::clone(&pool)),
            fts: FullTextIndex::new(Arc::clone(&pool)),
            embeddings: EmbeddingStore::new(Arc::clone(&pool)),
            admin: MemoryAdmin::new(Arc::clone(&pool)),
            pool,
        })
    }

    pub fn get_stats(&self) -> Result<DatabaseStats> {
        let conn = self.pool.get()?;
        Ok(migration::get_database_stats(&conn)?)
    }

    /// Fold the WAL back into the main file.
    pub fn checkpoint(&self) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        debug!("WAL checkpoint completed");
        Ok(())
    }
}

impl Drop for MemoryDatabase {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}

/// Appends WHERE clauses for `filter` against the `messages` table aliased `m`.
pub(crate) fn push_filter_clauses(
    filter: &SearchFilter,
    clauses: &mut Vec<String>,
    params: &mut Vec<Box<dyn ToSql>>,
) {
    if let Some(session_id) = &filter.session_id {
        clauses.push("m.session_id = ?".to_string());
        params.push(Box::new(session_id.clone()));
    }

    if let Some(metadata) = &filter.metadata {
        for (key, value) in metadata {
            push_metadata_clause(key, value, clauses, params);
        }
    }

    if let Some(range) = &filter.time_range {
        clauses.push("m.timestamp BETWEEN ? AND ?".to_string());
        params.push(Box::new(format_timestamp(&range.start)));
        params.push(Box::new(format_timestamp(&range.end)));
    }
}

fn push_metadata_clause(
    key: &str,
    value: &Value,
    clauses: &mut Vec<String>,
    params: &mut Vec<Box<dyn ToSql>>,
) {
    // SQLite JSON paths have no escape for a quote inside a quoted label.
    if key.contains('"') {
        clauses.push("0".to_string());
        return;
    }
    let path = format!("$.\"{}\"", key);

    match value {
        Value::Null => {
            clauses.push("json_type(m.metadata, ?) = 'null'".to_string());
            params.push(Box::new(path));
        }
        Value::Bool(b) => {
            clauses.push("json_type(m.metadata, ?) = ?".to_string());
            params.push(Box::new(path));
            params.push(Box::new(if *b { "true" } else { "false" }));
        }
        Value::Number(n) => {
            clauses.push("json_extract(m.metadata, ?) = ?".to_string());
            params.push(Box::new(path));
            if let Some(i) = n.as_i64() {
                params.push(Box::new(i));
            } else {
                params.push(Box::new(n.as_f64().unwrap_or(f64::NAN)));
            }
        }
        Value::String(s) => {
            clauses.push("json_type(m.metadata, ?) = 'text' AND json_extract(m.metadata, ?) = ?".to_string());
            params.push(Box::new(path.clone()));
            params.push(Box::new(path));
            params.push(Box::new(s.clone()));
        }
        Value::Array(_) | Value::Object(_) => {
            clauses.push("json_extract(m.metadata, ?) = json(?)".to_string());
            params.push(Box::new(path));
            params.push(Box::new(value.to_string()));
        }
    }
}

pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}
