//! Keyword mirror of `messages` backed by an FTS5 table.
//!
//! User text never reaches the FTS5 query parser verbatim: it is split into
//! terms, each term is emitted as a quoted string literal, and the terms are
//! OR-ed together.
use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;
use rusqlite::types::ToSql;
use rusqlite::{params, Connection};

use crate::error::Result;
use crate::memory_db::conversation_store::row_to_stored_message;
use crate::memory_db::schema::{SearchFilter, StoredMessage, MESSAGE_COLUMNS};
use crate::memory_db::{placeholders, push_filter_clauses, DbConn, DbPool};

lazy_static! {
    static ref TERM_SPLIT: Regex = Regex::new(r#"[\s"']+"#).unwrap();
}

pub struct FullTextIndex {
    pool: DbPool,
}

impl FullTextIndex {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    /// Turn arbitrary text into a safe FTS5 expression, or `None` when the
    /// text has no searchable terms.
    pub fn escape_query(query: &str) -> Option<String> {
        let terms: Vec<String> = TERM_SPLIT
            .split(query)
            .filter(|t| t.chars().any(char::is_alphanumeric))
            .map(|t| format!("\"{}\"", t))
            .collect();
        if terms.is_empty() {
            None
        } else {
            Some(terms.join(" OR "))
        }
    }

    /// Map SQLite's `bm25()` (lower is better, usually negative) onto `[0, 1)`.
    pub fn normalize_bm25(raw: f64) -> f32 {
        let relevance = (-raw).max(0.0);
        (relevance / (1.0 + relevance)) as f32
    }

    /// Keyword search ordered by BM25, ties broken by recency.
    pub fn search(
        &self,
        query: &str,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<(StoredMessage, f32)>> {
        let Some(fts_query) = Self::escape_query(query) else {
            return Ok(Vec::new());
        };

        let mut clauses = vec!["messages_fts MATCH ?".to_string()];
        let mut sql_params: Vec<Box<dyn ToSql>> = vec![Box::new(fts_query)];
        push_filter_clauses(filter, &mut clauses, &mut sql_params);
        sql_params.push(Box::new(limit as i64));

        let sql = format!(
            "SELECT {}, bm25(messages_fts) AS rank
             FROM messages_fts
             JOIN messages m ON m.message_id = messages_fts.rowid
             WHERE {}
             ORDER BY rank ASC, m.message_id DESC
             LIMIT ?",
            MESSAGE_COLUMNS,
            clauses.join(" AND ")
        );

        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn ToSql> = sql_params.iter().map(|p| p.as_ref()).collect();
        let mut rows = stmt.query(rusqlite::params_from_iter(param_refs))?;

        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            let message = row_to_stored_message(row)?;
            let raw: f64 = row.get(9)?;
            results.push((message, Self::normalize_bm25(raw)));
        }
        Ok(results)
    }

    /// Normalized BM25 for each candidate id that matches `query`.
    /// Candidates without a keyword hit are absent from the map.
    pub fn score_candidates(&self, query: &str, message_ids: &[i64]) -> Result<HashMap<i64, f32>> {
        let mut scores = HashMap::new();
        let Some(fts_query) = Self::escape_query(query) else {
            return Ok(scores);
        };
        if message_ids.is_empty() {
            return Ok(scores);
        }

        let sql = format!(
            "SELECT rowid, bm25(messages_fts) FROM messages_fts
             WHERE messages_fts MATCH ? AND rowid IN ({})",
            placeholders(message_ids.len())
        );
        let mut sql_params: Vec<&dyn ToSql> = Vec::with_capacity(message_ids.len() + 1);
        sql_params.push(&fts_query);
        for id in message_ids {
            sql_params.push(id);
        }

        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(sql_params))?;
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let raw: f64 = row.get(1)?;
            scores.insert(id, Self::normalize_bm25(raw));
        }
        Ok(scores)
    }

    /// Mirror one message row; runs inside the caller's transaction.
    pub(crate) fn insert_with_conn(
        conn: &Connection,
        message_id: i64,
        content: &str,
        session_id: &str,
        metadata_json: &str,
        role: &str,
    ) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO messages_fts (rowid, content, session_id, metadata, role)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![message_id, content, session_id, metadata_json, role],
        )?;
        Ok(())
    }

    pub(crate) fn delete_with_conn(conn: &Connection, message_ids: &[i64]) -> rusqlite::Result<usize> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM messages_fts WHERE rowid IN ({})",
            placeholders(message_ids.len())
        );
        conn.execute(&sql, rusqlite::params_from_iter(message_ids))
    }

    pub fn row_count(&self) -> Result<i64> {
        let conn = self.get_conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM messages_fts", [], |row| row.get(0))?)
    }
}
