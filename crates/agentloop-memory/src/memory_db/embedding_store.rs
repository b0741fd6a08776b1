//! Embedding storage and exact cosine retrieval over the `messages.embedding` column
use std::collections::HashMap;

use rayon::prelude::*;
use rusqlite::types::ToSql;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use tracing::{debug, warn};

use crate::error::Result;
use crate::memory_db::conversation_store::row_to_stored_message;
use crate::memory_db::schema::{SearchFilter, StoredMessage, MESSAGE_COLUMNS};
use crate::memory_db::{placeholders, push_filter_clauses, DbConn, DbPool};

pub struct EmbeddingStore {
    pool: DbPool,
}

impl EmbeddingStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    /// Attach vectors to existing messages in one transaction.
    /// Returns how many rows were updated; unknown ids are ignored.
    pub fn store_embeddings(&self, embeddings: &[(i64, Vec<f32>)], model: &str) -> Result<usize> {
        if embeddings.is_empty() {
            return Ok(0);
        }
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut updated = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE messages SET embedding = ?1, embedding_model = ?2 WHERE message_id = ?3",
            )?;
            for (message_id, vector) in embeddings {
                updated += stmt.execute(params![encode_embedding(vector), model, message_id])?;
            }
        }
        tx.commit()?;
        debug!("Stored {} embeddings ({})", updated, model);
        Ok(updated)
    }

    pub fn get_embedding(&self, message_id: i64) -> Result<Option<Vec<f32>>> {
        let conn = self.get_conn()?;
        let bytes: Option<Option<Vec<u8>>> = conn
            .query_row(
                "SELECT embedding FROM messages WHERE message_id = ?1",
                [message_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(bytes.flatten().map(|b| decode_embedding(&b)))
    }

    pub fn get_embeddings(&self, message_ids: &[i64]) -> Result<HashMap<i64, Vec<f32>>> {
        if message_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT message_id, embedding FROM messages
             WHERE embedding IS NOT NULL AND message_id IN ({})",
            placeholders(message_ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let vectors = stmt
            .query_map(rusqlite::params_from_iter(message_ids), |row| {
                Ok((row.get::<_, i64>(0)?, decode_embedding(&row.get::<_, Vec<u8>>(1)?)))
            })?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(vectors)
    }

    /// Exact nearest neighbours by cosine similarity among embedded rows that
    /// pass `filter`. Rows whose dimension differs from the query are skipped.
    pub fn search(
        &self,
        query: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<(StoredMessage, f32)>> {
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut clauses = vec!["m.embedding IS NOT NULL".to_string()];
        let mut sql_params: Vec<Box<dyn ToSql>> = Vec::new();
        push_filter_clauses(filter, &mut clauses, &mut sql_params);
        let sql = format!(
            "SELECT {}, m.embedding FROM messages m WHERE {}",
            MESSAGE_COLUMNS,
            clauses.join(" AND ")
        );

        let rows = {
            let conn = self.get_conn()?;
            let mut stmt = conn.prepare(&sql)?;
            let param_refs: Vec<&dyn ToSql> = sql_params.iter().map(|p| p.as_ref()).collect();
            let rows = stmt
                .query_map(rusqlite::params_from_iter(param_refs), |row| {
                    Ok((row_to_stored_message(row)?, row.get::<_, Vec<u8>>(9)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let dimension = query.len();
        let candidates = rows.len();
        let mut scored: Vec<(StoredMessage, f32)> = rows
            .into_par_iter()
            .filter_map(|(message, bytes)| {
                let vector = decode_embedding(&bytes);
                if vector.len() != dimension {
                    return None;
                }
                Some((message, cosine_similarity(query, &vector)))
            })
            .collect();

        if scored.len() < candidates {
            warn!(
                "Skipped {} embeddings whose dimension differs from the query ({})",
                candidates - scored.len(),
                dimension
            );
        }

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.0.message_id.cmp(&a.0.message_id))
        });
        scored.truncate(limit);
        Ok(scored)
    }
}

/// Little-endian `f32` sequence.
pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Inverse of [`encode_embedding`]; a trailing partial float is dropped.
pub fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity; 0 for mismatched lengths or a zero vector.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
