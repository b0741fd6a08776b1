//! `MemoryEngine`: the synchronous API an agent loop calls around each model turn.
//!
//! Handles are cheap. Every handle shares storage, the embedding pipeline and
//! the provider runtime, but tracks its own active session, so each caller
//! thread can drive its own conversation.
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::MemoryConfig;
use crate::context_engine::{
    truncate_to_token_budget, BuiltContext, ContextBuilder, ContextBuilderConfig, HybridRanker, RankingWeights,
};
use crate::error::{MemoryError, Result};
use crate::memory_db::{
    DatabaseStats, MemoryDatabase, MessageParams, Metadata, Role, SearchFilter, SearchResult, Session, SessionLoad,
    StoredMessage, TimeRange,
};
use crate::metrics;
use crate::providers::{estimate_tokens, EmbeddingProvider, Tokenizer};
use crate::worker_threads::EmbeddingPipeline;

/// Upper bound on a synchronous provider call made on the caller's behalf.
const PROVIDER_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of an embedding backfill run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub scanned: usize,
    pub embedded: usize,
    pub failed_batches: usize,
    /// Resume point for a later run.
    pub last_message_id: i64,
}

struct EngineCore {
    config: MemoryConfig,
    db: Arc<MemoryDatabase>,
    tokenizer: Arc<dyn Tokenizer>,
    embedder: Arc<dyn EmbeddingProvider>,
    pipeline: EmbeddingPipeline,
    context_builder: ContextBuilder,
    runtime: Option<tokio::runtime::Runtime>,
}

impl Drop for EngineCore {
    fn drop(&mut self) {
        self.pipeline.shutdown();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

pub struct MemoryEngine {
    core: Arc<EngineCore>,
    active_session: RwLock<Option<String>>,
}

impl MemoryEngine {
    pub fn open(
        config: MemoryConfig,
        tokenizer: Arc<dyn Tokenizer>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| MemoryError::InvalidArgument(e.to_string()))?;
        metrics::init_metrics();

        if embedder.dimensions() != config.embedding_dimension {
            warn!(
                "Embedding provider {} produces {} dimensions, configured {}",
                embedder.model_name(),
                embedder.dimensions(),
                config.embedding_dimension
            );
        }

        let db = Arc::new(MemoryDatabase::open(&config.db_path, config.pool_size)?);
        let pipeline = EmbeddingPipeline::start(Arc::clone(&db), Arc::clone(&embedder), config.pipeline_settings())?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("memory-provider")
            .enable_all()
            .build()?;
        let context_builder = ContextBuilder::new(ContextBuilderConfig {
            safety_buffer: config.safety_buffer,
            short_term_ratio: config.short_term_ratio,
        });

        info!("Memory engine ready (embeddings: {})", embedder.model_name());
        Ok(Self {
            core: Arc::new(EngineCore {
                config,
                db,
                tokenizer,
                embedder,
                pipeline,
                context_builder,
                runtime: Some(runtime),
            }),
            active_session: RwLock::new(None),
        })
    }

    /// A new handle over the same storage with no active session.
    pub fn handle(&self) -> MemoryEngine {
        MemoryEngine {
            core: Arc::clone(&self.core),
            active_session: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.core.config
    }

    pub fn active_session(&self) -> Option<String> {
        match self.active_session.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_active_session(&self, session_id: Option<String>) {
        match self.active_session.write() {
            Ok(mut guard) => *guard = session_id,
            Err(poisoned) => *poisoned.into_inner() = session_id,
        }
    }

    fn require_session(&self) -> Result<String> {
        self.active_session().ok_or_else(MemoryError::no_active_session)
    }

    // ===== Sessions =====

    /// Resume, reactivate or create `session_id` and make it this handle's
    /// active session. `user_id` is required only when the session is new.
    pub fn load_session(&self, session_id: &str, user_id: Option<&str>) -> Result<String> {
        let timeout = to_chrono(self.core.config.session_timeout);
        let outcome = self.core.db.sessions.load_or_create(session_id, user_id, timeout)?;
        match outcome {
            SessionLoad::Created => info!("Session {} created", session_id),
            SessionLoad::Reactivated => info!("Session {} reactivated after inactivity", session_id),
            SessionLoad::Resumed => debug!("Session {} resumed", session_id),
        }
        self.set_active_session(Some(session_id.to_string()));
        Ok(session_id.to_string())
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        self.core.db.sessions.get_session(session_id)
    }

    // ===== Messages =====

    /// Persist one turn in the active session. Embedding happens later on the
    /// background worker; this call never waits for the provider.
    pub fn add_memory(&self, content: &str, role: Role, metadata: Option<Metadata>) -> Result<StoredMessage> {
        let session_id = self.require_session()?;
        let tokens = self.count_tokens(content);
        let metadata = metadata.unwrap_or_default();

        let stored = self.core.db.conversations.append(
            MessageParams {
                session_id: &session_id,
                role,
                content,
                tokens,
                metadata: &metadata,
            },
            to_chrono(self.core.config.chunk_gap),
        )?;
        metrics::inc_messages_stored();

        if role.is_embeddable() {
            self.core.pipeline.enqueue(stored.message_id, content.to_string());
        }
        Ok(stored)
    }

    /// As many of the active session's most recent turns as fit `token_limit`,
    /// oldest first.
    pub fn get_session_messages(&self, token_limit: usize) -> Result<Vec<StoredMessage>> {
        let session_id = self.require_session()?;
        self.core.db.conversations.get_recent_within_budget(&session_id, token_limit)
    }

    fn count_tokens(&self, text: &str) -> usize {
        match self.core.tokenizer.count_tokens(text) {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!("Tokenizer failed, using estimate: {}", e);
                estimate_tokens(text)
            }
        }
    }

    // ===== Retrieval =====

    /// Ranked recall scoped to the active session (all sessions when none is
    /// active). Never fails: storage errors are logged and yield an empty list.
    pub fn search_memory(
        &self,
        query: &str,
        metadata_filter: Option<Metadata>,
        time_range: Option<TimeRange>,
        limit_tokens: Option<usize>,
    ) -> Vec<StoredMessage> {
        match self.search_memory_ranked(query, metadata_filter, time_range, limit_tokens) {
            Ok(results) => results.into_iter().map(|r| r.message).collect(),
            Err(e) => {
                error!("Memory search failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Like `search_memory`, but keeps scores and surfaces storage errors.
    pub fn search_memory_ranked(
        &self,
        query: &str,
        metadata_filter: Option<Metadata>,
        time_range: Option<TimeRange>,
        limit_tokens: Option<usize>,
    ) -> Result<Vec<SearchResult>> {
        let filter = SearchFilter {
            session_id: self.active_session(),
            ..Default::default()
        }
        .with_metadata(metadata_filter)
        .with_time_range(time_range);

        let ranked = self.rank(query, &filter)?;
        Ok(truncate_to_token_budget(ranked, limit_tokens))
    }

    fn rank(&self, query: &str, filter: &SearchFilter) -> Result<Vec<SearchResult>> {
        let query_embedding = match self.embed_blocking(vec![query.to_string()]) {
            Ok(mut vectors) if vectors.len() == 1 => vectors.pop(),
            Ok(vectors) => {
                warn!("Query embedding returned {} vectors", vectors.len());
                None
            }
            Err(e) => {
                debug!("Query embedding unavailable: {}", e);
                None
            }
        };

        let config = &self.core.config;
        HybridRanker::new(
            &self.core.db,
            config.candidate_limit,
            RankingWeights {
                vector: config.vector_weight,
                keyword: config.keyword_weight,
            },
        )
        .rank(query, query_embedding.as_deref(), filter)
    }

    /// Short-term history plus recalled memory, together within
    /// `max_tokens * (1 - safety_buffer)`. `None` uses the configured window.
    pub fn build_context(&self, query: &str, max_tokens: Option<usize>) -> Result<BuiltContext> {
        let session_id = self.require_session()?;
        let max_tokens = max_tokens.unwrap_or(self.core.config.context_window);
        let filter = SearchFilter::for_session(&session_id);

        self.core.context_builder.build(
            max_tokens,
            |budget| self.core.db.conversations.get_recent_within_budget(&session_id, budget),
            || match self.rank(query, &filter) {
                Ok(ranked) => ranked,
                Err(e) => {
                    error!("Long-term recall failed: {}", e);
                    Vec::new()
                }
            },
        )
    }

    // ===== Maintenance =====

    /// Delete whatever matches ANY given filter. Without filters nothing is
    /// touched and the result is `false`.
    pub fn clear_memory(&self, session_id: Option<&str>, agent_id: Option<&str>, user_id: Option<&str>) -> bool {
        match self.core.db.admin.clear(session_id, agent_id, user_id) {
            Ok(Some(report)) => {
                if let Some(active) = self.active_session() {
                    if report.sessions_deleted.contains(&active) {
                        info!("Active session {} was cleared", active);
                        self.set_active_session(None);
                    }
                }
                true
            }
            Ok(None) => false,
            Err(e) => {
                error!("Failed to clear memory: {}", e);
                false
            }
        }
    }

    /// Empty every table.
    pub fn clear_all(&self) -> bool {
        match self.core.db.admin.clear_all() {
            Ok(()) => {
                self.set_active_session(None);
                true
            }
            Err(e) => {
                error!("Failed to clear all memory: {}", e);
                false
            }
        }
    }

    /// Embed every user/assistant message still missing a vector, in id order,
    /// starting after `resume_from`. Failed batches are skipped and counted.
    pub fn backfill_embeddings(&self, batch_size: usize, resume_from: i64) -> Result<BackfillReport> {
        let batch_size = batch_size.max(1);
        let dimension = self.core.embedder.dimensions();
        let model = self.core.embedder.model_name().to_string();
        let mut report = BackfillReport {
            last_message_id: resume_from,
            ..Default::default()
        };

        loop {
            let pending = self
                .core
                .db
                .conversations
                .pending_embeddings(report.last_message_id, batch_size)?;
            let Some((last_id, _)) = pending.last() else {
                break;
            };
            report.scanned += pending.len();
            report.last_message_id = *last_id;

            let texts: Vec<String> = pending.iter().map(|(_, content)| content.clone()).collect();
            match self.embed_blocking(texts) {
                Ok(vectors) if vectors.len() == pending.len() => {
                    let pairs: Vec<(i64, Vec<f32>)> = pending
                        .iter()
                        .zip(vectors)
                        .filter(|(_, v)| v.len() == dimension)
                        .map(|((id, _), v)| (*id, v))
                        .collect();
                    let written = self.core.db.embeddings.store_embeddings(&pairs, &model)?;
                    metrics::add_embeddings_written(written);
                    report.embedded += written;
                }
                Ok(vectors) => {
                    warn!("Backfill batch returned {} vectors for {} messages", vectors.len(), pending.len());
                    report.failed_batches += 1;
                }
                Err(e) => {
                    warn!("Backfill batch ending at {} failed: {}", last_id, e);
                    report.failed_batches += 1;
                }
            }
            info!(
                "Backfill progress: {} scanned, {} embedded, last id {}",
                report.scanned, report.embedded, report.last_message_id
            );
        }
        Ok(report)
    }

    /// Wait for queued embeddings to be written.
    pub fn flush_embeddings(&self, timeout: Duration) -> bool {
        self.core.pipeline.flush(timeout)
    }

    pub fn stats(&self) -> Result<DatabaseStats> {
        self.core.db.get_stats()
    }

    /// Drain the embedding queue, stop the worker and checkpoint the WAL.
    /// Every handle shares the worker, so this affects all of them.
    pub fn close(&self) {
        self.core.pipeline.shutdown();
        if let Err(e) = self.core.db.checkpoint() {
            warn!("Checkpoint on close failed: {}", e);
        }
        self.set_active_session(None);
    }

    /// Run one provider call on the engine's runtime and wait for it.
    fn embed_blocking(&self, texts: Vec<String>) -> anyhow::Result<Vec<Vec<f32>>> {
        let runtime = self
            .core
            .runtime
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("provider runtime is shut down"))?;
        let embedder = Arc::clone(&self.core.embedder);
        let (tx, rx) = std_mpsc::sync_channel(1);
        runtime.spawn(async move {
            let _ = tx.send(embedder.embed_batch(&texts).await);
        });
        rx.recv_timeout(PROVIDER_CALL_TIMEOUT)
            .map_err(|e| anyhow::anyhow!("embedding call did not complete: {}", e))?
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}
