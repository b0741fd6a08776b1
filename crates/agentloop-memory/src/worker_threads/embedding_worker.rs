//! Background embedding consumer.
//!
//! One dedicated OS thread drives a current-thread tokio runtime. Callers
//! enqueue `(message_id, content)` without waiting; the consumer batches jobs
//! and flushes when the batch is full, when the queue has been idle, on an
//! explicit flush, or at shutdown. A panic inside the consumer is caught, the
//! runtime is rebuilt and consumption resumes with the same queue.
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{MemoryError, Result};
use crate::memory_db::MemoryDatabase;
use crate::metrics;
use crate::providers::EmbeddingProvider;

/// Exponential backoff for failed embedding batches.
/// `max_retries == 0` drops a failed batch immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn with_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), doubling up to `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub batch_size: usize,
    pub idle_flush: Duration,
    pub retry: RetryPolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_size: 32,
            idle_flush: Duration::from_secs(3),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
struct EmbeddingJob {
    message_id: i64,
    content: String,
}

enum PipelineCommand {
    Embed(EmbeddingJob),
    Flush(std_mpsc::SyncSender<()>),
    Shutdown,
}

struct WorkerContext {
    db: Arc<MemoryDatabase>,
    provider: Arc<dyn EmbeddingProvider>,
    settings: PipelineSettings,
    depth: Arc<AtomicUsize>,
}

pub struct EmbeddingPipeline {
    sender: mpsc::UnboundedSender<PipelineCommand>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
    depth: Arc<AtomicUsize>,
}

impl EmbeddingPipeline {
    pub fn start(
        db: Arc<MemoryDatabase>,
        provider: Arc<dyn EmbeddingProvider>,
        settings: PipelineSettings,
    ) -> Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let ctx = WorkerContext {
            db,
            provider,
            settings: PipelineSettings {
                batch_size: settings.batch_size.max(1),
                ..settings
            },
            depth: Arc::clone(&depth),
        };

        let thread_handle = thread::Builder::new()
            .name("embedding-worker".to_string())
            .spawn(move || supervise(receiver, ctx))
            .map_err(|e| MemoryError::InvalidState(format!("failed to spawn embedding worker: {}", e)))?;

        info!(
            "Spawned embedding worker (batch={}, idle={:?})",
            settings.batch_size, settings.idle_flush
        );
        Ok(Self {
            sender,
            thread_handle: Mutex::new(Some(thread_handle)),
            depth,
        })
    }

    /// Queue a message for embedding. Never blocks on the provider.
    pub fn enqueue(&self, message_id: i64, content: String) {
        let job = EmbeddingJob { message_id, content };
        // Count before sending so the consumer never decrements below zero.
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        if self.sender.send(PipelineCommand::Embed(job)).is_err() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            warn!("Embedding worker is stopped; message {} left for backfill", message_id);
            return;
        }
        metrics::set_embedding_queue_depth(depth);
    }

    /// Messages accepted but not yet flushed.
    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Block until everything enqueued before this call has been flushed,
    /// or `timeout` elapses. Returns false on timeout or a stopped worker.
    pub fn flush(&self, timeout: Duration) -> bool {
        let (ack_tx, ack_rx) = std_mpsc::sync_channel(1);
        if self.sender.send(PipelineCommand::Flush(ack_tx)).is_err() {
            return false;
        }
        ack_rx.recv_timeout(timeout).is_ok()
    }

    /// Drain the pending batch and stop the worker thread. Idempotent.
    pub fn shutdown(&self) {
        let handle = match self.thread_handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(handle) = handle else {
            return;
        };
        let _ = self.sender.send(PipelineCommand::Shutdown);
        if handle.join().is_err() {
            error!("Embedding worker thread terminated abnormally");
        }
        info!("Embedding worker stopped");
    }
}

impl Drop for EmbeddingPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Runs the consumer loop, rebuilding the runtime after a panic.
fn supervise(mut receiver: mpsc::UnboundedReceiver<PipelineCommand>, ctx: WorkerContext) {
    loop {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    error!("Failed to create embedding worker runtime: {}", e);
                    return;
                }
            };
            rt.block_on(run_worker_loop(&mut receiver, &ctx));
        }));

        match outcome {
            Ok(()) => break,
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("Embedding worker panicked ({}); restarting", reason);
                metrics::inc_embedding_worker_restarts();
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
    debug!("Embedding worker loop exited");
}

async fn run_worker_loop(receiver: &mut mpsc::UnboundedReceiver<PipelineCommand>, ctx: &WorkerContext) {
    let mut batch: Vec<EmbeddingJob> = Vec::with_capacity(ctx.settings.batch_size);
    loop {
        tokio::select! {
            command = receiver.recv() => {
                match command {
                    Some(PipelineCommand::Embed(job)) => {
                        batch.push(job);
                        if batch.len() >= ctx.settings.batch_size {
                            flush_batch(ctx, &mut batch).await;
                        }
                    }
                    Some(PipelineCommand::Flush(ack)) => {
                        flush_batch(ctx, &mut batch).await;
                        let _ = ack.send(());
                    }
                    Some(PipelineCommand::Shutdown) | None => {
                        flush_batch(ctx, &mut batch).await;
                        break;
                    }
                }
            }
            _ = tokio::time::sleep(ctx.settings.idle_flush), if !batch.is_empty() => {
                flush_batch(ctx, &mut batch).await;
            }
        }
    }
}

async fn flush_batch(ctx: &WorkerContext, batch: &mut Vec<EmbeddingJob>) {
    if batch.is_empty() {
        return;
    }
    let jobs = std::mem::take(batch);
    let remaining = ctx
        .depth
        .fetch_sub(jobs.len(), Ordering::Relaxed)
        .saturating_sub(jobs.len());
    metrics::set_embedding_queue_depth(remaining);

    embed_and_store(ctx, &jobs).await;
}

async fn embed_and_store(ctx: &WorkerContext, jobs: &[EmbeddingJob]) {
    let texts: Vec<String> = jobs.iter().map(|j| j.content.clone()).collect();
    let retry = ctx.settings.retry;
    let mut attempt = 0;

    let vectors = loop {
        match ctx.provider.embed_batch(&texts).await {
            Ok(vectors) if vectors.len() == texts.len() => break vectors,
            Ok(vectors) => {
                warn!("Embedding provider returned {} vectors for {} texts", vectors.len(), texts.len());
            }
            Err(e) => {
                warn!("Embedding batch of {} failed (attempt {}): {}", texts.len(), attempt + 1, e);
            }
        }
        if attempt >= retry.max_retries {
            error!(
                "Dropping embedding batch of {} messages (first id {}); run backfill to recover",
                jobs.len(),
                jobs[0].message_id
            );
            metrics::inc_embedding_batches_failed();
            return;
        }
        tokio::time::sleep(retry.backoff(attempt)).await;
        attempt += 1;
    };

    let dimension = ctx.provider.dimensions();
    let pairs: Vec<(i64, Vec<f32>)> = jobs
        .iter()
        .zip(vectors)
        .filter_map(|(job, vector)| {
            if vector.len() == dimension {
                Some((job.message_id, vector))
            } else {
                warn!(
                    "Skipping embedding for message {}: dimension {} != {}",
                    job.message_id,
                    vector.len(),
                    dimension
                );
                None
            }
        })
        .collect();

    match ctx.db.embeddings.store_embeddings(&pairs, ctx.provider.model_name()) {
        Ok(written) => {
            metrics::add_embeddings_written(written);
            debug!("Flushed embedding batch: {} of {} written", written, jobs.len());
        }
        Err(e) => error!("Failed to store embedding batch: {}", e),
    }
}
