use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use lazy_static::lazy_static;
use std::sync::OnceLock;
use tracing::warn;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}
static MESSAGES_STORED: OnceLock<IntCounter> = OnceLock::new();
static EMBEDDINGS_WRITTEN: OnceLock<IntCounter> = OnceLock::new();
static EMBEDDING_BATCHES_FAILED: OnceLock<IntCounter> = OnceLock::new();
static EMBEDDING_WORKER_RESTARTS: OnceLock<IntCounter> = OnceLock::new();
static SEARCH_FALLBACKS: OnceLock<IntCounter> = OnceLock::new();
static EMBEDDING_QUEUE_DEPTH: OnceLock<IntGauge> = OnceLock::new();

fn register_counter(slot: &'static OnceLock<IntCounter>, name: &str, help: &str) {
    if slot.get().is_some() {
        return;
    }
    match IntCounter::new(name, help) {
        Ok(counter) => {
            let counter = slot.get_or_init(|| counter);
            REGISTRY.register(Box::new(counter.clone())).ok();
        }
        Err(e) => warn!("Failed to create metric {}: {}", name, e),
    }
}

/// Registers every metric once; later calls are no-ops.
pub fn init_metrics() {
    register_counter(&MESSAGES_STORED, "memory_messages_stored_total", "Messages persisted by add_memory");
    register_counter(&EMBEDDINGS_WRITTEN, "memory_embeddings_written_total", "Embedding vectors written to storage");
    register_counter(
        &EMBEDDING_BATCHES_FAILED,
        "memory_embedding_batches_failed_total",
        "Embedding batches dropped after exhausting retries",
    );
    register_counter(
        &EMBEDDING_WORKER_RESTARTS,
        "memory_embedding_worker_restarts_total",
        "Embedding consumer restarts after a panic",
    );
    register_counter(
        &SEARCH_FALLBACKS,
        "memory_search_fallbacks_total",
        "Searches answered by the keyword index alone",
    );

    if EMBEDDING_QUEUE_DEPTH.get().is_none() {
        match IntGauge::new("memory_embedding_queue_depth", "Messages waiting for an embedding") {
            Ok(gauge) => {
                let gauge = EMBEDDING_QUEUE_DEPTH.get_or_init(|| gauge);
                REGISTRY.register(Box::new(gauge.clone())).ok();
            }
            Err(e) => warn!("Failed to create queue depth gauge: {}", e),
        }
    }
}

pub fn inc_messages_stored() {
    if let Some(counter) = MESSAGES_STORED.get() {
        counter.inc();
    }
}
pub fn add_embeddings_written(n: usize) {
    if let Some(counter) = EMBEDDINGS_WRITTEN.get() {
        counter.inc_by(n as u64);
    }
}
pub fn inc_embedding_batches_failed() {
    if let Some(counter) = EMBEDDING_BATCHES_FAILED.get() {
        counter.inc();
    }
}
pub fn inc_embedding_worker_restarts() {
    if let Some(counter) = EMBEDDING_WORKER_RESTARTS.get() {
        counter.inc();
    }
}
pub fn inc_search_fallbacks() {
    if let Some(counter) = SEARCH_FALLBACKS.get() {
        counter.inc();
    }
}
pub fn set_embedding_queue_depth(depth: usize) {
    if let Some(gauge) = EMBEDDING_QUEUE_DEPTH.get() {
        gauge.set(depth as i64);
    }
}

/// Text exposition of every registered metric.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent_and_exposes_counters() {
        init_metrics();
        init_metrics();
        inc_messages_stored();
        add_embeddings_written(3);
        set_embedding_queue_depth(2);

        let text = gather();
        assert!(text.contains("memory_messages_stored_total"));
        assert!(text.contains("memory_embeddings_written_total"));
        assert!(text.contains("memory_embedding_queue_depth"));
    }
}
