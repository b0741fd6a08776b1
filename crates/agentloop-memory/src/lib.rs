// agentloop-memory/crates/agentloop-memory/src/lib.rs

pub mod config;
pub mod context_engine;
pub mod engine;
pub mod error;
pub mod memory_db;
pub mod metrics;
pub mod providers;
pub mod telemetry;
pub mod worker_threads;

// Public API exports
pub use config::MemoryConfig;
pub use context_engine::BuiltContext;
pub use engine::{BackfillReport, MemoryEngine};
pub use error::{MemoryError, Result};
pub use memory_db::{
    DatabaseStats, Metadata, Role, SearchResult, SearchSource, Session, StoredMessage, TimeRange,
};
pub use providers::{
    estimate_tokens, EmbeddingProvider, HeuristicTokenizer, OpenAiCompatEmbeddings, Tokenizer,
    UnavailableEmbeddings,
};
#[cfg(feature = "tiktoken")]
pub use providers::TiktokenTokenizer;
