pub mod embedding_worker;
pub use embedding_worker::{EmbeddingPipeline, PipelineSettings, RetryPolicy};
