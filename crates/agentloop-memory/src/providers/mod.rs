//! External collaborator contracts: token counting and text embedding.
//!
//! Providers report failures through `anyhow`; the engine decides whether a
//! failure degrades (keyword-only search, heuristic token counts) or is logged
//! and dropped (embedding batches).
pub mod openai_compat;

pub use openai_compat::OpenAiCompatEmbeddings;

use async_trait::async_trait;

/// Counts tokens for one model. Must be stable for a given input.
pub trait Tokenizer: Send + Sync {
    fn count_tokens(&self, text: &str) -> anyhow::Result<usize>;
}

/// Turns a batch of strings into equal-length, fixed-dimension vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Recorded next to every stored vector.
    fn model_name(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// One vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}

/// `ceil(chars / 4)`: the usual rough estimate for BPE vocabularies.
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    (chars + 3) / 4
}

/// Tokenizer that never fails; used when no real tokenizer is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenizer;

impl Tokenizer for HeuristicTokenizer {
    fn count_tokens(&self, text: &str) -> anyhow::Result<usize> {
        Ok(estimate_tokens(text))
    }
}

/// BPE counts with the `cl100k_base` vocabulary.
#[cfg(feature = "tiktoken")]
pub struct TiktokenTokenizer {
    bpe: tiktoken_rs::CoreBPE,
}

#[cfg(feature = "tiktoken")]
impl TiktokenTokenizer {
    pub fn cl100k() -> anyhow::Result<Self> {
        Ok(Self {
            bpe: tiktoken_rs::cl100k_base()?,
        })
    }
}

#[cfg(feature = "tiktoken")]
impl Tokenizer for TiktokenTokenizer {
    fn count_tokens(&self, text: &str) -> anyhow::Result<usize> {
        Ok(self.bpe.encode_with_special_tokens(text).len())
    }
}

/// Provider for deployments without an embedding backend. Every call fails,
/// which routes all searches through the keyword index.
#[derive(Debug, Clone)]
pub struct UnavailableEmbeddings {
    dimensions: usize,
}

impl UnavailableEmbeddings {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

#[async_trait]
impl EmbeddingProvider for UnavailableEmbeddings {
    fn model_name(&self) -> &str {
        "unavailable"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        anyhow::bail!("no embedding provider configured ({} texts dropped)", texts.len())
    }
}
