#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use agentloop_memory::providers::{EmbeddingProvider, Tokenizer};
use agentloop_memory::{MemoryConfig, MemoryEngine};
use async_trait::async_trait;

pub const DIM: usize = 16;

/// One token per whitespace-separated word.
pub struct WordTokenizer;

impl Tokenizer for WordTokenizer {
    fn count_tokens(&self, text: &str) -> anyhow::Result<usize> {
        Ok(text.split_whitespace().count())
    }
}

/// Bag-of-words hashed into `DIM` buckets: texts sharing words point the same way.
pub struct HashingEmbedder;

pub fn hash_embed(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; DIM];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let bucket = word
            .to_lowercase()
            .bytes()
            .fold(7usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize))
            % DIM;
        vector[bucket] += 1.0;
    }
    vector
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn model_name(&self) -> &str {
        "hashing-test"
    }

    fn dimensions(&self) -> usize {
        DIM
    }

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| hash_embed(t)).collect())
    }
}

/// Provider that fails every call.
pub struct BrokenEmbedder;

#[async_trait]
impl EmbeddingProvider for BrokenEmbedder {
    fn model_name(&self) -> &str {
        "broken"
    }

    fn dimensions(&self) -> usize {
        DIM
    }

    async fn embed_batch(&self, _texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        anyhow::bail!("embedding backend is down")
    }
}

pub fn test_config(db_path: &Path) -> MemoryConfig {
    let mut config = MemoryConfig::with_db_path(db_path);
    config.embedding_dimension = DIM;
    config.embedding_batch_size = 4;
    config.embedding_idle_flush = Duration::from_millis(20);
    config.pool_size = 4;
    config
}

pub fn open_engine(db_path: &Path, embedder: Arc<dyn EmbeddingProvider>) -> MemoryEngine {
    open_with(test_config(db_path), embedder)
}

pub fn open_with(config: MemoryConfig, embedder: Arc<dyn EmbeddingProvider>) -> MemoryEngine {
    MemoryEngine::open(config, Arc::new(WordTokenizer), embedder).unwrap()
}

/// `n` filler words, i.e. `n` tokens under `WordTokenizer`.
pub fn words(n: usize) -> String {
    vec!["filler"; n].join(" ")
}
