use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::worker_threads::{PipelineSettings, RetryPolicy};

/// Every knob the engine reads. `Default` gives the documented defaults;
/// `from_env` overlays `MEMORY_*` variables (and `.env`).
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub db_path: PathBuf,
    /// Default `max_tokens` for `build_context`.
    pub context_window: usize,
    pub session_timeout: Duration,
    pub chunk_gap: Duration,
    pub safety_buffer: f64,
    pub short_term_ratio: f64,
    /// Candidates pulled from each index before hybrid reranking.
    pub candidate_limit: usize,
    pub vector_weight: f32,
    pub keyword_weight: f32,
    pub embedding_dimension: usize,
    pub embedding_batch_size: usize,
    pub embedding_idle_flush: Duration,
    pub embedding_retry: RetryPolicy,
    pub pool_size: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            context_window: 4096,
            session_timeout: Duration::from_secs(1800),
            chunk_gap: Duration::from_secs(600),
            safety_buffer: 0.2,
            short_term_ratio: 0.7,
            candidate_limit: 100,
            vector_weight: 0.5,
            keyword_weight: 0.5,
            embedding_dimension: 512,
            embedding_batch_size: 32,
            embedding_idle_flush: Duration::from_secs(3),
            embedding_retry: RetryPolicy::default(),
            pool_size: 8,
        }
    }
}

/// `~/.agentloop/memory.db`, or `./memory.db` without a home directory.
pub fn default_db_path() -> PathBuf {
    env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .map(|home| PathBuf::from(home).join(".agentloop").join("memory.db"))
        .unwrap_or_else(|| PathBuf::from("memory.db"))
}

impl MemoryConfig {
    /// Defaults pointed at a specific database file.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Default::default()
        }
    }

    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from an arbitrary variable source; unset variables keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let retries: u32 = parse_var(&get, "MEMORY_EMBEDDING_RETRIES", defaults.embedding_retry.max_retries)?;
        let config = Self {
            db_path: get("MEMORY_DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
            context_window: parse_var(&get, "MEMORY_CONTEXT_WINDOW", defaults.context_window)?,
            session_timeout: Duration::from_secs(parse_var(
                &get,
                "MEMORY_SESSION_TIMEOUT_SECS",
                defaults.session_timeout.as_secs(),
            )?),
            chunk_gap: Duration::from_secs(parse_var(&get, "MEMORY_CHUNK_GAP_SECS", defaults.chunk_gap.as_secs())?),
            safety_buffer: parse_var(&get, "MEMORY_SAFETY_BUFFER", defaults.safety_buffer)?,
            short_term_ratio: parse_var(&get, "MEMORY_SHORT_TERM_RATIO", defaults.short_term_ratio)?,
            candidate_limit: parse_var(&get, "MEMORY_CANDIDATE_LIMIT", defaults.candidate_limit)?,
            vector_weight: parse_var(&get, "MEMORY_VECTOR_WEIGHT", defaults.vector_weight)?,
            keyword_weight: parse_var(&get, "MEMORY_KEYWORD_WEIGHT", defaults.keyword_weight)?,
            embedding_dimension: parse_var(&get, "MEMORY_EMBEDDING_DIM", defaults.embedding_dimension)?,
            embedding_batch_size: parse_var(&get, "MEMORY_EMBEDDING_BATCH_SIZE", defaults.embedding_batch_size)?,
            embedding_idle_flush: Duration::from_millis(parse_var(
                &get,
                "MEMORY_EMBEDDING_IDLE_MS",
                defaults.embedding_idle_flush.as_millis() as u64,
            )?),
            embedding_retry: RetryPolicy {
                max_retries: retries,
                ..defaults.embedding_retry
            },
            pool_size: parse_var(&get, "MEMORY_POOL_SIZE", defaults.pool_size)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.safety_buffer) {
            anyhow::bail!("safety_buffer must be in [0, 1), got {}", self.safety_buffer);
        }
        if !(self.short_term_ratio > 0.0 && self.short_term_ratio <= 1.0) {
            anyhow::bail!("short_term_ratio must be in (0, 1], got {}", self.short_term_ratio);
        }
        if self.vector_weight < 0.0 || self.keyword_weight < 0.0 {
            anyhow::bail!("ranking weights must be non-negative");
        }
        if self.vector_weight + self.keyword_weight <= 0.0 {
            anyhow::bail!("at least one ranking weight must be positive");
        }
        if self.embedding_batch_size == 0 {
            anyhow::bail!("embedding_batch_size must be at least 1");
        }
        if self.embedding_dimension == 0 {
            anyhow::bail!("embedding_dimension must be at least 1");
        }
        if self.candidate_limit == 0 {
            anyhow::bail!("candidate_limit must be at least 1");
        }
        if self.pool_size == 0 {
            anyhow::bail!("pool_size must be at least 1");
        }
        Ok(())
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            batch_size: self.embedding_batch_size,
            idle_flush: self.embedding_idle_flush,
            retry: self.embedding_retry,
        }
    }

    pub fn print_config(&self) {
        info!("Memory Configuration:");
        info!("- Database: {}", self.db_path.display());
        info!("- Context Window: {}", self.context_window);
        info!("- Session Timeout: {}s", self.session_timeout.as_secs());
        info!("- Chunk Gap: {}s", self.chunk_gap.as_secs());
        info!("- Safety Buffer: {}", self.safety_buffer);
        info!("- Short-Term Ratio: {}", self.short_term_ratio);
        info!("- Candidates: {}", self.candidate_limit);
        info!("- Weights: vector {} / keyword {}", self.vector_weight, self.keyword_weight);
        info!("- Embedding: dim {}, batch {}, idle {:?}", self.embedding_dimension, self.embedding_batch_size, self.embedding_idle_flush);
        info!("- Embedding Retries: {}", self.embedding_retry.max_retries);
        info!("- Pool Size: {}", self.pool_size);
    }
}

fn parse_var<T, G>(get: &G, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", name, raw)),
        None => Ok(default),
    }
}
