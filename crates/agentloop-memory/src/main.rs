// agentloop-memory/crates/agentloop-memory/src/main.rs

#[cfg(feature = "cli")]
mod cli {
    use std::path::PathBuf;
    use std::sync::Arc;

    use agentloop_memory::config::MemoryConfig;
    use agentloop_memory::providers::{EmbeddingProvider, OpenAiCompatEmbeddings, Tokenizer, UnavailableEmbeddings};
    use agentloop_memory::{metrics, telemetry, MemoryEngine};
    use anyhow::{Context, Result};
    use clap::{Parser, Subcommand};
    use tracing::info;

    /// Maintenance tool for an agentloop memory database
    #[derive(Parser, Debug)]
    #[command(name = "agentloop-memory")]
    #[command(version)]
    struct Cli {
        /// Database file (overrides MEMORY_DB_PATH)
        #[arg(long, global = true)]
        db: Option<PathBuf>,

        /// Log per-message and per-batch events
        #[arg(short, long, global = true)]
        verbose: bool,

        #[command(subcommand)]
        command: Commands,
    }

    #[derive(Subcommand, Debug)]
    enum Commands {
        /// Print session, message and embedding counts
        Stats,

        /// Delete memory matching any of the given filters
        Clear {
            #[arg(long)]
            session: Option<String>,

            #[arg(long)]
            agent: Option<String>,

            #[arg(long)]
            user: Option<String>,
        },

        /// Delete everything
        ClearAll {
            /// Required confirmation
            #[arg(long)]
            yes: bool,
        },

        /// Embed stored messages that have no vector yet
        BackfillEmbeddings {
            #[arg(long, default_value_t = 32)]
            batch_size: usize,

            /// Continue after this message id
            #[arg(long, default_value_t = 0)]
            resume_from: i64,
        },

        /// Ranked recall, printed as JSON
        Search {
            query: String,

            /// Restrict to one existing session
            #[arg(long)]
            session: Option<String>,

            #[arg(long)]
            limit_tokens: Option<usize>,
        },
    }

    fn embedding_provider(config: &MemoryConfig) -> Arc<dyn EmbeddingProvider> {
        match std::env::var("EMBEDDING_URL") {
            Ok(url) if !url.trim().is_empty() => {
                let model = std::env::var("EMBEDDING_MODEL").unwrap_or_else(|_| "text-embedding".to_string());
                Arc::new(
                    OpenAiCompatEmbeddings::new(url, model, config.embedding_dimension)
                        .with_api_key(std::env::var("EMBEDDING_API_KEY").ok()),
                )
            }
            _ => {
                info!("EMBEDDING_URL not set, searches use the keyword index only");
                Arc::new(UnavailableEmbeddings::new(config.embedding_dimension))
            }
        }
    }

    #[cfg(feature = "tiktoken")]
    fn tokenizer() -> Result<Arc<dyn Tokenizer>> {
        Ok(Arc::new(agentloop_memory::providers::TiktokenTokenizer::cl100k()?))
    }

    #[cfg(not(feature = "tiktoken"))]
    fn tokenizer() -> Result<Arc<dyn Tokenizer>> {
        Ok(Arc::new(agentloop_memory::providers::HeuristicTokenizer))
    }

    pub fn run() -> Result<()> {
        let cli = Cli::parse();
        if cli.verbose {
            telemetry::init_tracing_with(telemetry::VERBOSE_LOG_FILTER);
        } else {
            telemetry::init_tracing();
        }

        let mut config = MemoryConfig::from_env()?;
        if let Some(db) = cli.db {
            config.db_path = db;
        }
        config.print_config();

        let provider = embedding_provider(&config);
        let engine = MemoryEngine::open(config, tokenizer()?, provider).context("failed to open memory database")?;

        match cli.command {
            Commands::Stats => {
                println!("{}", serde_json::to_string_pretty(&engine.stats()?)?);
                print!("{}", metrics::gather());
            }
            Commands::Clear { session, agent, user } => {
                let cleared = engine.clear_memory(session.as_deref(), agent.as_deref(), user.as_deref());
                if !cleared {
                    anyhow::bail!("nothing cleared: pass at least one of --session, --agent, --user");
                }
                println!("cleared");
            }
            Commands::ClearAll { yes } => {
                if !yes {
                    anyhow::bail!("refusing to delete all memory without --yes");
                }
                if !engine.clear_all() {
                    anyhow::bail!("clear-all failed, see log");
                }
                println!("all memory cleared");
            }
            Commands::BackfillEmbeddings { batch_size, resume_from } => {
                let report = engine.backfill_embeddings(batch_size, resume_from)?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                print!("{}", metrics::gather());
            }
            Commands::Search {
                query,
                session,
                limit_tokens,
            } => {
                if let Some(session_id) = session {
                    if engine.get_session(&session_id)?.is_none() {
                        anyhow::bail!("session {} does not exist", session_id);
                    }
                    engine.load_session(&session_id, None)?;
                }
                let results = engine.search_memory_ranked(&query, None, None, limit_tokens)?;
                println!("{}", serde_json::to_string_pretty(&results)?);
            }
        }

        engine.close();
        Ok(())
    }
}

#[cfg(feature = "cli")]
fn main() -> anyhow::Result<()> {
    cli::run()
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
