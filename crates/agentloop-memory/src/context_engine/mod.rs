//! Context engine module - ranks recalled memory and assembles budgeted context

pub mod context_builder;
pub mod hybrid_ranker;

pub use context_builder::{BuiltContext, ContextBudget, ContextBuilder, ContextBuilderConfig};
pub use hybrid_ranker::{sort_results, truncate_to_token_budget, HybridRanker, RankingWeights};
