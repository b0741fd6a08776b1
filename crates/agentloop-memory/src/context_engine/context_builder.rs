//! Splits a model's context budget between recent history and recalled memory.
use std::collections::HashSet;

use serde::Serialize;
use tracing::debug;

use crate::context_engine::hybrid_ranker::truncate_to_token_budget;
use crate::error::Result;
use crate::memory_db::{SearchResult, StoredMessage};

/// Two ordered, non-overlapping sequences; the caller interleaves them with
/// its own system and instruction messages.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuiltContext {
    /// Most recent turns of the active session, oldest first.
    pub short_term: Vec<StoredMessage>,
    /// Recalled messages, best match first.
    pub long_term: Vec<StoredMessage>,
}

impl BuiltContext {
    pub fn total_tokens(&self) -> usize {
        self.short_term
            .iter()
            .chain(self.long_term.iter())
            .map(|m| m.tokens)
            .sum()
    }
}

/// Configuration for context building
#[derive(Debug, Clone, Copy)]
pub struct ContextBuilderConfig {
    pub safety_buffer: f64,
    pub short_term_ratio: f64,
}

impl Default for ContextBuilderConfig {
    fn default() -> Self {
        Self {
            safety_buffer: 0.2,
            short_term_ratio: 0.7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextBudget {
    pub usable: usize,
    pub short_term: usize,
}

pub struct ContextBuilder {
    config: ContextBuilderConfig,
}

impl ContextBuilder {
    pub fn new(config: ContextBuilderConfig) -> Self {
        Self { config }
    }

    /// `usable = floor(max_tokens * (1 - safety_buffer))`,
    /// `short_term = floor(usable * short_term_ratio)`.
    pub fn budget(&self, max_tokens: usize) -> ContextBudget {
        let usable = (max_tokens as f64 * (1.0 - self.config.safety_buffer)).floor().max(0.0) as usize;
        let short_term = ((usable as f64 * self.config.short_term_ratio).floor().max(0.0) as usize).min(usable);
        ContextBudget { usable, short_term }
    }

    /// Fill the short-term slice first, then spend whatever is left on recall.
    ///
    /// `load_recent(budget)` returns the newest turns that fit `budget`;
    /// `recall()` returns the full ranked list, which is de-duplicated against
    /// the short-term slice before the greedy token cut.
    pub fn build<R, L>(&self, max_tokens: usize, load_recent: R, recall: L) -> Result<BuiltContext>
    where
        R: FnOnce(usize) -> Result<Vec<StoredMessage>>,
        L: FnOnce() -> Vec<SearchResult>,
    {
        let budget = self.budget(max_tokens);
        let short_term = load_recent(budget.short_term)?;
        let short_tokens: usize = short_term.iter().map(|m| m.tokens).sum();
        let long_budget = budget.usable.saturating_sub(short_tokens);

        let long_term = if long_budget > 0 {
            let seen: HashSet<i64> = short_term.iter().map(|m| m.message_id).collect();
            let candidates: Vec<SearchResult> = recall()
                .into_iter()
                .filter(|r| !seen.contains(&r.message.message_id))
                .collect();
            truncate_to_token_budget(candidates, Some(long_budget))
                .into_iter()
                .map(|r| r.message)
                .collect()
        } else {
            Vec::new()
        };

        debug!(
            "Built context: {} short-term ({} tokens), {} long-term, usable {}",
            short_term.len(),
            short_tokens,
            long_term.len(),
            budget.usable
        );
        Ok(BuiltContext { short_term, long_term })
    }
}
