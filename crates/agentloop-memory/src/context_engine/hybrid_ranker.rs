//! Hybrid semantic + keyword ranking over one filter scope.
//!
//! The candidate set is the union of the vector top-K and the keyword top-K.
//! Each candidate gets `vector_weight * cosine + keyword_weight * bm25`, where a
//! component is 0 when that index has no opinion on the row. Whenever the vector
//! side yields nothing (no query embedding, provider failure, empty index) the
//! ranking is keyword-only over the same filter.
use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::Result;
use crate::memory_db::{
    cosine_similarity, MemoryDatabase, SearchFilter, SearchResult, SearchSource, StoredMessage,
};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankingWeights {
    pub vector: f32,
    pub keyword: f32,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            vector: 0.5,
            keyword: 0.5,
        }
    }
}

pub struct HybridRanker<'a> {
    db: &'a MemoryDatabase,
    candidate_limit: usize,
    weights: RankingWeights,
}

#[derive(Default)]
struct Candidate {
    message: Option<StoredMessage>,
    cosine: Option<f32>,
    keyword: Option<f32>,
}

impl<'a> HybridRanker<'a> {
    pub fn new(db: &'a MemoryDatabase, candidate_limit: usize, weights: RankingWeights) -> Self {
        Self {
            db,
            candidate_limit: candidate_limit.max(1),
            weights,
        }
    }

    /// Fully ordered results, best first. `query_embedding` is `None` when the
    /// provider could not embed the query.
    pub fn rank(
        &self,
        query: &str,
        query_embedding: Option<&[f32]>,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchResult>> {
        let vector_hits = match query_embedding {
            Some(embedding) if !embedding.is_empty() => {
                match self.db.embeddings.search(embedding, filter, self.candidate_limit) {
                    Ok(hits) => hits,
                    Err(e) => {
                        warn!("Vector search failed, using keyword ranking: {}", e);
                        Vec::new()
                    }
                }
            }
            _ => Vec::new(),
        };

        if vector_hits.is_empty() {
            debug!("Keyword-only ranking for {:?}", query);
            metrics::inc_search_fallbacks();
            return self.keyword_only(query, filter);
        }
        let Some(embedding) = query_embedding else {
            return self.keyword_only(query, filter);
        };

        let keyword_hits = self.db.fts.search(query, filter, self.candidate_limit)?;

        let mut candidates: HashMap<i64, Candidate> = HashMap::new();
        for (message, cosine) in vector_hits {
            let entry = candidates.entry(message.message_id).or_default();
            entry.cosine = Some(cosine);
            entry.message = Some(message);
        }
        for (message, score) in keyword_hits {
            let entry = candidates.entry(message.message_id).or_default();
            entry.keyword = Some(score);
            if entry.message.is_none() {
                entry.message = Some(message);
            }
        }

        // Semantic-only candidates may still match a term outside the keyword top-K.
        let missing_keyword: Vec<i64> = candidates
            .iter()
            .filter(|(_, c)| c.keyword.is_none())
            .map(|(id, _)| *id)
            .collect();
        for (id, score) in self.db.fts.score_candidates(query, &missing_keyword)? {
            if let Some(c) = candidates.get_mut(&id) {
                c.keyword = Some(score);
            }
        }

        // Keyword-only candidates are scored against their stored vector if any.
        let missing_cosine: Vec<i64> = candidates
            .iter()
            .filter(|(_, c)| c.cosine.is_none())
            .map(|(id, _)| *id)
            .collect();
        for (id, vector) in self.db.embeddings.get_embeddings(&missing_cosine)? {
            if vector.len() != embedding.len() {
                continue;
            }
            if let Some(c) = candidates.get_mut(&id) {
                c.cosine = Some(cosine_similarity(embedding, &vector));
            }
        }

        let mut results: Vec<SearchResult> = candidates
            .into_values()
            .filter_map(|c| {
                let message = c.message?;
                let source = match (c.cosine.is_some(), c.keyword.is_some()) {
                    (true, true) => SearchSource::Hybrid,
                    (true, false) => SearchSource::Semantic,
                    _ => SearchSource::Keyword,
                };
                let score = self.weights.vector * c.cosine.unwrap_or(0.0)
                    + self.weights.keyword * c.keyword.unwrap_or(0.0);
                Some(SearchResult { message, score, source })
            })
            .collect();
        sort_results(&mut results);
        Ok(results)
    }

    fn keyword_only(&self, query: &str, filter: &SearchFilter) -> Result<Vec<SearchResult>> {
        let mut results: Vec<SearchResult> = self
            .db
            .fts
            .search(query, filter, self.candidate_limit)?
            .into_iter()
            .map(|(message, score)| SearchResult {
                message,
                score,
                source: SearchSource::Keyword,
            })
            .collect();
        sort_results(&mut results);
        Ok(results)
    }
}

/// Score descending, newer message first on ties.
pub fn sort_results(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.message.message_id.cmp(&a.message.message_id))
    });
}

/// Accept results in order while the running token sum stays within
/// `limit`; stop at the first one that would overflow.
pub fn truncate_to_token_budget(results: Vec<SearchResult>, limit: Option<usize>) -> Vec<SearchResult> {
    let Some(limit) = limit else {
        return results;
    };
    let mut total = 0usize;
    let mut kept = Vec::new();
    for result in results {
        if total + result.message.tokens > limit {
            break;
        }
        total += result.message.tokens;
        kept.push(result);
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::test_support::open_temp;
    use crate::memory_db::{Metadata, MessageParams, Role};
    use chrono::{Duration, Utc};
    use proptest::prelude::*;

    fn add(db: &MemoryDatabase, session: &str, content: &str, tokens: usize) -> i64 {
        db.conversations
            .append(
                MessageParams {
                    session_id: session,
                    role: Role::User,
                    content,
                    tokens,
                    metadata: &Metadata::new(),
                },
                Duration::seconds(600),
            )
            .unwrap()
            .message_id
    }

    fn result(id: i64, score: f32, tokens: usize) -> SearchResult {
        SearchResult {
            message: StoredMessage {
                message_id: id,
                session_id: "s1".into(),
                chunk_index: 0,
                role: Role::User,
                content: format!("m{}", id),
                tokens,
                timestamp: Utc::now(),
                metadata: Metadata::new(),
                embedding_model: None,
            },
            score,
            source: SearchSource::Keyword,
        }
    }

    // ===== Ranking =====

    #[test]
    fn test_no_embedding_falls_back_to_keywords() {
        let (_dir, db) = open_temp();
        db.sessions.create_session("s1", "u1").unwrap();
        add(&db, "s1", "the movie was long", 5);
        add(&db, "s1", "pizza for dinner", 5);

        let ranker = HybridRanker::new(&db, 100, RankingWeights::default());
        let results = ranker.rank("movie", None, &SearchFilter::for_session("s1")).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source, SearchSource::Keyword);
        assert!(results[0].message.content.contains("movie"));
    }

    #[test]
    fn test_empty_vector_index_falls_back_to_keywords() {
        let (_dir, db) = open_temp();
        db.sessions.create_session("s1", "u1").unwrap();
        add(&db, "s1", "the movie was long", 5);

        let ranker = HybridRanker::new(&db, 100, RankingWeights::default());
        let results = ranker.rank("movie", Some(&[1.0f32, 0.0][..]), &SearchFilter::default()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source, SearchSource::Keyword);
    }

    #[test]
    fn test_hybrid_combines_both_signals() {
        let (_dir, db) = open_temp();
        db.sessions.create_session("s1", "u1").unwrap();
        let both = add(&db, "s1", "sci-fi movie recommendations", 5);
        let semantic = add(&db, "s1", "films set in space", 5);
        let keyword = add(&db, "s1", "a movie with no vector", 5);
        let neither = add(&db, "s1", "grocery list", 5);
        db.embeddings
            .store_embeddings(
                &[(both, vec![1.0, 0.0]), (semantic, vec![0.9, 0.1]), (neither, vec![0.0, 1.0])],
                "m",
            )
            .unwrap();

        let ranker = HybridRanker::new(&db, 100, RankingWeights::default());
        let results = ranker.rank("movie", Some(&[1.0f32, 0.0][..]), &SearchFilter::for_session("s1")).unwrap();

        assert_eq!(results[0].message.message_id, both);
        assert_eq!(results[0].source, SearchSource::Hybrid);
        let by_id: HashMap<i64, &SearchResult> = results.iter().map(|r| (r.message.message_id, r)).collect();
        assert_eq!(by_id[&semantic].source, SearchSource::Semantic);
        assert_eq!(by_id[&keyword].source, SearchSource::Keyword);
        assert!(by_id[&both].score > by_id[&semantic].score);
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_vector_path_respects_session_scope() {
        let (_dir, db) = open_temp();
        db.sessions.create_session("s1", "u1").unwrap();
        db.sessions.create_session("s2", "u1").unwrap();
        let mine = add(&db, "s1", "alpha", 5);
        let theirs = add(&db, "s2", "alpha", 5);
        db.embeddings.store_embeddings(&[(mine, vec![1.0, 0.0]), (theirs, vec![1.0, 0.0])], "m").unwrap();

        let ranker = HybridRanker::new(&db, 100, RankingWeights::default());
        let results = ranker.rank("alpha", Some(&[1.0f32, 0.0][..]), &SearchFilter::for_session("s1")).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].message.message_id, mine);
    }

    #[test]
    fn test_ties_prefer_recent_messages() {
        let mut results = vec![result(1, 0.5, 1), result(3, 0.5, 1), result(2, 0.9, 1)];
        sort_results(&mut results);
        let ids: Vec<i64> = results.iter().map(|r| r.message.message_id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    // ===== Token budget =====

    #[test]
    fn test_truncation_stops_at_first_overflow() {
        let ranked = vec![result(1, 0.9, 40), result(2, 0.8, 70), result(3, 0.7, 5)];
        let kept = truncate_to_token_budget(ranked, Some(100));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].message.message_id, 1);
    }

    #[test]
    fn test_no_limit_keeps_everything() {
        let ranked = vec![result(1, 0.9, 40), result(2, 0.8, 70)];
        assert_eq!(truncate_to_token_budget(ranked, None).len(), 2);
    }

    proptest! {
        #[test]
        fn prop_truncation_is_a_prefix_within_budget(
            tokens in proptest::collection::vec(0usize..200, 0..40),
            limit in 0usize..1000,
        ) {
            let ranked: Vec<SearchResult> = tokens
                .iter()
                .enumerate()
                .map(|(i, t)| result(i as i64, 1.0 - i as f32 * 0.01, *t))
                .collect();
            let kept = truncate_to_token_budget(ranked, Some(limit));

            let total: usize = kept.iter().map(|r| r.message.tokens).sum();
            prop_assert!(total <= limit);
            for (i, r) in kept.iter().enumerate() {
                prop_assert_eq!(r.message.message_id, i as i64);
            }
            if kept.len() < tokens.len() {
                prop_assert!(total + tokens[kept.len()] > limit);
            }
        }
    }
}
