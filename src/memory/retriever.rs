//! Context retrieval over the memory store
//!
//! Ranks stored entries against a query: embed the query, score by cosine
//! similarity, take top-k, break ties by recency (newer first). Superseded
//! entries never appear. When the embedding boundary fails or times out the
//! retriever degrades to lexical fuzzy matching instead of blocking the turn.

use crate::embeddings::{cosine_similarity, Embedder};
use crate::error::{NimbusError, Result};
use crate::memory::MemoryStore;
use crate::types::{MemoryEntry, ScoredEntry};
use chrono::Utc;
use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Score boost for entries whose content contains the query verbatim.
/// Keeps exact matches ahead of merely-similar ones in one total order.
const EXACT_MATCH_BOOST: f32 = 0.25;

/// Retrieval layer combining the semantic index with a lexical fallback
pub struct ContextRetriever {
    store: Arc<dyn MemoryStore>,
    embedder: Arc<dyn Embedder>,
    embed_timeout: Duration,
}

impl ContextRetriever {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        embedder: Arc<dyn Embedder>,
        embed_timeout: Duration,
    ) -> Self {
        Self {
            store,
            embedder,
            embed_timeout,
        }
    }

    /// Return the `k` most relevant entries, most relevant first.
    ///
    /// Always bounded: an empty store yields an empty vec, never an error.
    /// Store failures propagate typed so the orchestrator can go stateless.
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<ScoredEntry>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let candidates = self.store.live_entries().await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        // Entries stamped in the future are clock skew, not context
        let now = Utc::now();
        let candidates: Vec<MemoryEntry> = candidates
            .into_iter()
            .filter(|e| e.recency <= now)
            .collect();

        let mut scored = match self.embed_query(query).await {
            Ok(query_vec) => self.rank_semantic(query, &query_vec, candidates),
            Err(e) => {
                warn!("Semantic ranking unavailable, using lexical fallback: {}", e);
                self.rank_lexical(query, candidates)
            }
        };

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.entry.recency.cmp(&a.entry.recency))
        });
        scored.truncate(k);

        // Best-effort: retrieval stamps feed eviction, they never fail a turn
        let ids: Vec<_> = scored.iter().map(|s| s.entry.id).collect();
        if let Err(e) = self.store.touch_retrieved(&ids).await {
            debug!("Failed to stamp retrieved entries: {}", e);
        }

        Ok(scored)
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        match tokio::time::timeout(self.embed_timeout, self.embedder.embed(query)).await {
            Ok(result) => result,
            Err(_) => Err(NimbusError::EmbeddingUnavailable(format!(
                "query embedding exceeded {}ms",
                self.embed_timeout.as_millis()
            ))),
        }
    }

    fn rank_semantic(
        &self,
        query: &str,
        query_vec: &[f32],
        candidates: Vec<MemoryEntry>,
    ) -> Vec<ScoredEntry> {
        let query_lower = query.to_lowercase();
        candidates
            .into_iter()
            .filter_map(|entry| {
                let vector = entry.embedding.as_deref()?;
                if vector.len() != query_vec.len() {
                    return None;
                }
                let mut score = cosine_similarity(query_vec, vector);
                if entry.content.to_lowercase().contains(&query_lower) {
                    score += EXACT_MATCH_BOOST;
                }
                Some(ScoredEntry {
                    entry,
                    score,
                    semantic: true,
                })
            })
            .collect()
    }

    fn rank_lexical(&self, query: &str, candidates: Vec<MemoryEntry>) -> Vec<ScoredEntry> {
        let matcher = SkimMatcherV2::default();
        candidates
            .into_iter()
            .filter_map(|entry| {
                let score = matcher.fuzzy_match(&entry.content, query)?;
                Some(ScoredEntry {
                    entry,
                    score: score as f32,
                    semantic: false,
                })
            })
            .collect()
    }
}
