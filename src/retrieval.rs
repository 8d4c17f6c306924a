//! EmbeddingService, VectorStore collaborator interfaces, and the pure
//! Deduper/RankFuser stages that turn per-query result lists into one
//! fused, deduplicated RetrievalResult (§4.5, §4.6).

use std::collections::HashMap;

use async_trait::async_trait;

use crate::chunk::Chunk;
use crate::error::Result;

/// `embed(text) -> vector`. Fixed dimensionality, deterministic for a given
/// model version (§6).
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// `search(vec, tenant_id, top_k) -> [Chunk]`. Tenant filtering is mandatory;
/// every returned chunk carries full metadata (§4.5, §6).
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn search(&self, embedding: &[f32], tenant_id: &str, top_k: usize) -> Result<Vec<Chunk>>;
}

/// Result of the fused, deduplicated retrieval stage (§3 RetrievalResult).
#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    pub chunks: Vec<Chunk>,
    pub empty: bool,
    pub raw_counts: HashMap<String, usize>,
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Character trigram Jaccard similarity, the fallback proxy used only when a
/// chunk has no embedding (§4.6, §9 resolved open question: embedding cosine
/// is authoritative whenever present).
fn trigram_similarity(a: &str, b: &str) -> f64 {
    fn trigrams(s: &str) -> std::collections::HashSet<String> {
        let chars: Vec<char> = s.to_lowercase().chars().collect();
        if chars.len() < 3 {
            return std::iter::once(chars.iter().collect()).collect();
        }
        chars
            .windows(3)
            .map(|w| w.iter().collect::<String>())
            .collect()
    }
    let ta = trigrams(a);
    let tb = trigrams(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    intersection as f64 / union as f64
}

fn chunk_similarity(a: &Chunk, b: &Chunk) -> f64 {
    match (&a.embedding, &b.embedding) {
        (Some(ea), Some(eb)) => cosine_similarity(ea, eb),
        _ => trigram_similarity(&a.text, &b.text),
    }
}

/// Deduper: `dedup(chunks, threshold) -> chunks` (§4.6).
///
/// Greedy: iterate in descending score, accept a chunk unless it is
/// threshold-similar to an already-accepted one. Ties on conflict keep the
/// higher-score chunk; a tie on score keeps the lexicographically lower
/// `chunk_id` (§4.1 stage 7).
pub fn dedup(chunks: Vec<Chunk>, threshold: f64) -> Vec<Chunk> {
    let mut sorted = chunks;
    sorted.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });

    let mut accepted: Vec<Chunk> = Vec::new();
    for candidate in sorted {
        let is_dup = accepted
            .iter()
            .any(|kept| chunk_similarity(kept, &candidate) > threshold);
        if !is_dup {
            accepted.push(candidate);
        }
    }
    accepted
}

/// RankFuser (Reciprocal Rank Fusion, k=60): merges per-query ranked chunk
/// lists into one list sorted by fused score descending (§4.6).
///
/// `fused = sum over lists containing the chunk of 1 / (60 + rank)`, where
/// `rank` is the chunk's 1-based rank in that list. Ties are broken by the
/// highest original retrieval score.
pub fn reciprocal_rank_fusion(lists: &[Vec<Chunk>]) -> Vec<Chunk> {
    const K: f64 = 60.0;
    let mut fused_scores: HashMap<String, f64> = HashMap::new();
    let mut best_chunk: HashMap<String, Chunk> = HashMap::new();

    for list in lists {
        for (idx, chunk) in list.iter().enumerate() {
            let rank = (idx + 1) as f64;
            let key = format!("{}::{}", chunk.doc_id, chunk.chunk_id);
            *fused_scores.entry(key.clone()).or_insert(0.0) += 1.0 / (K + rank);
            best_chunk
                .entry(key)
                .and_modify(|existing| {
                    if chunk.score > existing.score {
                        *existing = chunk.clone();
                    }
                })
                .or_insert_with(|| chunk.clone());
        }
    }

    let mut keys: Vec<String> = fused_scores.keys().cloned().collect();
    keys.sort_by(|a, b| {
        let fa = fused_scores[a];
        let fb = fused_scores[b];
        fb.partial_cmp(&fa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                best_chunk[b]
                    .score
                    .partial_cmp(&best_chunk[a].score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    });

    keys.into_iter().map(|k| best_chunk.remove(&k).unwrap()).collect()
}

/// `rerank(query, chunks, top_n) -> [Chunk]` (§4.1 stage 8, §6). Re-scores and
/// truncates; a deployment with no reranking provider configured uses
/// `PassthroughReranker`, which keeps the incoming order.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, chunks: Vec<Chunk>, top_n: usize) -> Result<Vec<Chunk>>;
}

/// Default no-provider reranker: truncates to `top_n` without reordering.
#[derive(Debug, Default)]
pub struct PassthroughReranker;

#[async_trait]
impl Reranker for PassthroughReranker {
    async fn rerank(&self, _query: &str, mut chunks: Vec<Chunk>, top_n: usize) -> Result<Vec<Chunk>> {
        chunks.truncate(top_n);
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(chunk_id: &str, score: f64) -> Chunk {
        Chunk {
            vector_id: format!("v-{chunk_id}"),
            doc_id: "doc-1".to_string(),
            chunk_id: chunk_id.to_string(),
            tenant_id: "t1".to_string(),
            user_id: "u1".to_string(),
            text: format!("passage {chunk_id}"),
            score,
            embedding: None,
        }
    }

    #[test]
    fn dedup_drops_near_duplicate_text_below_threshold() {
        let a = Chunk {
            text: "the retention policy is seven years".to_string(),
            ..chunk("a", 0.9)
        };
        let b = Chunk {
            text: "the retention policy is seven years".to_string(),
            ..chunk("b", 0.5)
        };
        let result = dedup(vec![a.clone(), b], 0.95);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].chunk_id, "a");
    }

    #[test]
    fn dedup_keeps_dissimilar_chunks() {
        let a = Chunk { text: "apples and oranges".to_string(), ..chunk("a", 0.9) };
        let b = Chunk { text: "quantum computing basics".to_string(), ..chunk("b", 0.8) };
        let result = dedup(vec![a, b], 0.95);
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn dedup_is_idempotent() {
        let a = Chunk { text: "unique passage one".to_string(), ..chunk("a", 0.9) };
        let b = Chunk { text: "unique passage two".to_string(), ..chunk("b", 0.8) };
        let once = dedup(vec![a.clone(), b.clone()], 0.95);
        let twice = dedup(once.clone(), 0.95);
        assert_eq!(once.len(), twice.len());
    }

    #[test]
    fn rrf_gives_top_rank_in_every_list_the_highest_score() {
        let winner = chunk("winner", 0.5);
        let other_a = chunk("other-a", 0.9);
        let other_b = chunk("other-b", 0.9);
        let list1 = vec![winner.clone(), other_a];
        let list2 = vec![winner.clone(), other_b];
        let fused = reciprocal_rank_fusion(&[list1, list2]);
        assert_eq!(fused[0].chunk_id, "winner");
    }

    #[test]
    fn rrf_is_order_independent_in_input_list_order() {
        let a = chunk("a", 0.9);
        let b = chunk("b", 0.8);
        let list1 = vec![a.clone(), b.clone()];
        let list2 = vec![b.clone(), a.clone()];
        let fused_ab = reciprocal_rank_fusion(&[list1.clone(), list2.clone()]);
        let fused_ba = reciprocal_rank_fusion(&[list2, list1]);
        let ids_ab: Vec<_> = fused_ab.iter().map(|c| c.chunk_id.clone()).collect();
        let ids_ba: Vec<_> = fused_ba.iter().map(|c| c.chunk_id.clone()).collect();
        assert_eq!(ids_ab, ids_ba);
    }

    #[tokio::test]
    async fn passthrough_reranker_truncates_without_reordering() {
        let reranker = PassthroughReranker;
        let chunks = vec![chunk("a", 0.9), chunk("b", 0.8), chunk("c", 0.7)];
        let result = reranker.rerank("query", chunks, 2).await.unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].chunk_id, "a");
        assert_eq!(result[1].chunk_id, "b");
    }
}
