//! GroundingScorer collaborator interface and decision policy (§4.9, §3 GroundingVerdict).
//!
//! Grounded on the teacher's `epistemic` module: `BudgetResult`/`Probability`
//! establish the pattern of mapping a continuous support score to a discrete
//! status via ordered thresholds. This crate's grounding model is simpler —
//! a single [0,1] score aggregated across chunks rather than a KL-divergence
//! budget — but keeps that score -> threshold -> level shape.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chunk::Chunk;
use crate::error::Result;

/// How per-chunk grounding scores are combined into one verdict score (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Aggregation {
    Max,
    Mean,
    Min,
}

impl Aggregation {
    pub fn combine(&self, scores: &[f64]) -> f64 {
        if scores.is_empty() {
            return 0.0;
        }
        match self {
            Aggregation::Max => scores.iter().cloned().fold(f64::MIN, f64::max),
            Aggregation::Min => scores.iter().cloned().fold(f64::MAX, f64::min),
            Aggregation::Mean => scores.iter().sum::<f64>() / scores.len() as f64,
        }
    }
}

/// Three-way hallucination verdict (§3 GroundingVerdict).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroundingLevel {
    Pass,
    Warn,
    Fail,
}

/// `score(chunks, answer) -> GroundingVerdict` (§3, §4.9).
#[derive(Debug, Clone)]
pub struct GroundingVerdict {
    pub score: f64,
    pub level: GroundingLevel,
    pub per_chunk_scores: Vec<f64>,
    pub aggregation: Aggregation,
}

impl GroundingVerdict {
    pub fn classify(
        per_chunk_scores: Vec<f64>,
        aggregation: Aggregation,
        pass_threshold: f64,
        warn_threshold: f64,
    ) -> Self {
        let score = aggregation.combine(&per_chunk_scores);
        let level = if score >= pass_threshold {
            GroundingLevel::Pass
        } else if score >= warn_threshold {
            GroundingLevel::Warn
        } else {
            GroundingLevel::Fail
        };
        Self {
            score,
            level,
            per_chunk_scores,
            aggregation,
        }
    }
}

/// `score(chunks, answer) -> GroundingVerdict`. Pair order (context, answer)
/// is contractual; reversing it is a contract violation (§6).
#[async_trait]
pub trait GroundingScorer: Send + Sync {
    async fn score(
        &self,
        context_chunks: &[Chunk],
        answer: &str,
        aggregation: Aggregation,
        pass_threshold: f64,
        warn_threshold: f64,
    ) -> Result<GroundingVerdict>;
}

/// Lexical-overlap grounding scorer: scores each chunk by the fraction of the
/// answer's distinct content words it covers. A placeholder-grade local
/// implementation suitable for tests and for deployments without a dedicated
/// grounding model; production deployments are expected to supply their own
/// `GroundingScorer` backed by an entailment or similarity model.
#[derive(Debug, Default)]
pub struct LexicalOverlapScorer;

fn content_words(text: &str) -> std::collections::HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.len() > 2)
        .collect()
}

#[async_trait]
impl GroundingScorer for LexicalOverlapScorer {
    async fn score(
        &self,
        context_chunks: &[Chunk],
        answer: &str,
        aggregation: Aggregation,
        pass_threshold: f64,
        warn_threshold: f64,
    ) -> Result<GroundingVerdict> {
        let answer_words = content_words(answer);
        let per_chunk_scores: Vec<f64> = context_chunks
            .iter()
            .map(|chunk| {
                if answer_words.is_empty() {
                    return 0.0;
                }
                let chunk_words = content_words(&chunk.text);
                let covered = answer_words.intersection(&chunk_words).count();
                covered as f64 / answer_words.len() as f64
            })
            .collect();

        Ok(GroundingVerdict::classify(
            per_chunk_scores,
            aggregation,
            pass_threshold,
            warn_threshold,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str) -> Chunk {
        Chunk {
            vector_id: "v1".to_string(),
            doc_id: "d1".to_string(),
            chunk_id: "c1".to_string(),
            tenant_id: "t1".to_string(),
            user_id: "u1".to_string(),
            text: text.to_string(),
            score: 0.9,
            embedding: None,
        }
    }

    #[test]
    fn max_aggregation_picks_best_chunk() {
        let verdict = GroundingVerdict::classify(vec![0.2, 0.9, 0.4], Aggregation::Max, 0.75, 0.5);
        assert_eq!(verdict.score, 0.9);
        assert_eq!(verdict.level, GroundingLevel::Pass);
    }

    #[test]
    fn fail_level_is_below_warn_threshold() {
        let verdict = GroundingVerdict::classify(vec![0.1], Aggregation::Mean, 0.75, 0.5);
        assert_eq!(verdict.level, GroundingLevel::Fail);
        assert!(verdict.score < 0.5);
    }

    #[tokio::test]
    async fn lexical_scorer_rewards_supported_answers() {
        let scorer = LexicalOverlapScorer;
        let chunks = vec![chunk("the retention period is seven years from contract end")];
        let verdict = scorer
            .score(&chunks, "the retention period is seven years", Aggregation::Max, 0.6, 0.3)
            .await
            .unwrap();
        assert_eq!(verdict.level, GroundingLevel::Pass);
    }

    #[tokio::test]
    async fn lexical_scorer_flags_unsupported_answers() {
        let scorer = LexicalOverlapScorer;
        let chunks = vec![chunk("unrelated passage about shipping logistics")];
        let verdict = scorer
            .score(&chunks, "the retention period is seven years", Aggregation::Max, 0.6, 0.3)
            .await
            .unwrap();
        assert_eq!(verdict.level, GroundingLevel::Fail);
    }
}
