//! Router: classifies a query into one of five route kinds (§4.3, §3 RouteDecision).

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::RouteUtterances;
use crate::error::Result;
use crate::retrieval::{cosine_similarity, EmbeddingService};

/// The fixed set of route kinds (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteKind {
    Rag,
    Direct,
    Escalate,
    SqlStructured,
    ApiLookup,
}

impl RouteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteKind::Rag => "RAG",
            RouteKind::Direct => "DIRECT",
            RouteKind::Escalate => "ESCALATE",
            RouteKind::SqlStructured => "SQL_STRUCTURED",
            RouteKind::ApiLookup => "API_LOOKUP",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "RAG" => Some(RouteKind::Rag),
            "DIRECT" => Some(RouteKind::Direct),
            "ESCALATE" => Some(RouteKind::Escalate),
            "SQL_STRUCTURED" => Some(RouteKind::SqlStructured),
            "API_LOOKUP" => Some(RouteKind::ApiLookup),
            _ => None,
        }
    }
}

impl std::fmt::Display for RouteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of classifying a query (§3 RouteDecision).
#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub route_kind: RouteKind,
    pub confidence: f64,
    pub scores: HashMap<String, f64>,
    pub matched_utterance: Option<String>,
}

/// `route(text) -> RouteDecision` using only local computation (§4.3).
#[async_trait]
pub trait Router: Send + Sync {
    async fn route(&self, text: &str) -> Result<RouteDecision>;
}

/// Max-sim cosine router over pre-embedded per-route utterance sets.
///
/// For each route, takes the **maximum** cosine similarity across its
/// utterance set (not the mean — mean-sim dilutes routes whose utterances
/// span multiple phrasings). Ties are broken by the alphabetically smaller
/// route name.
pub struct CosineRouter<E: EmbeddingService> {
    embedding_service: E,
    route_utterances: Vec<RouteUtterances>,
}

impl<E: EmbeddingService> CosineRouter<E> {
    pub fn new(embedding_service: E, route_utterances: Vec<RouteUtterances>) -> Self {
        Self {
            embedding_service,
            route_utterances,
        }
    }
}

#[async_trait]
impl<E: EmbeddingService> Router for CosineRouter<E> {
    async fn route(&self, text: &str) -> Result<RouteDecision> {
        let query_embedding = self.embedding_service.embed(text).await?;

        let mut scores: HashMap<String, f64> = HashMap::new();
        let mut best_match: HashMap<String, String> = HashMap::new();

        for route in &self.route_utterances {
            let mut max_sim = 0.0_f64;
            let mut matched = None;
            for (utterance, embedding) in &route.utterances {
                let sim = cosine_similarity(&query_embedding, embedding);
                if sim > max_sim {
                    max_sim = sim;
                    matched = Some(utterance.clone());
                }
            }
            scores.insert(route.route_kind.clone(), max_sim);
            if let Some(m) = matched {
                best_match.insert(route.route_kind.clone(), m);
            }
        }

        let mut ranked: Vec<(&String, &f64)> = scores.iter().collect();
        ranked.sort_by(|(name_a, score_a), (name_b, score_b)| {
            score_b
                .partial_cmp(score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| name_a.cmp(name_b))
        });

        let (winner_name, winner_score) = ranked
            .first()
            .map(|(n, s)| ((*n).clone(), **s))
            .unwrap_or_else(|| ("RAG".to_string(), 0.0));

        let route_kind = RouteKind::parse(&winner_name).unwrap_or(RouteKind::Rag);
        let matched_utterance = best_match.get(&winner_name).cloned();

        Ok(RouteDecision {
            route_kind,
            confidence: winner_score,
            scores,
            matched_utterance,
        })
    }
}

/// Apply the routing threshold: substitute `default_route` when confidence is
/// below it (§4.1 stage 3, §4.3).
pub fn apply_threshold(decision: RouteDecision, threshold: f64, default_route: RouteKind) -> RouteDecision {
    if decision.confidence < threshold {
        RouteDecision {
            route_kind: default_route,
            ..decision
        }
    } else {
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedEmbedder;

    #[async_trait]
    impl EmbeddingService for FixedEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            // Toy embedding: presence of a keyword bumps one axis.
            if text.contains("manager") {
                Ok(vec![0.0, 1.0])
            } else if text.contains("policy") {
                Ok(vec![1.0, 0.0])
            } else {
                Ok(vec![0.5, 0.5])
            }
        }
    }

    fn utterances() -> Vec<RouteUtterances> {
        vec![
            RouteUtterances {
                route_kind: "RAG".to_string(),
                utterances: vec![("what is the policy".to_string(), vec![1.0, 0.0])],
            },
            RouteUtterances {
                route_kind: "ESCALATE".to_string(),
                utterances: vec![("speak to a manager".to_string(), vec![0.0, 1.0])],
            },
        ]
    }

    #[tokio::test]
    async fn routes_to_highest_max_sim() {
        let router = CosineRouter::new(FixedEmbedder, utterances());
        let decision = router.route("I want to speak with a manager").await.unwrap();
        assert_eq!(decision.route_kind, RouteKind::Escalate);
        assert!(decision.confidence > 0.9);
    }

    #[tokio::test]
    async fn low_confidence_falls_back_to_default() {
        let router = CosineRouter::new(FixedEmbedder, utterances());
        let decision = router.route("something unrelated").await.unwrap();
        let decision = apply_threshold(decision, 0.9, RouteKind::Rag);
        assert_eq!(decision.route_kind, RouteKind::Rag);
    }

    #[tokio::test]
    async fn determinism_same_query_same_decision() {
        let router = CosineRouter::new(FixedEmbedder, utterances());
        let a = router.route("what is the policy").await.unwrap();
        let b = router.route("what is the policy").await.unwrap();
        assert_eq!(a.route_kind, b.route_kind);
        assert_eq!(a.confidence, b.confidence);
    }
}
