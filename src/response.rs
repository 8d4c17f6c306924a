//! External response shape (§3 Response, §6 Response JSON).

use serde::{Deserialize, Serialize};

/// One cited source in a Response (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub doc_id: String,
    pub chunk_id: String,
    pub text_snippet: String,
    pub relevance_score: f64,
    pub source_url: Option<String>,
}

/// Per-request metadata surfaced to the caller (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub route_used: String,
    pub faithfulness_score: Option<f64>,
    pub model: Option<String>,
    pub latency_ms: i64,
    pub tokens_used: Option<u64>,
    pub schema_valid: bool,
}

/// The final, caller-facing result of handling a Query (§3 Response, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub answer: Option<String>,
    pub trace_id: String,
    pub sources: Vec<Source>,
    pub metadata: Metadata,
    pub fallback: bool,
    pub blocked: bool,
    pub block_reason: Option<String>,
}

impl Response {
    /// A TERMINAL safety block: no answer, no sources, reason surfaced.
    pub fn blocked(trace_id: impl Into<String>, route_used: impl Into<String>, reason: impl Into<String>, latency_ms: i64) -> Self {
        Self {
            answer: None,
            trace_id: trace_id.into(),
            sources: Vec::new(),
            metadata: Metadata {
                route_used: route_used.into(),
                faithfulness_score: None,
                model: None,
                latency_ms,
                tokens_used: None,
                schema_valid: false,
            },
            fallback: false,
            blocked: true,
            block_reason: Some(reason.into()),
        }
    }

    /// A DEGRADE outcome where grounding failed below `warn_threshold`: the
    /// caller gets the configured fallback text instead of the model's answer,
    /// with `fallback=true` and the grounding score still surfaced (§4.9).
    pub fn fallback(
        trace_id: impl Into<String>,
        route_used: impl Into<String>,
        fallback_text: impl Into<String>,
        faithfulness_score: f64,
        latency_ms: i64,
    ) -> Self {
        Self {
            answer: Some(fallback_text.into()),
            trace_id: trace_id.into(),
            sources: Vec::new(),
            metadata: Metadata {
                route_used: route_used.into(),
                faithfulness_score: Some(faithfulness_score),
                model: None,
                latency_ms,
                tokens_used: None,
                schema_valid: false,
            },
            fallback: true,
            blocked: false,
            block_reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_response_carries_no_answer_or_sources() {
        let response = Response::blocked("trace-1", "RAG", "prompt injection detected", 12);
        assert!(response.blocked);
        assert!(response.answer.is_none());
        assert!(response.sources.is_empty());
        assert_eq!(response.block_reason.as_deref(), Some("prompt injection detected"));
    }

    #[test]
    fn fallback_response_sets_flag_and_score() {
        let response = Response::fallback("trace-2", "RAG", "I don't have enough information.", 0.2, 40);
        assert!(response.fallback);
        assert!(!response.blocked);
        assert_eq!(response.metadata.faithfulness_score, Some(0.2));
    }

    #[test]
    fn response_round_trips_through_json() {
        let response = Response::blocked("trace-3", "DIRECT", "pii", 5);
        let json = serde_json::to_value(&response).unwrap();
        let back: Response = serde_json::from_value(json).unwrap();
        assert_eq!(back.trace_id, "trace-3");
    }
}
