//! Error types for ragflow-core.

use thiserror::Error;

/// Result type alias using ragflow-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while handling a request.
///
/// Most variants here are recovered at the orchestrator boundary and turned
/// into a `Response` field rather than propagated to the caller (see
/// `Error::disposition`). Only programming invariants should ever escape as
/// an unhandled `Result::Err` from `handle`.
#[derive(Error, Debug)]
pub enum Error {
    /// Query failed its own invariants (nonempty text, length bound, nonempty ids).
    #[error("input rejected: {0}")]
    InputRejected(String),

    /// InjectionDetector, PIIDetector (when configured to block), or OptionalMLGuard flagged the input.
    #[error("safety block: {reason}")]
    SafetyBlock { reason: String },

    /// Route requires a capability that is out of core scope.
    #[error("route not implemented: {route}")]
    NotImplementedRoute { route: String },

    /// Non-fatal stage failure (rerank, expansion, schema validation). Recorded, not raised.
    #[error("stage degraded: {stage} - {reason}")]
    DegradedStage { stage: String, reason: String },

    /// All per-query retrieval searches returned zero results after fusion and dedup.
    #[error("retrieval returned no chunks")]
    RetrievalEmpty,

    /// LLM generation failed or timed out.
    #[error("generation failed: {0}")]
    GenerationFailed(String),

    /// Grounding score fell below `warn_threshold`.
    #[error("grounding check failed: score {score} below warn threshold {warn_threshold}")]
    GroundingFail { score: f64, warn_threshold: f64 },

    /// Deadline exceeded or cancellation signal fired.
    #[error("request cancelled: {reason}")]
    Cancelled { reason: String },

    /// Trace, audit, or metric sink failed. Never terminal for the request.
    #[error("sink error ({sink}): {message}")]
    SinkError { sink: String, message: String },

    /// A collaborator call (embedding, vector store, reranker, LLM) returned an error.
    #[error("collaborator error ({collaborator}): {message}")]
    Collaborator {
        collaborator: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Operation timed out.
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error (missing field, invalid value, build failure).
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal/programming invariant violated. Should crash the request task,
    /// not be handled as a normal outcome.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a safety-block error.
    pub fn safety_block(reason: impl Into<String>) -> Self {
        Self::SafetyBlock {
            reason: reason.into(),
        }
    }

    /// Create a not-implemented-route error.
    pub fn not_implemented_route(route: impl Into<String>) -> Self {
        Self::NotImplementedRoute {
            route: route.into(),
        }
    }

    /// Create a degraded-stage error.
    pub fn degraded_stage(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DegradedStage {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    /// Create a generation-failed error.
    pub fn generation_failed(message: impl Into<String>) -> Self {
        Self::GenerationFailed(message.into())
    }

    /// Create a grounding-fail error.
    pub fn grounding_fail(score: f64, warn_threshold: f64) -> Self {
        Self::GroundingFail {
            score,
            warn_threshold,
        }
    }

    /// Create a cancelled error.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Create a sink error.
    pub fn sink_error(sink: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SinkError {
            sink: sink.into(),
            message: message.into(),
        }
    }

    /// Create a collaborator error without a source.
    pub fn collaborator(collaborator: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Collaborator {
            collaborator: collaborator.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a collaborator error wrapping a source error.
    pub fn collaborator_with_source(
        collaborator: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Collaborator {
            collaborator: collaborator.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Whether this error is TERMINAL for the request (maps to a final Response
    /// rather than being recovered locally by the stage that produced it).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::SafetyBlock { .. }
                | Error::NotImplementedRoute { .. }
                | Error::GenerationFailed(_)
                | Error::Cancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_errors_are_classified_correctly() {
        assert!(Error::safety_block("injection").is_terminal());
        assert!(Error::not_implemented_route("SQL_STRUCTURED").is_terminal());
        assert!(Error::generation_failed("timeout").is_terminal());
        assert!(Error::cancelled("deadline exceeded").is_terminal());
    }

    #[test]
    fn degraded_and_sink_errors_are_not_terminal() {
        assert!(!Error::degraded_stage("rerank", "timeout").is_terminal());
        assert!(!Error::sink_error("trace", "disk full").is_terminal());
        assert!(!Error::RetrievalEmpty.is_terminal());
    }

    #[test]
    fn display_messages_are_readable() {
        let err = Error::grounding_fail(0.2, 0.5);
        assert!(err.to_string().contains("0.2"));
    }
}
