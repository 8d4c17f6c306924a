//! # ragflow-core
//!
//! Request-scoped orchestration core for an enterprise retrieval-augmented
//! generation pipeline.
//!
//! ## Core components
//!
//! - **Query / RequestContext**: validated request input and per-request state
//! - **Orchestrator**: runs the routing → retrieval → generation → grounding graph
//! - **Trace / AuditEvent**: append-only observation records for one request
//! - **Config**: immutable, process-lifetime configuration snapshot
//!
//! ## Example
//!
//! ```rust,ignore
//! use ragflow_core::{Config, ConfigBuilder, Orchestrator, Query};
//!
//! let config = ConfigBuilder::new().build()?;
//! let response = orchestrator.handle(Query::new("What is our retention policy?", "u1", "t1")).await;
//! ```

pub mod audit;
pub mod chunk;
pub mod compression;
pub mod config;
pub mod error;
pub mod experiment;
pub mod generation;
pub mod grounding;
pub mod metrics;
pub mod orchestrator;
pub mod primitives;
pub mod query;
pub mod query_plan;
pub mod response;
pub mod retrieval;
pub mod route;
pub mod safety;
pub mod schema;
pub mod trace;

pub use audit::{Actor, AuditEvent, AuditSink, InMemoryAuditSink, Resource};
pub use chunk::Chunk;
pub use compression::{compress, enforce_token_budget, approximate_token_count, CompressedContext, ScoredChunk};
pub use config::{Config, ConfigBuilder};
pub use error::{Error, Result};
pub use experiment::{FeatureFlagResolver, ShadowGateOutcome, ShadowRunner, ShadowSpendTracker};
pub use generation::{Generation, GenerationLimits, LLMClient, ModelTier, ModelTierPolicy, StubLlmClient, TierSignals};
pub use grounding::{Aggregation, GroundingLevel, GroundingScorer, GroundingVerdict, LexicalOverlapScorer};
pub use metrics::{names as metric_names, InMemoryMetricSink, MetricSink};
pub use orchestrator::{Collaborators, Orchestrator};
pub use primitives::{Clock, FixedClock, IdGen, SystemClock, UuidGen};
pub use query::{CancellationSignal, Query, QueryOptions, RequestContext};
pub use query_plan::{LlmQueryExpander, QueryExpander, QueryPlan};
pub use response::{Metadata, Response, Source};
pub use retrieval::{
    cosine_similarity, dedup, reciprocal_rank_fusion, EmbeddingService, PassthroughReranker,
    Reranker, RetrievalResult, VectorStore,
};
pub use route::{apply_threshold, CosineRouter, RouteDecision, RouteKind, Router};
pub use safety::{
    InjectionDetector, InjectionVerdict, MlGuardVerdict, NoopMlGuard, OptionalMlGuard,
    PatternInjectionDetector, PatternPiiDetector, PiiDetector, PiiFinding,
};
pub use schema::{validate, wrap_plain_text_answer, FieldSpec, FieldType, RouteSchema};
pub use trace::{AttrValue, CollectingTraceSink, FileTraceSink, NoopTraceSink, Span, SpanStatus, Trace, TraceSink, Totals};
