//! Immutable configuration snapshot.
//!
//! `Config` is built once, at process startup, by layering compiled-in
//! defaults with an optional file overlay and environment overrides, in that
//! order. Every stage reads thresholds from the resulting `Arc<Config>`; there
//! is no runtime attribute lookup and no reload short of a process restart.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::grounding::Aggregation;
use crate::primitives::hash::content_hash;

/// Routing thresholds (§4.3, §6).
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    pub threshold: f64,
    pub default_route: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            threshold: 0.55,
            default_route: "RAG".to_string(),
        }
    }
}

/// Query expansion thresholds (§4.4).
#[derive(Debug, Clone)]
pub struct ExpansionConfig {
    pub enabled: bool,
    pub variants: usize,
    pub skip_threshold: f64,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            variants: 2,
            skip_threshold: 0.92,
        }
    }
}

/// Retrieval fan-out bounds (§4.1 stage 6).
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub max_parallel: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 20,
            max_parallel: 4,
        }
    }
}

/// Dedup similarity threshold (§4.6).
#[derive(Debug, Clone)]
pub struct DedupConfig {
    pub threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { threshold: 0.95 }
    }
}

/// Rerank output size (§4.1 stage 8).
#[derive(Debug, Clone)]
pub struct RerankConfig {
    pub top_n: usize,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self { top_n: 8 }
    }
}

/// Compression and token-budget parameters (§4.7).
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    pub sentences_per_chunk: usize,
    pub max_tokens: usize,
    pub prompt_overhead_tokens: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            sentences_per_chunk: 5,
            max_tokens: 4_000,
            prompt_overhead_tokens: 500,
        }
    }
}

impl CompressionConfig {
    /// Budget actually enforced by TokenBudgeter: `max_tokens - prompt_overhead_tokens`.
    pub fn effective_budget(&self) -> usize {
        self.max_tokens.saturating_sub(self.prompt_overhead_tokens)
    }
}

/// Grounding thresholds and fallback text (§4.9).
#[derive(Debug, Clone)]
pub struct GroundingConfig {
    pub aggregation: Aggregation,
    pub pass_threshold: f64,
    pub warn_threshold: f64,
    pub fallback_text: String,
    pub disclaimer_prefix: String,
}

impl Default for GroundingConfig {
    fn default() -> Self {
        Self {
            aggregation: Aggregation::Max,
            pass_threshold: 0.75,
            warn_threshold: 0.5,
            fallback_text: "I don't have enough grounded information in the retrieved documents \
                 to answer this confidently. Please review the sources below."
                .to_string(),
            disclaimer_prefix: "Note: this answer may be only partially supported by the \
                 retrieved documents.\n\n"
                .to_string(),
        }
    }
}

/// Model tier -> model id map and generation parameters (§4.8).
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub tiers: HashMap<String, String>,
    pub temperature: f64,
    pub max_output_tokens: usize,
    pub timeout_ms: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        let mut tiers = HashMap::new();
        tiers.insert("FAST".to_string(), "fast-model".to_string());
        tiers.insert("STANDARD".to_string(), "standard-model".to_string());
        tiers.insert("COMPLEX".to_string(), "complex-model".to_string());
        Self {
            tiers,
            temperature: 0.2,
            max_output_tokens: 1024,
            timeout_ms: 20_000,
        }
    }
}

/// Safety layer toggles (§4.2).
#[derive(Debug, Clone)]
pub struct SafetyConfig {
    pub l2_enabled: bool,
    pub block_on_pii: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            l2_enabled: false,
            block_on_pii: false,
        }
    }
}

/// Shadow execution gates (§4.10).
#[derive(Debug, Clone)]
pub struct ShadowConfig {
    pub enabled: bool,
    pub sample_rate: f64,
    pub budget_usd: f64,
    pub circuit_multiplier: f64,
    pub max_inflight: usize,
    pub candidate_model_id: String,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_rate: 0.0,
            budget_usd: 0.0,
            circuit_multiplier: 3.0,
            max_inflight: 4,
            candidate_model_id: "standard-model".to_string(),
        }
    }
}

/// One experiment flag's variant weights and overrides (§4.10, §6).
#[derive(Debug, Clone)]
pub struct FlagDef {
    pub variants: Vec<(String, f64)>,
    pub user_overrides: HashMap<String, String>,
    pub tenant_overrides: HashMap<String, String>,
    pub default_variant: String,
}

/// All configured experiment flags, keyed by flag name.
#[derive(Debug, Clone, Default)]
pub struct FlagsConfig {
    pub flags: HashMap<String, FlagDef>,
}

/// One route's pre-embedded utterance set, for Router (§4.3).
#[derive(Debug, Clone)]
pub struct RouteUtterances {
    pub route_kind: String,
    pub utterances: Vec<(String, Vec<f32>)>,
}

/// The full immutable configuration snapshot.
#[derive(Debug, Clone)]
pub struct Config {
    pub routing: RoutingConfig,
    pub route_utterances: Vec<RouteUtterances>,
    pub expansion: ExpansionConfig,
    pub retrieval: RetrievalConfig,
    pub dedup: DedupConfig,
    pub rerank: RerankConfig,
    pub compression: CompressionConfig,
    pub grounding: GroundingConfig,
    pub generation: GenerationConfig,
    pub safety: SafetyConfig,
    pub shadow: ShadowConfig,
    pub flags: FlagsConfig,
    pub pipeline_version: String,
    config_hash: String,
}

impl Config {
    /// Stable hash of the snapshot's semantic content, used as
    /// `Trace.config_hash` / `RequestContext.config_snapshot_hash`.
    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }
}

/// Fluent builder mirroring the teacher's `OrchestratorConfig`/`ClientConfig`
/// pattern: one area at a time, ending in `.build()`.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    routing: Option<RoutingConfig>,
    route_utterances: Vec<RouteUtterances>,
    expansion: Option<ExpansionConfig>,
    retrieval: Option<RetrievalConfig>,
    dedup: Option<DedupConfig>,
    rerank: Option<RerankConfig>,
    compression: Option<CompressionConfig>,
    grounding: Option<GroundingConfig>,
    generation: Option<GenerationConfig>,
    safety: Option<SafetyConfig>,
    shadow: Option<ShadowConfig>,
    flags: Option<FlagsConfig>,
    pipeline_version: Option<String>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_routing(mut self, routing: RoutingConfig) -> Self {
        self.routing = Some(routing);
        self
    }

    pub fn with_route_utterances(mut self, utterances: Vec<RouteUtterances>) -> Self {
        self.route_utterances = utterances;
        self
    }

    pub fn with_expansion(mut self, expansion: ExpansionConfig) -> Self {
        self.expansion = Some(expansion);
        self
    }

    pub fn with_retrieval(mut self, retrieval: RetrievalConfig) -> Self {
        self.retrieval = Some(retrieval);
        self
    }

    pub fn with_dedup(mut self, dedup: DedupConfig) -> Self {
        self.dedup = Some(dedup);
        self
    }

    pub fn with_rerank(mut self, rerank: RerankConfig) -> Self {
        self.rerank = Some(rerank);
        self
    }

    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = Some(compression);
        self
    }

    pub fn with_grounding(mut self, grounding: GroundingConfig) -> Self {
        self.grounding = Some(grounding);
        self
    }

    pub fn with_generation(mut self, generation: GenerationConfig) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn with_safety(mut self, safety: SafetyConfig) -> Self {
        self.safety = Some(safety);
        self
    }

    pub fn with_shadow(mut self, shadow: ShadowConfig) -> Self {
        self.shadow = Some(shadow);
        self
    }

    pub fn with_flags(mut self, flags: FlagsConfig) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn with_pipeline_version(mut self, version: impl Into<String>) -> Self {
        self.pipeline_version = Some(version.into());
        self
    }

    /// Apply environment variable overrides. Only a handful of thresholds are
    /// exposed this way; unknown or malformed values are configuration errors,
    /// not silently ignored.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(raw) = std::env::var("RAGFLOW_ROUTING_THRESHOLD") {
            let threshold: f64 = raw
                .parse()
                .map_err(|_| Error::Config(format!("invalid RAGFLOW_ROUTING_THRESHOLD: {raw}")))?;
            let mut routing = self.routing.unwrap_or_default();
            routing.threshold = threshold;
            self.routing = Some(routing);
        }
        if let Ok(raw) = std::env::var("RAGFLOW_SHADOW_ENABLED") {
            let enabled: bool = raw
                .parse()
                .map_err(|_| Error::Config(format!("invalid RAGFLOW_SHADOW_ENABLED: {raw}")))?;
            let mut shadow = self.shadow.unwrap_or_default();
            shadow.enabled = enabled;
            self.shadow = Some(shadow);
        }
        Ok(self)
    }

    pub fn build(self) -> Result<Arc<Config>> {
        let routing = self.routing.unwrap_or_default();
        let expansion = self.expansion.unwrap_or_default();
        let retrieval = self.retrieval.unwrap_or_default();
        let dedup = self.dedup.unwrap_or_default();
        let rerank = self.rerank.unwrap_or_default();
        let compression = self.compression.unwrap_or_default();
        let grounding = self.grounding.unwrap_or_default();
        let generation = self.generation.unwrap_or_default();
        let safety = self.safety.unwrap_or_default();
        let shadow = self.shadow.unwrap_or_default();
        let flags = self.flags.unwrap_or_default();
        let pipeline_version = self.pipeline_version.unwrap_or_else(|| "0.1.0".to_string());

        if grounding.warn_threshold > grounding.pass_threshold {
            return Err(Error::Config(
                "grounding.warn_threshold must be <= grounding.pass_threshold".to_string(),
            ));
        }
        if compression.prompt_overhead_tokens >= compression.max_tokens {
            return Err(Error::Config(
                "compression.prompt_overhead_tokens must be < compression.max_tokens".to_string(),
            ));
        }

        let canonical = format!(
            "{:?}|{:?}|{:?}|{:?}|{:?}|{:?}|{:?}|{:?}|{:?}|{}",
            (routing.threshold, &routing.default_route),
            (expansion.enabled, expansion.variants, expansion.skip_threshold),
            (retrieval.top_k, retrieval.max_parallel),
            dedup.threshold,
            rerank.top_n,
            (
                compression.sentences_per_chunk,
                compression.max_tokens,
                compression.prompt_overhead_tokens,
            ),
            (grounding.pass_threshold, grounding.warn_threshold),
            (generation.temperature, generation.max_output_tokens),
            (safety.l2_enabled, safety.block_on_pii),
            pipeline_version,
        );
        let config_hash = content_hash(canonical.as_bytes());

        Ok(Arc::new(Config {
            routing,
            route_utterances: self.route_utterances,
            expansion,
            retrieval,
            dedup,
            rerank,
            compression,
            grounding,
            generation,
            safety,
            shadow,
            flags,
            pipeline_version,
            config_hash,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_build_succeeds() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.routing.default_route, "RAG");
        assert!(!config.config_hash().is_empty());
    }

    #[test]
    fn same_settings_hash_identically() {
        let a = ConfigBuilder::new().build().unwrap();
        let b = ConfigBuilder::new().build().unwrap();
        assert_eq!(a.config_hash(), b.config_hash());
    }

    #[test]
    fn different_settings_hash_differently() {
        let a = ConfigBuilder::new().build().unwrap();
        let b = ConfigBuilder::new()
            .with_routing(RoutingConfig {
                threshold: 0.9,
                default_route: "RAG".to_string(),
            })
            .build()
            .unwrap();
        assert_ne!(a.config_hash(), b.config_hash());
    }

    #[test]
    fn inverted_grounding_thresholds_rejected() {
        let result = ConfigBuilder::new()
            .with_grounding(GroundingConfig {
                aggregation: Aggregation::Max,
                pass_threshold: 0.4,
                warn_threshold: 0.6,
                fallback_text: String::new(),
                disclaimer_prefix: String::new(),
            })
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn env_override_applies_threshold() {
        std::env::set_var("RAGFLOW_ROUTING_THRESHOLD", "0.81");
        let config = ConfigBuilder::new()
            .with_env_overrides()
            .unwrap()
            .build()
            .unwrap();
        assert!((config.routing.threshold - 0.81).abs() < 1e-9);
        std::env::remove_var("RAGFLOW_ROUTING_THRESHOLD");
    }
}
