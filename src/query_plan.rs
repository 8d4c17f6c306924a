//! QueryExpander (§4.4, §3 QueryPlan).

use async_trait::async_trait;

use crate::error::Result;
use crate::generation::LLMClient;

/// Zero or more paraphrases plus the primary query text (§3 QueryPlan).
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub primary_text: String,
    pub variants: Vec<String>,
    pub skip_expansion: bool,
}

impl QueryPlan {
    pub fn unexpanded(primary_text: impl Into<String>) -> Self {
        Self {
            primary_text: primary_text.into(),
            variants: Vec::new(),
            skip_expansion: true,
        }
    }

    /// All texts to retrieve against: the primary followed by its variants.
    pub fn all_queries(&self) -> Vec<String> {
        std::iter::once(self.primary_text.clone())
            .chain(self.variants.iter().cloned())
            .collect()
    }
}

/// `expand(text, n) -> [string]` (§4.4). Guarantees: nonempty result (original
/// always present), no case-insensitive duplicates, length <= 1+n.
#[async_trait]
pub trait QueryExpander: Send + Sync {
    async fn expand(&self, text: &str, n: usize) -> Result<Vec<String>>;
}

/// Dedup a candidate list of paraphrases against the original, case-insensitively,
/// preserving first-seen order and bounding the result to `1 + n` entries.
fn dedup_variants(original: &str, candidates: Vec<String>, n: usize) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    seen.insert(original.to_lowercase());
    let mut out = Vec::new();
    for candidate in candidates {
        let key = candidate.to_lowercase();
        if seen.insert(key) {
            out.push(candidate);
            if out.len() >= n {
                break;
            }
        }
    }
    out
}

/// LLM-backed expander: asks the model for `n` paraphrases formatted one per
/// line, parses the response, and falls back to the original-only plan on any
/// error (the orchestrator records `skipped=true, reason=expander_error`).
pub struct LlmQueryExpander<L: LLMClient> {
    llm: L,
    model_id: String,
}

impl<L: LLMClient> LlmQueryExpander<L> {
    pub fn new(llm: L, model_id: impl Into<String>) -> Self {
        Self {
            llm,
            model_id: model_id.into(),
        }
    }
}

#[async_trait]
impl<L: LLMClient> QueryExpander for LlmQueryExpander<L> {
    async fn expand(&self, text: &str, n: usize) -> Result<Vec<String>> {
        use crate::generation::GenerationLimits;

        let system = "Rewrite the user's question as distinct paraphrases, one per line, \
             preserving its meaning. Output only the paraphrases, no numbering.";
        let generation = self
            .llm
            .generate(
                system,
                "",
                text,
                &self.model_id,
                &GenerationLimits {
                    max_output_tokens: 256,
                    temperature: 0.7,
                    timeout_ms: 5_000,
                },
            )
            .await?;

        let candidates: Vec<String> = generation
            .answer_text
            .lines()
            .map(|line| line.trim().trim_start_matches(['-', '*']).trim().to_string())
            .filter(|line| !line.is_empty())
            .collect();

        let variants = dedup_variants(text, candidates, n);
        Ok(std::iter::once(text.to_string()).chain(variants).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_queries_prepends_primary() {
        let plan = QueryPlan {
            primary_text: "original".to_string(),
            variants: vec!["variant one".to_string()],
            skip_expansion: false,
        };
        assert_eq!(plan.all_queries(), vec!["original", "variant one"]);
    }

    #[test]
    fn dedup_variants_drops_case_insensitive_duplicates() {
        let out = dedup_variants(
            "what is the refund policy",
            vec![
                "What is the refund policy".to_string(),
                "How do refunds work".to_string(),
            ],
            2,
        );
        assert_eq!(out, vec!["How do refunds work".to_string()]);
    }

    #[test]
    fn dedup_variants_bounds_to_n() {
        let out = dedup_variants(
            "original",
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            2,
        );
        assert_eq!(out.len(), 2);
    }
}
