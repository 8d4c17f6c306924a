//! Metric instrumentation (§4.11 MetricSink; §6 metric taxonomy).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Counter, histogram, and gauge record points. Implementations must be safe
/// for concurrent use from many request tasks (§5 shared-resource policy).
pub trait MetricSink: Send + Sync {
    fn inc(&self, metric: &str, labels: &[(&str, &str)], value: u64);
    fn observe(&self, metric: &str, labels: &[(&str, &str)], value: f64);
    fn set(&self, metric: &str, labels: &[(&str, &str)], value: f64);
}

/// The exact metric names from §6, as associated constants so call sites
/// can't typo a metric name.
pub mod names {
    pub const REQUESTS_TOTAL: &str = "requests_total";
    pub const SAFETY_BLOCKED_TOTAL: &str = "safety_blocked_total";
    pub const PII_DETECTED_TOTAL: &str = "pii_detected_total";
    pub const HALLUCINATION_VERDICT_TOTAL: &str = "hallucination_verdict_total";
    pub const LLM_ERRORS_TOTAL: &str = "llm_errors_total";
    pub const FEEDBACK_RECEIVED_TOTAL: &str = "feedback_received_total";
    pub const VARIANT_ASSIGNED_TOTAL: &str = "variant_assigned_total";

    pub const REQUEST_DURATION_SECONDS: &str = "request_duration_seconds";
    pub const RETRIEVAL_COSINE_SIMILARITY: &str = "retrieval_cosine_similarity";
    pub const TOKENS_IN_TOTAL: &str = "tokens_in_total";
    pub const TOKENS_OUT_TOTAL: &str = "tokens_out_total";
    pub const LLM_COST_USD: &str = "llm_cost_usd";

    pub const EMBEDDING_CENTROID_SHIFT: &str = "embedding_centroid_shift";
    pub const RETRIEVAL_EMPTY_RESULT_RATE: &str = "retrieval_empty_result_rate";
    pub const SHADOW_BUDGET_REMAINING_USD: &str = "shadow_budget_remaining_usd";
}

fn label_key(metric: &str, labels: &[(&str, &str)]) -> String {
    let mut key = metric.to_string();
    for (k, v) in labels {
        key.push('|');
        key.push_str(k);
        key.push('=');
        key.push_str(v);
    }
    key
}

/// Process-local in-memory registry, atomic per entry (§5: "Metric registry:
/// process-local; updates are atomic.").
#[derive(Debug, Default)]
pub struct InMemoryMetricSink {
    counters: Mutex<HashMap<String, AtomicU64>>,
    histograms: Mutex<HashMap<String, Vec<f64>>>,
    gauges: Mutex<HashMap<String, f64>>,
}

impl InMemoryMetricSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_value(&self, metric: &str, labels: &[(&str, &str)]) -> u64 {
        let key = label_key(metric, labels);
        self.counters
            .lock()
            .unwrap()
            .get(&key)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn gauge_value(&self, metric: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let key = label_key(metric, labels);
        self.gauges.lock().unwrap().get(&key).copied()
    }

    pub fn histogram_samples(&self, metric: &str, labels: &[(&str, &str)]) -> Vec<f64> {
        let key = label_key(metric, labels);
        self.histograms.lock().unwrap().get(&key).cloned().unwrap_or_default()
    }
}

impl MetricSink for InMemoryMetricSink {
    fn inc(&self, metric: &str, labels: &[(&str, &str)], value: u64) {
        let key = label_key(metric, labels);
        let mut counters = self.counters.lock().unwrap();
        counters
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::SeqCst);
    }

    fn observe(&self, metric: &str, labels: &[(&str, &str)], value: f64) {
        let key = label_key(metric, labels);
        self.histograms.lock().unwrap().entry(key).or_default().push(value);
    }

    fn set(&self, metric: &str, labels: &[(&str, &str)], value: f64) {
        let key = label_key(metric, labels);
        self.gauges.lock().unwrap().insert(key, value);
    }
}
