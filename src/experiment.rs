//! FeatureFlagResolver, ShadowRunner, VariantRecorder (§4.10).
//!
//! The bounded fire-and-forget task pool here is grounded on the teacher's
//! `adversarial::invoker::PooledFreshInvoker` — a `tokio::sync::Semaphore`
//! gating concurrent in-flight tasks, permits dropped rather than queued.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{Config, FlagDef};
use crate::primitives::hash::bucket;

/// `resolve(flag_name, user_id, tenant_id) -> variant_name` (§4.10).
///
/// Priority order: tenant override, user override, hash bucketing, default
/// variant. Deterministic: same inputs always yield the same variant for a
/// fixed config.
pub struct FeatureFlagResolver<'a> {
    flags: &'a HashMap<String, FlagDef>,
}

impl<'a> FeatureFlagResolver<'a> {
    pub fn new(flags: &'a HashMap<String, FlagDef>) -> Self {
        Self { flags }
    }

    pub fn resolve(&self, flag_name: &str, user_id: &str, tenant_id: &str) -> String {
        let Some(def) = self.flags.get(flag_name) else {
            return "control".to_string();
        };

        if let Some(variant) = def.tenant_overrides.get(tenant_id) {
            return variant.clone();
        }
        if let Some(variant) = def.user_overrides.get(user_id) {
            return variant.clone();
        }

        let draw = bucket(user_id);
        let mut cumulative = 0.0_f64;
        for (variant, weight) in &def.variants {
            cumulative += weight;
            if draw < cumulative {
                return variant.clone();
            }
        }

        def.default_variant.clone()
    }
}

/// Rolling-window circuit breaker comparing observed shadow latency to a
/// multiple of primary latency (§4.10 gate d).
#[derive(Debug)]
struct CircuitBreaker {
    window: Mutex<VecDeque<u64>>,
    window_size: usize,
}

impl CircuitBreaker {
    fn new(window_size: usize) -> Self {
        Self {
            window: Mutex::new(VecDeque::with_capacity(window_size)),
            window_size,
        }
    }

    fn record_and_check(&self, shadow_latency_ms: u64, primary_latency_ms: u64, circuit_multiplier: f64) -> bool {
        let mut window = self.window.lock().unwrap();
        window.push_back(shadow_latency_ms);
        if window.len() > self.window_size {
            window.pop_front();
        }
        let avg: f64 = window.iter().sum::<u64>() as f64 / window.len() as f64;
        avg > circuit_multiplier * primary_latency_ms as f64
    }
}

/// Process-local cumulative spend tracker, stored in micro-dollars to stay
/// integer and lock-free (§5, §9 resolved open question: no cross-process
/// coordination is attempted).
#[derive(Debug, Default)]
pub struct ShadowSpendTracker {
    spent_micros: AtomicU64,
}

impl ShadowSpendTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, cost_usd: f64) {
        let micros = (cost_usd * 1_000_000.0).round() as u64;
        self.spent_micros.fetch_add(micros, Ordering::SeqCst);
    }

    pub fn spent_usd(&self) -> f64 {
        self.spent_micros.load(Ordering::SeqCst) as f64 / 1_000_000.0
    }

    pub fn remaining_usd(&self, budget_usd: f64) -> f64 {
        (budget_usd - self.spent_usd()).max(0.0)
    }
}

/// Draws a pseudo-uniform `[0,1)` sample without pulling in a PRNG
/// dependency the teacher's stack doesn't already carry: combines the
/// current instant's nanoseconds with the request's trace id.
fn sample_draw(trace_id: &str) -> f64 {
    use std::hash::{Hash, Hasher};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    trace_id.hash(&mut hasher);
    nanos.hash(&mut hasher);
    (hasher.finish() % 1_000_000) as f64 / 1_000_000.0
}

/// Outcome of evaluating the shadow gates, before any task is spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowGateOutcome {
    Proceed,
    Disabled,
    SampledOut,
    BudgetExhausted,
    CircuitOpen,
    InflightCapReached,
}

/// ShadowRunner: after the primary request finalizes, evaluates the gates in
/// order and, if all pass, reserves an inflight slot for a caller-spawned
/// shadow task (§4.10, §5).
pub struct ShadowRunner {
    spend: ShadowSpendTracker,
    circuit: CircuitBreaker,
    inflight: Arc<tokio::sync::Semaphore>,
    inflight_count: AtomicUsize,
    dropped_count: AtomicUsize,
}

impl ShadowRunner {
    pub fn new(max_inflight: usize) -> Self {
        Self {
            spend: ShadowSpendTracker::new(),
            circuit: CircuitBreaker::new(20),
            inflight: Arc::new(tokio::sync::Semaphore::new(max_inflight.max(1))),
            inflight_count: AtomicUsize::new(0),
            dropped_count: AtomicUsize::new(0),
        }
    }

    pub fn spend_tracker(&self) -> &ShadowSpendTracker {
        &self.spend
    }

    pub fn dropped_count(&self) -> usize {
        self.dropped_count.load(Ordering::SeqCst)
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight_count.load(Ordering::SeqCst)
    }

    /// Evaluate gates (a)-(d) in order. Does not itself spawn the task — the
    /// orchestrator owns that, since it alone knows the primary's
    /// CompressedContext and candidate model/prompt to re-run.
    pub fn evaluate_gates(&self, config: &Config, trace_id: &str, primary_latency_ms: u64) -> ShadowGateOutcome {
        if !config.shadow.enabled {
            return ShadowGateOutcome::Disabled;
        }
        if sample_draw(trace_id) >= config.shadow.sample_rate {
            return ShadowGateOutcome::SampledOut;
        }
        if self.spend.remaining_usd(config.shadow.budget_usd) <= 0.0 {
            return ShadowGateOutcome::BudgetExhausted;
        }
        let window = self.circuit.window.lock().unwrap();
        let circuit_open = if window.is_empty() {
            false
        } else {
            let avg: f64 = window.iter().sum::<u64>() as f64 / window.len() as f64;
            avg > config.shadow.circuit_multiplier * primary_latency_ms as f64
        };
        drop(window);
        if circuit_open {
            return ShadowGateOutcome::CircuitOpen;
        }
        ShadowGateOutcome::Proceed
    }

    /// Try to reserve an inflight slot for a shadow task. Returns `None` (and
    /// increments the dropped counter) if the cap is reached (§5: "drop new
    /// ones when the cap is reached").
    pub fn try_reserve(self: &Arc<Self>) -> Option<tokio::sync::OwnedSemaphorePermit> {
        match self.inflight.clone().try_acquire_owned() {
            Ok(permit) => {
                self.inflight_count.fetch_add(1, Ordering::SeqCst);
                Some(permit)
            }
            Err(_) => {
                self.dropped_count.fetch_add(1, Ordering::SeqCst);
                None
            }
        }
    }

    pub fn record_completion(&self, shadow_latency_ms: u64, primary_latency_ms: u64, circuit_multiplier: f64, cost_usd: f64) {
        self.inflight_count.fetch_sub(1, Ordering::SeqCst);
        self.spend.record(cost_usd);
        self.circuit
            .record_and_check(shadow_latency_ms, primary_latency_ms, circuit_multiplier);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use std::collections::HashMap;

    fn flags_with_weights(weights: &[(&str, f64)]) -> HashMap<String, FlagDef> {
        let mut flags = HashMap::new();
        flags.insert(
            "prompt_v2".to_string(),
            FlagDef {
                variants: weights.iter().map(|(n, w)| (n.to_string(), *w)).collect(),
                user_overrides: HashMap::new(),
                tenant_overrides: HashMap::new(),
                default_variant: "control".to_string(),
            },
        );
        flags
    }

    #[test]
    fn resolve_is_deterministic_for_fixed_user() {
        let flags = flags_with_weights(&[("control", 0.9), ("treatment", 0.1)]);
        let resolver = FeatureFlagResolver::new(&flags);
        let a = resolver.resolve("prompt_v2", "user-42", "t1");
        let b = resolver.resolve("prompt_v2", "user-42", "t1");
        assert_eq!(a, b);
    }

    #[test]
    fn tenant_override_wins_over_bucketing() {
        let mut flags = flags_with_weights(&[("control", 0.9), ("treatment", 0.1)]);
        flags
            .get_mut("prompt_v2")
            .unwrap()
            .tenant_overrides
            .insert("t1".to_string(), "treatment".to_string());
        let resolver = FeatureFlagResolver::new(&flags);
        assert_eq!(resolver.resolve("prompt_v2", "user-1", "t1"), "treatment");
    }

    #[test]
    fn user_override_wins_over_bucketing_but_not_tenant() {
        let mut flags = flags_with_weights(&[("control", 0.9), ("treatment", 0.1)]);
        flags
            .get_mut("prompt_v2")
            .unwrap()
            .user_overrides
            .insert("user-1".to_string(), "treatment".to_string());
        let resolver = FeatureFlagResolver::new(&flags);
        assert_eq!(resolver.resolve("prompt_v2", "user-1", "t1"), "treatment");
    }

    #[test]
    fn empirical_distribution_approximates_weights() {
        let flags = flags_with_weights(&[("control", 0.9), ("treatment", 0.1)]);
        let resolver = FeatureFlagResolver::new(&flags);
        let mut treatment_count = 0;
        for i in 0..10_000 {
            let user_id = format!("synthetic-user-{i}");
            if resolver.resolve("prompt_v2", &user_id, "t1") == "treatment" {
                treatment_count += 1;
            }
        }
        let fraction = treatment_count as f64 / 10_000.0;
        assert!((fraction - 0.10).abs() < 0.02, "fraction was {fraction}");
    }

    #[test]
    fn unknown_flag_falls_back_to_control() {
        let flags: HashMap<String, FlagDef> = HashMap::new();
        let resolver = FeatureFlagResolver::new(&flags);
        assert_eq!(resolver.resolve("does_not_exist", "u1", "t1"), "control");
    }

    #[test]
    fn disabled_shadow_short_circuits_at_first_gate() {
        let config = ConfigBuilder::new().build().unwrap();
        let runner = ShadowRunner::new(4);
        let outcome = runner.evaluate_gates(&config, "trace-1", 100);
        assert_eq!(outcome, ShadowGateOutcome::Disabled);
    }

    #[test]
    fn budget_exhausted_blocks_further_shadow_runs() {
        use crate::config::ShadowConfig;
        let config = ConfigBuilder::new()
            .with_shadow(ShadowConfig {
                enabled: true,
                sample_rate: 1.0,
                budget_usd: 0.0001,
                circuit_multiplier: 3.0,
                max_inflight: 4,
                candidate_model_id: "standard-model".to_string(),
            })
            .build()
            .unwrap();
        let runner = ShadowRunner::new(4);
        runner.spend_tracker().record(0.01);
        let outcome = runner.evaluate_gates(&config, "trace-1", 100);
        assert_eq!(outcome, ShadowGateOutcome::BudgetExhausted);
    }

    #[test]
    fn inflight_cap_drops_tasks_beyond_the_limit() {
        let runner = Arc::new(ShadowRunner::new(1));
        let first = runner.try_reserve();
        assert!(first.is_some());
        let second = runner.try_reserve();
        assert!(second.is_none());
        assert_eq!(runner.dropped_count(), 1);
    }
}
