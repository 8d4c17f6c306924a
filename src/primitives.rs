//! Deterministic leaf primitives: clock, id generation, hashing.
//!
//! Every stage reads time and identity through these traits rather than
//! calling `chrono`/`uuid` directly, so tests can swap in fixed values.

use chrono::{DateTime, Utc};
use std::time::Instant;
use uuid::Uuid;

/// Source of wall-clock and monotonic time.
pub trait Clock: Send + Sync {
    /// Wall-clock time, used for records (Trace.timestamp, AuditEvent.timestamp).
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic instant, used for measuring span/stage durations.
    fn monotonic_now(&self) -> Instant;
}

/// Real clock backed by the system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }
}

/// Fixed clock for deterministic tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    pub wall: DateTime<Utc>,
    pub mono: Instant,
}

impl FixedClock {
    pub fn new(wall: DateTime<Utc>) -> Self {
        Self {
            wall,
            mono: Instant::now(),
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.wall
    }

    fn monotonic_now(&self) -> Instant {
        self.mono
    }
}

/// Generator for the opaque ids used throughout the trace/audit model.
pub trait IdGen: Send + Sync {
    fn new_trace_id(&self) -> String;
    fn new_span_id(&self) -> String;
    fn new_event_id(&self) -> String;
}

/// UUID v4-backed id generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGen;

impl IdGen for UuidGen {
    fn new_trace_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    fn new_span_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    fn new_event_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Content hashing used for `config_hash` and the feature-flag bucket hash.
///
/// `bucket_hash` is contractually MD5 (see `FeatureFlagResolver`); `content_hash`
/// uses SHA-256 and is used for the config snapshot hash, which has no
/// algorithm contract of its own.
pub mod hash {
    /// SHA-256 hex digest of arbitrary bytes.
    pub fn content_hash(bytes: &[u8]) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        format!("{:x}", hasher.finalize())
    }

    /// `(first 8 hex chars of MD5(input)) mod 10000 / 10000.0`, the bucket
    /// assignment function used by `FeatureFlagResolver::resolve`.
    pub fn bucket(input: &str) -> f64 {
        let digest = md5::compute(input.as_bytes());
        let hex = format!("{:x}", digest);
        let prefix = &hex[..8];
        let value = u32::from_str_radix(prefix, 16).expect("hex prefix of md5 digest");
        (value % 10_000) as f64 / 10_000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_returns_fixed_wall_time() {
        let wall = Utc::now();
        let clock = FixedClock::new(wall);
        assert_eq!(clock.now(), wall);
    }

    #[test]
    fn uuid_gen_produces_distinct_ids() {
        let gen = UuidGen;
        assert_ne!(gen.new_trace_id(), gen.new_trace_id());
    }

    #[test]
    fn bucket_is_deterministic_and_in_unit_interval() {
        let a = hash::bucket("user-123");
        let b = hash::bucket("user-123");
        assert_eq!(a, b);
        assert!((0.0..1.0).contains(&a));
    }

    #[test]
    fn bucket_differs_across_inputs_in_general() {
        let a = hash::bucket("user-1");
        let b = hash::bucket("user-2");
        assert_ne!(a, b);
    }
}
