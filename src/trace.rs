//! Uniform trace/span model (§3 Trace, Span; §4.11 TraceSink).
//!
//! Grounded on the teacher's `trajectory::TrajectoryEvent` — an ordered,
//! append-only event list owned by the request, with typed attributes and a
//! single delivery point at the end of the request's life. The shape here is
//! simpler: one `Trace` per request, append-only `Span`s, frozen at finalize.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Typed attribute value attached to a span.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Text(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Text(v)
    }
}

/// A span's terminal status (§3 Span).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Ok,
    Skipped,
    Failed,
}

/// One stage's trace record within a Trace (§3 Span).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub status: SpanStatus,
    pub attributes: HashMap<String, AttrValue>,
}

impl Span {
    pub fn new(name: impl Into<String>, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        debug_assert!(start <= end, "span start must be <= end");
        Self {
            name: name.into(),
            start,
            end,
            status: SpanStatus::Ok,
            attributes: HashMap::new(),
        }
    }

    pub fn skipped(
        name: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Self {
        let mut span = Self::new(name, start, end);
        span.status = SpanStatus::Skipped;
        span.attributes.insert("reason".to_string(), reason.into().into());
        span
    }

    pub fn failed(
        name: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Self {
        let mut span = Self::new(name, start, end);
        span.status = SpanStatus::Failed;
        span.attributes.insert("reason".to_string(), reason.into().into());
        span
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn duration_ms(&self) -> i64 {
        (self.end - self.start).num_milliseconds()
    }
}

/// Aggregate totals recorded at finalize (§3 Trace.totals).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Totals {
    pub latency_ms: i64,
    pub cost_usd: f64,
}

/// One request's full trace: append-only spans plus scalar scores (§3 Trace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub session_id: Option<String>,
    pub pipeline_version: String,
    pub config_hash: String,
    pub variant: String,
    pub spans: Vec<Span>,
    pub scores: HashMap<String, f64>,
    pub totals: Totals,
    #[serde(skip)]
    frozen: bool,
}

impl Trace {
    pub fn open(
        trace_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        user_id: impl Into<String>,
        session_id: Option<String>,
        pipeline_version: impl Into<String>,
        config_hash: impl Into<String>,
        variant: impl Into<String>,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            timestamp,
            user_id: user_id.into(),
            session_id,
            pipeline_version: pipeline_version.into(),
            config_hash: config_hash.into(),
            variant: variant.into(),
            spans: Vec::new(),
            scores: HashMap::new(),
            totals: Totals::default(),
            frozen: false,
        }
    }

    /// Append one span. Panics if the trace has already been frozen — this is
    /// a programming invariant violation (writing to a finalized trace), not
    /// a recoverable error.
    pub fn push_span(&mut self, span: Span) {
        assert!(!self.frozen, "cannot append a span to a frozen trace");
        self.spans.push(span);
    }

    pub fn record_score(&mut self, name: impl Into<String>, value: f64) {
        assert!(!self.frozen, "cannot record a score on a frozen trace");
        self.scores.insert(name.into(), value);
    }

    /// Freeze the trace at finalize: compute totals and forbid further mutation.
    pub fn finalize(&mut self, cost_usd: f64) {
        let latency_ms = self
            .spans
            .iter()
            .map(|s| s.end)
            .max()
            .map(|end| (end - self.timestamp).num_milliseconds())
            .unwrap_or(0);
        self.totals = Totals {
            latency_ms,
            cost_usd,
        };
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn to_json(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(Error::Serialization)
    }
}

/// Observation output for completed traces (§4.11).
///
/// `save` is invoked once per request at finalize. On error the caller (the
/// orchestrator) never fails the request; it logs and moves on, per §4.11 and
/// the `SinkError` disposition (§7).
#[async_trait]
pub trait TraceSink: Send + Sync {
    async fn save(&self, trace: &Trace) -> Result<()>;
}

/// No-op sink, useful as a default collaborator in tests and examples.
#[derive(Debug, Default)]
pub struct NoopTraceSink;

#[async_trait]
impl TraceSink for NoopTraceSink {
    async fn save(&self, _trace: &Trace) -> Result<()> {
        Ok(())
    }
}

/// In-memory sink for tests: records every trace delivered to it.
#[derive(Debug, Default)]
pub struct CollectingTraceSink {
    traces: std::sync::Mutex<Vec<Trace>>,
}

#[async_trait]
impl TraceSink for CollectingTraceSink {
    async fn save(&self, trace: &Trace) -> Result<()> {
        self.traces.lock().unwrap().push(trace.clone());
        Ok(())
    }
}

impl CollectingTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.traces.lock().unwrap().len()
    }

    pub fn traces(&self) -> Vec<Trace> {
        self.traces.lock().unwrap().clone()
    }
}

/// File-backed fallback writer. `TraceSink` implementations that call an
/// external store should fall back to this on error (§4.11): "the orchestrator
/// never fails a request due to trace-sink failure."
#[derive(Debug)]
pub struct FileTraceSink {
    path: std::path::PathBuf,
}

impl FileTraceSink {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TraceSink for FileTraceSink {
    async fn save(&self, trace: &Trace) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let json = trace.to_json()?;
        let mut line = serde_json::to_string(&json).map_err(Error::Serialization)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| Error::sink_error("trace", e.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| Error::sink_error("trace", e.to_string()))?;
        Ok(())
    }
}

impl fmt::Display for SpanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpanStatus::Ok => write!(f, "ok"),
            SpanStatus::Skipped => write!(f, "skipped"),
            SpanStatus::Failed => write!(f, "failed"),
        }
    }
}
