//! Query input and per-request context (§3).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Route kind a caller may force via `Query.options.force_route`.
pub const MAX_QUERY_CODEPOINTS: usize = 10_000;

/// Optional per-request overrides.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub max_tokens: Option<usize>,
    pub temperature: Option<f64>,
    pub include_sources: bool,
    pub force_route: Option<String>,
}

/// Immutable request input (§3 Query).
#[derive(Debug, Clone)]
pub struct Query {
    pub text: String,
    pub user_id: String,
    pub tenant_id: String,
    pub session_id: Option<String>,
    pub options: QueryOptions,
}

impl Query {
    pub fn new(
        text: impl Into<String>,
        user_id: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            user_id: user_id.into(),
            tenant_id: tenant_id.into(),
            session_id: None,
            options: QueryOptions::default(),
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    /// Validate the Query invariants from §3: nonempty text bounded to
    /// `MAX_QUERY_CODEPOINTS`, nonempty `user_id`/`tenant_id`.
    pub fn validate(&self) -> Result<()> {
        if self.text.is_empty() {
            return Err(Error::InputRejected("query text is empty".to_string()));
        }
        if self.text.chars().count() > MAX_QUERY_CODEPOINTS {
            return Err(Error::InputRejected(format!(
                "query text exceeds {MAX_QUERY_CODEPOINTS} code points"
            )));
        }
        if self.user_id.is_empty() {
            return Err(Error::InputRejected("user_id is empty".to_string()));
        }
        if self.tenant_id.is_empty() {
            return Err(Error::InputRejected("tenant_id is empty".to_string()));
        }
        Ok(())
    }
}

/// Cooperative cancellation signal, checked at stage and sub-task boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    fired: Arc<AtomicBool>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        self.fired.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// Per-request, orchestrator-owned context. Stages borrow it; it is never
/// mutated by anything but the orchestrator (§3, §9).
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub trace_id: String,
    pub started_at: DateTime<Utc>,
    pub started_mono: Instant,
    pub deadline: Option<DateTime<Utc>>,
    pub cancellation_signal: CancellationSignal,
    pub variant_name: String,
    pub config_snapshot_hash: String,
}

impl RequestContext {
    pub fn new(
        trace_id: impl Into<String>,
        started_at: DateTime<Utc>,
        started_mono: Instant,
        config_snapshot_hash: impl Into<String>,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            started_at,
            started_mono,
            deadline: None,
            cancellation_signal: CancellationSignal::new(),
            variant_name: "control".to_string(),
            config_snapshot_hash: config_snapshot_hash.into(),
        }
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant_name = variant.into();
        self
    }

    /// Returns `Err(Error::Cancelled)` if the deadline has passed or the
    /// cancellation signal has fired. Call at every stage boundary and
    /// between chunks/sentences inside CPU-bound stages.
    pub fn check_cancellation(&self, now: DateTime<Utc>) -> Result<()> {
        if self.cancellation_signal.is_cancelled() {
            return Err(Error::cancelled("cancellation signal fired"));
        }
        if let Some(deadline) = self.deadline {
            if now >= deadline {
                return Err(Error::cancelled("deadline exceeded"));
            }
        }
        Ok(())
    }
}
