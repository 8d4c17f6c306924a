//! Append-only audit trail (§3 AuditEvent; §4.11 AuditSink).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Who performed the action an AuditEvent records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    #[serde(rename = "type")]
    pub actor_type: String,
    pub id: String,
}

/// What the action was performed on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub id: String,
}

/// An append-only audit record (§3 AuditEvent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub actor: Actor,
    pub resource: Resource,
    pub action: String,
    pub tenant_id: String,
    pub details: HashMap<String, Value>,
}

impl AuditEvent {
    pub fn safety_block(
        event_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        user_id: impl Into<String>,
        tenant_id: impl Into<String>,
        trace_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let mut details = HashMap::new();
        details.insert("reason".to_string(), Value::String(reason.into()));
        Self {
            event_id: event_id.into(),
            event_type: "safety_block".to_string(),
            timestamp,
            actor: Actor {
                actor_type: "user".to_string(),
                id: user_id.into(),
            },
            resource: Resource {
                resource_type: "request".to_string(),
                id: trace_id.into(),
            },
            action: "block".to_string(),
            tenant_id: tenant_id.into(),
            details,
        }
    }

    pub fn variant_assignment(
        event_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        user_id: impl Into<String>,
        tenant_id: impl Into<String>,
        flag: impl Into<String>,
        variant: impl Into<String>,
    ) -> Self {
        let flag = flag.into();
        let variant = variant.into();
        let mut details = HashMap::new();
        details.insert("flag".to_string(), Value::String(flag.clone()));
        details.insert("variant".to_string(), Value::String(variant.clone()));
        Self {
            event_id: event_id.into(),
            event_type: "variant_assignment".to_string(),
            timestamp,
            actor: Actor {
                actor_type: "user".to_string(),
                id: user_id.into(),
            },
            resource: Resource {
                resource_type: "feature_flag".to_string(),
                id: flag,
            },
            action: "assign".to_string(),
            tenant_id: tenant_id.into(),
            details,
        }
    }
}

/// Append-only sink. Deliberately exposes no update/delete operation
/// (§4.11, §8 invariant 11).
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: AuditEvent) -> Result<()>;
}

/// In-memory append-only sink; the default for tests and for a single-process
/// deployment that forwards events to durable storage out of band.
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    events: std::sync::Mutex<Vec<AuditEvent>>,
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn append(&self, event: AuditEvent) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count_of_type(&self, event_type: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_only_sink_records_events_in_order() {
        let sink = InMemoryAuditSink::new();
        let now = Utc::now();
        sink.append(AuditEvent::safety_block("e1", now, "u1", "t1", "trace-1", "injection"))
            .await
            .unwrap();
        sink.append(AuditEvent::variant_assignment(
            "e2", now, "u1", "t1", "prompt_v2", "treatment",
        ))
        .await
        .unwrap();
        assert_eq!(sink.count_of_type("safety_block"), 1);
        assert_eq!(sink.count_of_type("variant_assignment"), 1);
    }
}
