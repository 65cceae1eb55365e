//! Operational event stream for the pipeline.
//!
//! Notifications and transition outcomes go here. The `StateTransition`
//! history is the system of record; nothing reads audit events back to make
//! decisions.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::lead::LeadId;
use crate::domain::TenantId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Transition,
    Notification,
    Configuration,
    Persistence,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Rejected,
    Failed,
}

/// Who acted on which lead, shared by every event of one request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditContext {
    pub lead_id: Option<LeadId>,
    pub tenant_id: Option<TenantId>,
    pub correlation_id: String,
    pub actor: String,
}

impl AuditContext {
    pub fn new(
        lead_id: Option<LeadId>,
        tenant_id: Option<TenantId>,
        correlation_id: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        Self { lead_id, tenant_id, correlation_id: correlation_id.into(), actor: actor.into() }
    }

    fn lead_label(&self) -> &str {
        self.lead_id.as_ref().map(|id| id.0.as_str()).unwrap_or("-")
    }

    fn tenant_label(&self) -> &str {
        self.tenant_id.as_ref().map(|id| id.0.as_str()).unwrap_or("-")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub category: AuditCategory,
    pub outcome: AuditOutcome,
    #[serde(flatten)]
    pub context: AuditContext,
    pub metadata: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        context: &AuditContext,
        event_type: impl Into<String>,
        category: AuditCategory,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            category,
            outcome,
            context: context.clone(),
            metadata: BTreeMap::new(),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

/// Writes each event as a structured `tracing` record. Failures log at `warn`.
#[derive(Clone, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        let context = &event.context;
        match event.outcome {
            AuditOutcome::Failed => warn!(
                event_name = %event.event_type,
                category = ?event.category,
                correlation_id = %context.correlation_id,
                lead_id = context.lead_label(),
                tenant_id = context.tenant_label(),
                actor = %context.actor,
                metadata = ?event.metadata,
                "pipeline audit event failed"
            ),
            outcome => info!(
                event_name = %event.event_type,
                category = ?event.category,
                outcome = ?outcome,
                correlation_id = %context.correlation_id,
                lead_id = context.lead_label(),
                tenant_id = context.tenant_label(),
                actor = %context.actor,
                metadata = ?event.metadata,
                "pipeline audit event"
            ),
        }
    }
}

/// Keeps events in memory for assertions.
#[derive(Clone, Default)]
pub struct InMemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl InMemoryAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<AuditEvent> {
        self.events().into_iter().filter(|event| event.event_type == event_type).collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn emit(&self, event: AuditEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}
