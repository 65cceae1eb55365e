use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::sla::SlaConfigId;
use crate::domain::stage::StageId;
use crate::domain::team::TeamId;
use crate::domain::TenantId;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LeadId(pub String);

impl std::fmt::Display for LeadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A running SLA clock for one stage the lead currently sits in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaTimer {
    pub stage_id: StageId,
    pub started_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
}

/// Engine-owned bookkeeping stored alongside the lead.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateMetadata {
    #[serde(default)]
    pub sla_timers: BTreeMap<SlaConfigId, SlaTimer>,
    #[serde(default)]
    pub last_transition_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assigned_team_id: Option<TeamId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: LeadId,
    pub tenant_id: TenantId,
    pub current_stage_id: Option<StageId>,
    pub state_context: Value,
    pub state_metadata: StateMetadata,
    /// Bumped on every write; transitions compare-and-swap on it.
    pub version: u64,
    pub last_modified: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Lead {
    pub fn new(id: LeadId, tenant_id: TenantId, state_context: Value) -> Self {
        let now = Utc::now();
        Self {
            id,
            tenant_id,
            current_stage_id: None,
            state_context,
            state_metadata: StateMetadata::default(),
            version: 1,
            last_modified: now,
            created_at: now,
        }
    }
}

/// Partial update of a lead. `None` leaves the field untouched.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct LeadPatch {
    pub current_stage_id: Option<Option<StageId>>,
    pub state_context: Option<Value>,
    pub state_metadata: Option<StateMetadata>,
}

impl LeadPatch {
    /// Applies the patch, stamps `last_modified` and bumps the version.
    pub fn apply_to(self, lead: &mut Lead, now: DateTime<Utc>) {
        if let Some(stage) = self.current_stage_id {
            lead.current_stage_id = stage;
        }
        if let Some(context) = self.state_context {
            lead.state_context = context;
        }
        if let Some(metadata) = self.state_metadata {
            lead.state_metadata = metadata;
        }
        lead.last_modified = now;
        lead.version += 1;
    }
}

/// Who asked for a transition. `System` is an unauthenticated context and skips team gating.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    System,
    User(String),
}

impl TriggeredBy {
    pub const SYSTEM: &'static str = "system";

    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.is_empty() || value.eq_ignore_ascii_case(Self::SYSTEM) {
            Self::System
        } else {
            Self::User(value.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::System => Self::SYSTEM,
            Self::User(user_id) => user_id,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::System => None,
            Self::User(user_id) => Some(user_id),
        }
    }
}
