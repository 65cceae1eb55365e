use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::lead::{Lead, LeadId, LeadPatch};
use crate::domain::stage::StageId;
use crate::domain::TenantId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransitionId(pub String);

impl TransitionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Immutable audit record of one executed transition. Rows are only ever appended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub id: TransitionId,
    pub lead_id: LeadId,
    pub tenant_id: TenantId,
    pub from_stage_id: Option<StageId>,
    pub to_stage_id: StageId,
    pub event: String,
    pub triggered_by: String,
    pub context: Value,
    pub metadata: Value,
    pub triggered_at: DateTime<Utc>,
}

/// The lead update and history append that make up one transition.
///
/// Stores apply both writes in a single unit, and only if the lead still has
/// `expected_version` and `expected_stage_id`.
#[derive(Clone, Debug, PartialEq)]
pub struct LeadTransitionWrite {
    pub lead_id: LeadId,
    pub expected_version: u64,
    pub expected_stage_id: Option<StageId>,
    pub patch: LeadPatch,
    pub transition: StateTransition,
}

impl LeadTransitionWrite {
    pub fn matches(&self, lead: &Lead) -> bool {
        lead.version == self.expected_version && lead.current_stage_id == self.expected_stage_id
    }
}
