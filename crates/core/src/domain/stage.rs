use serde::{Deserialize, Serialize};

use crate::domain::TenantId;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StageId(pub String);

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One step of a tenant's lead pipeline.
///
/// Stages are configuration: the engine reads them but never mutates them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStage {
    pub id: StageId,
    pub tenant_id: TenantId,
    pub name: String,
    pub description: Option<String>,
    pub order: i32,
    pub color: String,
    pub is_active: bool,
    pub is_initial_state: bool,
    pub is_final_state: bool,
    pub allowed_transitions: Vec<StageId>,
}

impl PipelineStage {
    /// Target stages honored by the engine. Final stages have none, whatever is configured.
    pub fn outgoing(&self) -> &[StageId] {
        if self.is_final_state {
            &[]
        } else {
            &self.allowed_transitions
        }
    }

    pub fn allows(&self, target: &StageId) -> bool {
        self.outgoing().contains(target)
    }

    /// Event name that moves a lead into this stage, e.g. `TRANSITION_TO_UNDER_REVIEW`.
    pub fn transition_event(&self) -> String {
        transition_event_name(&self.name)
    }
}

pub fn transition_event_name(stage_name: &str) -> String {
    let mut normalized = String::with_capacity(stage_name.len());
    let mut last_was_separator = true;
    for ch in stage_name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            normalized.push(ch.to_ascii_uppercase());
            last_was_separator = false;
        } else if !last_was_separator {
            normalized.push('_');
            last_was_separator = true;
        }
    }
    while normalized.ends_with('_') {
        normalized.pop();
    }
    format!("TRANSITION_TO_{normalized}")
}
