//! Turn-around time: how long a lead sat in each stage, and where its SLA clocks stand.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::lead::{Lead, LeadId, StateMetadata};
use crate::domain::sla::SlaConfigId;
use crate::domain::stage::StageId;
use crate::domain::transition::StateTransition;

/// One visit to a stage. `exited_at` is `None` for the stage the lead is in now.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDwell {
    pub stage_id: StageId,
    pub entered_at: DateTime<Utc>,
    pub exited_at: Option<DateTime<Utc>>,
    pub dwell_secs: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SlaState {
    OnTrack { remaining_secs: i64 },
    Breached { overrun_secs: i64 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaStatus {
    pub sla_config_id: SlaConfigId,
    pub stage_id: StageId,
    pub started_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub state: SlaState,
}

impl SlaStatus {
    pub fn is_breached(&self) -> bool {
        matches!(self.state, SlaState::Breached { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TatReport {
    pub lead_id: LeadId,
    pub current_stage_id: Option<StageId>,
    /// Oldest visit first.
    pub dwells: Vec<StageDwell>,
    /// Summed dwell per stage across repeat visits.
    pub total_secs_by_stage: BTreeMap<StageId, i64>,
    pub sla: Vec<SlaStatus>,
    pub generated_at: DateTime<Utc>,
}

/// Visits reconstructed from history in any order; each entry into a stage ends at the next
/// transition, and the last one runs until `now`.
pub fn compute_stage_dwells(history: &[StateTransition], now: DateTime<Utc>) -> Vec<StageDwell> {
    let mut ordered = history.iter().collect::<Vec<_>>();
    ordered.sort_by_key(|transition| transition.triggered_at);

    ordered
        .iter()
        .enumerate()
        .map(|(index, transition)| {
            let exited_at = ordered.get(index + 1).map(|next| next.triggered_at);
            let end = exited_at.unwrap_or(now);
            StageDwell {
                stage_id: transition.to_stage_id.clone(),
                entered_at: transition.triggered_at,
                exited_at,
                dwell_secs: (end - transition.triggered_at).num_seconds().max(0),
            }
        })
        .collect()
}

pub fn evaluate_sla_timers(metadata: &StateMetadata, now: DateTime<Utc>) -> Vec<SlaStatus> {
    metadata
        .sla_timers
        .iter()
        .map(|(sla_config_id, timer)| {
            let remaining = (timer.due_at - now).num_seconds();
            let state = if remaining < 0 {
                SlaState::Breached { overrun_secs: -remaining }
            } else {
                SlaState::OnTrack { remaining_secs: remaining }
            };
            SlaStatus {
                sla_config_id: sla_config_id.clone(),
                stage_id: timer.stage_id.clone(),
                started_at: timer.started_at,
                due_at: timer.due_at,
                state,
            }
        })
        .collect()
}

pub fn tat_report(lead: &Lead, history: &[StateTransition], now: DateTime<Utc>) -> TatReport {
    let dwells = compute_stage_dwells(history, now);
    let mut total_secs_by_stage = BTreeMap::new();
    for dwell in &dwells {
        *total_secs_by_stage.entry(dwell.stage_id.clone()).or_insert(0) += dwell.dwell_secs;
    }

    TatReport {
        lead_id: lead.id.clone(),
        current_stage_id: lead.current_stage_id.clone(),
        dwells,
        total_secs_by_stage,
        sla: evaluate_sla_timers(&lead.state_metadata, now),
        generated_at: now,
    }
}
