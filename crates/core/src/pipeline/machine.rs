use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::rules::ValidationRule;
use crate::domain::sla::{SlaConfig, SlaConfigId};
use crate::domain::stage::{PipelineStage, StageId};
use crate::domain::TenantId;
use crate::errors::ApplicationError;
use crate::pipeline::rules::RuleEvaluator;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageAction {
    StartSlaTimer { sla_config_id: SlaConfigId, stage_id: StageId, threshold_secs: i64 },
    ClearSlaTimers { stage_id: StageId },
    NotifyStageEntry { stage_id: StageId, stage_name: String },
    NotifyStageExit { stage_id: StageId, stage_name: String },
}

impl StageAction {
    pub fn is_notification(&self) -> bool {
        matches!(self, Self::NotifyStageEntry { .. } | Self::NotifyStageExit { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MachineTransitionDef {
    pub target: StageId,
    /// Rules scoped to the target (or global), ordered by rule order.
    pub guards: Vec<ValidationRule>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MachineState {
    pub stage_id: StageId,
    pub name: String,
    pub is_final: bool,
    pub entry_actions: Vec<StageAction>,
    pub exit_actions: Vec<StageAction>,
    /// Event name -> transition. Empty for final states.
    pub transitions: BTreeMap<String, MachineTransitionDef>,
}

/// Executable description of one tenant's pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateMachine {
    pub tenant_id: TenantId,
    pub initial_state: StageId,
    pub states: BTreeMap<StageId, MachineState>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MachineStep {
    pub from: StageId,
    pub to: StageId,
    pub event: String,
    /// Exit actions of `from` followed by entry actions of `to`.
    pub actions: Vec<StageAction>,
    /// Messages from non-blocking rule failures.
    pub warnings: Vec<String>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MachineTransitionError {
    #[error("stage {0} is not part of the active pipeline")]
    UnknownState(StageId),
    #[error("cannot transition from final state {0}")]
    FinalState(StageId),
    #[error("event {event} is not handled in state {state}")]
    UnhandledEvent { state: StageId, event: String },
    #[error("transition into {target} blocked by rule `{rule}`: {message}")]
    GuardRejected { target: StageId, rule: String, message: String },
}

/// Builds the machine from a tenant's configuration.
///
/// `stages` must be the active stages ordered by `order`. Fails when there are none, because
/// no initial state can be chosen, and when two allowed targets of one stage share an event
/// name. The initial state is the first stage flagged initial, falling back to the first stage
/// by order.
pub fn generate_state_machine(
    tenant_id: &TenantId,
    stages: &[PipelineStage],
    rules: &[ValidationRule],
    slas: &[SlaConfig],
) -> Result<StateMachine, ApplicationError> {
    let first = stages.first().ok_or_else(|| ApplicationError::no_pipeline_stages(tenant_id))?;
    let initial_state = stages
        .iter()
        .find(|stage| stage.is_initial_state)
        .map_or_else(|| first.id.clone(), |stage| stage.id.clone());

    let mut ordered_rules = rules.iter().filter(|rule| rule.enabled).cloned().collect::<Vec<_>>();
    ordered_rules.sort_by_key(|rule| rule.order);

    let states = stages
        .iter()
        .map(|stage| {
            let state = MachineState {
                stage_id: stage.id.clone(),
                name: stage.name.clone(),
                is_final: stage.is_final_state,
                entry_actions: entry_actions(stage, slas),
                exit_actions: exit_actions(stage, slas),
                transitions: transition_table(stage, stages, &ordered_rules)?,
            };
            Ok((stage.id.clone(), state))
        })
        .collect::<Result<_, ApplicationError>>()?;

    Ok(StateMachine { tenant_id: tenant_id.clone(), initial_state, states, generated_at: Utc::now() })
}

fn stage_slas<'a>(stage: &'a PipelineStage, slas: &'a [SlaConfig]) -> impl Iterator<Item = &'a SlaConfig> {
    slas.iter().filter(move |sla| sla.enabled && sla.pipeline_stage_id == stage.id)
}

fn entry_actions(stage: &PipelineStage, slas: &[SlaConfig]) -> Vec<StageAction> {
    let mut actions = stage_slas(stage, slas)
        .map(|sla| StageAction::StartSlaTimer {
            sla_config_id: sla.id.clone(),
            stage_id: stage.id.clone(),
            threshold_secs: sla.threshold().num_seconds(),
        })
        .collect::<Vec<_>>();
    actions.push(StageAction::NotifyStageEntry {
        stage_id: stage.id.clone(),
        stage_name: stage.name.clone(),
    });
    actions
}

fn exit_actions(stage: &PipelineStage, slas: &[SlaConfig]) -> Vec<StageAction> {
    let mut actions = Vec::new();
    if stage_slas(stage, slas).next().is_some() {
        actions.push(StageAction::ClearSlaTimers { stage_id: stage.id.clone() });
    }
    actions.push(StageAction::NotifyStageExit {
        stage_id: stage.id.clone(),
        stage_name: stage.name.clone(),
    });
    actions
}

/// Two allowed targets of `stage` whose names map to the same event: `(event, first, second)`.
///
/// Targets missing from `stages` are ignored.
pub fn find_event_collision(
    stage: &PipelineStage,
    stages: &[PipelineStage],
) -> Option<(String, StageId, StageId)> {
    let mut seen: BTreeMap<String, &StageId> = BTreeMap::new();
    for target in stage
        .outgoing()
        .iter()
        .filter_map(|target_id| stages.iter().find(|candidate| &candidate.id == target_id))
    {
        let event = target.transition_event();
        if let Some(first) = seen.get(&event) {
            return Some((event, (*first).clone(), target.id.clone()));
        }
        seen.insert(event, &target.id);
    }
    None
}

fn transition_table(
    stage: &PipelineStage,
    stages: &[PipelineStage],
    rules: &[ValidationRule],
) -> Result<BTreeMap<String, MachineTransitionDef>, ApplicationError> {
    if let Some((event, first, second)) = find_event_collision(stage, stages) {
        tracing::error!(
            event_name = "pipeline.machine.duplicate_event",
            tenant_id = %stage.tenant_id,
            stage_id = %stage.id,
            event = %event,
            first_target = %first,
            second_target = %second,
            "two allowed targets share one transition event"
        );
        return Err(ApplicationError::duplicate_transition_event(
            &stage.tenant_id,
            &stage.id,
            &event,
            &first,
            &second,
        ));
    }

    let mut table = BTreeMap::new();
    for target_id in stage.outgoing() {
        let Some(target) = stages.iter().find(|candidate| &candidate.id == target_id) else {
            tracing::warn!(
                event_name = "pipeline.machine.dangling_transition",
                tenant_id = %stage.tenant_id,
                stage_id = %stage.id,
                target_stage_id = %target_id,
                "allowed transition points at a stage outside the active pipeline; skipped"
            );
            continue;
        };
        let guards = rules.iter().filter(|rule| rule.applies_to(target_id)).cloned().collect();
        table.insert(
            target.transition_event(),
            MachineTransitionDef { target: target_id.clone(), guards },
        );
    }
    Ok(table)
}

impl StateMachine {
    pub fn state(&self, stage_id: &StageId) -> Option<&MachineState> {
        self.states.get(stage_id)
    }

    /// Events accepted in `stage_id`, in event-name order.
    pub fn events_for(&self, stage_id: &StageId) -> Vec<&str> {
        self.state(stage_id)
            .map(|state| state.transitions.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Applies `event` in `current`, evaluating guards against `context`.
    pub fn transition(
        &self,
        current: &StageId,
        event: &str,
        context: &Value,
        evaluator: &dyn RuleEvaluator,
    ) -> Result<MachineStep, MachineTransitionError> {
        let state =
            self.state(current).ok_or_else(|| MachineTransitionError::UnknownState(current.clone()))?;
        if state.is_final {
            return Err(MachineTransitionError::FinalState(current.clone()));
        }
        let definition = state.transitions.get(event).ok_or_else(|| {
            MachineTransitionError::UnhandledEvent { state: current.clone(), event: event.to_string() }
        })?;

        let mut warnings = Vec::new();
        for rule in &definition.guards {
            let verdict = evaluator.evaluate(rule, context);
            if verdict.passed {
                continue;
            }
            let message = verdict.message.clone().unwrap_or_else(|| rule.failure_message());
            if verdict.blocks() {
                return Err(MachineTransitionError::GuardRejected {
                    target: definition.target.clone(),
                    rule: rule.name.clone(),
                    message,
                });
            }
            warnings.push(message);
        }

        Ok(MachineStep {
            from: current.clone(),
            to: definition.target.clone(),
            event: event.to_string(),
            actions: self.actions_between(Some(current), &definition.target),
            warnings,
        })
    }

    /// Exit actions of `from` (if it is a machine state) followed by entry actions of `to`.
    pub fn actions_between(&self, from: Option<&StageId>, to: &StageId) -> Vec<StageAction> {
        let exit = from.and_then(|stage_id| self.state(stage_id)).map(|state| &state.exit_actions);
        let entry = self.state(to).map(|state| &state.entry_actions);
        exit.into_iter().chain(entry).flatten().cloned().collect()
    }
}
