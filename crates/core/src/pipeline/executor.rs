//! Team-aware transition execution.
//!
//! Every request is validated again here, whatever the caller already checked. The lead update
//! and the history row are written by one `commit_transition` call guarded by the lead version,
//! so a concurrent change makes the request fail instead of overwriting it.
//!
//! Validation rules are not evaluated on this path; they only guard
//! [`StateMachineService::execute_transition`](crate::pipeline::service::StateMachineService).

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::lead::{Lead, LeadId, LeadPatch, TriggeredBy};
use crate::domain::stage::StageId;
use crate::domain::team::Team;
use crate::domain::transition::{LeadTransitionWrite, StateTransition, TransitionId};
use crate::errors::{ApplicationError, DomainError};
use crate::pipeline::effects::{apply_timer_actions, emit_notifications};
use crate::pipeline::service::StateMachineService;
use crate::pipeline::store::{PipelineStore, StoreError};
use crate::pipeline::teams::TeamAssignmentResolver;
use crate::pipeline::validator::TransitionValidator;

pub const DEFAULT_TRANSITION_EVENT: &str = "MANUAL_TRANSITION";

const CONFLICT_MESSAGE: &str =
    "the lead was changed by another request while this transition ran; reload it and retry";
const PERSISTENCE_MESSAGE: &str = "the transition could not be saved; nothing was changed";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub lead_id: LeadId,
    pub target_stage_id: StageId,
    pub event: Option<String>,
    /// Replaces the lead's context when present.
    pub context: Option<Value>,
    pub triggered_by: TriggeredBy,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub message: String,
    pub lead: Option<Lead>,
    pub transition: Option<StateTransition>,
    pub assigned_team: Option<Team>,
}

impl ExecutionResult {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            lead: None,
            transition: None,
            assigned_team: None,
        }
    }
}

pub struct TransitionExecutor {
    store: Arc<dyn PipelineStore>,
    validator: TransitionValidator,
    resolver: TeamAssignmentResolver,
    machines: Arc<StateMachineService>,
    sink: Arc<dyn AuditSink>,
    default_event: String,
}

impl TransitionExecutor {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        validator: TransitionValidator,
        resolver: TeamAssignmentResolver,
        machines: Arc<StateMachineService>,
        sink: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            validator,
            resolver,
            machines,
            sink,
            default_event: DEFAULT_TRANSITION_EVENT.to_string(),
        }
    }

    pub fn with_default_event(mut self, event: impl Into<String>) -> Self {
        self.default_event = event.into();
        self
    }

    /// Never returns an error; every failure is a result with `success == false`.
    pub async fn execute_transition(&self, request: ExecutionRequest) -> ExecutionResult {
        let audit = AuditContext::new(
            Some(request.lead_id.clone()),
            None,
            TransitionId::generate().0,
            request.triggered_by.as_str(),
        );

        match self.run(&request, &audit).await {
            Ok(result) => result,
            Err(failure) => {
                let message = failure_message(&failure);
                match &failure {
                    failure if failure.is_conflict() => warn!(
                        event_name = "pipeline.transition.conflict",
                        correlation_id = %audit.correlation_id,
                        lead_id = %request.lead_id,
                        target_stage_id = %request.target_stage_id,
                        error = %failure,
                        "transition lost a concurrent update race"
                    ),
                    _ => error!(
                        event_name = "pipeline.transition.failed",
                        correlation_id = %audit.correlation_id,
                        lead_id = %request.lead_id,
                        target_stage_id = %request.target_stage_id,
                        error = %failure,
                        "transition failed"
                    ),
                }
                let category = match &failure {
                    ApplicationError::Persistence(_) => AuditCategory::Persistence,
                    _ => AuditCategory::Transition,
                };
                self.sink.emit(
                    AuditEvent::new(&audit, "pipeline.transition.failed", category, AuditOutcome::Failed)
                    .with_metadata("target_stage_id", request.target_stage_id.0.clone())
                    .with_metadata("reason", message.clone()),
                );
                ExecutionResult::failed(message)
            }
        }
    }

    async fn run(
        &self,
        request: &ExecutionRequest,
        audit: &AuditContext,
    ) -> Result<ExecutionResult, ApplicationError> {
        let lead = self
            .store
            .find_lead(&request.lead_id)
            .await?
            .ok_or_else(|| DomainError::LeadNotFound(request.lead_id.clone()))?;
        let audit = AuditContext { tenant_id: Some(lead.tenant_id.clone()), ..audit.clone() };
        let from = lead.current_stage_id.clone();
        let target = &request.target_stage_id;

        let validation = self
            .validator
            .validate_transition_with_teams(
                from.as_ref(),
                target,
                &lead.tenant_id,
                request.triggered_by.user_id(),
            )
            .await;
        if !validation.is_valid {
            info!(
                event_name = "pipeline.transition.rejected",
                correlation_id = %audit.correlation_id,
                lead_id = %lead.id,
                tenant_id = %lead.tenant_id,
                target_stage_id = %target,
                reason = %validation.message,
                "transition rejected"
            );
            self.sink.emit(
                AuditEvent::new(
                    &audit,
                    "pipeline.transition.rejected",
                    AuditCategory::Transition,
                    AuditOutcome::Rejected,
                )
                .with_metadata("target_stage_id", target.0.clone())
                .with_metadata("reason", validation.message.clone()),
            );
            return Ok(ExecutionResult::failed(validation.message));
        }

        let machine = self.machines.get_state_machine(&lead.tenant_id).await?;
        let actions = machine.actions_between(from.as_ref(), target);
        let assigned_team = self.resolver.auto_assign_to_team(&lead.id, target).await?;

        let now = Utc::now();
        let mut metadata = apply_timer_actions(&lead.state_metadata, &actions, now);
        metadata.assigned_team_id = assigned_team.as_ref().map(|team| team.id.clone());
        let context = request.context.clone().unwrap_or_else(|| lead.state_context.clone());
        let event = request.event.clone().unwrap_or_else(|| self.default_event.clone());

        let transition = StateTransition {
            id: TransitionId::generate(),
            lead_id: lead.id.clone(),
            tenant_id: lead.tenant_id.clone(),
            from_stage_id: from.clone(),
            to_stage_id: target.clone(),
            event,
            triggered_by: request.triggered_by.as_str().to_string(),
            context: context.clone(),
            metadata: json!({
                "timestamp": now,
                "path": "team",
                "correlation_id": audit.correlation_id,
                "assigned_team": assigned_team.as_ref().map(|team| json!({
                    "id": team.id,
                    "name": team.name,
                })),
                "team_info": validation.team_info.as_ref().map(|teams| {
                    teams.iter().map(|team| team.name.clone()).collect::<Vec<_>>()
                }),
                "sla_timers": metadata.sla_timers,
            }),
            triggered_at: now,
        };

        let (updated, transition) = self
            .store
            .commit_transition(LeadTransitionWrite {
                lead_id: lead.id.clone(),
                expected_version: lead.version,
                expected_stage_id: from.clone(),
                patch: LeadPatch {
                    current_stage_id: Some(Some(target.clone())),
                    state_context: Some(context),
                    state_metadata: Some(metadata),
                },
                transition,
            })
            .await?;

        emit_notifications(self.sink.as_ref(), &audit, &actions);
        self.sink.emit(
            AuditEvent::new(
                &audit,
                "pipeline.transition.executed",
                AuditCategory::Transition,
                AuditOutcome::Success,
            )
            .with_metadata("transition_id", transition.id.0.clone())
            .with_metadata("to_stage_id", target.0.clone())
            .with_metadata(
                "from_stage_id",
                from.as_ref().map(|stage| stage.0.clone()).unwrap_or_default(),
            ),
        );
        info!(
            event_name = "pipeline.transition.executed",
            correlation_id = %audit.correlation_id,
            lead_id = %updated.id,
            tenant_id = %updated.tenant_id,
            from_stage_id = from.as_ref().map(|stage| stage.0.as_str()).unwrap_or("none"),
            to_stage_id = %target,
            version = updated.version,
            "transition executed"
        );

        Ok(ExecutionResult {
            success: true,
            message: format!("lead {} moved to stage {}", updated.id, target),
            lead: Some(updated),
            transition: Some(transition),
            assigned_team,
        })
    }
}

fn failure_message(failure: &ApplicationError) -> String {
    match failure {
        ApplicationError::Domain(error) => error.to_string(),
        ApplicationError::Configuration(message) => message.clone(),
        ApplicationError::Persistence(StoreError::Conflict { .. }) => CONFLICT_MESSAGE.to_string(),
        ApplicationError::Persistence(_) => PERSISTENCE_MESSAGE.to_string(),
    }
}
