use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::domain::lead::LeadId;
use crate::domain::stage::{PipelineStage, StageId};
use crate::domain::team::{Team, TeamWithStages};
use crate::domain::TenantId;
use crate::errors::{ApplicationError, DomainError};
use crate::pipeline::store::PipelineStore;
use crate::pipeline::validator::TransitionValidator;

/// A stage the lead can move to next, with the teams that own it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOption {
    pub stage_id: StageId,
    pub name: String,
    pub color: String,
    pub teams: Vec<Team>,
}

#[derive(Clone)]
pub struct TeamAssignmentResolver {
    store: Arc<dyn PipelineStore>,
    validator: TransitionValidator,
}

impl TeamAssignmentResolver {
    pub fn new(store: Arc<dyn PipelineStore>, validator: TransitionValidator) -> Self {
        Self { store, validator }
    }

    /// Active teams owning the stage, each with its active members.
    pub async fn get_teams_for_stage(
        &self,
        stage_id: &StageId,
        tenant_id: &TenantId,
    ) -> Result<Vec<Team>, ApplicationError> {
        Ok(self.store.list_teams(tenant_id, true, Some(stage_id)).await?)
    }

    /// First owning team in store order, or `None` when the stage is unowned.
    ///
    /// No rotation or load balancing.
    pub async fn auto_assign_to_team(
        &self,
        lead_id: &LeadId,
        stage_id: &StageId,
    ) -> Result<Option<Team>, ApplicationError> {
        let lead = self
            .store
            .find_lead(lead_id)
            .await?
            .ok_or_else(|| DomainError::LeadNotFound(lead_id.clone()))?;
        let assigned = self.get_teams_for_stage(stage_id, &lead.tenant_id).await?.into_iter().next();
        debug!(
            event_name = "pipeline.teams.auto_assign",
            lead_id = %lead_id,
            stage_id = %stage_id,
            team_id = assigned.as_ref().map(|team| team.id.0.as_str()).unwrap_or("none"),
        );
        Ok(assigned)
    }

    pub async fn get_teams_with_stages(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<TeamWithStages>, ApplicationError> {
        let teams = self.store.list_teams(tenant_id, true, None).await?;
        let stages = self.store.list_pipeline_stages(tenant_id, false).await?;

        Ok(teams
            .into_iter()
            .map(|team| {
                let owned = stages
                    .iter()
                    .filter(|stage| team.owns_stage(&stage.id))
                    .cloned()
                    .collect();
                TeamWithStages { team, stages: owned }
            })
            .collect())
    }

    /// Next stages that pass both validation phases for `user_id`.
    ///
    /// A lead without a stage is offered the active initial stages. Failures resolve to an
    /// empty list.
    pub async fn get_available_transitions_with_teams(
        &self,
        lead_id: &LeadId,
        user_id: Option<&str>,
    ) -> Vec<TransitionOption> {
        match self.available_transitions(lead_id, user_id).await {
            Ok(options) => options,
            Err(failure) => {
                error!(
                    event_name = "pipeline.teams.options_failed",
                    lead_id = %lead_id,
                    error = %failure,
                    "could not list available transitions"
                );
                Vec::new()
            }
        }
    }

    async fn available_transitions(
        &self,
        lead_id: &LeadId,
        user_id: Option<&str>,
    ) -> Result<Vec<TransitionOption>, ApplicationError> {
        let lead = self
            .store
            .find_lead(lead_id)
            .await?
            .ok_or_else(|| DomainError::LeadNotFound(lead_id.clone()))?;
        let candidates = self.candidate_targets(lead.current_stage_id.as_ref(), &lead.tenant_id).await?;

        let mut options = Vec::new();
        for target in candidates {
            let validation = self
                .validator
                .validate_transition_with_teams(
                    lead.current_stage_id.as_ref(),
                    &target.id,
                    &lead.tenant_id,
                    user_id,
                )
                .await;
            if !validation.is_valid {
                continue;
            }
            options.push(TransitionOption {
                stage_id: target.id,
                name: target.name,
                color: target.color,
                teams: validation.team_info.unwrap_or_default(),
            });
        }
        Ok(options)
    }

    async fn candidate_targets(
        &self,
        current: Option<&StageId>,
        tenant_id: &TenantId,
    ) -> Result<Vec<PipelineStage>, ApplicationError> {
        let Some(current) = current else {
            let stages = self.store.list_pipeline_stages(tenant_id, true).await?;
            return Ok(stages.into_iter().filter(|stage| stage.is_initial_state).collect());
        };
        let stage = self
            .store
            .find_pipeline_stage(current)
            .await?
            .ok_or_else(|| DomainError::StageNotFound(current.clone()))?;

        let mut targets = Vec::new();
        for target_id in stage.outgoing() {
            if let Some(target) = self.store.find_pipeline_stage(target_id).await? {
                targets.push(target);
            }
        }
        Ok(targets)
    }
}
