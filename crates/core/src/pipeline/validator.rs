//! Two-phase transition legality check: pipeline graph first, team ownership second.
//!
//! The public checks never return errors. A persistence failure turns into a denial with a
//! generic message and the detail goes to the log.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::domain::stage::{PipelineStage, StageId};
use crate::domain::team::Team;
use crate::domain::TenantId;
use crate::errors::ApplicationError;
use crate::pipeline::store::PipelineStore;

pub(crate) const VALIDATION_UNAVAILABLE: &str =
    "the transition could not be validated right now; it was denied, please retry";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionCheck {
    pub is_valid: bool,
    pub message: String,
}

impl TransitionCheck {
    fn valid() -> Self {
        Self { is_valid: true, message: "transition is valid".to_string() }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self { is_valid: false, message: message.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionCheck {
    pub granted: bool,
    pub message: String,
    /// Teams owning the stage; empty when the stage is unrestricted.
    pub teams: Vec<Team>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionValidation {
    pub is_valid: bool,
    pub message: String,
    pub team_info: Option<Vec<Team>>,
}

impl TransitionValidation {
    fn denied(message: impl Into<String>) -> Self {
        Self { is_valid: false, message: message.into(), team_info: None }
    }
}

#[derive(Clone)]
pub struct TransitionValidator {
    store: Arc<dyn PipelineStore>,
}

impl TransitionValidator {
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self { store }
    }

    /// Graph-only check. A lead without a stage may only enter an initial stage; final stages
    /// have no way out; otherwise the target must be listed in the current stage's allowed
    /// transitions.
    pub async fn validate_basic_transition(
        &self,
        current_stage_id: Option<&StageId>,
        target_stage_id: &StageId,
        tenant_id: &TenantId,
    ) -> TransitionCheck {
        match self.basic_transition(current_stage_id, target_stage_id, tenant_id).await {
            Ok(check) => check,
            Err(failure) => {
                error!(
                    event_name = "pipeline.validation.basic_failed",
                    tenant_id = %tenant_id,
                    target_stage_id = %target_stage_id,
                    error = %failure,
                    "basic transition check failed; denying"
                );
                TransitionCheck::invalid(VALIDATION_UNAVAILABLE)
            }
        }
    }

    pub(crate) async fn basic_transition(
        &self,
        current_stage_id: Option<&StageId>,
        target_stage_id: &StageId,
        tenant_id: &TenantId,
    ) -> Result<TransitionCheck, ApplicationError> {
        let Some(target) = self.tenant_stage(target_stage_id, tenant_id).await? else {
            return Ok(TransitionCheck::invalid(format!(
                "target stage {target_stage_id} does not exist for tenant {tenant_id}"
            )));
        };

        let Some(current_stage_id) = current_stage_id else {
            return Ok(if target.is_initial_state {
                TransitionCheck::valid()
            } else {
                TransitionCheck::invalid(format!(
                    "lead has no stage yet and can only enter an initial stage; {} is not one",
                    target.name
                ))
            });
        };

        let Some(current) = self.tenant_stage(current_stage_id, tenant_id).await? else {
            return Ok(TransitionCheck::invalid(format!(
                "current stage {current_stage_id} does not exist for tenant {tenant_id}"
            )));
        };
        if current.is_final_state {
            return Ok(TransitionCheck::invalid(format!(
                "cannot transition from final state {}",
                current.name
            )));
        }
        if !current.allows(&target.id) {
            return Ok(TransitionCheck::invalid(format!(
                "transition from {} to {} is not allowed",
                current.name, target.name
            )));
        }
        Ok(TransitionCheck::valid())
    }

    /// `None` for a missing stage and for a stage owned by another tenant.
    async fn tenant_stage(
        &self,
        stage_id: &StageId,
        tenant_id: &TenantId,
    ) -> Result<Option<PipelineStage>, ApplicationError> {
        let stage = self.store.find_pipeline_stage(stage_id).await?;
        Ok(stage.filter(|stage| {
            let same_tenant = &stage.tenant_id == tenant_id;
            if !same_tenant {
                debug!(
                    event_name = "pipeline.validation.cross_tenant_stage",
                    stage_id = %stage_id,
                    tenant_id = %tenant_id,
                    owner_tenant_id = %stage.tenant_id,
                );
            }
            same_tenant
        }))
    }

    /// Team gate for entering `stage_id`.
    ///
    /// Unowned stages are open to everyone. Without a user the caller is a system context and is
    /// let through, with the owning teams attached for information.
    pub async fn check_team_permissions(
        &self,
        stage_id: &StageId,
        tenant_id: &TenantId,
        user_id: Option<&str>,
    ) -> PermissionCheck {
        match self.team_permissions(stage_id, tenant_id, user_id).await {
            Ok(check) => check,
            Err(failure) => {
                error!(
                    event_name = "pipeline.validation.team_check_failed",
                    tenant_id = %tenant_id,
                    stage_id = %stage_id,
                    error = %failure,
                    "team permission check failed; denying"
                );
                PermissionCheck {
                    granted: false,
                    message: VALIDATION_UNAVAILABLE.to_string(),
                    teams: Vec::new(),
                }
            }
        }
    }

    pub(crate) async fn team_permissions(
        &self,
        stage_id: &StageId,
        tenant_id: &TenantId,
        user_id: Option<&str>,
    ) -> Result<PermissionCheck, ApplicationError> {
        let teams = self.store.list_teams(tenant_id, true, Some(stage_id)).await?;
        if teams.is_empty() {
            return Ok(PermissionCheck {
                granted: true,
                message: "stage has no owning team".to_string(),
                teams,
            });
        }

        let Some(user_id) = user_id else {
            return Ok(PermissionCheck {
                granted: true,
                message: "no user supplied; treated as a system transition".to_string(),
                teams,
            });
        };

        if teams.iter().any(|team| team.has_active_member(user_id)) {
            return Ok(PermissionCheck {
                granted: true,
                message: format!("user {user_id} is a member of an owning team"),
                teams,
            });
        }

        let names = teams.iter().map(|team| team.name.as_str()).collect::<Vec<_>>().join(", ");
        Ok(PermissionCheck {
            granted: false,
            message: format!(
                "user {user_id} is not an active member of a team owning this stage: {names}"
            ),
            teams,
        })
    }

    /// Both phases; the result is valid only when both pass.
    pub async fn validate_transition_with_teams(
        &self,
        current_stage_id: Option<&StageId>,
        target_stage_id: &StageId,
        tenant_id: &TenantId,
        user_id: Option<&str>,
    ) -> TransitionValidation {
        let basic = match self.basic_transition(current_stage_id, target_stage_id, tenant_id).await
        {
            Ok(basic) => basic,
            Err(failure) => return self.fail_closed(tenant_id, target_stage_id, &failure),
        };
        if !basic.is_valid {
            return TransitionValidation::denied(basic.message);
        }

        match self.team_permissions(target_stage_id, tenant_id, user_id).await {
            Ok(permission) => {
                let team_info = (!permission.teams.is_empty()).then_some(permission.teams);
                if permission.granted {
                    TransitionValidation { is_valid: true, message: basic.message, team_info }
                } else {
                    TransitionValidation { is_valid: false, message: permission.message, team_info }
                }
            }
            Err(failure) => self.fail_closed(tenant_id, target_stage_id, &failure),
        }
    }

    fn fail_closed(
        &self,
        tenant_id: &TenantId,
        target_stage_id: &StageId,
        failure: &ApplicationError,
    ) -> TransitionValidation {
        error!(
            event_name = "pipeline.validation.failed",
            tenant_id = %tenant_id,
            target_stage_id = %target_stage_id,
            error = %failure,
            "transition validation failed; denying"
        );
        TransitionValidation::denied(VALIDATION_UNAVAILABLE)
    }
}
