use thiserror::Error;

use crate::domain::lead::LeadId;
use crate::domain::stage::StageId;
use crate::domain::TenantId;
use crate::pipeline::store::StoreError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("lead not found: {0}")]
    LeadNotFound(LeadId),
    #[error("pipeline stage not found: {0}")]
    StageNotFound(StageId),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl ApplicationError {
    pub fn no_pipeline_stages(tenant_id: &TenantId) -> Self {
        Self::Configuration(format!(
            "no active pipeline stages configured for tenant {tenant_id}; cannot determine an initial state"
        ))
    }

    /// Two allowed targets of `stage_id` produce the same machine event.
    pub fn duplicate_transition_event(
        tenant_id: &TenantId,
        stage_id: &StageId,
        event: &str,
        first: &StageId,
        second: &StageId,
    ) -> Self {
        Self::Configuration(format!(
            "stage {stage_id} of tenant {tenant_id} reaches both {first} and {second} through event {event}; rename one of the stages"
        ))
    }

    /// Lost an optimistic-concurrency race; retrying against fresh state may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Persistence(StoreError::Conflict { .. }))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Domain(DomainError::LeadNotFound(_) | DomainError::StageNotFound(_))
                | Self::Persistence(StoreError::NotFound { .. })
        )
    }
}
