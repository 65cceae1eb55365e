//! Persistence contract consumed by the pipeline engine.
//!
//! The engine never talks to a database directly. Everything it reads or writes goes through
//! [`PipelineStore`]; `leadflow-db` provides the SQLite implementation and
//! [`InMemoryPipelineStore`] backs tests and embedded use. [`TimeoutStore`] bounds every call so
//! a stalled backend cannot stall a transition indefinitely.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::domain::lead::{Lead, LeadId, LeadPatch};
use crate::domain::rules::ValidationRule;
use crate::domain::sla::SlaConfig;
use crate::domain::stage::{PipelineStage, StageId};
use crate::domain::team::Team;
use crate::domain::transition::{LeadTransitionWrite, StateTransition};
use crate::domain::TenantId;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error(
        "lead {lead_id} was modified concurrently (expected version {expected_version}, found {actual_version})"
    )]
    Conflict { lead_id: LeadId, expected_version: u64, actual_version: u64 },
    #[error("store operation `{operation}` timed out after {after:?}")]
    Timeout { operation: &'static str, after: Duration },
    #[error("store backend failure: {0}")]
    Backend(String),
    #[error("decode error: {0}")]
    Decode(String),
}

#[async_trait]
pub trait PipelineStore: Send + Sync {
    async fn find_lead(&self, id: &LeadId) -> Result<Option<Lead>, StoreError>;

    async fn update_lead(&self, id: &LeadId, patch: LeadPatch) -> Result<Lead, StoreError>;

    async fn find_pipeline_stage(&self, id: &StageId)
        -> Result<Option<PipelineStage>, StoreError>;

    /// Ordered by `order` ascending.
    async fn list_pipeline_stages(
        &self,
        tenant_id: &TenantId,
        active_only: bool,
    ) -> Result<Vec<PipelineStage>, StoreError>;

    /// Ordered by rule `order` ascending.
    async fn list_validation_rules(
        &self,
        tenant_id: &TenantId,
        enabled_only: bool,
    ) -> Result<Vec<ValidationRule>, StoreError>;

    async fn list_sla_configs(
        &self,
        tenant_id: &TenantId,
        enabled_only: bool,
    ) -> Result<Vec<SlaConfig>, StoreError>;

    /// Teams come back with their active members only.
    async fn list_teams(
        &self,
        tenant_id: &TenantId,
        active_only: bool,
        stage_filter: Option<&StageId>,
    ) -> Result<Vec<Team>, StoreError>;

    async fn create_state_transition(
        &self,
        record: StateTransition,
    ) -> Result<StateTransition, StoreError>;

    /// Ordered by `triggered_at` descending.
    async fn list_state_transitions(
        &self,
        lead_id: &LeadId,
    ) -> Result<Vec<StateTransition>, StoreError>;

    /// Applies the lead update and appends the history row as one unit.
    ///
    /// Fails with [`StoreError::Conflict`] and writes nothing when the lead no longer matches the
    /// expected version and stage.
    async fn commit_transition(
        &self,
        write: LeadTransitionWrite,
    ) -> Result<(Lead, StateTransition), StoreError>;

    async fn save_lead(&self, lead: Lead) -> Result<(), StoreError>;

    async fn save_pipeline_stage(&self, stage: PipelineStage) -> Result<(), StoreError>;

    async fn save_validation_rule(&self, rule: ValidationRule) -> Result<(), StoreError>;

    async fn save_sla_config(&self, sla: SlaConfig) -> Result<(), StoreError>;

    async fn save_team(&self, team: Team) -> Result<(), StoreError>;
}

#[derive(Default)]
struct InMemoryState {
    leads: HashMap<LeadId, Lead>,
    stages: Vec<PipelineStage>,
    rules: Vec<ValidationRule>,
    slas: Vec<SlaConfig>,
    teams: Vec<Team>,
    transitions: Vec<StateTransition>,
}

#[derive(Default)]
pub struct InMemoryPipelineStore {
    state: RwLock<InMemoryState>,
}

impl InMemoryPipelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn transition_count(&self) -> usize {
        self.state.read().await.transitions.len()
    }
}

fn upsert<T>(items: &mut Vec<T>, item: T, same: impl Fn(&T, &T) -> bool) {
    match items.iter_mut().find(|existing| same(existing, &item)) {
        Some(existing) => *existing = item,
        None => items.push(item),
    }
}

#[async_trait]
impl PipelineStore for InMemoryPipelineStore {
    async fn find_lead(&self, id: &LeadId) -> Result<Option<Lead>, StoreError> {
        Ok(self.state.read().await.leads.get(id).cloned())
    }

    async fn update_lead(&self, id: &LeadId, patch: LeadPatch) -> Result<Lead, StoreError> {
        let mut state = self.state.write().await;
        let lead = state
            .leads
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound { entity: "lead", id: id.0.clone() })?;
        patch.apply_to(lead, Utc::now());
        Ok(lead.clone())
    }

    async fn find_pipeline_stage(
        &self,
        id: &StageId,
    ) -> Result<Option<PipelineStage>, StoreError> {
        Ok(self.state.read().await.stages.iter().find(|stage| &stage.id == id).cloned())
    }

    async fn list_pipeline_stages(
        &self,
        tenant_id: &TenantId,
        active_only: bool,
    ) -> Result<Vec<PipelineStage>, StoreError> {
        let state = self.state.read().await;
        let mut stages = state
            .stages
            .iter()
            .filter(|stage| &stage.tenant_id == tenant_id && (!active_only || stage.is_active))
            .cloned()
            .collect::<Vec<_>>();
        stages.sort_by_key(|stage| stage.order);
        Ok(stages)
    }

    async fn list_validation_rules(
        &self,
        tenant_id: &TenantId,
        enabled_only: bool,
    ) -> Result<Vec<ValidationRule>, StoreError> {
        let state = self.state.read().await;
        let mut rules = state
            .rules
            .iter()
            .filter(|rule| &rule.tenant_id == tenant_id && (!enabled_only || rule.enabled))
            .cloned()
            .collect::<Vec<_>>();
        rules.sort_by_key(|rule| rule.order);
        Ok(rules)
    }

    async fn list_sla_configs(
        &self,
        tenant_id: &TenantId,
        enabled_only: bool,
    ) -> Result<Vec<SlaConfig>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .slas
            .iter()
            .filter(|sla| &sla.tenant_id == tenant_id && (!enabled_only || sla.enabled))
            .cloned()
            .collect())
    }

    async fn list_teams(
        &self,
        tenant_id: &TenantId,
        active_only: bool,
        stage_filter: Option<&StageId>,
    ) -> Result<Vec<Team>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .teams
            .iter()
            .filter(|team| &team.tenant_id == tenant_id && (!active_only || team.is_active))
            .filter(|team| stage_filter.map_or(true, |stage_id| team.owns_stage(stage_id)))
            .map(Team::with_active_members)
            .collect())
    }

    async fn create_state_transition(
        &self,
        record: StateTransition,
    ) -> Result<StateTransition, StoreError> {
        self.state.write().await.transitions.push(record.clone());
        Ok(record)
    }

    async fn list_state_transitions(
        &self,
        lead_id: &LeadId,
    ) -> Result<Vec<StateTransition>, StoreError> {
        let state = self.state.read().await;
        let mut history = state
            .transitions
            .iter()
            .filter(|transition| &transition.lead_id == lead_id)
            .cloned()
            .collect::<Vec<_>>();
        history.sort_by(|left, right| right.triggered_at.cmp(&left.triggered_at));
        Ok(history)
    }

    async fn commit_transition(
        &self,
        write: LeadTransitionWrite,
    ) -> Result<(Lead, StateTransition), StoreError> {
        let mut state = self.state.write().await;
        let lead = state
            .leads
            .get_mut(&write.lead_id)
            .ok_or_else(|| StoreError::NotFound { entity: "lead", id: write.lead_id.0.clone() })?;

        if !write.matches(lead) {
            return Err(StoreError::Conflict {
                lead_id: write.lead_id.clone(),
                expected_version: write.expected_version,
                actual_version: lead.version,
            });
        }

        write.patch.apply_to(lead, write.transition.triggered_at);
        let updated = lead.clone();
        state.transitions.push(write.transition.clone());
        Ok((updated, write.transition))
    }

    async fn save_lead(&self, lead: Lead) -> Result<(), StoreError> {
        self.state.write().await.leads.insert(lead.id.clone(), lead);
        Ok(())
    }

    async fn save_pipeline_stage(&self, stage: PipelineStage) -> Result<(), StoreError> {
        upsert(&mut self.state.write().await.stages, stage, |left, right| left.id == right.id);
        Ok(())
    }

    async fn save_validation_rule(&self, rule: ValidationRule) -> Result<(), StoreError> {
        upsert(&mut self.state.write().await.rules, rule, |left, right| left.id == right.id);
        Ok(())
    }

    async fn save_sla_config(&self, sla: SlaConfig) -> Result<(), StoreError> {
        upsert(&mut self.state.write().await.slas, sla, |left, right| left.id == right.id);
        Ok(())
    }

    async fn save_team(&self, team: Team) -> Result<(), StoreError> {
        upsert(&mut self.state.write().await.teams, team, |left, right| left.id == right.id);
        Ok(())
    }
}

/// Bounds every call on the wrapped store with a timeout.
pub struct TimeoutStore {
    inner: Arc<dyn PipelineStore>,
    timeout: Duration,
}

impl TimeoutStore {
    pub fn new(inner: Arc<dyn PipelineStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, StoreError>> + Send,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| StoreError::Timeout { operation, after: self.timeout })?
    }
}

#[async_trait]
impl PipelineStore for TimeoutStore {
    async fn find_lead(&self, id: &LeadId) -> Result<Option<Lead>, StoreError> {
        self.bounded("find_lead", self.inner.find_lead(id)).await
    }

    async fn update_lead(&self, id: &LeadId, patch: LeadPatch) -> Result<Lead, StoreError> {
        self.bounded("update_lead", self.inner.update_lead(id, patch)).await
    }

    async fn find_pipeline_stage(
        &self,
        id: &StageId,
    ) -> Result<Option<PipelineStage>, StoreError> {
        self.bounded("find_pipeline_stage", self.inner.find_pipeline_stage(id)).await
    }

    async fn list_pipeline_stages(
        &self,
        tenant_id: &TenantId,
        active_only: bool,
    ) -> Result<Vec<PipelineStage>, StoreError> {
        self.bounded("list_pipeline_stages", self.inner.list_pipeline_stages(tenant_id, active_only))
            .await
    }

    async fn list_validation_rules(
        &self,
        tenant_id: &TenantId,
        enabled_only: bool,
    ) -> Result<Vec<ValidationRule>, StoreError> {
        self.bounded(
            "list_validation_rules",
            self.inner.list_validation_rules(tenant_id, enabled_only),
        )
        .await
    }

    async fn list_sla_configs(
        &self,
        tenant_id: &TenantId,
        enabled_only: bool,
    ) -> Result<Vec<SlaConfig>, StoreError> {
        self.bounded("list_sla_configs", self.inner.list_sla_configs(tenant_id, enabled_only)).await
    }

    async fn list_teams(
        &self,
        tenant_id: &TenantId,
        active_only: bool,
        stage_filter: Option<&StageId>,
    ) -> Result<Vec<Team>, StoreError> {
        self.bounded("list_teams", self.inner.list_teams(tenant_id, active_only, stage_filter))
            .await
    }

    async fn create_state_transition(
        &self,
        record: StateTransition,
    ) -> Result<StateTransition, StoreError> {
        self.bounded("create_state_transition", self.inner.create_state_transition(record)).await
    }

    async fn list_state_transitions(
        &self,
        lead_id: &LeadId,
    ) -> Result<Vec<StateTransition>, StoreError> {
        self.bounded("list_state_transitions", self.inner.list_state_transitions(lead_id)).await
    }

    async fn commit_transition(
        &self,
        write: LeadTransitionWrite,
    ) -> Result<(Lead, StateTransition), StoreError> {
        self.bounded("commit_transition", self.inner.commit_transition(write)).await
    }

    async fn save_lead(&self, lead: Lead) -> Result<(), StoreError> {
        self.bounded("save_lead", self.inner.save_lead(lead)).await
    }

    async fn save_pipeline_stage(&self, stage: PipelineStage) -> Result<(), StoreError> {
        self.bounded("save_pipeline_stage", self.inner.save_pipeline_stage(stage)).await
    }

    async fn save_validation_rule(&self, rule: ValidationRule) -> Result<(), StoreError> {
        self.bounded("save_validation_rule", self.inner.save_validation_rule(rule)).await
    }

    async fn save_sla_config(&self, sla: SlaConfig) -> Result<(), StoreError> {
        self.bounded("save_sla_config", self.inner.save_sla_config(sla)).await
    }

    async fn save_team(&self, team: Team) -> Result<(), StoreError> {
        self.bounded("save_team", self.inner.save_team(team)).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;

    use super::{InMemoryPipelineStore, PipelineStore, StoreError, TimeoutStore};
    use crate::domain::lead::{Lead, LeadId, LeadPatch};
    use crate::domain::rules::ValidationRule;
    use crate::domain::sla::SlaConfig;
    use crate::domain::stage::{PipelineStage, StageId};
    use crate::domain::team::Team;
    use crate::domain::transition::{
        LeadTransitionWrite, StateTransition, TransitionId,
    };
    use crate::domain::TenantId;

    fn lead(id: &str) -> Lead {
        Lead::new(LeadId(id.to_string()), TenantId("t-1".to_string()), json!({}))
    }

    fn record(lead_id: &str, to: &str) -> StateTransition {
        StateTransition {
            id: TransitionId::generate(),
            lead_id: LeadId(lead_id.to_string()),
            tenant_id: TenantId("t-1".to_string()),
            from_stage_id: None,
            to_stage_id: StageId(to.to_string()),
            event: "TRANSITION_TO_NEW".to_string(),
            triggered_by: "user1".to_string(),
            context: json!({}),
            metadata: json!({}),
            triggered_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn commit_applies_update_and_history_together() {
        let store = InMemoryPipelineStore::new();
        store.save_lead(lead("L-1")).await.expect("save lead");

        let (updated, _) = store
            .commit_transition(LeadTransitionWrite {
                lead_id: LeadId("L-1".to_string()),
                expected_version: 1,
                expected_stage_id: None,
                patch: LeadPatch {
                    current_stage_id: Some(Some(StageId("stg-new".to_string()))),
                    ..LeadPatch::default()
                },
                transition: record("L-1", "stg-new"),
            })
            .await
            .expect("commit");

        assert_eq!(updated.version, 2);
        assert_eq!(updated.current_stage_id, Some(StageId("stg-new".to_string())));
        assert_eq!(store.transition_count().await, 1);
    }

    #[tokio::test]
    async fn stale_commit_is_rejected_without_writing() {
        let store = InMemoryPipelineStore::new();
        store.save_lead(lead("L-1")).await.expect("save lead");
        store
            .update_lead(&LeadId("L-1".to_string()), LeadPatch::default())
            .await
            .expect("bump version");

        let error = store
            .commit_transition(LeadTransitionWrite {
                lead_id: LeadId("L-1".to_string()),
                expected_version: 1,
                expected_stage_id: None,
                patch: LeadPatch::default(),
                transition: record("L-1", "stg-new"),
            })
            .await
            .expect_err("stale version");

        assert_eq!(
            error,
            StoreError::Conflict {
                lead_id: LeadId("L-1".to_string()),
                expected_version: 1,
                actual_version: 2,
            }
        );
        assert_eq!(store.transition_count().await, 0);
    }

    #[tokio::test]
    async fn history_is_listed_newest_first() {
        let store = InMemoryPipelineStore::new();
        let mut first = record("L-1", "stg-new");
        first.triggered_at = Utc::now() - chrono::Duration::hours(2);
        let second = record("L-1", "stg-review");

        store.create_state_transition(first).await.expect("first");
        store.create_state_transition(second).await.expect("second");
        store.create_state_transition(record("L-2", "stg-new")).await.expect("other lead");

        let history =
            store.list_state_transitions(&LeadId("L-1".to_string())).await.expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].to_stage_id, StageId("stg-review".to_string()));
    }

    /// Every call hangs far past any test timeout.
    pub(crate) struct StalledStore;

    async fn stall<T>() -> Result<T, StoreError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Err(StoreError::Backend("stalled".to_string()))
    }

    #[async_trait]
    impl PipelineStore for StalledStore {
        async fn find_lead(&self, _: &LeadId) -> Result<Option<Lead>, StoreError> {
            stall().await
        }
        async fn update_lead(&self, _: &LeadId, _: LeadPatch) -> Result<Lead, StoreError> {
            stall().await
        }
        async fn find_pipeline_stage(
            &self,
            _: &StageId,
        ) -> Result<Option<PipelineStage>, StoreError> {
            stall().await
        }
        async fn list_pipeline_stages(
            &self,
            _: &TenantId,
            _: bool,
        ) -> Result<Vec<PipelineStage>, StoreError> {
            stall().await
        }
        async fn list_validation_rules(
            &self,
            _: &TenantId,
            _: bool,
        ) -> Result<Vec<ValidationRule>, StoreError> {
            stall().await
        }
        async fn list_sla_configs(
            &self,
            _: &TenantId,
            _: bool,
        ) -> Result<Vec<SlaConfig>, StoreError> {
            stall().await
        }
        async fn list_teams(
            &self,
            _: &TenantId,
            _: bool,
            _: Option<&StageId>,
        ) -> Result<Vec<Team>, StoreError> {
            stall().await
        }
        async fn create_state_transition(
            &self,
            _: StateTransition,
        ) -> Result<StateTransition, StoreError> {
            stall().await
        }
        async fn list_state_transitions(
            &self,
            _: &LeadId,
        ) -> Result<Vec<StateTransition>, StoreError> {
            stall().await
        }
        async fn commit_transition(
            &self,
            _: LeadTransitionWrite,
        ) -> Result<(Lead, StateTransition), StoreError> {
            stall().await
        }
        async fn save_lead(&self, _: Lead) -> Result<(), StoreError> {
            stall().await
        }
        async fn save_pipeline_stage(&self, _: PipelineStage) -> Result<(), StoreError> {
            stall().await
        }
        async fn save_validation_rule(&self, _: ValidationRule) -> Result<(), StoreError> {
            stall().await
        }
        async fn save_sla_config(&self, _: SlaConfig) -> Result<(), StoreError> {
            stall().await
        }
        async fn save_team(&self, _: Team) -> Result<(), StoreError> {
            stall().await
        }
    }

    #[tokio::test]
    async fn timeout_store_bounds_stalled_calls() {
        let store = TimeoutStore::new(Arc::new(StalledStore), Duration::from_millis(20));

        let error =
            store.find_lead(&LeadId("L-1".to_string())).await.expect_err("stalled call times out");

        assert!(matches!(error, StoreError::Timeout { operation: "find_lead", .. }));
    }
}
