//! The lead pipeline engine and the facade application code talks to.

pub mod effects;
pub mod executor;
pub mod machine;
pub mod rules;
pub mod service;
pub mod store;
pub mod tat;
pub mod teams;
pub mod validator;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use crate::audit::{AuditSink, TracingAuditSink};
use crate::config::EngineConfig;
use crate::domain::lead::{LeadId, TriggeredBy};
use crate::domain::stage::StageId;
use crate::domain::team::{Team, TeamWithStages};
use crate::domain::TenantId;
use crate::errors::{ApplicationError, DomainError};

pub use executor::{ExecutionRequest, ExecutionResult, TransitionExecutor, DEFAULT_TRANSITION_EVENT};
pub use machine::{
    find_event_collision, generate_state_machine, MachineState, MachineStep, MachineTransitionDef,
    MachineTransitionError, StageAction, StateMachine,
};
pub use rules::{ConditionRuleEvaluator, RuleEvaluator, RuleVerdict};
pub use service::{MachineTransitionResult, StateMachineService};
pub use store::{InMemoryPipelineStore, PipelineStore, StoreError, TimeoutStore};
pub use tat::{SlaState, SlaStatus, StageDwell, TatReport};
pub use teams::{TeamAssignmentResolver, TransitionOption};
pub use validator::{PermissionCheck, TransitionCheck, TransitionValidation, TransitionValidator};

/// Everything the engine exposes, wired over one store.
///
/// Configuration edits made through the store are not seen by transitions until
/// [`LeadPipeline::clear_cache`] is called for the tenant.
pub struct LeadPipeline {
    store: Arc<dyn PipelineStore>,
    machines: Arc<StateMachineService>,
    validator: TransitionValidator,
    resolver: TeamAssignmentResolver,
    executor: TransitionExecutor,
}

impl LeadPipeline {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        evaluator: Arc<dyn RuleEvaluator>,
        sink: Arc<dyn AuditSink>,
        default_event: impl Into<String>,
    ) -> Self {
        let machines =
            Arc::new(StateMachineService::new(Arc::clone(&store), evaluator, Arc::clone(&sink)));
        let validator = TransitionValidator::new(Arc::clone(&store));
        let resolver = TeamAssignmentResolver::new(Arc::clone(&store), validator.clone());
        let executor = TransitionExecutor::new(
            Arc::clone(&store),
            validator.clone(),
            resolver.clone(),
            Arc::clone(&machines),
            sink,
        )
        .with_default_event(default_event);

        Self { store, machines, validator, resolver, executor }
    }

    /// Built-in condition evaluator, tracing audit sink, default event name.
    pub fn with_defaults(store: Arc<dyn PipelineStore>) -> Self {
        Self::new(
            store,
            Arc::new(ConditionRuleEvaluator),
            Arc::new(TracingAuditSink),
            DEFAULT_TRANSITION_EVENT,
        )
    }

    /// Wraps `store` in the configured persistence timeout.
    pub fn from_engine_config(
        store: Arc<dyn PipelineStore>,
        engine: &EngineConfig,
        sink: Arc<dyn AuditSink>,
    ) -> Self {
        let bounded = Arc::new(TimeoutStore::new(
            store,
            Duration::from_millis(engine.persistence_timeout_ms),
        ));
        Self::new(bounded, Arc::new(ConditionRuleEvaluator), sink, engine.default_event.clone())
    }

    pub fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.store
    }

    pub async fn validate_transition_with_teams(
        &self,
        current_stage_id: Option<&StageId>,
        target_stage_id: &StageId,
        tenant_id: &TenantId,
        user_id: Option<&str>,
    ) -> TransitionValidation {
        self.validator
            .validate_transition_with_teams(current_stage_id, target_stage_id, tenant_id, user_id)
            .await
    }

    /// Team-aware path.
    pub async fn execute_transition(&self, request: ExecutionRequest) -> ExecutionResult {
        self.executor.execute_transition(request).await
    }

    /// Machine-only path: guards apply, team ownership does not.
    pub async fn execute_machine_transition(
        &self,
        lead_id: &LeadId,
        event: &str,
        context: Option<Value>,
        triggered_by: &TriggeredBy,
    ) -> Result<MachineTransitionResult, ApplicationError> {
        self.machines.execute_transition(lead_id, event, context, triggered_by).await
    }

    pub async fn get_available_transitions_with_teams(
        &self,
        lead_id: &LeadId,
        user_id: Option<&str>,
    ) -> Vec<TransitionOption> {
        self.resolver.get_available_transitions_with_teams(lead_id, user_id).await
    }

    pub async fn get_teams_for_stage(
        &self,
        stage_id: &StageId,
        tenant_id: &TenantId,
    ) -> Result<Vec<Team>, ApplicationError> {
        self.resolver.get_teams_for_stage(stage_id, tenant_id).await
    }

    pub async fn get_teams_with_stages(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<TeamWithStages>, ApplicationError> {
        self.resolver.get_teams_with_stages(tenant_id).await
    }

    pub async fn auto_assign_to_team(
        &self,
        lead_id: &LeadId,
        stage_id: &StageId,
    ) -> Result<Option<Team>, ApplicationError> {
        self.resolver.auto_assign_to_team(lead_id, stage_id).await
    }

    pub async fn get_state_machine(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Arc<StateMachine>, ApplicationError> {
        self.machines.get_state_machine(tenant_id).await
    }

    pub async fn clear_cache(&self, tenant_id: &TenantId) {
        self.machines.clear_cache(tenant_id).await;
    }

    pub async fn clear_all_cache(&self) {
        self.machines.clear_all_cache().await;
    }

    pub async fn tat_report(&self, lead_id: &LeadId) -> Result<TatReport, ApplicationError> {
        let lead = self
            .store
            .find_lead(lead_id)
            .await?
            .ok_or_else(|| DomainError::LeadNotFound(lead_id.clone()))?;
        let history = self.store.list_state_transitions(lead_id).await?;
        Ok(tat::tat_report(&lead, &history, Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::{ExecutionRequest, LeadPipeline, DEFAULT_TRANSITION_EVENT};
    use crate::audit::InMemoryAuditSink;
    use crate::config::EngineConfig;
    use crate::domain::lead::{Lead, LeadId, TriggeredBy};
    use crate::domain::stage::{PipelineStage, StageId};
    use crate::domain::team::{Team, TeamId, TeamMember};
    use crate::domain::TenantId;
    use crate::pipeline::rules::ConditionRuleEvaluator;
    use crate::pipeline::store::{InMemoryPipelineStore, PipelineStore};

    fn tenant() -> TenantId {
        TenantId("t-acme".to_string())
    }

    fn id(value: &str) -> StageId {
        StageId(value.to_string())
    }

    fn stage(stage_id: &str, name: &str, order: i32, initial: bool, last: bool, next: &[&str]) -> PipelineStage {
        PipelineStage {
            id: id(stage_id),
            tenant_id: tenant(),
            name: name.to_string(),
            description: Some(format!("{name} stage")),
            order,
            color: "#1f77b4".to_string(),
            is_active: true,
            is_initial_state: initial,
            is_final_state: last,
            allowed_transitions: next.iter().map(|target| id(target)).collect(),
        }
    }

    async fn pipeline(teams: Vec<Team>) -> (Arc<InMemoryPipelineStore>, LeadPipeline, InMemoryAuditSink) {
        let store = Arc::new(InMemoryPipelineStore::new());
        for stage in [
            stage("NEW", "New", 1, true, false, &["REVIEW"]),
            stage("REVIEW", "Review", 2, false, false, &["APPROVED"]),
            stage("APPROVED", "Approved", 3, false, true, &[]),
        ] {
            store.save_pipeline_stage(stage).await.expect("save stage");
        }
        for team in teams {
            store.save_team(team).await.expect("save team");
        }
        let sink = InMemoryAuditSink::default();
        let engine = LeadPipeline::new(
            store.clone(),
            Arc::new(ConditionRuleEvaluator),
            Arc::new(sink.clone()),
            DEFAULT_TRANSITION_EVENT,
        );
        (store, engine, sink)
    }

    async fn lead_at(store: &InMemoryPipelineStore, lead_id: &str, stage_id: Option<&str>) {
        let mut lead = Lead::new(LeadId(lead_id.to_string()), tenant(), json!({}));
        lead.current_stage_id = stage_id.map(id);
        store.save_lead(lead).await.expect("save lead");
    }

    fn underwriters() -> Team {
        Team {
            id: TeamId("team-uw".to_string()),
            tenant_id: tenant(),
            name: "Underwriters".to_string(),
            description: None,
            is_active: true,
            pipeline_stage_ids: vec![id("REVIEW")],
            members: vec![TeamMember {
                user_id: "user1".to_string(),
                role: "underwriter".to_string(),
                is_active: true,
            }],
        }
    }

    #[tokio::test]
    async fn fresh_lead_must_enter_through_new() {
        let (store, engine, _) = pipeline(Vec::new()).await;
        lead_at(&store, "L-A", None).await;

        let skip = engine
            .execute_machine_transition(
                &LeadId("L-A".to_string()),
                "TRANSITION_TO_REVIEW",
                None,
                &TriggeredBy::User("user1".to_string()),
            )
            .await
            .expect("machine call");
        assert!(!skip.changed);
        let direct = engine.validate_transition_with_teams(None, &id("REVIEW"), &tenant(), None).await;
        assert!(!direct.is_valid);

        let enter = engine.validate_transition_with_teams(None, &id("NEW"), &tenant(), None).await;
        assert!(enter.is_valid);
        let result = engine
            .execute_transition(ExecutionRequest {
                lead_id: LeadId("L-A".to_string()),
                target_stage_id: id("NEW"),
                event: Some("TRANSITION_TO_NEW".to_string()),
                context: None,
                triggered_by: TriggeredBy::User("user1".to_string()),
            })
            .await;
        assert!(result.success, "{}", result.message);
    }

    #[tokio::test]
    async fn review_to_approved_without_owning_team() {
        let (store, engine, _) = pipeline(Vec::new()).await;
        lead_at(&store, "L-B", Some("REVIEW")).await;

        let result = engine
            .execute_transition(ExecutionRequest {
                lead_id: LeadId("L-B".to_string()),
                target_stage_id: id("APPROVED"),
                event: None,
                context: None,
                triggered_by: TriggeredBy::parse("user1"),
            })
            .await;

        assert!(result.success);
        assert_eq!(result.lead.and_then(|lead| lead.current_stage_id), Some(id("APPROVED")));
        let history = store.list_state_transitions(&LeadId("L-B".to_string())).await.expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from_stage_id, Some(id("REVIEW")));
        assert_eq!(history[0].to_stage_id, id("APPROVED"));
    }

    #[tokio::test]
    async fn underwriters_gate_review() {
        let (_, engine, _) = pipeline(vec![underwriters()]).await;

        let outsider = engine
            .validate_transition_with_teams(Some(&id("NEW")), &id("REVIEW"), &tenant(), Some("user2"))
            .await;
        assert!(!outsider.is_valid);
        assert!(outsider.message.contains("Underwriters"));

        let member = engine
            .validate_transition_with_teams(Some(&id("NEW")), &id("REVIEW"), &tenant(), Some("user1"))
            .await;
        assert!(member.is_valid);
    }

    #[tokio::test]
    async fn approved_is_terminal_for_every_path() {
        let (store, engine, _) = pipeline(vec![underwriters()]).await;
        lead_at(&store, "L-D", Some("APPROVED")).await;

        for target in ["NEW", "REVIEW"] {
            let result = engine
                .execute_transition(ExecutionRequest {
                    lead_id: LeadId("L-D".to_string()),
                    target_stage_id: id(target),
                    event: Some(format!("TRANSITION_TO_{target}")),
                    context: None,
                    triggered_by: TriggeredBy::parse("user1"),
                })
                .await;
            assert!(!result.success);
            assert!(result.message.contains("cannot transition from final state"));
        }

        let machine = engine
            .execute_machine_transition(&LeadId("L-D".to_string()), "TRANSITION_TO_NEW", None, &TriggeredBy::System)
            .await
            .expect("machine call");
        assert!(!machine.changed);
        assert!(machine.reason.is_some_and(|reason| reason.contains("cannot transition from final state")));
    }

    #[tokio::test]
    async fn team_gate_applies_only_to_the_team_aware_path() {
        let (store, engine, _) = pipeline(vec![underwriters()]).await;
        lead_at(&store, "L-E", Some("NEW")).await;

        let gated = engine
            .execute_transition(ExecutionRequest {
                lead_id: LeadId("L-E".to_string()),
                target_stage_id: id("REVIEW"),
                event: None,
                context: None,
                triggered_by: TriggeredBy::parse("user2"),
            })
            .await;
        assert!(!gated.success);

        let ungated = engine
            .execute_machine_transition(
                &LeadId("L-E".to_string()),
                "TRANSITION_TO_REVIEW",
                None,
                &TriggeredBy::parse("user2"),
            )
            .await
            .expect("machine call");
        assert!(ungated.changed);
    }

    #[tokio::test]
    async fn history_only_grows_and_feeds_the_tat_report() {
        let (store, engine, _) = pipeline(Vec::new()).await;
        lead_at(&store, "L-F", None).await;

        let mut seen = Vec::new();
        for target in ["NEW", "REVIEW", "APPROVED"] {
            let result = engine
                .execute_transition(ExecutionRequest {
                    lead_id: LeadId("L-F".to_string()),
                    target_stage_id: id(target),
                    event: None,
                    context: None,
                    triggered_by: TriggeredBy::System,
                })
                .await;
            assert!(result.success, "{}", result.message);
            seen.push(result.transition.expect("transition"));

            let history = store.list_state_transitions(&LeadId("L-F".to_string())).await.expect("history");
            assert_eq!(history.len(), seen.len());
            for earlier in &seen {
                assert!(history.contains(earlier));
            }
        }

        let report = engine.tat_report(&LeadId("L-F".to_string())).await.expect("report");
        assert_eq!(report.dwells.len(), 3);
        assert_eq!(report.current_stage_id, Some(id("APPROVED")));
        assert!(report.dwells.last().is_some_and(|dwell| dwell.exited_at.is_none()));
    }

    #[tokio::test]
    async fn machine_cache_sees_configuration_only_after_clear() {
        let (store, engine, _) = pipeline(Vec::new()).await;
        let first = engine.get_state_machine(&tenant()).await.expect("machine");
        assert!(Arc::ptr_eq(&first, &engine.get_state_machine(&tenant()).await.expect("machine")));

        let mut review = stage("REVIEW", "Review", 2, false, false, &["APPROVED", "NEW"]);
        review.color = "#ff7f0e".to_string();
        store.save_pipeline_stage(review).await.expect("update stage");
        assert_eq!(
            engine.get_state_machine(&tenant()).await.expect("machine").events_for(&id("REVIEW")),
            vec!["TRANSITION_TO_APPROVED"]
        );

        engine.clear_cache(&tenant()).await;
        assert_eq!(
            engine.get_state_machine(&tenant()).await.expect("machine").events_for(&id("REVIEW")),
            vec!["TRANSITION_TO_APPROVED", "TRANSITION_TO_NEW"]
        );
    }

    #[tokio::test]
    async fn engine_config_sets_default_event() {
        let store = Arc::new(InMemoryPipelineStore::new());
        store.save_pipeline_stage(stage("NEW", "New", 1, true, false, &[])).await.expect("stage");
        lead_at(&store, "L-G", None).await;
        let engine = LeadPipeline::from_engine_config(
            store.clone(),
            &EngineConfig { persistence_timeout_ms: 2_000, default_event: "INTAKE".to_string() },
            Arc::new(InMemoryAuditSink::default()),
        );

        let result = engine
            .execute_transition(ExecutionRequest {
                lead_id: LeadId("L-G".to_string()),
                target_stage_id: id("NEW"),
                event: None,
                context: None,
                triggered_by: TriggeredBy::System,
            })
            .await;
        assert_eq!(result.transition.map(|transition| transition.event), Some("INTAKE".to_string()));
    }
}
