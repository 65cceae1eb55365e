//! Per-tenant state machine cache and the machine-only transition path.
//!
//! The cache has no dependency tracking. Code that edits stages, validation rules or SLA configs
//! must call [`StateMachineService::clear_cache`] (or `clear_all_cache`) afterwards, otherwise
//! transitions keep running against the previously generated machine.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::lead::{Lead, LeadId, LeadPatch, TriggeredBy};
use crate::domain::stage::StageId;
use crate::domain::transition::{LeadTransitionWrite, StateTransition, TransitionId};
use crate::domain::TenantId;
use crate::errors::{ApplicationError, DomainError};
use crate::pipeline::effects::{apply_timer_actions, emit_notifications};
use crate::pipeline::machine::{generate_state_machine, StateMachine};
use crate::pipeline::rules::RuleEvaluator;
use crate::pipeline::store::PipelineStore;

/// Outcome of [`StateMachineService::execute_transition`].
///
/// `changed` is false when the machine did not move (unhandled event, final state, blocked
/// guard); nothing is persisted in that case and `reason` says why.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MachineTransitionResult {
    pub changed: bool,
    pub from: Option<StageId>,
    pub to: StageId,
    pub lead: Lead,
    pub transition: Option<StateTransition>,
    pub warnings: Vec<String>,
    pub reason: Option<String>,
}

pub struct StateMachineService {
    store: Arc<dyn PipelineStore>,
    evaluator: Arc<dyn RuleEvaluator>,
    sink: Arc<dyn AuditSink>,
    cache: RwLock<HashMap<TenantId, Arc<StateMachine>>>,
}

impl StateMachineService {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        evaluator: Arc<dyn RuleEvaluator>,
        sink: Arc<dyn AuditSink>,
    ) -> Self {
        Self { store, evaluator, sink, cache: RwLock::new(HashMap::new()) }
    }

    /// Cached machine for the tenant, generated on a miss.
    ///
    /// Two concurrent misses may both generate; the last one to finish stays cached.
    pub async fn get_state_machine(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Arc<StateMachine>, ApplicationError> {
        if let Some(machine) = self.cache.read().await.get(tenant_id) {
            return Ok(Arc::clone(machine));
        }

        let machine = Arc::new(self.generate(tenant_id).await?);
        self.cache.write().await.insert(tenant_id.clone(), Arc::clone(&machine));
        self.sink.emit(
            AuditEvent::new(
                &AuditContext::new(None, Some(tenant_id.clone()), TransitionId::generate().0, "system"),
                "pipeline.machine.generated",
                AuditCategory::Configuration,
                AuditOutcome::Success,
            )
            .with_metadata("states", machine.states.len().to_string())
            .with_metadata("initial_state", machine.initial_state.0.clone()),
        );
        info!(
            event_name = "pipeline.machine.generated",
            tenant_id = %tenant_id,
            states = machine.states.len(),
            initial_state = %machine.initial_state,
            "generated pipeline state machine"
        );
        Ok(machine)
    }

    async fn generate(&self, tenant_id: &TenantId) -> Result<StateMachine, ApplicationError> {
        let stages = self.store.list_pipeline_stages(tenant_id, true).await?;
        let rules = self.store.list_validation_rules(tenant_id, true).await?;
        let slas = self.store.list_sla_configs(tenant_id, true).await?;

        generate_state_machine(tenant_id, &stages, &rules, &slas)
    }

    pub async fn clear_cache(&self, tenant_id: &TenantId) {
        if self.cache.write().await.remove(tenant_id).is_some() {
            debug!(event_name = "pipeline.machine.cache_cleared", tenant_id = %tenant_id);
        }
    }

    pub async fn clear_all_cache(&self) {
        let mut cache = self.cache.write().await;
        let cleared = cache.len();
        cache.clear();
        debug!(event_name = "pipeline.machine.cache_cleared_all", cleared);
    }

    pub async fn is_cached(&self, tenant_id: &TenantId) -> bool {
        self.cache.read().await.contains_key(tenant_id)
    }

    /// Applies a named event using machine semantics only.
    ///
    /// A lead without a stage is treated as sitting in the machine's initial state. Guards from
    /// validation rules apply; team ownership is NOT checked on this path.
    pub async fn execute_transition(
        &self,
        lead_id: &LeadId,
        event: &str,
        context: Option<Value>,
        triggered_by: &TriggeredBy,
    ) -> Result<MachineTransitionResult, ApplicationError> {
        let lead = self
            .store
            .find_lead(lead_id)
            .await?
            .ok_or_else(|| DomainError::LeadNotFound(lead_id.clone()))?;
        let machine = self.get_state_machine(&lead.tenant_id).await?;
        let current = lead.current_stage_id.clone().unwrap_or_else(|| machine.initial_state.clone());
        let context = context.unwrap_or_else(|| lead.state_context.clone());

        let step = match machine.transition(&current, event, &context, self.evaluator.as_ref()) {
            Ok(step) => step,
            Err(rejection) => {
                warn!(
                    event_name = "pipeline.machine.transition_unchanged",
                    lead_id = %lead.id,
                    tenant_id = %lead.tenant_id,
                    current_stage_id = %current,
                    event,
                    reason = %rejection,
                    "machine did not change state"
                );
                return Ok(MachineTransitionResult {
                    changed: false,
                    from: lead.current_stage_id.clone(),
                    to: current,
                    lead,
                    transition: None,
                    warnings: Vec::new(),
                    reason: Some(rejection.to_string()),
                });
            }
        };

        let now = Utc::now();
        let metadata = apply_timer_actions(&lead.state_metadata, &step.actions, now);
        let transition = StateTransition {
            id: TransitionId::generate(),
            lead_id: lead.id.clone(),
            tenant_id: lead.tenant_id.clone(),
            from_stage_id: lead.current_stage_id.clone(),
            to_stage_id: step.to.clone(),
            event: step.event.clone(),
            triggered_by: triggered_by.as_str().to_string(),
            context: context.clone(),
            metadata: json!({
                "timestamp": now,
                "path": "machine",
                "sla_timers": metadata.sla_timers,
                "warnings": step.warnings,
            }),
            triggered_at: now,
        };
        let (updated, transition) = self
            .store
            .commit_transition(LeadTransitionWrite {
                lead_id: lead.id.clone(),
                expected_version: lead.version,
                expected_stage_id: lead.current_stage_id.clone(),
                patch: LeadPatch {
                    current_stage_id: Some(Some(step.to.clone())),
                    state_context: Some(context),
                    state_metadata: Some(metadata),
                },
                transition,
            })
            .await?;

        emit_notifications(
            self.sink.as_ref(),
            &AuditContext::new(
                Some(updated.id.clone()),
                Some(updated.tenant_id.clone()),
                transition.id.0.clone(),
                triggered_by.as_str(),
            ),
            &step.actions,
        );
        info!(
            event_name = "pipeline.machine.transition_applied",
            lead_id = %updated.id,
            tenant_id = %updated.tenant_id,
            from_stage_id = %step.from,
            to_stage_id = %step.to,
            event = %step.event,
            "machine transition applied"
        );

        Ok(MachineTransitionResult {
            changed: true,
            from: transition.from_stage_id.clone(),
            to: step.to,
            lead: updated,
            transition: Some(transition),
            warnings: step.warnings,
            reason: None,
        })
    }
}
