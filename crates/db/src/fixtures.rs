use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use leadflow_core::domain::lead::{Lead, LeadId};
use leadflow_core::domain::rules::{RuleAction, RuleCondition, RuleId, RuleSeverity, ValidationRule};
use leadflow_core::domain::sla::{SlaConfig, SlaConfigId, TimeUnit};
use leadflow_core::domain::stage::{PipelineStage, StageId};
use leadflow_core::domain::team::{Team, TeamId, TeamMember};
use leadflow_core::domain::TenantId;
use leadflow_core::pipeline::{find_event_collision, PipelineStore, StoreError};

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("failed to read seed file {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("failed to parse seed document: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid seed document: {0}")]
    Invalid(String),
    #[error("seed persistence failed: {0}")]
    Store(#[from] StoreError),
}

/// A whole tenant pipeline as written in a TOML seed file.
///
/// Stage, rule, SLA and team entries are configuration upserts. Leads are only created when
/// missing, so re-seeding never rewinds a lead that has already moved.
#[derive(Clone, Debug, Deserialize)]
pub struct PipelineSeed {
    pub tenant_id: String,
    #[serde(default)]
    pub stages: Vec<StageSeed>,
    #[serde(default)]
    pub rules: Vec<RuleSeed>,
    #[serde(default)]
    pub sla_configs: Vec<SlaSeed>,
    #[serde(default)]
    pub teams: Vec<TeamSeed>,
    #[serde(default)]
    pub leads: Vec<LeadSeed>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StageSeed {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub order: i32,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub initial: bool,
    #[serde(default, rename = "final")]
    pub terminal: bool,
    #[serde(default)]
    pub allowed_transitions: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RuleSeed {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Omit to apply the rule to every stage.
    #[serde(default)]
    pub stage: Option<String>,
    pub severity: RuleSeverity,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    #[serde(default)]
    pub actions: Vec<RuleAction>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SlaSeed {
    pub id: String,
    pub name: String,
    pub stage: String,
    pub timeframe: u32,
    pub time_unit: TimeUnit,
    #[serde(default)]
    pub escalation_rules: Value,
    #[serde(default)]
    pub notification_rules: Value,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TeamSeed {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub stages: Vec<String>,
    #[serde(default)]
    pub members: Vec<MemberSeed>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MemberSeed {
    pub user_id: String,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LeadSeed {
    pub id: String,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub context: Value,
}

fn default_true() -> bool {
    true
}

fn default_color() -> String {
    "#6b7280".to_string()
}

fn default_role() -> String {
    "member".to_string()
}

impl PipelineSeed {
    /// Built-in demo lending pipeline.
    pub const DEMO_TOML: &str = include_str!("../../../config/fixtures/demo_pipeline.toml");

    pub fn demo() -> Result<Self, SeedError> {
        Self::from_toml_str(Self::DEMO_TOML)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, SeedError> {
        let seed: Self = toml::from_str(raw)?;
        seed.validate()?;
        Ok(seed)
    }

    pub fn from_path(path: &Path) -> Result<Self, SeedError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|source| SeedError::Read { path: path.display().to_string(), source })?;
        Self::from_toml_str(&raw)
    }

    pub fn tenant(&self) -> TenantId {
        TenantId(self.tenant_id.clone())
    }

    /// Checks that every stage reference resolves inside the document.
    pub fn validate(&self) -> Result<(), SeedError> {
        if self.tenant_id.trim().is_empty() {
            return Err(SeedError::Invalid("tenant_id must not be empty".to_string()));
        }

        let mut stage_ids = HashSet::new();
        for stage in &self.stages {
            if !stage_ids.insert(stage.id.as_str()) {
                return Err(SeedError::Invalid(format!("duplicate stage id `{}`", stage.id)));
            }
        }
        if !self.stages.is_empty() && !self.stages.iter().any(|stage| stage.initial && stage.active) {
            return Err(SeedError::Invalid("at least one active stage must be initial".to_string()));
        }

        let known = |stage_id: &str, owner: &str| {
            if stage_ids.contains(stage_id) {
                Ok(())
            } else {
                Err(SeedError::Invalid(format!("{owner} references unknown stage `{stage_id}`")))
            }
        };
        for stage in &self.stages {
            for target in &stage.allowed_transitions {
                known(target, &format!("stage `{}`", stage.id))?;
            }
        }
        for rule in &self.rules {
            if let Some(stage_id) = &rule.stage {
                known(stage_id, &format!("rule `{}`", rule.id))?;
            }
        }
        for sla in &self.sla_configs {
            known(&sla.stage, &format!("sla config `{}`", sla.id))?;
        }
        for team in &self.teams {
            for stage_id in &team.stages {
                known(stage_id, &format!("team `{}`", team.id))?;
            }
        }
        for lead in &self.leads {
            if let Some(stage_id) = &lead.stage {
                known(stage_id, &format!("lead `{}`", lead.id))?;
            }
        }

        let stages = self.pipeline_stages();
        for stage in &stages {
            if let Some((event, first, second)) = find_event_collision(stage, &stages) {
                return Err(SeedError::Invalid(format!(
                    "stage `{}` reaches `{first}` and `{second}` through the same event {event}",
                    stage.id
                )));
            }
        }
        for sla in self.sla_configs() {
            if !sla.is_within_bounds() {
                return Err(SeedError::Invalid(format!(
                    "sla config `{}` exceeds {} days",
                    sla.id.0,
                    SlaConfig::MAX_THRESHOLD_DAYS
                )));
            }
        }
        Ok(())
    }

    pub fn pipeline_stages(&self) -> Vec<PipelineStage> {
        let tenant_id = self.tenant();
        self.stages
            .iter()
            .map(|stage| PipelineStage {
                id: StageId(stage.id.clone()),
                tenant_id: tenant_id.clone(),
                name: stage.name.clone(),
                description: stage.description.clone(),
                order: stage.order,
                color: stage.color.clone(),
                is_active: stage.active,
                is_initial_state: stage.initial,
                is_final_state: stage.terminal,
                allowed_transitions: stage.allowed_transitions.iter().cloned().map(StageId).collect(),
            })
            .collect()
    }

    pub fn validation_rules(&self) -> Vec<ValidationRule> {
        let tenant_id = self.tenant();
        self.rules
            .iter()
            .map(|rule| ValidationRule {
                id: RuleId(rule.id.clone()),
                tenant_id: tenant_id.clone(),
                name: rule.name.clone(),
                description: rule.description.clone(),
                conditions: rule.conditions.clone(),
                actions: rule.actions.clone(),
                severity: rule.severity,
                enabled: rule.enabled,
                pipeline_stage_id: rule.stage.clone().map(StageId),
                order: rule.order,
            })
            .collect()
    }

    pub fn sla_configs(&self) -> Vec<SlaConfig> {
        let tenant_id = self.tenant();
        self.sla_configs
            .iter()
            .map(|sla| SlaConfig {
                id: SlaConfigId(sla.id.clone()),
                tenant_id: tenant_id.clone(),
                pipeline_stage_id: StageId(sla.stage.clone()),
                name: sla.name.clone(),
                timeframe: sla.timeframe,
                time_unit: sla.time_unit,
                escalation_rules: sla.escalation_rules.clone(),
                notification_rules: sla.notification_rules.clone(),
                enabled: sla.enabled,
            })
            .collect()
    }

    pub fn teams(&self) -> Vec<Team> {
        let tenant_id = self.tenant();
        self.teams
            .iter()
            .map(|team| Team {
                id: TeamId(team.id.clone()),
                tenant_id: tenant_id.clone(),
                name: team.name.clone(),
                description: team.description.clone(),
                is_active: team.active,
                pipeline_stage_ids: team.stages.iter().cloned().map(StageId).collect(),
                members: team
                    .members
                    .iter()
                    .map(|member| TeamMember {
                        user_id: member.user_id.clone(),
                        role: member.role.clone(),
                        is_active: member.active,
                    })
                    .collect(),
            })
            .collect()
    }

    pub fn leads(&self) -> Vec<Lead> {
        let tenant_id = self.tenant();
        self.leads
            .iter()
            .map(|seed| {
                let context = if seed.context.is_null() {
                    Value::Object(Default::default())
                } else {
                    seed.context.clone()
                };
                let mut lead = Lead::new(LeadId(seed.id.clone()), tenant_id.clone(), context);
                lead.current_stage_id = seed.stage.clone().map(StageId);
                lead
            })
            .collect()
    }

    /// Writes the document through the store's configuration upserts.
    pub async fn apply(&self, store: &dyn PipelineStore) -> Result<SeedResult, SeedError> {
        // Stages first: rules, SLAs, teams and leads reference them.
        let stages = self.pipeline_stages();
        for stage in &stages {
            store.save_pipeline_stage(stage.clone()).await?;
        }
        let rules = self.validation_rules();
        for rule in &rules {
            store.save_validation_rule(rule.clone()).await?;
        }
        let sla_configs = self.sla_configs();
        for sla in &sla_configs {
            store.save_sla_config(sla.clone()).await?;
        }
        let teams = self.teams();
        for team in &teams {
            store.save_team(team.clone()).await?;
        }

        let mut leads_created = Vec::new();
        let mut leads_existing = Vec::new();
        for lead in self.leads() {
            if store.find_lead(&lead.id).await?.is_some() {
                leads_existing.push(lead.id.0.clone());
                continue;
            }
            leads_created.push(lead.id.0.clone());
            store.save_lead(lead).await?;
        }

        info!(
            event_name = "pipeline.seed.applied",
            tenant_id = %self.tenant_id,
            stages = stages.len(),
            rules = rules.len(),
            sla_configs = sla_configs.len(),
            teams = teams.len(),
            leads_created = leads_created.len(),
            "pipeline seed applied"
        );

        Ok(SeedResult {
            tenant_id: self.tenant_id.clone(),
            stages: stages.len(),
            rules: rules.len(),
            sla_configs: sla_configs.len(),
            teams: teams.len(),
            leads_created,
            leads_existing,
        })
    }

    /// Reads the tenant back and checks every seeded entity is present.
    pub async fn verify(&self, store: &dyn PipelineStore) -> Result<VerificationResult, SeedError> {
        let tenant_id = self.tenant();
        let mut checks = Vec::new();

        let stored_stages = store.list_pipeline_stages(&tenant_id, false).await?;
        for stage in self.pipeline_stages() {
            let present = stored_stages.iter().any(|stored| *stored == stage);
            checks.push((format!("stage:{}", stage.id), present));
        }

        let stored_rules = store.list_validation_rules(&tenant_id, false).await?;
        for rule in self.validation_rules() {
            checks.push((format!("rule:{}", rule.id.0), stored_rules.iter().any(|stored| stored.id == rule.id)));
        }

        let stored_slas = store.list_sla_configs(&tenant_id, false).await?;
        for sla in self.sla_configs() {
            checks.push((format!("sla:{}", sla.id.0), stored_slas.iter().any(|stored| stored.id == sla.id)));
        }

        let stored_teams = store.list_teams(&tenant_id, false, None).await?;
        for team in self.teams() {
            checks.push((format!("team:{}", team.id.0), stored_teams.iter().any(|stored| stored.id == team.id)));
        }

        for lead in self.leads() {
            let present = store.find_lead(&lead.id).await?.is_some_and(|stored| stored.tenant_id == tenant_id);
            checks.push((format!("lead:{}", lead.id), present));
        }

        let all_present = checks.iter().all(|(_, present)| *present);
        Ok(VerificationResult { all_present, checks })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct SeedResult {
    pub tenant_id: String,
    pub stages: usize,
    pub rules: usize,
    pub sla_configs: usize,
    pub teams: usize,
    pub leads_created: Vec<String>,
    pub leads_existing: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(String, bool)>,
}
