//! SQLite implementation of the engine's persistence contract.
//!
//! JSON-shaped fields are stored as TEXT and timestamps as fixed-width RFC 3339 so that text
//! ordering matches time ordering.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{sqlite::SqliteRow, Row, Sqlite, Transaction};

use leadflow_core::domain::lead::{Lead, LeadId, LeadPatch};
use leadflow_core::domain::rules::{RuleId, RuleSeverity, ValidationRule};
use leadflow_core::domain::sla::{SlaConfig, SlaConfigId, TimeUnit};
use leadflow_core::domain::stage::{PipelineStage, StageId};
use leadflow_core::domain::team::{Team, TeamId, TeamMember};
use leadflow_core::domain::transition::{LeadTransitionWrite, StateTransition, TransitionId};
use leadflow_core::domain::TenantId;
use leadflow_core::pipeline::{PipelineStore, StoreError};

use super::RepositoryError;
use crate::DbPool;

const LEAD_COLUMNS: &str = "id, tenant_id, current_stage_id, state_context_json,
    state_metadata_json, version, last_modified, created_at";

const STAGE_COLUMNS: &str = "id, tenant_id, name, description, stage_order, color, is_active,
    is_initial_state, is_final_state, allowed_transitions_json";

const RULE_COLUMNS: &str = "id, tenant_id, name, description, conditions_json, actions_json,
    severity, enabled, pipeline_stage_id, rule_order";

const SLA_COLUMNS: &str = "id, tenant_id, pipeline_stage_id, name, timeframe, time_unit,
    escalation_rules_json, notification_rules_json, enabled";

const TRANSITION_COLUMNS: &str = "id, lead_id, tenant_id, from_stage_id, to_stage_id, event,
    triggered_by, context_json, metadata_json, triggered_at";

#[derive(Clone)]
pub struct SqlPipelineStore {
    pool: DbPool,
}

impl SqlPipelineStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn lead_in(
        tx: &mut Transaction<'_, Sqlite>,
        id: &LeadId,
    ) -> Result<Option<Lead>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {LEAD_COLUMNS} FROM lead WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(lead_from_row).transpose()
    }

    /// Writes `lead` over the row still at `expected_version` / `expected_stage`.
    async fn write_lead_guarded(
        tx: &mut Transaction<'_, Sqlite>,
        lead: &Lead,
        expected_version: u64,
        expected_stage: Option<&StageId>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE lead SET
                current_stage_id = ?,
                state_context_json = ?,
                state_metadata_json = ?,
                version = ?,
                last_modified = ?
             WHERE id = ? AND version = ? AND current_stage_id IS ?",
        )
        .bind(lead.current_stage_id.as_ref().map(|stage| stage.0.as_str()))
        .bind(to_json("state_context_json", &lead.state_context)?)
        .bind(to_json("state_metadata_json", &lead.state_metadata)?)
        .bind(to_i64("version", lead.version)?)
        .bind(timestamp(lead.last_modified))
        .bind(&lead.id.0)
        .bind(to_i64("version", expected_version)?)
        .bind(expected_stage.map(|stage| stage.0.as_str()))
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        let actual_version = Self::lead_in(tx, &lead.id).await?.map_or(0, |current| current.version);
        Err(RepositoryError::Conflict { lead_id: lead.id.clone(), expected_version, actual_version })
    }

    async fn insert_transition(
        tx: &mut Transaction<'_, Sqlite>,
        record: &StateTransition,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO state_transition (
                id,
                lead_id,
                tenant_id,
                from_stage_id,
                to_stage_id,
                event,
                triggered_by,
                context_json,
                metadata_json,
                triggered_at,
                seq
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                (SELECT COALESCE(MAX(seq), 0) + 1 FROM state_transition WHERE lead_id = ?))",
        )
        .bind(&record.id.0)
        .bind(&record.lead_id.0)
        .bind(&record.tenant_id.0)
        .bind(record.from_stage_id.as_ref().map(|stage| stage.0.as_str()))
        .bind(&record.to_stage_id.0)
        .bind(&record.event)
        .bind(&record.triggered_by)
        .bind(to_json("context_json", &record.context)?)
        .bind(to_json("metadata_json", &record.metadata)?)
        .bind(timestamp(record.triggered_at))
        .bind(&record.lead_id.0)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn members_of(&self, team_id: &TeamId) -> Result<Vec<TeamMember>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT user_id, role, is_active
             FROM team_member
             WHERE team_id = ? AND is_active = 1
             ORDER BY member_order ASC, user_id ASC",
        )
        .bind(&team_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(TeamMember {
                    user_id: row.try_get("user_id")?,
                    role: row.try_get("role")?,
                    is_active: row.try_get("is_active")?,
                })
            })
            .collect()
    }

    async fn update_lead_inner(&self, id: &LeadId, patch: LeadPatch) -> Result<Lead, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let mut lead = Self::lead_in(&mut tx, id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound { entity: "lead", id: id.0.clone() })?;
        let expected_version = lead.version;
        let expected_stage = lead.current_stage_id.clone();

        patch.apply_to(&mut lead, Utc::now());
        Self::write_lead_guarded(&mut tx, &lead, expected_version, expected_stage.as_ref()).await?;
        tx.commit().await?;
        Ok(lead)
    }

    async fn commit_transition_inner(
        &self,
        write: LeadTransitionWrite,
    ) -> Result<(Lead, StateTransition), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let mut lead = Self::lead_in(&mut tx, &write.lead_id).await?.ok_or_else(|| {
            RepositoryError::NotFound { entity: "lead", id: write.lead_id.0.clone() }
        })?;
        if !write.matches(&lead) {
            return Err(RepositoryError::Conflict {
                lead_id: write.lead_id.clone(),
                expected_version: write.expected_version,
                actual_version: lead.version,
            });
        }

        write.patch.apply_to(&mut lead, write.transition.triggered_at);
        Self::write_lead_guarded(
            &mut tx,
            &lead,
            write.expected_version,
            write.expected_stage_id.as_ref(),
        )
        .await?;
        Self::insert_transition(&mut tx, &write.transition).await?;
        tx.commit().await?;

        Ok((lead, write.transition))
    }

    async fn list_teams_inner(
        &self,
        tenant_id: &TenantId,
        active_only: bool,
        stage_filter: Option<&StageId>,
    ) -> Result<Vec<Team>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, name, description, is_active, pipeline_stage_ids_json
             FROM team
             WHERE tenant_id = ? AND (? = 0 OR is_active = 1)
             ORDER BY rowid ASC",
        )
        .bind(&tenant_id.0)
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;

        let mut teams = Vec::with_capacity(rows.len());
        for row in rows {
            let mut team = team_from_row(row)?;
            if stage_filter.is_some_and(|stage_id| !team.owns_stage(stage_id)) {
                continue;
            }
            team.members = self.members_of(&team.id).await?;
            teams.push(team);
        }
        Ok(teams)
    }

    async fn save_team_inner(&self, team: Team) -> Result<(), RepositoryError> {
        let now = timestamp(Utc::now());
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO team (
                id,
                tenant_id,
                name,
                description,
                is_active,
                pipeline_stage_ids_json,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                tenant_id = excluded.tenant_id,
                name = excluded.name,
                description = excluded.description,
                is_active = excluded.is_active,
                pipeline_stage_ids_json = excluded.pipeline_stage_ids_json,
                updated_at = excluded.updated_at",
        )
        .bind(&team.id.0)
        .bind(&team.tenant_id.0)
        .bind(&team.name)
        .bind(team.description.as_deref())
        .bind(team.is_active)
        .bind(to_json("pipeline_stage_ids_json", &team.pipeline_stage_ids)?)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM team_member WHERE team_id = ?")
            .bind(&team.id.0)
            .execute(&mut *tx)
            .await?;
        for (position, member) in team.members.iter().enumerate() {
            sqlx::query(
                "INSERT INTO team_member (team_id, user_id, role, is_active, member_order)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&team.id.0)
            .bind(&member.user_id)
            .bind(&member.role)
            .bind(member.is_active)
            .bind(to_i64("member_order", position as u64)?)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl PipelineStore for SqlPipelineStore {
    async fn find_lead(&self, id: &LeadId) -> Result<Option<Lead>, StoreError> {
        let row = sqlx::query(&format!("SELECT {LEAD_COLUMNS} FROM lead WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(RepositoryError::from)?;
        Ok(row.map(lead_from_row).transpose()?)
    }

    async fn update_lead(&self, id: &LeadId, patch: LeadPatch) -> Result<Lead, StoreError> {
        Ok(self.update_lead_inner(id, patch).await?)
    }

    async fn find_pipeline_stage(
        &self,
        id: &StageId,
    ) -> Result<Option<PipelineStage>, StoreError> {
        let row = sqlx::query(&format!("SELECT {STAGE_COLUMNS} FROM pipeline_stage WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(RepositoryError::from)?;
        Ok(row.map(stage_from_row).transpose()?)
    }

    async fn list_pipeline_stages(
        &self,
        tenant_id: &TenantId,
        active_only: bool,
    ) -> Result<Vec<PipelineStage>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {STAGE_COLUMNS}
             FROM pipeline_stage
             WHERE tenant_id = ? AND (? = 0 OR is_active = 1)
             ORDER BY stage_order ASC, rowid ASC"
        ))
        .bind(&tenant_id.0)
        .bind(active_only)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.into_iter().map(stage_from_row).collect::<Result<Vec<_>, _>>()?)
    }

    async fn list_validation_rules(
        &self,
        tenant_id: &TenantId,
        enabled_only: bool,
    ) -> Result<Vec<ValidationRule>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RULE_COLUMNS}
             FROM validation_rule
             WHERE tenant_id = ? AND (? = 0 OR enabled = 1)
             ORDER BY rule_order ASC, rowid ASC"
        ))
        .bind(&tenant_id.0)
        .bind(enabled_only)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.into_iter().map(rule_from_row).collect::<Result<Vec<_>, _>>()?)
    }

    async fn list_sla_configs(
        &self,
        tenant_id: &TenantId,
        enabled_only: bool,
    ) -> Result<Vec<SlaConfig>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SLA_COLUMNS}
             FROM sla_config
             WHERE tenant_id = ? AND (? = 0 OR enabled = 1)
             ORDER BY rowid ASC"
        ))
        .bind(&tenant_id.0)
        .bind(enabled_only)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.into_iter().map(sla_from_row).collect::<Result<Vec<_>, _>>()?)
    }

    async fn list_teams(
        &self,
        tenant_id: &TenantId,
        active_only: bool,
        stage_filter: Option<&StageId>,
    ) -> Result<Vec<Team>, StoreError> {
        Ok(self.list_teams_inner(tenant_id, active_only, stage_filter).await?)
    }

    async fn create_state_transition(
        &self,
        record: StateTransition,
    ) -> Result<StateTransition, StoreError> {
        let mut tx = self.pool.begin().await.map_err(RepositoryError::from)?;
        Self::insert_transition(&mut tx, &record).await?;
        tx.commit().await.map_err(RepositoryError::from)?;
        Ok(record)
    }

    async fn list_state_transitions(
        &self,
        lead_id: &LeadId,
    ) -> Result<Vec<StateTransition>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSITION_COLUMNS}
             FROM state_transition
             WHERE lead_id = ?
             ORDER BY triggered_at DESC, seq DESC"
        ))
        .bind(&lead_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.into_iter().map(transition_from_row).collect::<Result<Vec<_>, _>>()?)
    }

    async fn commit_transition(
        &self,
        write: LeadTransitionWrite,
    ) -> Result<(Lead, StateTransition), StoreError> {
        Ok(self.commit_transition_inner(write).await?)
    }

    async fn save_lead(&self, lead: Lead) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO lead ({LEAD_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                tenant_id = excluded.tenant_id,
                current_stage_id = excluded.current_stage_id,
                state_context_json = excluded.state_context_json,
                state_metadata_json = excluded.state_metadata_json,
                version = excluded.version,
                last_modified = excluded.last_modified"
        ))
        .bind(&lead.id.0)
        .bind(&lead.tenant_id.0)
        .bind(lead.current_stage_id.as_ref().map(|stage| stage.0.as_str()))
        .bind(to_json("state_context_json", &lead.state_context)?)
        .bind(to_json("state_metadata_json", &lead.state_metadata)?)
        .bind(to_i64("version", lead.version)?)
        .bind(timestamp(lead.last_modified))
        .bind(timestamp(lead.created_at))
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        Ok(())
    }

    async fn save_pipeline_stage(&self, stage: PipelineStage) -> Result<(), StoreError> {
        let now = timestamp(Utc::now());
        sqlx::query(
            "INSERT INTO pipeline_stage (
                id,
                tenant_id,
                name,
                description,
                stage_order,
                color,
                is_active,
                is_initial_state,
                is_final_state,
                allowed_transitions_json,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                tenant_id = excluded.tenant_id,
                name = excluded.name,
                description = excluded.description,
                stage_order = excluded.stage_order,
                color = excluded.color,
                is_active = excluded.is_active,
                is_initial_state = excluded.is_initial_state,
                is_final_state = excluded.is_final_state,
                allowed_transitions_json = excluded.allowed_transitions_json,
                updated_at = excluded.updated_at",
        )
        .bind(&stage.id.0)
        .bind(&stage.tenant_id.0)
        .bind(&stage.name)
        .bind(stage.description.as_deref())
        .bind(stage.order)
        .bind(&stage.color)
        .bind(stage.is_active)
        .bind(stage.is_initial_state)
        .bind(stage.is_final_state)
        .bind(to_json("allowed_transitions_json", &stage.allowed_transitions)?)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        Ok(())
    }

    async fn save_validation_rule(&self, rule: ValidationRule) -> Result<(), StoreError> {
        let now = timestamp(Utc::now());
        sqlx::query(
            "INSERT INTO validation_rule (
                id,
                tenant_id,
                name,
                description,
                conditions_json,
                actions_json,
                severity,
                enabled,
                pipeline_stage_id,
                rule_order,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                tenant_id = excluded.tenant_id,
                name = excluded.name,
                description = excluded.description,
                conditions_json = excluded.conditions_json,
                actions_json = excluded.actions_json,
                severity = excluded.severity,
                enabled = excluded.enabled,
                pipeline_stage_id = excluded.pipeline_stage_id,
                rule_order = excluded.rule_order,
                updated_at = excluded.updated_at",
        )
        .bind(&rule.id.0)
        .bind(&rule.tenant_id.0)
        .bind(&rule.name)
        .bind(rule.description.as_deref())
        .bind(to_json("conditions_json", &rule.conditions)?)
        .bind(to_json("actions_json", &rule.actions)?)
        .bind(rule.severity.as_str())
        .bind(rule.enabled)
        .bind(rule.pipeline_stage_id.as_ref().map(|stage| stage.0.as_str()))
        .bind(rule.order)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        Ok(())
    }

    async fn save_sla_config(&self, sla: SlaConfig) -> Result<(), StoreError> {
        let now = timestamp(Utc::now());
        sqlx::query(
            "INSERT INTO sla_config (
                id,
                tenant_id,
                pipeline_stage_id,
                name,
                timeframe,
                time_unit,
                escalation_rules_json,
                notification_rules_json,
                enabled,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                tenant_id = excluded.tenant_id,
                pipeline_stage_id = excluded.pipeline_stage_id,
                name = excluded.name,
                timeframe = excluded.timeframe,
                time_unit = excluded.time_unit,
                escalation_rules_json = excluded.escalation_rules_json,
                notification_rules_json = excluded.notification_rules_json,
                enabled = excluded.enabled,
                updated_at = excluded.updated_at",
        )
        .bind(&sla.id.0)
        .bind(&sla.tenant_id.0)
        .bind(&sla.pipeline_stage_id.0)
        .bind(&sla.name)
        .bind(i64::from(sla.timeframe))
        .bind(sla.time_unit.as_str())
        .bind(to_json("escalation_rules_json", &sla.escalation_rules)?)
        .bind(to_json("notification_rules_json", &sla.notification_rules)?)
        .bind(sla.enabled)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        Ok(())
    }

    async fn save_team(&self, team: Team) -> Result<(), StoreError> {
        Ok(self.save_team_inner(team).await?)
    }
}

fn lead_from_row(row: SqliteRow) -> Result<Lead, RepositoryError> {
    Ok(Lead {
        id: LeadId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        current_stage_id: row.try_get::<Option<String>, _>("current_stage_id")?.map(StageId),
        state_context: from_json("state_context_json", &row.try_get::<String, _>("state_context_json")?)?,
        state_metadata: from_json(
            "state_metadata_json",
            &row.try_get::<String, _>("state_metadata_json")?,
        )?,
        version: parse_u64("version", row.try_get("version")?)?,
        last_modified: parse_timestamp("last_modified", &row.try_get::<String, _>("last_modified")?)?,
        created_at: parse_timestamp("created_at", &row.try_get::<String, _>("created_at")?)?,
    })
}

fn stage_from_row(row: SqliteRow) -> Result<PipelineStage, RepositoryError> {
    Ok(PipelineStage {
        id: StageId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        order: row.try_get("stage_order")?,
        color: row.try_get("color")?,
        is_active: row.try_get("is_active")?,
        is_initial_state: row.try_get("is_initial_state")?,
        is_final_state: row.try_get("is_final_state")?,
        allowed_transitions: from_json(
            "allowed_transitions_json",
            &row.try_get::<String, _>("allowed_transitions_json")?,
        )?,
    })
}

fn rule_from_row(row: SqliteRow) -> Result<ValidationRule, RepositoryError> {
    let severity_raw = row.try_get::<String, _>("severity")?;
    let severity = RuleSeverity::parse(&severity_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown rule severity `{severity_raw}`")))?;

    Ok(ValidationRule {
        id: RuleId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        conditions: from_json("conditions_json", &row.try_get::<String, _>("conditions_json")?)?,
        actions: from_json("actions_json", &row.try_get::<String, _>("actions_json")?)?,
        severity,
        enabled: row.try_get("enabled")?,
        pipeline_stage_id: row.try_get::<Option<String>, _>("pipeline_stage_id")?.map(StageId),
        order: row.try_get("rule_order")?,
    })
}

fn sla_from_row(row: SqliteRow) -> Result<SlaConfig, RepositoryError> {
    let unit_raw = row.try_get::<String, _>("time_unit")?;
    let time_unit = TimeUnit::parse(&unit_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown sla time unit `{unit_raw}`")))?;
    let timeframe = row.try_get::<i64, _>("timeframe")?;

    Ok(SlaConfig {
        id: SlaConfigId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        pipeline_stage_id: StageId(row.try_get("pipeline_stage_id")?),
        name: row.try_get("name")?,
        timeframe: u32::try_from(timeframe).map_err(|_| {
            RepositoryError::Decode(format!("invalid value for `timeframe`: {timeframe}"))
        })?,
        time_unit,
        escalation_rules: from_json(
            "escalation_rules_json",
            &row.try_get::<String, _>("escalation_rules_json")?,
        )?,
        notification_rules: from_json(
            "notification_rules_json",
            &row.try_get::<String, _>("notification_rules_json")?,
        )?,
        enabled: row.try_get("enabled")?,
    })
}

fn team_from_row(row: SqliteRow) -> Result<Team, RepositoryError> {
    Ok(Team {
        id: TeamId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        is_active: row.try_get("is_active")?,
        pipeline_stage_ids: from_json(
            "pipeline_stage_ids_json",
            &row.try_get::<String, _>("pipeline_stage_ids_json")?,
        )?,
        members: Vec::new(),
    })
}

fn transition_from_row(row: SqliteRow) -> Result<StateTransition, RepositoryError> {
    Ok(StateTransition {
        id: TransitionId(row.try_get("id")?),
        lead_id: LeadId(row.try_get("lead_id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        from_stage_id: row.try_get::<Option<String>, _>("from_stage_id")?.map(StageId),
        to_stage_id: StageId(row.try_get("to_stage_id")?),
        event: row.try_get("event")?,
        triggered_by: row.try_get("triggered_by")?,
        context: from_json("context_json", &row.try_get::<String, _>("context_json")?)?,
        metadata: from_json("metadata_json", &row.try_get::<String, _>("metadata_json")?)?,
        triggered_at: parse_timestamp("triggered_at", &row.try_get::<String, _>("triggered_at")?)?,
    })
}

fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}` ({value}): {error}"))
        })
}

fn to_json<T: Serialize + ?Sized>(column: &str, value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|error| RepositoryError::Encode(format!("could not encode `{column}`: {error}")))
}

fn from_json<T: DeserializeOwned>(column: &str, raw: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid JSON in `{column}`: {error}")))
}

fn parse_u64(column: &str, value: i64) -> Result<u64, RepositoryError> {
    u64::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative integer): {value}"
        ))
    })
}

fn to_i64(column: &str, value: u64) -> Result<i64, RepositoryError> {
    i64::try_from(value)
        .map_err(|_| RepositoryError::Encode(format!("value for `{column}` exceeds i64: {value}")))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::json;

    use leadflow_core::domain::lead::{Lead, LeadId, LeadPatch};
    use leadflow_core::domain::rules::{RuleAction, RuleCondition, RuleId, RuleSeverity, ValidationRule};
    use leadflow_core::domain::sla::{SlaConfig, SlaConfigId, TimeUnit};
    use leadflow_core::domain::stage::{PipelineStage, StageId};
    use leadflow_core::domain::team::{Team, TeamId, TeamMember};
    use leadflow_core::domain::transition::{LeadTransitionWrite, StateTransition, TransitionId};
    use leadflow_core::domain::TenantId;
    use leadflow_core::pipeline::{PipelineStore, StoreError};

    use super::SqlPipelineStore;
    use crate::{connect_with_settings, migrations};

    async fn store() -> SqlPipelineStore {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlPipelineStore::new(pool)
    }

    fn tenant() -> TenantId {
        TenantId("t-1".to_string())
    }

    fn stage(id: &str, order: i32, active: bool, next: &[&str]) -> PipelineStage {
        PipelineStage {
            id: StageId(id.to_string()),
            tenant_id: tenant(),
            name: id.to_string(),
            description: None,
            order,
            color: "#445566".to_string(),
            is_active: active,
            is_initial_state: order == 1,
            is_final_state: next.is_empty(),
            allowed_transitions: next.iter().map(|target| StageId(target.to_string())).collect(),
        }
    }

    fn record(lead_id: &str, from: Option<&str>, to: &str) -> StateTransition {
        StateTransition {
            id: TransitionId::generate(),
            lead_id: LeadId(lead_id.to_string()),
            tenant_id: tenant(),
            from_stage_id: from.map(|stage| StageId(stage.to_string())),
            to_stage_id: StageId(to.to_string()),
            event: format!("TRANSITION_TO_{to}"),
            triggered_by: "user1".to_string(),
            context: json!({"channel": "branch"}),
            metadata: json!({"note": "test"}),
            triggered_at: Utc::now(),
        }
    }

    async fn seed_stages(store: &SqlPipelineStore) {
        for stage in [
            stage("APPROVED", 3, true, &[]),
            stage("NEW", 1, true, &["REVIEW"]),
            stage("REVIEW", 2, true, &["APPROVED"]),
            stage("ARCHIVED", 4, false, &[]),
        ] {
            store.save_pipeline_stage(stage).await.expect("save stage");
        }
    }

    #[tokio::test]
    async fn stages_are_listed_by_order_and_filtered_by_activity() {
        let store = store().await;
        seed_stages(&store).await;

        let active = store.list_pipeline_stages(&tenant(), true).await.expect("active");
        let ids = active.iter().map(|stage| stage.id.0.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["NEW", "REVIEW", "APPROVED"]);
        assert_eq!(active[0].allowed_transitions, vec![StageId("REVIEW".to_string())]);

        let all = store.list_pipeline_stages(&tenant(), false).await.expect("all");
        assert_eq!(all.len(), 4);

        let found = store.find_pipeline_stage(&StageId("REVIEW".to_string())).await.expect("find");
        assert_eq!(found, Some(stage("REVIEW", 2, true, &["APPROVED"])));
    }

    #[tokio::test]
    async fn rules_and_slas_round_trip_their_tagged_json() {
        let store = store().await;
        seed_stages(&store).await;
        let rule = ValidationRule {
            id: RuleId("r-kyc".to_string()),
            tenant_id: tenant(),
            name: "KYC".to_string(),
            description: Some("identity checked".to_string()),
            conditions: vec![
                RuleCondition::FieldPresent { field: "kyc.reference".to_string() },
                RuleCondition::NumberAtMost { field: "loan.amount".to_string(), max: 50_000.0 },
            ],
            actions: vec![RuleAction::Block { message: "KYC missing".to_string() }],
            severity: RuleSeverity::Error,
            enabled: true,
            pipeline_stage_id: Some(StageId("REVIEW".to_string())),
            order: 2,
        };
        let disabled = ValidationRule {
            id: RuleId("r-old".to_string()),
            enabled: false,
            order: 1,
            ..rule.clone()
        };
        store.save_validation_rule(rule.clone()).await.expect("save rule");
        store.save_validation_rule(disabled).await.expect("save rule");

        assert_eq!(store.list_validation_rules(&tenant(), true).await.expect("rules"), vec![rule]);
        assert_eq!(store.list_validation_rules(&tenant(), false).await.expect("rules").len(), 2);

        let sla = SlaConfig {
            id: SlaConfigId("sla-review".to_string()),
            tenant_id: tenant(),
            pipeline_stage_id: StageId("REVIEW".to_string()),
            name: "Review in 8h".to_string(),
            timeframe: 8,
            time_unit: TimeUnit::Hours,
            escalation_rules: json!({"notify": ["supervisor"]}),
            notification_rules: json!(null),
            enabled: true,
        };
        store.save_sla_config(sla.clone()).await.expect("save sla");
        assert_eq!(store.list_sla_configs(&tenant(), true).await.expect("slas"), vec![sla]);
    }

    #[tokio::test]
    async fn teams_carry_only_active_members_and_filter_by_stage() {
        let store = store().await;
        seed_stages(&store).await;
        store
            .save_team(Team {
                id: TeamId("team-uw".to_string()),
                tenant_id: tenant(),
                name: "Underwriters".to_string(),
                description: None,
                is_active: true,
                pipeline_stage_ids: vec![StageId("REVIEW".to_string())],
                members: vec![
                    TeamMember { user_id: "user1".to_string(), role: "lead".to_string(), is_active: true },
                    TeamMember { user_id: "user4".to_string(), role: "member".to_string(), is_active: false },
                ],
            })
            .await
            .expect("save team");
        store
            .save_team(Team {
                id: TeamId("team-intake".to_string()),
                tenant_id: tenant(),
                name: "Intake".to_string(),
                description: None,
                is_active: false,
                pipeline_stage_ids: vec![StageId("NEW".to_string())],
                members: Vec::new(),
            })
            .await
            .expect("save team");

        let review = store
            .list_teams(&tenant(), true, Some(&StageId("REVIEW".to_string())))
            .await
            .expect("review teams");
        assert_eq!(review.len(), 1);
        assert_eq!(review[0].members.len(), 1);
        assert_eq!(review[0].members[0].user_id, "user1");

        assert!(store
            .list_teams(&tenant(), true, Some(&StageId("NEW".to_string())))
            .await
            .expect("new teams")
            .is_empty());
        assert_eq!(store.list_teams(&tenant(), false, None).await.expect("all teams").len(), 2);
    }

    #[tokio::test]
    async fn commit_updates_lead_and_appends_history_atomically() {
        let store = store().await;
        seed_stages(&store).await;
        let mut lead = Lead::new(LeadId("L-1".to_string()), tenant(), json!({"amount": 1200}));
        lead.current_stage_id = Some(StageId("NEW".to_string()));
        store.save_lead(lead.clone()).await.expect("save lead");

        let transition = record("L-1", Some("NEW"), "REVIEW");
        let (updated, stored) = store
            .commit_transition(LeadTransitionWrite {
                lead_id: lead.id.clone(),
                expected_version: 1,
                expected_stage_id: Some(StageId("NEW".to_string())),
                patch: LeadPatch {
                    current_stage_id: Some(Some(StageId("REVIEW".to_string()))),
                    ..LeadPatch::default()
                },
                transition: transition.clone(),
            })
            .await
            .expect("commit");

        assert_eq!(updated.version, 2);
        assert_eq!(stored, transition);
        let reloaded = store.find_lead(&lead.id).await.expect("find").expect("lead exists");
        assert_eq!(reloaded.current_stage_id, Some(StageId("REVIEW".to_string())));
        assert_eq!(reloaded.state_context, json!({"amount": 1200}));
        assert_eq!(store.list_state_transitions(&lead.id).await.expect("history"), vec![transition]);
    }

    #[tokio::test]
    async fn stale_commit_conflicts_and_leaves_no_trace() {
        let store = store().await;
        seed_stages(&store).await;
        let mut lead = Lead::new(LeadId("L-2".to_string()), tenant(), json!({}));
        lead.current_stage_id = Some(StageId("NEW".to_string()));
        store.save_lead(lead.clone()).await.expect("save lead");
        store
            .update_lead(&lead.id, LeadPatch { state_context: Some(json!({"touched": true})), ..LeadPatch::default() })
            .await
            .expect("concurrent edit");

        let error = store
            .commit_transition(LeadTransitionWrite {
                lead_id: lead.id.clone(),
                expected_version: 1,
                expected_stage_id: Some(StageId("NEW".to_string())),
                patch: LeadPatch {
                    current_stage_id: Some(Some(StageId("REVIEW".to_string()))),
                    ..LeadPatch::default()
                },
                transition: record("L-2", Some("NEW"), "REVIEW"),
            })
            .await
            .expect_err("stale version");

        assert!(matches!(error, StoreError::Conflict { expected_version: 1, actual_version: 2, .. }));
        assert!(store.list_state_transitions(&lead.id).await.expect("history").is_empty());
    }

    #[tokio::test]
    async fn history_is_newest_first_and_missing_lead_is_not_found() {
        let store = store().await;
        seed_stages(&store).await;
        store.save_lead(Lead::new(LeadId("L-3".to_string()), tenant(), json!({}))).await.expect("lead");

        let mut older = record("L-3", None, "NEW");
        older.triggered_at = Utc::now() - Duration::hours(2);
        let newer = record("L-3", Some("NEW"), "REVIEW");
        store.create_state_transition(older.clone()).await.expect("older");
        store.create_state_transition(newer.clone()).await.expect("newer");

        let history = store.list_state_transitions(&LeadId("L-3".to_string())).await.expect("history");
        assert_eq!(history, vec![newer, older]);

        let missing = store
            .update_lead(&LeadId("L-404".to_string()), LeadPatch::default())
            .await
            .expect_err("missing lead");
        assert!(matches!(missing, StoreError::NotFound { entity: "lead", .. }));
    }
}
