use serde::{Deserialize, Serialize};

use crate::domain::stage::{PipelineStage, StageId};
use crate::domain::TenantId;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TeamId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamMember {
    pub user_id: String,
    pub role: String,
    pub is_active: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: TeamId,
    pub tenant_id: TenantId,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    /// Stages this team serves. Ownership is many-to-many.
    pub pipeline_stage_ids: Vec<StageId>,
    pub members: Vec<TeamMember>,
}

impl Team {
    pub fn owns_stage(&self, stage_id: &StageId) -> bool {
        self.pipeline_stage_ids.contains(stage_id)
    }

    pub fn has_active_member(&self, user_id: &str) -> bool {
        self.members.iter().any(|member| member.is_active && member.user_id == user_id)
    }

    /// Copy of the team with inactive members removed.
    pub fn with_active_members(&self) -> Self {
        Self {
            members: self.members.iter().filter(|member| member.is_active).cloned().collect(),
            ..self.clone()
        }
    }
}

/// A team with its owned stages resolved, for configuration views.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamWithStages {
    pub team: Team,
    pub stages: Vec<PipelineStage>,
}

#[cfg(test)]
mod tests {
    use super::{Team, TeamId, TeamMember};
    use crate::domain::stage::StageId;
    use crate::domain::TenantId;

    #[test]
    fn inactive_members_do_not_count() {
        let team = Team {
            id: TeamId("team-uw".to_string()),
            tenant_id: TenantId("t-1".to_string()),
            name: "Underwriters".to_string(),
            description: None,
            is_active: true,
            pipeline_stage_ids: vec![StageId("stg-review".to_string())],
            members: vec![
                TeamMember { user_id: "user1".to_string(), role: "lead".to_string(), is_active: true },
                TeamMember {
                    user_id: "user9".to_string(),
                    role: "member".to_string(),
                    is_active: false,
                },
            ],
        };

        assert!(team.owns_stage(&StageId("stg-review".to_string())));
        assert!(team.has_active_member("user1"));
        assert!(!team.has_active_member("user9"));
        assert_eq!(team.with_active_members().members.len(), 1);
    }
}
