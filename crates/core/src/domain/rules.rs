use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::stage::StageId;
use crate::domain::TenantId;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RuleId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSeverity {
    Error,
    Warning,
    Info,
}

impl RuleSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warning" => Some(Self::Warning),
            "info" => Some(Self::Info),
            _ => None,
        }
    }

    pub fn blocks(&self) -> bool {
        matches!(self, Self::Error)
    }
}

/// A single predicate over the lead context. Fields are dotted paths, e.g. `applicant.income`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleCondition {
    FieldPresent { field: String },
    FieldEquals { field: String, value: Value },
    FieldIn { field: String, values: Vec<Value> },
    NumberAtLeast { field: String, min: f64 },
    NumberAtMost { field: String, max: f64 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    Block { message: String },
    Warn { message: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub id: RuleId,
    pub tenant_id: TenantId,
    pub name: String,
    pub description: Option<String>,
    pub conditions: Vec<RuleCondition>,
    pub actions: Vec<RuleAction>,
    pub severity: RuleSeverity,
    pub enabled: bool,
    /// `None` applies the rule to every stage.
    pub pipeline_stage_id: Option<StageId>,
    pub order: i32,
}

impl ValidationRule {
    pub fn applies_to(&self, stage_id: &StageId) -> bool {
        self.pipeline_stage_id.as_ref().map_or(true, |scoped| scoped == stage_id)
    }

    /// Message shown when the rule fails; falls back to the rule name.
    pub fn failure_message(&self) -> String {
        self.actions
            .iter()
            .find_map(|action| match action {
                RuleAction::Block { message } | RuleAction::Warn { message } => {
                    (!message.trim().is_empty()).then(|| message.clone())
                }
            })
            .unwrap_or_else(|| format!("validation rule `{}` failed", self.name))
    }
}
