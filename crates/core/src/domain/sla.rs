use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::stage::StageId;
use crate::domain::TenantId;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlaConfigId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minutes => "minutes",
            Self::Hours => "hours",
            Self::Days => "days",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "minutes" => Some(Self::Minutes),
            "hours" => Some(Self::Hours),
            "days" => Some(Self::Days),
            _ => None,
        }
    }
}

/// Maximum dwell time for one stage. Escalation and notification rules are opaque to the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlaConfig {
    pub id: SlaConfigId,
    pub tenant_id: TenantId,
    pub pipeline_stage_id: StageId,
    pub name: String,
    pub timeframe: u32,
    pub time_unit: TimeUnit,
    pub escalation_rules: Value,
    pub notification_rules: Value,
    pub enabled: bool,
}

impl SlaConfig {
    /// Longest threshold a configuration may carry: ten years.
    pub const MAX_THRESHOLD_DAYS: i64 = 3_650;

    pub fn threshold(&self) -> Duration {
        let timeframe = i64::from(self.timeframe);
        match self.time_unit {
            TimeUnit::Minutes => Duration::minutes(timeframe),
            TimeUnit::Hours => Duration::hours(timeframe),
            TimeUnit::Days => Duration::days(timeframe),
        }
    }

    pub fn is_within_bounds(&self) -> bool {
        self.threshold() <= Duration::days(Self::MAX_THRESHOLD_DAYS)
    }

    pub fn due_at(&self, started_at: DateTime<Utc>) -> DateTime<Utc> {
        saturating_due_at(started_at, self.threshold())
    }
}

/// `started_at + threshold`, clamped to the latest representable instant.
pub fn saturating_due_at(started_at: DateTime<Utc>, threshold: Duration) -> DateTime<Utc> {
    started_at.checked_add_signed(threshold).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
