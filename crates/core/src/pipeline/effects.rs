use chrono::{DateTime, Duration, Utc};

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::lead::{SlaTimer, StateMetadata};
use crate::domain::sla::saturating_due_at;
use crate::pipeline::machine::StageAction;

/// Metadata after running the timer actions of a transition at `now`.
///
/// Notifications are left alone here; they go out through [`emit_notifications`] once the
/// transition has been committed.
pub fn apply_timer_actions(
    metadata: &StateMetadata,
    actions: &[StageAction],
    now: DateTime<Utc>,
) -> StateMetadata {
    let mut next = metadata.clone();
    for action in actions {
        match action {
            StageAction::ClearSlaTimers { stage_id } => {
                next.sla_timers.retain(|_, timer| &timer.stage_id != stage_id);
            }
            StageAction::StartSlaTimer { sla_config_id, stage_id, threshold_secs } => {
                let due_at = saturating_due_at(now, Duration::seconds(*threshold_secs));
                next.sla_timers.insert(
                    sla_config_id.clone(),
                    SlaTimer { stage_id: stage_id.clone(), started_at: now, due_at },
                );
            }
            StageAction::NotifyStageEntry { .. } | StageAction::NotifyStageExit { .. } => {}
        }
    }
    next.last_transition_at = Some(now);
    next
}

pub fn emit_notifications(sink: &dyn AuditSink, context: &AuditContext, actions: &[StageAction]) {
    for action in actions.iter().filter(|action| action.is_notification()) {
        let (event_type, stage_id, stage_name) = match action {
            StageAction::NotifyStageEntry { stage_id, stage_name } => {
                ("pipeline.stage_entered", stage_id, stage_name)
            }
            StageAction::NotifyStageExit { stage_id, stage_name } => {
                ("pipeline.stage_exited", stage_id, stage_name)
            }
            _ => continue,
        };
        sink.emit(
            AuditEvent::new(context, event_type, AuditCategory::Notification, AuditOutcome::Success)
                .with_metadata("stage_id", stage_id.0.clone())
                .with_metadata("stage_name", stage_name.clone()),
        );
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::{apply_timer_actions, emit_notifications};
    use crate::audit::{AuditContext, InMemoryAuditSink};
    use crate::domain::lead::{SlaTimer, StateMetadata};
    use crate::domain::sla::SlaConfigId;
    use crate::domain::stage::StageId;
    use crate::pipeline::machine::StageAction;

    #[test]
    fn timers_for_exited_stage_are_replaced_by_entered_stage_timers() {
        let start = Utc.with_ymd_and_hms(2026, 5, 4, 8, 0, 0).unwrap();
        let mut metadata = StateMetadata::default();
        metadata.sla_timers.insert(
            SlaConfigId("sla-new".to_string()),
            SlaTimer {
                stage_id: StageId("stg-new".to_string()),
                started_at: start,
                due_at: start + Duration::hours(1),
            },
        );
        let now = start + Duration::minutes(30);

        let next = apply_timer_actions(
            &metadata,
            &[
                StageAction::ClearSlaTimers { stage_id: StageId("stg-new".to_string()) },
                StageAction::StartSlaTimer {
                    sla_config_id: SlaConfigId("sla-review".to_string()),
                    stage_id: StageId("stg-review".to_string()),
                    threshold_secs: 7200,
                },
            ],
            now,
        );

        assert!(!next.sla_timers.contains_key(&SlaConfigId("sla-new".to_string())));
        let review = &next.sla_timers[&SlaConfigId("sla-review".to_string())];
        assert_eq!(review.due_at, now + Duration::hours(2));
        assert_eq!(next.last_transition_at, Some(now));
    }

    #[test]
    fn only_notification_actions_are_emitted() {
        let sink = InMemoryAuditSink::default();
        emit_notifications(
            &sink,
            &AuditContext::new(None, None, "req-1", "user1"),
            &[
                StageAction::NotifyStageExit {
                    stage_id: StageId("stg-new".to_string()),
                    stage_name: "New".to_string(),
                },
                StageAction::ClearSlaTimers { stage_id: StageId("stg-new".to_string()) },
                StageAction::NotifyStageEntry {
                    stage_id: StageId("stg-review".to_string()),
                    stage_name: "Review".to_string(),
                },
            ],
        );

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "pipeline.stage_exited");
        assert_eq!(events[1].metadata["stage_name"], "Review");
    }

    #[test]
    fn timer_past_the_calendar_limit_saturates() {
        let now = Utc.with_ymd_and_hms(2026, 5, 4, 8, 0, 0).unwrap();
        let next = apply_timer_actions(
            &StateMetadata::default(),
            &[StageAction::StartSlaTimer {
                sla_config_id: SlaConfigId("sla-forever".to_string()),
                stage_id: StageId("stg-review".to_string()),
                threshold_secs: Duration::days(200_000_000).num_seconds(),
            }],
            now,
        );

        let timer = &next.sla_timers[&SlaConfigId("sla-forever".to_string())];
        assert_eq!(timer.started_at, now);
        assert_eq!(timer.due_at, DateTime::<Utc>::MAX_UTC);
    }
}
