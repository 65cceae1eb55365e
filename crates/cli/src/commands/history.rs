use leadflow_core::domain::lead::LeadId;
use serde_json::json;

use crate::commands::{application_failure, CommandResult, EXIT_DB};

/// Transition history (newest first) together with the lead's TAT report.
pub fn run(lead_id: String) -> CommandResult {
    let lead_id = LeadId(lead_id);
    let outcome = super::run_with_store("history", |config, store| async move {
        let engine = super::engine(&config, store);
        let report = engine.tat_report(&lead_id).await.map_err(application_failure)?;
        let transitions = engine
            .store()
            .list_state_transitions(&lead_id)
            .await
            .map_err(|error| ("persistence", error.to_string(), EXIT_DB))?;

        let count = transitions.len();
        Ok((count, Some(json!({ "transitions": transitions, "tat": report }))))
    });

    match outcome {
        Ok((count, data)) => {
            CommandResult::success_with_data("history", format!("{count} transition(s)"), data)
        }
        Err(result) => result,
    }
}
