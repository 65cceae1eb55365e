use leadflow_core::domain::lead::LeadId;

use crate::commands::{to_data, CommandResult};

pub fn run(lead_id: String, user: Option<String>) -> CommandResult {
    let lead_id = LeadId(lead_id);
    let outcome = super::run_with_store("options", |config, store| async move {
        let options = super::engine(&config, store)
            .get_available_transitions_with_teams(&lead_id, user.as_deref())
            .await;
        let data = to_data(&options)?;
        Ok((options.len(), data))
    });

    match outcome {
        Ok((count, data)) => {
            CommandResult::success_with_data("options", format!("{count} stage(s) available"), data)
        }
        Err(result) => result,
    }
}
