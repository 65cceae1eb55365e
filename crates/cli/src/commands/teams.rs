use leadflow_core::domain::TenantId;

use crate::commands::{application_failure, to_data, CommandResult};

pub fn run(tenant_id: String) -> CommandResult {
    let tenant_id = TenantId(tenant_id);
    let outcome = super::run_with_store("teams", |config, store| async move {
        let teams = super::engine(&config, store)
            .get_teams_with_stages(&tenant_id)
            .await
            .map_err(application_failure)?;
        let data = to_data(&teams)?;
        Ok((teams.len(), data))
    });

    match outcome {
        Ok((count, data)) => CommandResult::success_with_data("teams", format!("{count} team(s)"), data),
        Err(result) => result,
    }
}
