use leadflow_core::domain::lead::{LeadId, TriggeredBy};

use crate::commands::{
    application_failure, parse_context, to_data, CommandResult, EXIT_INPUT, EXIT_REJECTED,
};

#[derive(Debug, Clone)]
pub struct MachineTransitionArgs {
    pub lead_id: String,
    pub event: String,
    pub user: Option<String>,
    pub context: Option<String>,
}

/// Sends `event` straight to the tenant's state machine. Validation rules apply, team ownership
/// does not.
pub fn run(args: MachineTransitionArgs) -> CommandResult {
    let context = match parse_context(args.context.as_deref()) {
        Ok(context) => context,
        Err(error) => {
            return CommandResult::failure(
                "machine-transition",
                "invalid_input",
                format!("{error:#}"),
                EXIT_INPUT,
            );
        }
    };
    let lead_id = LeadId(args.lead_id);
    let triggered_by = args.user.as_deref().map_or(TriggeredBy::System, TriggeredBy::parse);

    let outcome = super::run_with_store("machine-transition", |config, store| async move {
        let result = super::engine(&config, store)
            .execute_machine_transition(&lead_id, &args.event, context, &triggered_by)
            .await
            .map_err(application_failure)?;
        let data = to_data(&result)?;
        Ok((result, data))
    });

    match outcome {
        Ok((result, data)) if result.changed => CommandResult::success_with_data(
            "machine-transition",
            format!("lead moved to {}", result.to),
            data,
        ),
        Ok((result, data)) => CommandResult::failure_with_data(
            "machine-transition",
            "transition_rejected",
            result.reason.unwrap_or_else(|| "state machine did not change state".to_string()),
            EXIT_REJECTED,
            data,
        ),
        Err(result) => result,
    }
}
