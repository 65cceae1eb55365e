use leadflow_core::domain::lead::{LeadId, TriggeredBy};
use leadflow_core::domain::stage::StageId;
use leadflow_core::pipeline::ExecutionRequest;

use crate::commands::{parse_context, to_data, CommandResult, EXIT_INPUT, EXIT_REJECTED};

#[derive(Debug, Clone)]
pub struct TransitionArgs {
    pub lead_id: String,
    pub target_stage_id: String,
    pub event: Option<String>,
    pub user: Option<String>,
    pub context: Option<String>,
}

/// Team-aware transition; the lead only moves if the user may act on the target stage.
pub fn run(args: TransitionArgs) -> CommandResult {
    let context = match parse_context(args.context.as_deref()) {
        Ok(context) => context,
        Err(error) => {
            return CommandResult::failure("transition", "invalid_input", format!("{error:#}"), EXIT_INPUT);
        }
    };
    let request = ExecutionRequest {
        lead_id: LeadId(args.lead_id),
        target_stage_id: StageId(args.target_stage_id),
        event: args.event,
        context,
        triggered_by: args.user.as_deref().map_or(TriggeredBy::System, TriggeredBy::parse),
    };

    let outcome = super::run_with_store("transition", |config, store| async move {
        let result = super::engine(&config, store).execute_transition(request).await;
        let data = to_data(&result)?;
        Ok((result, data))
    });

    match outcome {
        Ok((result, data)) if result.success => {
            CommandResult::success_with_data("transition", result.message, data)
        }
        Ok((result, data)) => CommandResult::failure_with_data(
            "transition",
            "transition_rejected",
            result.message,
            EXIT_REJECTED,
            data,
        ),
        Err(result) => result,
    }
}
