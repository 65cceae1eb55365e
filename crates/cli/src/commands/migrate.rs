use crate::commands::CommandResult;

pub fn run() -> CommandResult {
    match super::run_with_store("migrate", |_, _| async { Ok(()) }) {
        Ok(()) => CommandResult::success("migrate", "applied pending migrations"),
        Err(result) => result,
    }
}
