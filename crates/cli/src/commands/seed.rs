use std::path::PathBuf;

use leadflow_db::{PipelineSeed, SeedError};
use serde_json::json;

use crate::commands::{CommandResult, Failure, EXIT_INPUT, EXIT_SEED};

#[derive(Debug, Clone, Default)]
pub struct SeedArgs {
    pub file: Option<PathBuf>,
    pub demo: bool,
}

pub fn run(args: SeedArgs) -> CommandResult {
    let seed = match load_document(&args) {
        Ok(seed) => seed,
        Err((error_class, message, exit_code)) => {
            return CommandResult::failure("seed", error_class, message, exit_code);
        }
    };

    let result = super::run_with_store("seed", |_, store| async move {
        let applied = seed
            .apply(store.as_ref())
            .await
            .map_err(|error| ("seed_execution", error.to_string(), EXIT_SEED))?;
        let verification = seed
            .verify(store.as_ref())
            .await
            .map_err(|error| ("seed_verification", error.to_string(), EXIT_SEED))?;

        if !verification.all_present {
            return Err(("seed_verification", verification_message(&verification.checks), EXIT_SEED));
        }
        let data = json!({ "applied": applied, "verification": verification });
        Ok((applied, Some(data)))
    });

    match result {
        Ok((applied, data)) => CommandResult::success_with_data(
            "seed",
            format!(
                "seeded tenant {}: {} stages, {} rules, {} sla configs, {} teams, {} new leads",
                applied.tenant_id,
                applied.stages,
                applied.rules,
                applied.sla_configs,
                applied.teams,
                applied.leads_created.len()
            ),
            data,
        ),
        Err(result) => result,
    }
}

fn load_document(args: &SeedArgs) -> Result<PipelineSeed, Failure> {
    let loaded = match (&args.file, args.demo) {
        (Some(_), true) => {
            return Err((
                "invalid_input",
                "pass either a seed file or --demo, not both".to_string(),
                EXIT_INPUT,
            ));
        }
        (None, false) => {
            return Err(("invalid_input", "a seed file or --demo is required".to_string(), EXIT_INPUT));
        }
        (Some(path), false) => PipelineSeed::from_path(path),
        (None, true) => PipelineSeed::demo(),
    };

    loaded.map_err(|error| {
        let error_class = match error {
            SeedError::Read { .. } => "seed_read",
            _ => "seed_document",
        };
        (error_class, error.to_string(), EXIT_SEED)
    })
}

fn verification_message(checks: &[(String, bool)]) -> String {
    let failed_checks = checks
        .iter()
        .filter_map(|(check, passed)| (!passed).then_some(check.as_str()))
        .collect::<Vec<_>>();
    if failed_checks.is_empty() {
        "some seed data failed to load".to_string()
    } else {
        format!("seed verification failed for checks: {}", failed_checks.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::verification_message;

    #[test]
    fn verification_error_message_targets_failed_checks() {
        let checks = vec![
            ("stage:stg-new".to_string(), true),
            ("team:team-intake".to_string(), false),
            ("lead:lead-1001".to_string(), false),
        ];

        assert_eq!(
            verification_message(&checks),
            "seed verification failed for checks: team:team-intake, lead:lead-1001"
        );
    }

    #[test]
    fn verification_error_message_falls_back_to_generic_when_no_labels() {
        let checks = vec![("stage:stg-new".to_string(), true)];
        assert_eq!(verification_message(&checks), "some seed data failed to load");
    }
}
