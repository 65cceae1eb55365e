pub mod config;
pub mod history;
pub mod machine_transition;
pub mod migrate;
pub mod options;
pub mod seed;
pub mod teams;
pub mod transition;

use std::sync::Arc;

use anyhow::Context;
use leadflow_core::audit::TracingAuditSink;
use leadflow_core::config::{AppConfig, LoadOptions};
use leadflow_core::errors::ApplicationError;
use leadflow_core::pipeline::LeadPipeline;
use leadflow_db::{connect_config, migrations, DbPool, SqlPipelineStore};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::success_with_data(command, message, None)
    }

    pub fn success_with_data(
        command: &str,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            data,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        Self::failure_with_data(command, error_class, message, exit_code, None)
    }

    pub fn failure_with_data(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
        data: Option<Value>,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            data,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }

    fn from_failure(command: &str, failure: Failure) -> Self {
        let (error_class, message, exit_code) = failure;
        Self::failure(command, error_class, message, exit_code)
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

/// `(error_class, message, exit_code)` carried out of a command's async body.
pub(crate) type Failure = (&'static str, String, u8);

pub(crate) const EXIT_CONFIG: u8 = 2;
pub(crate) const EXIT_RUNTIME: u8 = 3;
pub(crate) const EXIT_DB: u8 = 4;
pub(crate) const EXIT_MIGRATION: u8 = 5;
pub(crate) const EXIT_SEED: u8 = 6;
pub(crate) const EXIT_INPUT: u8 = 7;
pub(crate) const EXIT_NOT_FOUND: u8 = 8;
pub(crate) const EXIT_REJECTED: u8 = 9;

/// Loads config and a current-thread runtime, then drives `body` against a migrated store.
pub(crate) fn run_with_store<T, F, Fut>(command: &str, body: F) -> Result<T, CommandResult>
where
    F: FnOnce(AppConfig, Arc<SqlPipelineStore>) -> Fut,
    Fut: std::future::Future<Output = Result<T, Failure>>,
{
    let config = AppConfig::load(LoadOptions::default()).map_err(|error| {
        CommandResult::failure(
            command,
            "config_validation",
            format!("configuration issue: {error}"),
            EXIT_CONFIG,
        )
    })?;

    let runtime =
        tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(|error| {
            CommandResult::failure(
                command,
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                EXIT_RUNTIME,
            )
        })?;

    runtime
        .block_on(async {
            let pool = open_pool(&config).await?;
            let store = Arc::new(SqlPipelineStore::new(pool.clone()));
            let outcome = body(config, store).await;
            pool.close().await;
            outcome
        })
        .map_err(|failure| CommandResult::from_failure(command, failure))
}

pub(crate) async fn open_pool(config: &AppConfig) -> Result<DbPool, Failure> {
    let pool = connect_config(&config.database)
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), EXIT_DB))?;
    migrations::run_pending(&pool)
        .await
        .map_err(|error| ("migration", error.to_string(), EXIT_MIGRATION))?;
    Ok(pool)
}

pub(crate) fn engine(config: &AppConfig, store: Arc<SqlPipelineStore>) -> LeadPipeline {
    LeadPipeline::from_engine_config(store, &config.engine, Arc::new(TracingAuditSink))
}

pub(crate) fn parse_context(raw: Option<&str>) -> anyhow::Result<Option<Value>> {
    raw.map(|raw| {
        serde_json::from_str::<Value>(raw).context("--context must be a JSON document")
    })
    .transpose()
}

pub(crate) fn application_failure(error: ApplicationError) -> Failure {
    let (error_class, exit_code) = if error.is_not_found() {
        ("not_found", EXIT_NOT_FOUND)
    } else if error.is_conflict() {
        ("conflict", EXIT_REJECTED)
    } else {
        match &error {
            ApplicationError::Configuration(_) => ("pipeline_configuration", EXIT_CONFIG),
            ApplicationError::Domain(_) => ("domain", EXIT_REJECTED),
            ApplicationError::Persistence(_) => ("persistence", EXIT_DB),
        }
    };
    (error_class, error.to_string(), exit_code)
}

pub(crate) fn to_data(value: &impl Serialize) -> Result<Option<Value>, Failure> {
    serde_json::to_value(value)
        .map(Some)
        .map_err(|error| ("serialization", error.to_string(), EXIT_RUNTIME))
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use leadflow_core::errors::{ApplicationError, DomainError};
    use leadflow_core::{LeadId, StoreError, TenantId};

    use super::{
        application_failure, parse_context, CommandResult, EXIT_CONFIG, EXIT_DB, EXIT_NOT_FOUND,
        EXIT_REJECTED,
    };

    #[test]
    fn data_is_omitted_when_absent() {
        let plain: Value =
            serde_json::from_str(&CommandResult::success("migrate", "done").output).expect("json");
        assert!(plain.get("data").is_none());
        assert_eq!(plain["error_class"], Value::Null);

        let with_data: Value = serde_json::from_str(
            &CommandResult::success_with_data("teams", "1 team", Some(json!([{"name": "Intake"}])))
                .output,
        )
        .expect("json");
        assert_eq!(with_data["data"][0]["name"], "Intake");
    }

    #[test]
    fn context_argument_must_be_json() {
        assert_eq!(parse_context(None).expect("absent"), None);
        assert_eq!(
            parse_context(Some(r#"{"loan":{"amount":900}}"#)).expect("valid"),
            Some(json!({"loan": {"amount": 900}}))
        );
        let error = parse_context(Some("amount=900")).expect_err("invalid");
        assert!(error.to_string().contains("--context"));
    }

    #[test]
    fn application_errors_map_to_classes_and_exit_codes() {
        let missing = application_failure(DomainError::LeadNotFound(LeadId("L-9".to_owned())).into());
        assert_eq!((missing.0, missing.2), ("not_found", EXIT_NOT_FOUND));
        assert!(missing.1.contains("L-9"));

        let raced = application_failure(
            StoreError::Conflict { lead_id: LeadId("L-1".to_owned()), expected_version: 3, actual_version: 4 }
                .into(),
        );
        assert_eq!((raced.0, raced.2), ("conflict", EXIT_REJECTED));

        let stalled = application_failure(
            StoreError::Timeout { operation: "find_lead", after: std::time::Duration::from_millis(250) }
                .into(),
        );
        assert_eq!((stalled.0, stalled.2), ("persistence", EXIT_DB));

        let empty = application_failure(ApplicationError::no_pipeline_stages(&TenantId("t-empty".to_owned())));
        assert_eq!((empty.0, empty.2), ("pipeline_configuration", EXIT_CONFIG));
    }
}
