use thiserror::Error;

use leadflow_core::domain::lead::LeadId;
use leadflow_core::pipeline::StoreError;

pub mod pipeline;

pub use pipeline::SqlPipelineStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("lead {lead_id} changed concurrently (expected version {expected_version}, found {actual_version})")]
    Conflict { lead_id: LeadId, expected_version: u64, actual_version: u64 },
}

impl From<RepositoryError> for StoreError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::Database(source) => StoreError::Backend(source.to_string()),
            RepositoryError::Decode(message) => StoreError::Decode(message),
            RepositoryError::Encode(message) => StoreError::Backend(message),
            RepositoryError::NotFound { entity, id } => StoreError::NotFound { entity, id },
            RepositoryError::Conflict { lead_id, expected_version, actual_version } => {
                StoreError::Conflict { lead_id, expected_version, actual_version }
            }
        }
    }
}
