pub mod connection;
pub mod fixtures;
pub mod migrations;
pub mod repositories;

pub use connection::{connect_config, connect_with_settings, DbPool};
pub use fixtures::{PipelineSeed, SeedError, SeedResult, VerificationResult};
pub use repositories::{RepositoryError, SqlPipelineStore};
