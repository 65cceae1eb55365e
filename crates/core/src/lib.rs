pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod pipeline;

pub use audit::{AuditEvent, AuditSink, InMemoryAuditSink, TracingAuditSink};
pub use config::{AppConfig, ConfigError, LoadOptions};
pub use domain::lead::{Lead, LeadId, TriggeredBy};
pub use domain::stage::{PipelineStage, StageId};
pub use domain::team::{Team, TeamId};
pub use domain::transition::StateTransition;
pub use domain::TenantId;
pub use errors::{ApplicationError, DomainError};
pub use pipeline::{
    ExecutionRequest, ExecutionResult, LeadPipeline, MachineTransitionResult, PipelineStore,
    StoreError, TransitionOption, TransitionValidation,
};
