//! Workspace orchestration business logic
//!
//! This crate owns the workspace lifecycle: the durable job ledger, the
//! workspace and metadata stores, and the service that validates requests,
//! resolves their dependencies and enqueues jobs for a runner. It never
//! provisions containers itself; runners consume the ledger and drive the
//! provisioning engine.

pub mod db;
pub mod dto;
pub mod error;
pub mod job;
pub mod resolvers;
pub mod service;
pub mod store;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use dto::{
    CreateWorkspaceDto, ProvisioningParams, WorkspaceDto, WorkspaceRetrievalParams, WorkspaceState,
};
pub use error::{ApiKeyError, OrchestratorError, Result};
pub use job::{Job, JobAction, JobFilter, JobScheduler, JobState, JobStore, ResourceType};
pub use resolvers::{
    ApiKeyService, BuildCache, ContainerRegistryResolver, GitProviderResolver, NoopTelemetry,
    RequestContext, TargetResolver, TelemetryEvent, TelemetrySink,
};
pub use service::{workspace_env_vars, WorkspaceEnvVarParams, WorkspaceService, WorkspaceServiceConfig};
pub use store::{
    FileStatus, GitStatus, WorkspaceMetadata, WorkspaceMetadataStore, WorkspaceRecord, WorkspaceStore,
};
