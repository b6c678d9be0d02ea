//! Job runner for workspace provisioning.
//!
//! Polls the job ledger, claims workspace jobs addressed to this runner and
//! executes them with the provisioning engine against the configured targets.

pub mod config;
pub mod provisioner;
pub mod resolvers;

use std::sync::Arc;

use sqlx::SqlitePool;
use ws_core::{Executor, LocalExecutor};
use ws_orchestrator::{
    JobStore, NoopTelemetry, WorkspaceMetadataStore, WorkspaceService, WorkspaceServiceConfig,
    WorkspaceStore,
};

pub use config::Config;
pub use provisioner::{Backend, DockerBackend, Runner};
pub use resolvers::{ConfigGitProviders, ConfigRegistries, ConfigTargets, NoBuildCache, ServerManagedApiKeys};

/// Wire a workspace service whose collaborators come from the runner config.
///
/// `git_executor` runs `git ls-remote` when commits have to be resolved.
pub fn build_service(config: &Config, pool: SqlitePool, git_executor: Arc<dyn Executor>) -> WorkspaceService {
    let jobs = JobStore::new(pool.clone());
    WorkspaceService::new(WorkspaceServiceConfig {
        store: WorkspaceStore::new(pool.clone()),
        metadata_store: WorkspaceMetadataStore::new(pool),
        jobs: jobs.clone(),
        scheduler: Arc::new(jobs),
        targets: Arc::new(ConfigTargets(config.targets.clone())),
        registries: Arc::new(ConfigRegistries(config.container_registries.clone())),
        build_cache: Arc::new(NoBuildCache),
        api_keys: Arc::new(ServerManagedApiKeys),
        git_providers: Arc::new(ConfigGitProviders::new(config.git_providers.clone(), git_executor)),
        telemetry: Arc::new(NoopTelemetry),
        server_api_url: config.server_api_url.clone(),
        server_url: config.server_url.clone(),
        server_version: env!("CARGO_PKG_VERSION").to_string(),
        default_workspace_image: config.default_workspace_image.clone(),
        default_workspace_user: config.default_workspace_user.clone(),
    })
}

/// Build a runner backed by the Docker CLI.
pub fn build_runner(config: Config, pool: SqlitePool) -> Runner {
    let service = build_service(&config, pool.clone(), Arc::new(LocalExecutor::new()));
    Runner::new(Arc::new(config), JobStore::new(pool), service, Arc::new(DockerBackend))
}
