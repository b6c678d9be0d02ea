//! Workspace lifecycle: validate, resolve, persist, enqueue.
//!
//! The service never provisions anything itself. Every accepted lifecycle
//! call leaves a job in the ledger for a runner to pick up, and the state a
//! caller sees is read back from the latest of those jobs.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, instrument, warn};
use uuid::Uuid;
use ws_core::validation::{suggest_unique_name, validate_workspace_name, workspace_name_from_repo_url};
use ws_core::{ContainerRegistry, GitProviderConfig, Workspace};

use crate::dto::{
    CreateWorkspaceDto, ProvisioningParams, WorkspaceDto, WorkspaceRetrievalParams, WorkspaceState,
};
use crate::error::{ApiKeyError, OrchestratorError, Result};
use crate::job::{JobAction, JobFilter, JobScheduler, JobStore, ResourceType};
use crate::resolvers::{
    ApiKeyService, BuildCache, ContainerRegistryResolver, GitProviderResolver, RequestContext,
    TargetResolver, TelemetryEvent, TelemetrySink,
};
use crate::store::{WorkspaceMetadata, WorkspaceMetadataStore, WorkspaceRecord, WorkspaceStore};

pub const ENV_SERVER_API_URL: &str = "WS_SERVER_API_URL";
pub const ENV_SERVER_URL: &str = "WS_SERVER_URL";
pub const ENV_SERVER_VERSION: &str = "WS_SERVER_VERSION";
pub const ENV_SERVER_API_KEY: &str = "WS_SERVER_API_KEY";
pub const ENV_CLIENT_ID: &str = "WS_CLIENT_ID";
pub const ENV_WORKSPACE_ID: &str = "WS_WORKSPACE_ID";
pub const ENV_TARGET_ID: &str = "WS_TARGET_ID";
pub const ENV_REPOSITORY_URL: &str = "WS_WORKSPACE_REPOSITORY_URL";

/// Server details injected into every workspace's environment.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceEnvVarParams<'a> {
    pub api_url: &'a str,
    pub server_url: &'a str,
    pub server_version: &'a str,
    pub client_id: &'a str,
}

/// Variables the workspace agent needs to reach back to the server.
pub fn workspace_env_vars(
    workspace: &Workspace,
    params: &WorkspaceEnvVarParams<'_>,
) -> HashMap<String, String> {
    [
        (ENV_SERVER_API_URL, params.api_url),
        (ENV_SERVER_URL, params.server_url),
        (ENV_SERVER_VERSION, params.server_version),
        (ENV_SERVER_API_KEY, workspace.api_key.as_str()),
        (ENV_CLIENT_ID, params.client_id),
        (ENV_WORKSPACE_ID, workspace.id.as_str()),
        (ENV_TARGET_ID, workspace.target_id.as_str()),
        (ENV_REPOSITORY_URL, workspace.repository.url.as_str()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Dependencies and settings of a [`WorkspaceService`].
#[derive(Clone)]
pub struct WorkspaceServiceConfig {
    pub store: WorkspaceStore,
    pub metadata_store: WorkspaceMetadataStore,
    pub jobs: JobStore,
    pub scheduler: Arc<dyn JobScheduler>,
    pub targets: Arc<dyn TargetResolver>,
    pub registries: Arc<dyn ContainerRegistryResolver>,
    pub build_cache: Arc<dyn BuildCache>,
    pub api_keys: Arc<dyn ApiKeyService>,
    pub git_providers: Arc<dyn GitProviderResolver>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub server_api_url: String,
    pub server_url: String,
    pub server_version: String,
    pub default_workspace_image: String,
    pub default_workspace_user: String,
}

#[derive(Clone)]
pub struct WorkspaceService {
    config: WorkspaceServiceConfig,
}

impl WorkspaceService {
    pub fn new(config: WorkspaceServiceConfig) -> Self {
        Self { config }
    }

    /// Validate and persist a workspace, then enqueue its `create` job.
    #[instrument(skip(self, ctx, dto), fields(name = %dto.name, target_id = %dto.target_id))]
    pub async fn create(&self, ctx: &RequestContext, dto: CreateWorkspaceDto) -> Result<WorkspaceDto> {
        let name = self.resolve_name(&dto).await?;
        validate_workspace_name(&name).map_err(|_| OrchestratorError::InvalidName(name.clone()))?;
        if self.config.store.name_in_use(&name).await? {
            return Err(OrchestratorError::AlreadyExists(name));
        }

        let target = self
            .config
            .targets
            .find_target(&dto.target_id)
            .await
            .map_err(|e| OrchestratorError::dependency("target", e))?
            .ok_or_else(|| OrchestratorError::TargetNotFound(dto.target_id.clone()))?;

        let mut repository = dto.repository.clone();
        let git_provider_config = self
            .resolve_git_provider_config(dto.git_provider_config_id.as_deref(), &repository.url)
            .await?;
        if !repository.is_pinned() && !repository.url.is_empty() {
            let sha = self
                .config
                .git_providers
                .last_commit_sha(&repository, git_provider_config.as_ref())
                .await
                .map_err(|e| OrchestratorError::dependency("latest commit", e))?;
            repository.sha = Some(sha);
        }

        let id = dto
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let api_key = self.config.api_keys.create_api_key(&id).await?;

        let mut workspace = Workspace {
            id: id.clone(),
            name,
            image: dto
                .image
                .clone()
                .unwrap_or_else(|| self.config.default_workspace_image.clone()),
            user: dto
                .user
                .clone()
                .unwrap_or_else(|| self.config.default_workspace_user.clone()),
            repository,
            target_id: target.id.clone(),
            build_config: dto.build_config.clone(),
            env_vars: dto.env_vars.clone(),
            labels: dto.labels.clone(),
            api_key,
            git_provider_config_id: git_provider_config.map(|c| c.id),
        };
        let injected = workspace_env_vars(
            &workspace,
            &WorkspaceEnvVarParams {
                api_url: &self.config.server_api_url,
                server_url: &self.config.server_url,
                server_version: &self.config.server_version,
                client_id: &ctx.client_id,
            },
        );
        workspace.env_vars.extend(injected);

        if let Err(e) = self.persist_and_enqueue(&workspace, target.runner_id.as_deref()).await {
            self.track(ctx, TelemetryEvent::new("workspace_create", &id).with_error(&e))
                .await;
            return Err(e);
        }

        info!("Workspace {} ({}) accepted", workspace.name, workspace.id);
        self.track(ctx, TelemetryEvent::new("workspace_create", &id)).await;
        self.find(&id, WorkspaceRetrievalParams::default()).await
    }

    /// Store the row and its `create` job, or neither.
    async fn persist_and_enqueue(&self, workspace: &Workspace, runner_id: Option<&str>) -> Result<()> {
        if let Err(e) = self.config.store.insert(workspace).await {
            self.revoke_after_failure(&workspace.id).await;
            return Err(e);
        }

        if let Err(e) = self
            .config
            .scheduler
            .create_job(&workspace.id, ResourceType::Workspace, runner_id, JobAction::Create)
            .await
        {
            if let Err(purge) = self.config.store.purge(&workspace.id).await {
                warn!("Failed to remove workspace {} after enqueue failure: {}", workspace.id, purge);
            }
            self.revoke_after_failure(&workspace.id).await;
            return Err(OrchestratorError::Scheduling(e));
        }
        Ok(())
    }

    async fn revoke_after_failure(&self, id: &str) {
        if let Err(e) = self.config.api_keys.delete_api_key(id).await {
            warn!("Failed to revoke API key for abandoned workspace {}: {}", id, e);
        }
    }

    async fn resolve_name(&self, dto: &CreateWorkspaceDto) -> Result<String> {
        if !dto.name.is_empty() {
            return Ok(dto.name.clone());
        }
        let initial = workspace_name_from_repo_url(&dto.repository.url);
        let existing = self.config.store.active_names().await?;
        Ok(suggest_unique_name(&initial, &existing))
    }

    async fn resolve_git_provider_config(
        &self,
        explicit_id: Option<&str>,
        repository_url: &str,
    ) -> Result<Option<GitProviderConfig>> {
        let providers = &self.config.git_providers;
        if let Some(id) = explicit_id.filter(|id| !id.is_empty()) {
            let config = providers
                .find_config(id)
                .await
                .map_err(|e| OrchestratorError::dependency("git provider config", e))?
                .ok_or_else(|| {
                    OrchestratorError::dependency(
                        "git provider config",
                        anyhow::anyhow!("no git provider config with id {}", id),
                    )
                })?;
            return Ok(Some(config));
        }
        if repository_url.is_empty() {
            return Ok(None);
        }

        let configs = providers
            .list_configs_for_url(repository_url)
            .await
            .map_err(|e| OrchestratorError::dependency("git provider config", e))?;
        Ok(configs.into_iter().next())
    }

    /// Look a workspace up by id or name.
    pub async fn find(&self, id_or_name: &str, params: WorkspaceRetrievalParams) -> Result<WorkspaceDto> {
        match self.config.store.find(id_or_name, params.show_deleted).await {
            Ok(record) => self.to_dto(record).await,
            Err(OrchestratorError::NotFound(id)) => {
                if self.was_purged(&id).await? {
                    Err(OrchestratorError::Deleted(id))
                } else {
                    Err(OrchestratorError::NotFound(id))
                }
            }
            Err(e) => Err(e),
        }
    }

    /// A purged workspace leaves no row, only its `delete` jobs.
    async fn was_purged(&self, id: &str) -> Result<bool> {
        let filter = JobFilter::resource(id).action(JobAction::Delete);
        Ok(self.config.jobs.find_optional(&filter).await?.is_some())
    }

    pub async fn list(&self, params: WorkspaceRetrievalParams) -> Result<Vec<WorkspaceDto>> {
        let records = self.config.store.list(params.show_deleted).await?;
        let mut dtos = Vec::with_capacity(records.len());
        for record in records {
            dtos.push(self.to_dto(record).await?);
        }
        Ok(dtos)
    }

    async fn to_dto(&self, record: WorkspaceRecord) -> Result<WorkspaceDto> {
        let id = &record.workspace.id;
        let metadata = self.config.metadata_store.find(id).await?;
        let latest = self.config.jobs.find_optional(&JobFilter::resource(id.as_str())).await?;
        Ok(WorkspaceDto {
            state: WorkspaceState::from_job(latest.as_ref()),
            metadata,
            deleted: record.deleted,
            workspace: record.workspace,
        })
    }

    /// Replace the whole label map.
    #[instrument(skip(self, labels))]
    pub async fn update_labels(&self, id: &str, labels: HashMap<String, String>) -> Result<WorkspaceDto> {
        let record = self.config.store.find(id, false).await?;
        self.config
            .store
            .update_labels(&record.workspace.id, &labels)
            .await?;
        self.find(&record.workspace.id, WorkspaceRetrievalParams::default())
            .await
    }

    /// Record what the workspace agent reports. Only the metadata row is written.
    pub async fn update_metadata(&self, id: &str, metadata: WorkspaceMetadata) -> Result<WorkspaceMetadata> {
        let record = self.config.store.find(id, false).await?;
        self.config
            .metadata_store
            .save(&record.workspace.id, &metadata)
            .await
    }

    pub async fn start(&self, ctx: &RequestContext, id: &str) -> Result<()> {
        self.enqueue_lifecycle(ctx, id, JobAction::Start, "workspace_start")
            .await
    }

    pub async fn stop(&self, ctx: &RequestContext, id: &str) -> Result<()> {
        self.enqueue_lifecycle(ctx, id, JobAction::Stop, "workspace_stop")
            .await
    }

    pub async fn restart(&self, ctx: &RequestContext, id: &str) -> Result<()> {
        self.enqueue_lifecycle(ctx, id, JobAction::Restart, "workspace_restart")
            .await
    }

    #[instrument(skip(self, ctx))]
    async fn enqueue_lifecycle(
        &self,
        ctx: &RequestContext,
        id: &str,
        action: JobAction,
        event: &'static str,
    ) -> Result<()> {
        let record = self.config.store.find(id, false).await?;
        let result = self.enqueue(&record.workspace, action).await;
        let telemetry = TelemetryEvent::new(event, &record.workspace.id);
        match &result {
            Ok(()) => self.track(ctx, telemetry).await,
            Err(e) => self.track(ctx, telemetry.with_error(e)).await,
        }
        result
    }

    async fn enqueue(&self, workspace: &Workspace, action: JobAction) -> Result<()> {
        let runner_id = self.runner_for(workspace).await;
        self.config
            .scheduler
            .create_job(&workspace.id, ResourceType::Workspace, runner_id.as_deref(), action)
            .await
            .map_err(OrchestratorError::Scheduling)
    }

    /// Runner assigned to the workspace's target. Lookup failures leave the job unassigned.
    async fn runner_for(&self, workspace: &Workspace) -> Option<String> {
        match self.config.targets.find_target(&workspace.target_id).await {
            Ok(target) => target.and_then(|t| t.runner_id),
            Err(e) => {
                warn!("Failed to look up target {}: {}", workspace.target_id, e);
                None
            }
        }
    }

    /// Soft delete: revoke the API key, enqueue `delete`, then tombstone the row.
    ///
    /// A scheduling failure leaves the row active so the call can be retried.
    #[instrument(skip(self, ctx))]
    pub async fn delete(&self, ctx: &RequestContext, id: &str) -> Result<()> {
        let record = self.config.store.find(id, false).await?;
        let workspace = &record.workspace;

        revoke_api_key(self.config.api_keys.as_ref(), &workspace.id).await?;
        self.enqueue(workspace, JobAction::Delete).await?;
        self.config.store.mark_deleted(&workspace.id).await?;

        info!("Workspace {} marked deleted", workspace.id);
        self.track(ctx, TelemetryEvent::new("workspace_delete", &workspace.id))
            .await;
        Ok(())
    }

    /// Hard delete for cleanup: works on active and soft-deleted rows alike.
    #[instrument(skip(self, ctx))]
    pub async fn force_delete(&self, ctx: &RequestContext, id: &str) -> Result<()> {
        let record = self.config.store.find(id, true).await?;
        let workspace = &record.workspace;

        revoke_api_key(self.config.api_keys.as_ref(), &workspace.id).await?;
        self.enqueue(workspace, JobAction::Delete).await?;
        self.config.store.purge(&workspace.id).await?;
        self.config.metadata_store.delete(&workspace.id).await?;

        info!("Workspace {} purged", workspace.id);
        self.track(ctx, TelemetryEvent::new("workspace_force_delete", &workspace.id))
            .await;
        Ok(())
    }

    /// Resolve what the provisioning engine needs for `id`.
    ///
    /// A cached build stands in for the configured build: its image and user
    /// replace the workspace's and the build configuration is dropped.
    #[instrument(skip(self, builder_image))]
    pub async fn provisioning_params(&self, id: &str, builder_image: &str) -> Result<ProvisioningParams> {
        let record = self.config.store.find(id, true).await?;
        let mut workspace = record.workspace;

        let target = self
            .config
            .targets
            .find_target(&workspace.target_id)
            .await
            .map_err(|e| OrchestratorError::dependency("target", e))?
            .ok_or_else(|| OrchestratorError::TargetNotFound(workspace.target_id.clone()))?;

        let git_provider_config = match workspace.git_provider_config_id.as_deref() {
            Some(config_id) => self
                .config
                .git_providers
                .find_config(config_id)
                .await
                .map_err(|e| OrchestratorError::dependency("git provider config", e))?,
            None => None,
        };

        let cached_build = self
            .config
            .build_cache
            .find_cached_build(&workspace)
            .await
            .map_err(|e| OrchestratorError::dependency("cached build", e))?;
        if let Some(cached) = &cached_build {
            info!("Using cached build {} for workspace {}", cached.image, workspace.id);
            workspace.image = cached.image.clone();
            workspace.user = cached.user.clone();
            workspace.build_config = None;
        }

        let mut container_registries: Vec<ContainerRegistry> = Vec::new();
        for image in [workspace.image.as_str(), builder_image] {
            if let Some(registry) = self
                .config
                .registries
                .find_container_registry(image, &workspace.env_vars)
                .await
            {
                if !container_registries.contains(&registry) {
                    container_registries.push(registry);
                }
            }
        }

        Ok(ProvisioningParams {
            workspace,
            target,
            git_provider_config,
            container_registries,
            cached_build,
        })
    }

    async fn track(&self, ctx: &RequestContext, event: TelemetryEvent) {
        let name = event.name;
        if let Err(e) = self.config.telemetry.track(event, &ctx.client_id).await {
            warn!("Failed to track telemetry event {}: {}", name, e);
        }
    }
}

/// Revoke a workspace key; one that is already gone counts as revoked.
async fn revoke_api_key(api_keys: &dyn ApiKeyService, id: &str) -> Result<()> {
    match api_keys.delete_api_key(id).await {
        Ok(()) => Ok(()),
        Err(ApiKeyError::NotFound(_)) => {
            warn!("API key for workspace {} was already revoked", id);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
