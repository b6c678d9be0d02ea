#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::SqlitePool;
use ws_core::{CachedBuild, ContainerRegistry, GitProviderConfig, GitRepository, Target, Workspace};
use ws_orchestrator::test_utils::create_test_db;
use ws_orchestrator::{
    ApiKeyError, ApiKeyService, BuildCache, ContainerRegistryResolver, CreateWorkspaceDto,
    GitProviderResolver, JobAction, JobScheduler, JobStore, ResourceType, TargetResolver,
    TelemetryEvent, TelemetrySink, WorkspaceMetadataStore, WorkspaceService,
    WorkspaceServiceConfig, WorkspaceStore,
};

pub const SERVER_API_URL: &str = "http://localhost:3986";
pub const SERVER_URL: &str = "http://localhost:3987";
pub const SERVER_VERSION: &str = "0.0.0-test";
pub const DEFAULT_IMAGE: &str = "ghcr.io/acme/workspace:latest";
pub const DEFAULT_USER: &str = "ws";

pub struct StaticTargets(pub Vec<Target>);

#[async_trait]
impl TargetResolver for StaticTargets {
    async fn find_target(&self, target_id: &str) -> anyhow::Result<Option<Target>> {
        Ok(self.0.iter().find(|t| t.id == target_id).cloned())
    }
}

pub struct StaticRegistries(pub Vec<ContainerRegistry>);

#[async_trait]
impl ContainerRegistryResolver for StaticRegistries {
    async fn find_container_registry(
        &self,
        image: &str,
        _env_vars: &HashMap<String, String>,
    ) -> Option<ContainerRegistry> {
        ContainerRegistry::for_image(&self.0, image).cloned()
    }
}

#[derive(Default)]
pub struct FakeBuildCache(pub Mutex<Option<CachedBuild>>);

#[async_trait]
impl BuildCache for FakeBuildCache {
    async fn find_cached_build(&self, _workspace: &Workspace) -> anyhow::Result<Option<CachedBuild>> {
        Ok(self.0.lock().unwrap().clone())
    }
}

/// Issues `key-<name>` tokens and remembers which are live.
#[derive(Default)]
pub struct FakeApiKeys {
    pub live: Mutex<HashMap<String, String>>,
    pub broken_delete: AtomicBool,
}

impl FakeApiKeys {
    pub fn is_live(&self, name: &str) -> bool {
        self.live.lock().unwrap().contains_key(name)
    }
}

#[async_trait]
impl ApiKeyService for FakeApiKeys {
    async fn create_api_key(&self, name: &str) -> Result<String, ApiKeyError> {
        let token = format!("key-{}", name);
        self.live
            .lock()
            .unwrap()
            .insert(name.to_string(), token.clone());
        Ok(token)
    }

    async fn delete_api_key(&self, name: &str) -> Result<(), ApiKeyError> {
        if self.broken_delete.load(Ordering::SeqCst) {
            return Err(ApiKeyError::Other(anyhow::anyhow!("key service unavailable")));
        }
        match self.live.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(ApiKeyError::NotFound(name.to_string())),
        }
    }
}

#[derive(Default)]
pub struct FakeGitProviders {
    pub configs: Vec<GitProviderConfig>,
    pub sha_lookups: AtomicUsize,
}

#[async_trait]
impl GitProviderResolver for FakeGitProviders {
    async fn list_configs_for_url(&self, url: &str) -> anyhow::Result<Vec<GitProviderConfig>> {
        Ok(self
            .configs
            .iter()
            .filter(|c| {
                c.base_api_url
                    .as_deref()
                    .is_some_and(|base| url.contains(base.trim_start_matches("https://api.")))
            })
            .cloned()
            .collect())
    }

    async fn find_config(&self, id: &str) -> anyhow::Result<Option<GitProviderConfig>> {
        Ok(self.configs.iter().find(|c| c.id == id).cloned())
    }

    async fn last_commit_sha(
        &self,
        _repository: &GitRepository,
        _config: Option<&GitProviderConfig>,
    ) -> anyhow::Result<String> {
        self.sha_lookups.fetch_add(1, Ordering::SeqCst);
        Ok("0f3c2a1".to_string())
    }
}

/// Delegates to the ledger unless told to fail.
pub struct ToggleScheduler {
    pub jobs: JobStore,
    pub broken: AtomicBool,
}

#[async_trait]
impl JobScheduler for ToggleScheduler {
    async fn create_job(
        &self,
        resource_id: &str,
        resource_type: ResourceType,
        runner_id: Option<&str>,
        action: JobAction,
    ) -> anyhow::Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            anyhow::bail!("job queue unavailable");
        }
        self.jobs
            .create_job(resource_id, resource_type, runner_id, action)
            .await
    }
}

/// Records events, then reports failure for every one of them.
#[derive(Default)]
pub struct FlakyTelemetry {
    pub events: Mutex<Vec<(TelemetryEvent, String)>>,
}

#[async_trait]
impl TelemetrySink for FlakyTelemetry {
    async fn track(&self, event: TelemetryEvent, client_id: &str) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap()
            .push((event, client_id.to_string()));
        anyhow::bail!("telemetry endpoint unreachable")
    }
}

pub struct Harness {
    pub pool: SqlitePool,
    pub service: WorkspaceService,
    pub store: WorkspaceStore,
    pub jobs: JobStore,
    pub api_keys: Arc<FakeApiKeys>,
    pub git_providers: Arc<FakeGitProviders>,
    pub scheduler: Arc<ToggleScheduler>,
    pub telemetry: Arc<FlakyTelemetry>,
    pub build_cache: Arc<FakeBuildCache>,
}

pub fn github_config() -> GitProviderConfig {
    GitProviderConfig {
        id: "github".into(),
        provider_id: "github".into(),
        alias: "test-alias".into(),
        username: "test-username".into(),
        token: "test-token".into(),
        base_api_url: Some("https://api.github.com".into()),
    }
}

pub fn target() -> Target {
    Target {
        id: "t1".into(),
        name: "local".into(),
        provider_name: "docker".into(),
        provider_version: "0.1.0".into(),
        runner_id: Some("runner-a".into()),
        options: "{}".into(),
    }
}

pub async fn harness() -> Harness {
    let pool = create_test_db().await;
    let store = WorkspaceStore::new(pool.clone());
    let jobs = JobStore::new(pool.clone());
    let api_keys = Arc::new(FakeApiKeys::default());
    let git_providers = Arc::new(FakeGitProviders {
        configs: vec![github_config()],
        ..Default::default()
    });
    let scheduler = Arc::new(ToggleScheduler {
        jobs: jobs.clone(),
        broken: AtomicBool::new(false),
    });
    let telemetry = Arc::new(FlakyTelemetry::default());
    let build_cache = Arc::new(FakeBuildCache::default());

    let service = WorkspaceService::new(WorkspaceServiceConfig {
        store: store.clone(),
        metadata_store: WorkspaceMetadataStore::new(pool.clone()),
        jobs: jobs.clone(),
        scheduler: scheduler.clone(),
        targets: Arc::new(StaticTargets(vec![target()])),
        registries: Arc::new(StaticRegistries(vec![ContainerRegistry {
            server: "ghcr.io".into(),
            username: "bot".into(),
            password: "secret".into(),
        }])),
        build_cache: build_cache.clone(),
        api_keys: api_keys.clone(),
        git_providers: git_providers.clone(),
        telemetry: telemetry.clone(),
        server_api_url: SERVER_API_URL.into(),
        server_url: SERVER_URL.into(),
        server_version: SERVER_VERSION.into(),
        default_workspace_image: DEFAULT_IMAGE.into(),
        default_workspace_user: DEFAULT_USER.into(),
    });

    Harness {
        pool,
        service,
        store,
        jobs,
        api_keys,
        git_providers,
        scheduler,
        telemetry,
        build_cache,
    }
}

pub fn create_dto(name: &str) -> CreateWorkspaceDto {
    CreateWorkspaceDto {
        name: name.to_string(),
        repository: GitRepository {
            id: "repo-1".into(),
            url: "https://github.com/acme/widget".into(),
            name: "widget".into(),
            owner: "acme".into(),
            branch: Some("main".into()),
            ..Default::default()
        },
        target_id: "t1".into(),
        ..Default::default()
    }
}
