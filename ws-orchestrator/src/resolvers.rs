//! Seams to the systems the workspace service consults but does not own.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use ws_core::{CachedBuild, ContainerRegistry, GitProviderConfig, GitRepository, Target, Workspace};

use crate::error::ApiKeyError;

#[async_trait]
pub trait TargetResolver: Send + Sync {
    /// `Ok(None)` when no target has this id.
    async fn find_target(&self, target_id: &str) -> anyhow::Result<Option<Target>>;
}

#[async_trait]
pub trait ContainerRegistryResolver: Send + Sync {
    /// Best match for `image`, if any registry serves it.
    async fn find_container_registry(
        &self,
        image: &str,
        env_vars: &HashMap<String, String>,
    ) -> Option<ContainerRegistry>;
}

#[async_trait]
pub trait BuildCache: Send + Sync {
    async fn find_cached_build(&self, workspace: &Workspace) -> anyhow::Result<Option<CachedBuild>>;
}

#[async_trait]
pub trait ApiKeyService: Send + Sync {
    /// Issue a key named `name` and return its token.
    async fn create_api_key(&self, name: &str) -> Result<String, ApiKeyError>;

    async fn delete_api_key(&self, name: &str) -> Result<(), ApiKeyError>;
}

#[async_trait]
pub trait GitProviderResolver: Send + Sync {
    /// Configs able to serve `url`, best match first.
    async fn list_configs_for_url(&self, url: &str) -> anyhow::Result<Vec<GitProviderConfig>>;

    async fn find_config(&self, id: &str) -> anyhow::Result<Option<GitProviderConfig>>;

    async fn last_commit_sha(
        &self,
        repository: &GitRepository,
        config: Option<&GitProviderConfig>,
    ) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryEvent {
    pub name: &'static str,
    pub workspace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TelemetryEvent {
    pub fn new(name: &'static str, workspace_id: impl Into<String>) -> Self {
        Self {
            name,
            workspace_id: workspace_id.into(),
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Fire-and-forget event sink. Errors are logged by the caller and dropped.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn track(&self, event: TelemetryEvent, client_id: &str) -> anyhow::Result<()>;
}

/// Sink used when telemetry is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

#[async_trait]
impl TelemetrySink for NoopTelemetry {
    async fn track(&self, _event: TelemetryEvent, _client_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Caller identity carried into every service call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub client_id: String,
}

impl RequestContext {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
        }
    }
}
