//! Domain types shared by the orchestrator, the provisioning engine and runners.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WsError};
use crate::exec::SshTarget;

const DEFAULT_REGISTRY: &str = "docker.io";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitRepository {
    pub id: String,
    pub url: String,
    pub name: String,
    pub owner: String,
    #[serde(default)]
    pub branch: Option<String>,
    /// Commit to check out. Unset means "latest on branch", resolved at creation.
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub path: Option<String>,
}

impl GitRepository {
    pub fn is_pinned(&self) -> bool {
        self.sha.as_deref().is_some_and(|sha| !sha.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevcontainerBuild {
    pub file_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerfileBuild {
    pub file_path: String,
    #[serde(default)]
    pub context: Option<String>,
}

/// How a workspace image is produced from its repository.
///
/// Every field unset means the builder is detected from the cloned tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devcontainer: Option<DevcontainerBuild>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<DockerfileBuild>,
    /// Prebuilt image to run once the repository is cloned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub image: String,
    pub user: String,
    pub repository: GitRepository,
    pub target_id: String,
    #[serde(default)]
    pub build_config: Option<BuildConfig>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub git_provider_config_id: Option<String>,
}

impl Workspace {
    /// Directory name the repository is cloned into.
    pub fn folder_name(&self) -> &str {
        &self.name
    }

    /// Name of the long-lived container backing the workspace.
    pub fn container_name(&self) -> String {
        format!("ws-{}", self.id)
    }
}

/// A provisioning destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub name: String,
    pub provider_name: String,
    #[serde(default)]
    pub provider_version: String,
    /// Runner that executes jobs for this target. Unset lets any runner claim them.
    #[serde(default)]
    pub runner_id: Option<String>,
    /// Provider specific options, stored as JSON text.
    #[serde(default)]
    pub options: String,
}

/// Remote shell settings carried in a target's options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteOptions {
    pub remote_host: String,
    #[serde(default)]
    pub remote_user: Option<String>,
    #[serde(default)]
    pub remote_port: Option<u16>,
    #[serde(default)]
    pub remote_identity_file: Option<PathBuf>,
}

impl RemoteOptions {
    pub fn ssh_target(&self) -> SshTarget {
        SshTarget {
            host: self.remote_host.clone(),
            user: self.remote_user.clone(),
            port: self.remote_port,
            identity_file: self.remote_identity_file.clone(),
        }
    }
}

impl Target {
    /// Remote shell settings, or `None` for a target on the local machine.
    pub fn remote_options(&self) -> Result<Option<RemoteOptions>> {
        if self.options.trim().is_empty() {
            return Ok(None);
        }
        let value: serde_json::Value = serde_json::from_str(&self.options)?;
        let has_host = value
            .get("remote_host")
            .and_then(|h| h.as_str())
            .is_some_and(|h| !h.is_empty());
        if !has_host {
            return Ok(None);
        }
        let remote: RemoteOptions = serde_json::from_value(value).map_err(|e| {
            WsError::Parse(format!("Invalid remote options for target {}: {}", self.id, e))
        })?;
        Ok(Some(remote))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.remote_options(), Ok(Some(_)))
    }
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRegistry {
    pub server: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for ContainerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerRegistry")
            .field("server", &self.server)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl ContainerRegistry {
    /// Pick the registry serving `image` out of `registries`.
    pub fn for_image<'a>(
        registries: &'a [ContainerRegistry],
        image: &str,
    ) -> Option<&'a ContainerRegistry> {
        let server = registry_server(image);
        registries
            .iter()
            .find(|r| normalize_server(&r.server) == server)
    }
}

/// Registry host an image reference is pulled from.
pub fn registry_server(image: &str) -> &str {
    match image.split_once('/') {
        Some((first, _)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            first
        }
        _ => DEFAULT_REGISTRY,
    }
}

fn normalize_server(server: &str) -> &str {
    let server = server
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    match server {
        "index.docker.io" | "registry-1.docker.io" => DEFAULT_REGISTRY,
        other => other,
    }
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitProviderConfig {
    pub id: String,
    pub provider_id: String,
    #[serde(default)]
    pub alias: String,
    pub username: String,
    pub token: String,
    #[serde(default)]
    pub base_api_url: Option<String>,
}

impl std::fmt::Debug for GitProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitProviderConfig")
            .field("id", &self.id)
            .field("provider_id", &self.provider_id)
            .field("alias", &self.alias)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// A previously built image that can stand in for a workspace build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedBuild {
    pub image: String,
    pub user: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_server() {
        assert_eq!(registry_server("ubuntu:22.04"), "docker.io");
        assert_eq!(registry_server("library/ubuntu"), "docker.io");
        assert_eq!(registry_server("ghcr.io/acme/dev:1"), "ghcr.io");
        assert_eq!(registry_server("localhost:5000/img"), "localhost:5000");
    }

    #[test]
    fn test_registry_for_image() {
        let registries = vec![
            ContainerRegistry {
                server: "https://index.docker.io/".into(),
                username: "hub".into(),
                password: "x".into(),
            },
            ContainerRegistry {
                server: "ghcr.io".into(),
                username: "gh".into(),
                password: "y".into(),
            },
        ];

        let hub = ContainerRegistry::for_image(&registries, "node:20").unwrap();
        assert_eq!(hub.username, "hub");
        let gh = ContainerRegistry::for_image(&registries, "ghcr.io/acme/dev").unwrap();
        assert_eq!(gh.username, "gh");
        assert!(ContainerRegistry::for_image(&registries, "quay.io/x/y").is_none());
    }

    #[test]
    fn test_target_remote_options() {
        let local = Target {
            id: "t1".into(),
            options: "{}".into(),
            ..Default::default()
        };
        assert!(local.remote_options().unwrap().is_none());
        assert!(!local.is_remote());

        let remote = Target {
            id: "t2".into(),
            options: r#"{"remote_host":"build-1","remote_user":"dev","remote_port":2222}"#.into(),
            ..Default::default()
        };
        let opts = remote.remote_options().unwrap().unwrap();
        assert_eq!(opts.ssh_target().destination(), "dev@build-1");
        assert_eq!(opts.remote_port, Some(2222));
    }

    #[test]
    fn test_target_invalid_options() {
        let target = Target {
            id: "t3".into(),
            options: "not json".into(),
            ..Default::default()
        };
        assert!(target.remote_options().is_err());
    }

    #[test]
    fn test_secrets_hidden_from_debug() {
        let gpc = GitProviderConfig {
            token: "s3cret".into(),
            ..Default::default()
        };
        assert!(!format!("{:?}", gpc).contains("s3cret"));
    }
}
