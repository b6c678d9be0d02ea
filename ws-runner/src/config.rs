use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use ws_core::{ContainerRegistry, GitProviderConfig, Target};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_runner_id")]
    pub runner_id: String,

    /// How long a running job may go without a heartbeat before it is failed.
    #[serde(default = "default_job_lease")]
    pub job_lease_secs: u64,

    /// How long shutdown waits for in-flight jobs to record their outcome.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Workspaces live under `<workspaces_dir>/<target id>/<workspace name>`.
    #[serde(default = "default_workspaces_dir")]
    pub workspaces_dir: PathBuf,

    /// Per-workspace provisioning logs.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Image the repository is cloned with.
    #[serde(default = "default_builder_image")]
    pub builder_image: String,

    #[serde(default = "default_server_api_url")]
    pub server_api_url: String,

    #[serde(default = "default_server_url")]
    pub server_url: String,

    #[serde(default = "default_workspace_image")]
    pub default_workspace_image: String,

    #[serde(default = "default_workspace_user")]
    pub default_workspace_user: String,

    #[serde(default)]
    pub targets: Vec<Target>,

    #[serde(default)]
    pub container_registries: Vec<ContainerRegistry>,

    #[serde(default)]
    pub git_providers: Vec<GitProviderConfig>,
}

fn state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ws")
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn default_db_path() -> PathBuf {
    match std::env::var("WS_RUNNER_DB_PATH") {
        Ok(path) => PathBuf::from(path),
        Err(_) => state_dir().join("ws.db"),
    }
}

fn default_poll_interval() -> u64 {
    std::env::var("WS_RUNNER_POLL_INTERVAL")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5) // 5 seconds
}

fn default_job_lease() -> u64 {
    std::env::var("WS_RUNNER_JOB_LEASE")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(600) // 10 minutes
}

fn default_shutdown_grace() -> u64 {
    std::env::var("WS_RUNNER_SHUTDOWN_GRACE")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(30)
}

fn default_runner_id() -> String {
    env_or("WS_RUNNER_ID", "local")
}

fn default_workspaces_dir() -> PathBuf {
    match std::env::var("WS_RUNNER_WORKSPACES_DIR") {
        Ok(path) => PathBuf::from(path),
        Err(_) => state_dir().join("workspaces"),
    }
}

fn default_log_dir() -> PathBuf {
    match std::env::var("WS_RUNNER_LOG_DIR") {
        Ok(path) => PathBuf::from(path),
        Err(_) => state_dir().join("logs"),
    }
}

fn default_builder_image() -> String {
    env_or("WS_RUNNER_BUILDER_IMAGE", "alpine/git:latest")
}

fn default_server_api_url() -> String {
    env_or("WS_SERVER_API_URL", "http://localhost:3986")
}

fn default_server_url() -> String {
    env_or("WS_SERVER_URL", "http://localhost:3987")
}

fn default_workspace_image() -> String {
    env_or("WS_DEFAULT_WORKSPACE_IMAGE", "mcr.microsoft.com/devcontainers/base:ubuntu")
}

fn default_workspace_user() -> String {
    env_or("WS_DEFAULT_WORKSPACE_USER", "ws")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            poll_interval_secs: default_poll_interval(),
            runner_id: default_runner_id(),
            job_lease_secs: default_job_lease(),
            shutdown_grace_secs: default_shutdown_grace(),
            workspaces_dir: default_workspaces_dir(),
            log_dir: default_log_dir(),
            builder_image: default_builder_image(),
            server_api_url: default_server_api_url(),
            server_url: default_server_url(),
            default_workspace_image: default_workspace_image(),
            default_workspace_user: default_workspace_user(),
            targets: Vec::new(),
            container_registries: Vec::new(),
            git_providers: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Read a YAML config file. Fields it leaves out fall back to the environment.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        let mut config: Config = serde_yaml_ng::from_str(raw)?;
        config.db_path = expand(&config.db_path);
        config.workspaces_dir = expand(&config.workspaces_dir);
        config.log_dir = expand(&config.log_dir);
        Ok(config)
    }

    pub fn target_dir(&self, target_id: &str) -> PathBuf {
        self.workspaces_dir.join(target_id)
    }
}

fn expand(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_yaml() {
        let raw = r#"
db_path: /var/lib/ws/ws.db
runner_id: runner-a
job_lease_secs: 120
workspaces_dir: ~/ws-data
builder_image: ghcr.io/acme/builder:1
targets:
  - id: t1
    name: local
    provider_name: docker
  - id: t2
    name: build-box
    provider_name: docker
    options: '{"remote_host": "build-1", "remote_user": "dev"}'
container_registries:
  - server: ghcr.io
    username: bot
    password: secret
"#;

        let config = Config::from_yaml(raw).unwrap();

        assert_eq!(config.db_path, PathBuf::from("/var/lib/ws/ws.db"));
        assert_eq!(config.runner_id, "runner-a");
        assert_eq!(config.job_lease_secs, 120);
        assert!(!config.workspaces_dir.to_string_lossy().starts_with('~'));
        assert_eq!(config.builder_image, "ghcr.io/acme/builder:1");
        assert_eq!(config.targets.len(), 2);
        assert!(config.targets[1].is_remote());
        assert_eq!(config.container_registries[0].server, "ghcr.io");
        assert_eq!(config.target_dir("t1"), config.workspaces_dir.join("t1"));
    }

    #[test]
    fn test_load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();

        let err = Config::load(&dir.path().join("missing.yaml")).unwrap_err();

        assert!(err.to_string().contains("missing.yaml"));
    }
}
