//! The container runtime seam the engine drives.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use ws_core::{CancellationToken, ContainerRegistry, ExecOutput, LogWriter, Result, WsError};

/// A bind mount from the target filesystem into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: String,
}

/// Everything needed to create (not start) a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<BindMount>,
    pub entrypoint: Option<String>,
    pub cmd: Vec<String>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
}

/// A shell command to run inside an existing container.
#[derive(Debug, Clone, Default)]
pub struct ContainerExec<'a> {
    pub user: Option<&'a str>,
    pub env: BTreeMap<String, String>,
    pub command: String,
    pub stdin: Option<&'a [u8]>,
}

impl<'a> ContainerExec<'a> {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn user(mut self, user: &'a str) -> Self {
        self.user = Some(user);
        self
    }

    pub fn stdin(mut self, input: &'a [u8]) -> Self {
        self.stdin = Some(input);
        self
    }
}

/// Parameters for building an image from a Dockerfile on the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBuild {
    pub dockerfile: PathBuf,
    pub context: PathBuf,
    pub tag: String,
}

/// Parameters for `devcontainer up`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevcontainerUp {
    pub workspace_folder: PathBuf,
    pub config: Option<PathBuf>,
    pub id_labels: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Error, Debug)]
pub enum LogStreamError {
    /// The container cannot be followed yet; worth retrying.
    #[error("log stream not ready: {0}")]
    NotReady(String),

    #[error("log stream failed: {0}")]
    Failed(#[source] WsError),
}

/// Container operations needed to provision and run a workspace.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + fmt::Debug {
    /// Pull `image`, authenticating against `registry` first when given.
    async fn pull_image(
        &self,
        image: &str,
        registry: Option<&ContainerRegistry>,
        log: &LogWriter,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Create a container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    async fn stop_container(&self, id: &str) -> Result<()>;

    /// Force-remove a container, running or not.
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Run a command in a container and capture its output.
    async fn exec_capture(&self, id: &str, exec: &ContainerExec<'_>) -> Result<ExecOutput>;

    /// Run a command in a container streaming its output to `log`; returns the exit code.
    async fn exec_streaming(
        &self,
        id: &str,
        exec: &ContainerExec<'_>,
        log: &LogWriter,
        cancel: &CancellationToken,
    ) -> Result<i32>;

    /// Follow a container's output until it exits or `stop` fires.
    async fn stream_logs(
        &self,
        id: &str,
        log: &LogWriter,
        stop: &CancellationToken,
    ) -> std::result::Result<(), LogStreamError>;

    async fn build_image(
        &self,
        build: &ImageBuild,
        log: &LogWriter,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Bring up a devcontainer and return the id of its container.
    async fn devcontainer_up(
        &self,
        up: &DevcontainerUp,
        log: &LogWriter,
        cancel: &CancellationToken,
    ) -> Result<String>;

    /// Id of a container (running or not) carrying `key=value`.
    async fn find_container_by_label(&self, key: &str, value: &str) -> Result<Option<String>>;
}
