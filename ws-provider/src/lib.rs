//! Container provisioning engine.
//!
//! Turns a fully resolved workspace into a running container: pulls the
//! builder image, clones the repository in a disposable container, reconciles
//! the clone user's UID/GID with the host, detects how the workspace image is
//! built and hands off to the devcontainer or image path. The engine never
//! resolves targets, registries or credentials itself, and never branches on
//! whether commands run locally or over a remote shell.

pub mod clone;
pub mod detect;
pub mod docker;
pub mod engine;
pub mod error;
pub mod log_stream;
pub mod puller;
pub mod runtime;
pub mod state;
pub mod uid_gid;

#[cfg(any(test, feature = "test-helpers"))]
pub mod mock;


pub use detect::{BuilderType, Detection};
pub use docker::DockerCli;
pub use engine::{CreateWorkspaceOptions, ProvisionOutcome, WorkspaceProvisioner};
pub use error::{ProvisionError, ProvisionResult};
pub use runtime::{ContainerExec, ContainerRuntime, ContainerSpec, LogStreamError};
pub use state::{ProvisionStage, ProvisionState};

/// Label carrying the target id on every container the engine creates.
pub const TARGET_ID_LABEL: &str = "ws.target.id";
/// Label carrying the workspace id on every container the engine creates.
pub const WORKSPACE_ID_LABEL: &str = "ws.workspace.id";
