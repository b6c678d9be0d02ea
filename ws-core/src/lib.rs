pub mod command_stream;
pub mod error;
pub mod exec;
pub mod log_writer;
pub mod models;
pub mod validation;

pub use error::{Result, WsError};
pub use exec::{
    redact_credentials, shell_quote, ExecOutput, Executor, LocalExecutor, SshExecutor, SshTarget,
};
pub use log_writer::LogWriter;
pub use models::{
    BuildConfig, CachedBuild, ContainerRegistry, DevcontainerBuild, DockerfileBuild,
    GitProviderConfig, GitRepository, RemoteOptions, Target, Workspace,
};

// Re-exported so downstream crates share one cancellation type.
pub use tokio_util::sync::CancellationToken;
