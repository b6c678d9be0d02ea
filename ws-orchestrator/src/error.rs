use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Invalid workspace name: {0}")]
    InvalidName(String),

    #[error("Workspace not found: {0}")]
    NotFound(String),

    #[error("Workspace deleted: {0}")]
    Deleted(String),

    #[error("Workspace already exists: {0}")]
    AlreadyExists(String),

    #[error("Target not found: {0}")]
    TargetNotFound(String),

    #[error("Failed to resolve {dependency}: {source}")]
    DependencyResolution {
        dependency: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid job state transition for {job_id}: {from} -> {to}")]
    InvalidStateTransition {
        job_id: String,
        from: String,
        to: String,
    },

    #[error("Failed to schedule job: {0}")]
    Scheduling(#[source] anyhow::Error),

    #[error("API key error: {0}")]
    ApiKey(#[from] ApiKeyError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    pub(crate) fn dependency(dependency: &'static str, source: anyhow::Error) -> Self {
        Self::DependencyResolution { dependency, source }
    }
}

/// Failure reported by an [`ApiKeyService`](crate::ApiKeyService).
#[derive(Error, Debug)]
pub enum ApiKeyError {
    /// The key does not exist, e.g. it was already revoked.
    #[error("API key not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
