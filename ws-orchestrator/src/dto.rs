use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use ws_core::{BuildConfig, CachedBuild, ContainerRegistry, GitProviderConfig, GitRepository, Target, Workspace};

use crate::job::{Job, JobAction, JobState};
use crate::store::WorkspaceMetadata;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateWorkspaceDto {
    /// Generated when unset.
    #[serde(default)]
    pub id: Option<String>,
    /// Derived from the repository URL when empty.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub build_config: Option<BuildConfig>,
    pub repository: GitRepository,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub target_id: String,
    #[serde(default)]
    pub git_provider_config_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkspaceRetrievalParams {
    pub show_deleted: bool,
}

/// Lifecycle state read off the latest job of a workspace. Never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum WorkspaceState {
    PendingCreate,
    Creating,
    Starting,
    Started,
    Stopping,
    Stopped,
    Deleting,
    Error { message: String },
    Unknown,
}

impl WorkspaceState {
    pub fn from_job(job: Option<&Job>) -> Self {
        let Some(job) = job else {
            return Self::Unknown;
        };
        if job.state == JobState::Error {
            return Self::Error {
                message: job.error.clone().unwrap_or_default(),
            };
        }

        let done = job.state == JobState::Success;
        match (job.action, job.state) {
            (JobAction::Create, JobState::Pending) => Self::PendingCreate,
            (JobAction::Create, _) if !done => Self::Creating,
            (JobAction::Create | JobAction::Start | JobAction::Restart, _) if done => Self::Started,
            (JobAction::Start | JobAction::Restart, _) => Self::Starting,
            (JobAction::Stop, _) if done => Self::Stopped,
            (JobAction::Stop, _) => Self::Stopping,
            (JobAction::Delete, _) if !done => Self::Deleting,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceDto {
    #[serde(flatten)]
    pub workspace: Workspace,
    pub metadata: Option<WorkspaceMetadata>,
    pub state: WorkspaceState,
    pub deleted: bool,
}

/// Everything a runner needs to hand a workspace to the provisioning engine.
#[derive(Debug, Clone)]
pub struct ProvisioningParams {
    /// The workspace with any cached build already applied.
    pub workspace: Workspace,
    pub target: Target,
    pub git_provider_config: Option<GitProviderConfig>,
    pub container_registries: Vec<ContainerRegistry>,
    pub cached_build: Option<CachedBuild>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ResourceType;

    fn job(action: JobAction, state: JobState) -> Job {
        let mut job = Job::new("w1", ResourceType::Workspace, action, None);
        job.state = state;
        job
    }

    #[test]
    fn test_state_from_latest_job() {
        use JobAction::*;
        use JobState::*;

        assert_eq!(WorkspaceState::from_job(None), WorkspaceState::Unknown);
        assert_eq!(
            WorkspaceState::from_job(Some(&job(Create, Pending))),
            WorkspaceState::PendingCreate
        );
        assert_eq!(
            WorkspaceState::from_job(Some(&job(Create, Running))),
            WorkspaceState::Creating
        );
        assert_eq!(
            WorkspaceState::from_job(Some(&job(Create, Success))),
            WorkspaceState::Started
        );
        assert_eq!(
            WorkspaceState::from_job(Some(&job(Restart, Running))),
            WorkspaceState::Starting
        );
        assert_eq!(
            WorkspaceState::from_job(Some(&job(Stop, Pending))),
            WorkspaceState::Stopping
        );
        assert_eq!(
            WorkspaceState::from_job(Some(&job(Stop, Success))),
            WorkspaceState::Stopped
        );
        assert_eq!(
            WorkspaceState::from_job(Some(&job(Delete, Running))),
            WorkspaceState::Deleting
        );
    }

    #[test]
    fn test_error_state_carries_message() {
        let mut failed = job(JobAction::Start, JobState::Error);
        failed.error = Some("provisioning failed during cloning".into());

        assert_eq!(
            WorkspaceState::from_job(Some(&failed)),
            WorkspaceState::Error {
                message: "provisioning failed during cloning".into()
            }
        );
    }
}
