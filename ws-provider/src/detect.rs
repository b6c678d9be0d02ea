//! Builder type detection against a cloned repository.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;
use ws_core::{BuildConfig, Executor};

use crate::error::{at_stage, ProvisionError};
use crate::state::ProvisionStage;

const DEVCONTAINER_DESCRIPTORS: [&str; 2] = [".devcontainer/devcontainer.json", ".devcontainer.json"];
const DEFAULT_DOCKERFILE: &str = "Dockerfile";

/// How the workspace runtime is produced. Computed per run, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderType {
    Devcontainer,
    Image,
    Dockerfile,
}

impl fmt::Display for BuilderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Devcontainer => "devcontainer",
            Self::Image => "image",
            Self::Dockerfile => "dockerfile",
        })
    }
}

/// Detected builder plus the descriptor it came from, relative to the repository root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub builder_type: BuilderType,
    pub descriptor: Option<PathBuf>,
}

impl Detection {
    fn new(builder_type: BuilderType, descriptor: Option<PathBuf>) -> Self {
        Self {
            builder_type,
            descriptor,
        }
    }
}

/// Decide how to build the workspace in `workspace_dir`.
///
/// Explicit configuration wins: a configured devcontainer file, then a
/// configured Dockerfile, then a configured image. Otherwise the tree is
/// checked for a devcontainer descriptor and then a top-level `Dockerfile`.
pub async fn detect_builder_type(
    config: &BuildConfig,
    workspace_dir: &Path,
    executor: &dyn Executor,
) -> Result<Detection, ProvisionError> {
    let exists = |relative: PathBuf| async move {
        executor
            .path_exists(&workspace_dir.join(&relative))
            .await
            .map(|found| found.then_some(relative))
            .map_err(at_stage(ProvisionStage::BuilderDetecting))
    };

    if let Some(devcontainer) = &config.devcontainer {
        if let Some(path) = exists(PathBuf::from(&devcontainer.file_path)).await? {
            return Ok(Detection::new(BuilderType::Devcontainer, Some(path)));
        }
        debug!("Configured devcontainer file {} not found", devcontainer.file_path);
    }
    if let Some(dockerfile) = &config.dockerfile {
        if let Some(path) = exists(PathBuf::from(&dockerfile.file_path)).await? {
            return Ok(Detection::new(BuilderType::Dockerfile, Some(path)));
        }
        debug!("Configured Dockerfile {} not found", dockerfile.file_path);
    }
    if config.image.is_some() {
        return Ok(Detection::new(BuilderType::Image, None));
    }

    for descriptor in DEVCONTAINER_DESCRIPTORS {
        if let Some(path) = exists(PathBuf::from(descriptor)).await? {
            return Ok(Detection::new(BuilderType::Devcontainer, Some(path)));
        }
    }
    if let Some(path) = exists(PathBuf::from(DEFAULT_DOCKERFILE)).await? {
        return Ok(Detection::new(BuilderType::Dockerfile, Some(path)));
    }

    Err(ProvisionError::UnknownBuilderType(
        workspace_dir.display().to_string(),
    ))
}
