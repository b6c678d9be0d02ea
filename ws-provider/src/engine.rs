//! The provisioning engine.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};
use ws_core::{
    shell_quote, BuildConfig, CancellationToken, ContainerRegistry, Executor, GitProviderConfig,
    LogWriter, Workspace, WsError,
};

use crate::clone::{clone_command, clone_container_name, CLONE_MOUNT};
use crate::detect::{detect_builder_type, BuilderType, Detection};
use crate::error::{at_stage, ProvisionError, ProvisionResult};
use crate::log_stream::{LogTail, RetryPolicy};
use crate::puller::ImagePuller;
use crate::runtime::{BindMount, ContainerExec, ContainerRuntime, ContainerSpec, DevcontainerUp, ImageBuild};
use crate::state::{ProvisionStage, StageTracker};
use crate::uid_gid::{clone_user_for, reconcile, UidGidOutcome};
use crate::{TARGET_ID_LABEL, WORKSPACE_ID_LABEL};

/// Where the repository appears inside the workspace container.
pub const WORKSPACES_MOUNT: &str = "/workspaces";

/// Fully resolved inputs for one provisioning run.
#[derive(Clone)]
pub struct CreateWorkspaceOptions {
    pub workspace: Workspace,
    /// Directory on the target the repository is cloned into.
    pub workspace_dir: PathBuf,
    pub builder_image: String,
    pub container_registries: Vec<ContainerRegistry>,
    pub git_provider_config: Option<GitProviderConfig>,
    pub log_writer: LogWriter,
    pub executor: Arc<dyn Executor>,
    /// Injected on top of the workspace's own variables.
    pub env_vars: HashMap<String, String>,
}

impl fmt::Debug for CreateWorkspaceOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateWorkspaceOptions")
            .field("workspace_id", &self.workspace.id)
            .field("workspace_dir", &self.workspace_dir)
            .field("builder_image", &self.builder_image)
            .field("executor", &self.executor.describe())
            .finish_non_exhaustive()
    }
}

impl CreateWorkspaceOptions {
    fn container_env(&self) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = self
            .workspace
            .env_vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.extend(self.env_vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    fn id_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(TARGET_ID_LABEL.to_string(), self.workspace.target_id.clone());
        labels.insert(WORKSPACE_ID_LABEL.to_string(), self.workspace.id.clone());
        labels
    }

    fn repository_mount(&self) -> String {
        format!("{}/{}", WORKSPACES_MOUNT, self.workspace.folder_name())
    }
}

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionOutcome {
    pub container_id: String,
    pub builder_type: Option<BuilderType>,
    pub image: Option<String>,
    pub stages: Vec<ProvisionStage>,
}

#[derive(Debug, Clone)]
pub struct WorkspaceProvisioner {
    runtime: Arc<dyn ContainerRuntime>,
    log_retry: RetryPolicy,
    log_grace: Duration,
}

impl WorkspaceProvisioner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            log_retry: RetryPolicy::default(),
            log_grace: Duration::from_secs(5),
        }
    }

    /// Create the directory holding a target's workspaces.
    pub async fn create_target_dir(&self, executor: &dyn Executor, dir: &Path) -> ws_core::Result<()> {
        info!("Creating target directory {} on {}", dir.display(), executor.describe());
        executor.create_dir_all(dir).await
    }

    /// Provision a workspace container. Progress is written to `opts.log_writer`.
    #[instrument(skip_all, fields(workspace_id = %opts.workspace.id))]
    pub async fn create_workspace(
        &self,
        opts: &CreateWorkspaceOptions,
        cancel: &CancellationToken,
    ) -> ProvisionResult<ProvisionOutcome> {
        let mut tracker = StageTracker::new(opts.log_writer.clone());
        let mut puller = ImagePuller::new(
            self.runtime.as_ref(),
            &opts.container_registries,
            &opts.log_writer,
        );

        let result = match &opts.workspace.build_config {
            None => self.provision_from_image(opts, &mut puller, &mut tracker, cancel).await,
            Some(build) => {
                self.provision_from_build(opts, build, &mut puller, &mut tracker, cancel)
                    .await
            }
        };

        match result {
            Ok((container_id, builder_type, image)) => {
                tracker.advance(ProvisionStage::Ready)?;
                opts.log_writer
                    .write_line(&format!("Workspace {} is ready", opts.workspace.name));
                info!("Workspace {} ready in container {}", opts.workspace.id, container_id);
                Ok(ProvisionOutcome {
                    container_id,
                    builder_type,
                    image,
                    stages: tracker.history().to_vec(),
                })
            }
            Err(e) => {
                tracker.fail(&e);
                Err(e)
            }
        }
    }

    fn enter(
        tracker: &mut StageTracker,
        stage: ProvisionStage,
        cancel: &CancellationToken,
    ) -> ProvisionResult<()> {
        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled {
                stage: tracker.current(),
            });
        }
        tracker.advance(stage)
    }

    /// Baseline path: no build configuration, the workspace image is run as is.
    async fn provision_from_image(
        &self,
        opts: &CreateWorkspaceOptions,
        puller: &mut ImagePuller<'_>,
        tracker: &mut StageTracker,
        cancel: &CancellationToken,
    ) -> ProvisionResult<(String, Option<BuilderType>, Option<String>)> {
        let image = opts.workspace.image.clone();

        Self::enter(tracker, ProvisionStage::ImagePulling, cancel)?;
        puller
            .pull(&image, cancel)
            .await
            .map_err(at_stage(ProvisionStage::ImagePulling))?;

        Self::enter(tracker, ProvisionStage::ImageFinalize, cancel)?;
        let container_id = self
            .create_workspace_container(opts, &image, false)
            .await
            .map_err(at_stage(ProvisionStage::ImageFinalize))?;
        if !opts.workspace.repository.url.is_empty() {
            self.clone_into_workspace_container(opts, &container_id, cancel)
                .await
                .map_err(at_stage(ProvisionStage::ImageFinalize))?;
        }

        Ok((container_id, None, Some(image)))
    }

    async fn provision_from_build(
        &self,
        opts: &CreateWorkspaceOptions,
        build: &BuildConfig,
        puller: &mut ImagePuller<'_>,
        tracker: &mut StageTracker,
        cancel: &CancellationToken,
    ) -> ProvisionResult<(String, Option<BuilderType>, Option<String>)> {
        Self::enter(tracker, ProvisionStage::ImagePulling, cancel)?;
        puller
            .pull(&opts.builder_image, cancel)
            .await
            .map_err(at_stage(ProvisionStage::ImagePulling))?;

        Self::enter(tracker, ProvisionStage::Cloning, cancel)?;
        self.clone_repository(opts, cancel).await?;

        Self::enter(tracker, ProvisionStage::BuilderDetecting, cancel)?;
        let Detection {
            builder_type,
            descriptor,
        } = detect_builder_type(build, &opts.workspace_dir, opts.executor.as_ref()).await?;
        opts.log_writer
            .write_line(&format!("Detected builder: {}", builder_type));

        match builder_type {
            BuilderType::Devcontainer => {
                Self::enter(tracker, ProvisionStage::DevcontainerBuild, cancel)?;
                let up = DevcontainerUp {
                    workspace_folder: opts.workspace_dir.clone(),
                    config: descriptor.map(|d| opts.workspace_dir.join(d)),
                    id_labels: opts.id_labels(),
                    env: opts.container_env(),
                };
                let container_id = self
                    .runtime
                    .devcontainer_up(&up, &opts.log_writer, cancel)
                    .await
                    .map_err(at_stage(ProvisionStage::DevcontainerBuild))?;
                Ok((container_id, Some(builder_type), None))
            }
            BuilderType::Image => {
                Self::enter(tracker, ProvisionStage::ImageFinalize, cancel)?;
                let image = build
                    .image
                    .clone()
                    .unwrap_or_else(|| opts.workspace.image.clone());
                let container_id = self.finalize_image(opts, puller, &image, cancel).await?;
                Ok((container_id, Some(builder_type), Some(image)))
            }
            BuilderType::Dockerfile => {
                Self::enter(tracker, ProvisionStage::ImageFinalize, cancel)?;
                let dockerfile = descriptor.unwrap_or_else(|| PathBuf::from("Dockerfile"));
                let context = build
                    .dockerfile
                    .as_ref()
                    .and_then(|d| d.context.as_deref())
                    .map(|c| opts.workspace_dir.join(c))
                    .unwrap_or_else(|| opts.workspace_dir.clone());
                let image_build = ImageBuild {
                    dockerfile: opts.workspace_dir.join(dockerfile),
                    context,
                    tag: format!("ws-{}:latest", opts.workspace.id.to_lowercase()),
                };
                self.runtime
                    .build_image(&image_build, &opts.log_writer, cancel)
                    .await
                    .map_err(at_stage(ProvisionStage::ImageFinalize))?;
                puller.mark_available(&image_build.tag);

                let container_id = self
                    .finalize_image(opts, puller, &image_build.tag, cancel)
                    .await?;
                Ok((container_id, Some(builder_type), Some(image_build.tag)))
            }
        }
    }

    async fn finalize_image(
        &self,
        opts: &CreateWorkspaceOptions,
        puller: &mut ImagePuller<'_>,
        image: &str,
        cancel: &CancellationToken,
    ) -> ProvisionResult<String> {
        puller
            .pull(image, cancel)
            .await
            .map_err(at_stage(ProvisionStage::ImageFinalize))?;
        self.create_workspace_container(opts, image, true)
            .await
            .map_err(at_stage(ProvisionStage::ImageFinalize))
    }

    async fn create_workspace_container(
        &self,
        opts: &CreateWorkspaceOptions,
        image: &str,
        mount_repository: bool,
    ) -> ws_core::Result<String> {
        let workspace = &opts.workspace;
        let mounts = if mount_repository {
            vec![BindMount {
                source: opts.workspace_dir.clone(),
                target: opts.repository_mount(),
            }]
        } else {
            Vec::new()
        };
        let spec = ContainerSpec {
            name: workspace.container_name(),
            image: image.to_string(),
            labels: opts.id_labels(),
            env: opts.container_env(),
            mounts,
            entrypoint: Some("sleep".to_string()),
            cmd: vec!["infinity".to_string()],
            user: Some(workspace.user.clone()).filter(|u| !u.is_empty()),
            working_dir: mount_repository.then(|| opts.repository_mount()),
        };

        let id = self.runtime.create_container(&spec).await?;
        self.runtime.start_container(&id).await?;
        info!("Started workspace container {} from {}", id, image);
        Ok(id)
    }

    async fn clone_into_workspace_container(
        &self,
        opts: &CreateWorkspaceOptions,
        container_id: &str,
        cancel: &CancellationToken,
    ) -> ws_core::Result<()> {
        let destination = opts.repository_mount();
        let user = Some(opts.workspace.user.as_str()).filter(|u| !u.is_empty());

        if let Some(user) = user {
            let prepare = format!(
                "mkdir -p {dir} && chown {user} {dir}",
                dir = shell_quote(&destination),
                user = shell_quote(user)
            );
            self.runtime
                .exec_capture(container_id, &ContainerExec::new(prepare).user("root"))
                .await?
                .check("prepare clone directory")?;
        }

        let command = clone_command(
            &opts.workspace.repository,
            opts.git_provider_config.as_ref(),
            &destination,
        )?;
        let exec = ContainerExec {
            user,
            ..ContainerExec::new(command)
        };
        let code = self
            .runtime
            .exec_streaming(container_id, &exec, &opts.log_writer, cancel)
            .await?;
        if code != 0 {
            return Err(WsError::Command(format!("git clone failed with exit code {}", code)));
        }
        Ok(())
    }

    /// Clone the repository inside a disposable container that is always removed.
    async fn clone_repository(
        &self,
        opts: &CreateWorkspaceOptions,
        cancel: &CancellationToken,
    ) -> ProvisionResult<()> {
        let stage = ProvisionStage::Cloning;
        opts.executor
            .create_dir_all(&opts.workspace_dir)
            .await
            .map_err(at_stage(stage))?;
        let parent = opts.workspace_dir.parent().ok_or_else(|| {
            ProvisionError::at(
                stage,
                WsError::Validation(format!(
                    "workspace directory {} has no parent",
                    opts.workspace_dir.display()
                )),
            )
        })?;

        let mut env = BTreeMap::new();
        env.insert("GIT_SSL_NO_VERIFY".to_string(), "true".to_string());
        let spec = ContainerSpec {
            name: clone_container_name(&opts.workspace.target_id, &opts.workspace.name),
            image: opts.builder_image.clone(),
            env,
            mounts: vec![BindMount {
                source: parent.to_path_buf(),
                target: CLONE_MOUNT.to_string(),
            }],
            entrypoint: Some("sleep".to_string()),
            cmd: vec!["infinity".to_string()],
            ..Default::default()
        };
        let container_id = self
            .runtime
            .create_container(&spec)
            .await
            .map_err(at_stage(stage))?;

        let result = self.clone_in_container(opts, &container_id, cancel).await;

        if let Err(e) = self.runtime.remove_container(&container_id).await {
            warn!("Failed to remove clone container {}: {}", container_id, e);
        }
        result.map_err(at_stage(stage))
    }

    async fn clone_in_container(
        &self,
        opts: &CreateWorkspaceOptions,
        container_id: &str,
        cancel: &CancellationToken,
    ) -> ws_core::Result<()> {
        self.runtime.start_container(container_id).await?;

        let tail = LogTail::spawn(
            self.runtime.clone(),
            container_id.to_string(),
            opts.log_writer.clone(),
            self.log_retry,
            cancel,
        );

        let cloned = self.run_clone(opts, container_id, cancel).await;
        let tailed = tail.finish(self.log_grace).await;
        cloned?;
        tailed
    }

    async fn run_clone(
        &self,
        opts: &CreateWorkspaceOptions,
        container_id: &str,
        cancel: &CancellationToken,
    ) -> ws_core::Result<()> {
        let (uid, gid) = opts.executor.user_uid_gid().await?;
        let user = clone_user_for(uid, gid);
        if user != "root" {
            self.patch_user_ids(opts, container_id, user, uid, gid).await?;
        }

        let destination = format!("{}/{}", CLONE_MOUNT, opts.workspace.folder_name());
        let command = clone_command(
            &opts.workspace.repository,
            opts.git_provider_config.as_ref(),
            &destination,
        )?;
        let code = self
            .runtime
            .exec_streaming(
                container_id,
                &ContainerExec::new(command).user(user),
                &opts.log_writer,
                cancel,
            )
            .await?;
        if code != 0 {
            return Err(WsError::Command(format!("git clone failed with exit code {}", code)));
        }
        Ok(())
    }

    async fn read_container_file(&self, container_id: &str, path: &str) -> ws_core::Result<String> {
        let exec = ContainerExec::new(format!("cat {}", path)).user("root");
        let output = self.runtime.exec_capture(container_id, &exec).await?;
        Ok(output.check(&format!("read {}", path))?.stdout)
    }

    /// Rewrite the clone user's UID/GID to the ids of the executing user.
    async fn patch_user_ids(
        &self,
        opts: &CreateWorkspaceOptions,
        container_id: &str,
        user: &str,
        uid: u32,
        gid: u32,
    ) -> ws_core::Result<()> {
        let passwd = self.read_container_file(container_id, "/etc/passwd").await?;
        let group = self.read_container_file(container_id, "/etc/group").await?;

        let patch = reconcile(&passwd, &group, user, uid, gid);
        opts.log_writer.write_line(&patch.outcome.to_string());
        info!("UID/GID reconciliation for {}: {:?}", user, patch.outcome);

        for (path, contents) in [("/etc/passwd", &patch.passwd), ("/etc/group", &patch.group)] {
            if let Some(contents) = contents {
                self.runtime
                    .exec_capture(
                        container_id,
                        &ContainerExec::new(format!("cat > {}", path))
                            .user("root")
                            .stdin(contents.as_bytes()),
                    )
                    .await?
                    .check(&format!("write {}", path))?;
            }
        }

        if let (UidGidOutcome::Updated { new_uid, new_gid, .. }, Some(home)) =
            (&patch.outcome, &patch.home)
        {
            let chown = format!("chown -R {}:{} {}", new_uid, new_gid, shell_quote(home));
            self.runtime
                .exec_capture(container_id, &ContainerExec::new(chown).user("root"))
                .await?
                .check("chown home directory")?;
        }
        Ok(())
    }

    async fn workspace_container(&self, workspace: &Workspace) -> ws_core::Result<Option<String>> {
        self.runtime
            .find_container_by_label(WORKSPACE_ID_LABEL, &workspace.id)
            .await
    }

    #[instrument(skip_all, fields(workspace_id = %workspace.id))]
    pub async fn start_workspace(&self, workspace: &Workspace) -> ws_core::Result<String> {
        let id = self.workspace_container(workspace).await?.ok_or_else(|| {
            WsError::Command(format!("no container found for workspace {}", workspace.id))
        })?;
        self.runtime.start_container(&id).await?;
        info!("Started workspace {}", workspace.id);
        Ok(id)
    }

    #[instrument(skip_all, fields(workspace_id = %workspace.id))]
    pub async fn stop_workspace(&self, workspace: &Workspace) -> ws_core::Result<()> {
        match self.workspace_container(workspace).await? {
            Some(id) => {
                self.runtime.stop_container(&id).await?;
                info!("Stopped workspace {}", workspace.id);
            }
            None => warn!("No container to stop for workspace {}", workspace.id),
        }
        Ok(())
    }

    /// Remove the workspace container and, when given, its directory on the target.
    #[instrument(skip_all, fields(workspace_id = %workspace.id))]
    pub async fn destroy_workspace(
        &self,
        workspace: &Workspace,
        workspace_dir: Option<&Path>,
        executor: &dyn Executor,
    ) -> ws_core::Result<()> {
        if let Some(id) = self.workspace_container(workspace).await? {
            self.runtime.remove_container(&id).await?;
        }
        if let Some(dir) = workspace_dir {
            executor
                .exec(&format!("rm -rf {}", shell_quote(&dir.display().to_string())), None)
                .await?
                .check("remove workspace directory")?;
        }
        info!("Destroyed workspace {}", workspace.id);
        Ok(())
    }
}
