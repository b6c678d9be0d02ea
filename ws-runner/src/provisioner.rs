use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout_at, Duration, Instant};
use tracing::{error, info, instrument, warn};
use ws_core::{CancellationToken, Executor, LocalExecutor, LogWriter, SshExecutor, Target, Workspace};
use ws_orchestrator::{
    Job, JobAction, JobFilter, JobState, JobStore, OrchestratorError, ProvisioningParams,
    ResourceType, WorkspaceService,
};
use ws_provider::{
    ContainerRuntime, CreateWorkspaceOptions, DockerCli, WorkspaceProvisioner, WORKSPACE_ID_LABEL,
};

use crate::config::Config;

/// Where commands for a target run and which container runtime drives them.
pub trait Backend: Send + Sync {
    fn executor(&self, target: &Target) -> anyhow::Result<Arc<dyn Executor>>;

    fn runtime(&self, executor: Arc<dyn Executor>) -> Arc<dyn ContainerRuntime>;
}

/// Docker CLI, run locally or over SSH depending on the target's options.
pub struct DockerBackend;

impl Backend for DockerBackend {
    fn executor(&self, target: &Target) -> anyhow::Result<Arc<dyn Executor>> {
        let executor: Arc<dyn Executor> = match target.remote_options()? {
            Some(remote) => Arc::new(SshExecutor::new(remote.ssh_target())),
            None => Arc::new(LocalExecutor::new()),
        };
        Ok(executor)
    }

    fn runtime(&self, executor: Arc<dyn Executor>) -> Arc<dyn ContainerRuntime> {
        Arc::new(DockerCli::new(executor))
    }
}

/// Claims workspace jobs from the ledger and drives the provisioning engine.
#[derive(Clone)]
pub struct Runner {
    config: Arc<Config>,
    jobs: JobStore,
    service: WorkspaceService,
    backend: Arc<dyn Backend>,
    cancel: CancellationToken,
}

impl Runner {
    pub fn new(
        config: Arc<Config>,
        jobs: JobStore,
        service: WorkspaceService,
        backend: Arc<dyn Backend>,
    ) -> Self {
        Self {
            config,
            jobs,
            service,
            backend,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that aborts in-flight provisioning when cancelled.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Fail jobs this runner left running before it last stopped.
    pub async fn recover(&self) -> anyhow::Result<u64> {
        Ok(self.jobs.abandon_runner(&self.config.runner_id).await?)
    }

    /// Poll until cancelled, then wait for in-flight jobs to finish.
    pub async fn run(&self) {
        if let Err(e) = self.recover().await {
            error!("Failed to recover abandoned jobs: {}", e);
        }

        let mut interval = interval(Duration::from_secs(self.config.poll_interval_secs.max(1)));
        let mut in_flight: Vec<JoinHandle<()>> = Vec::new();

        info!(
            "Runner {} polling every {} seconds",
            self.config.runner_id, self.config.poll_interval_secs
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                () = self.cancel.cancelled() => break,
            }

            in_flight.retain(|handle| !handle.is_finished());
            if let Err(e) = self.renew_leases().await {
                warn!("Failed to renew job leases: {}", e);
            }
            match self.run_once().await {
                Ok(handles) => in_flight.extend(handles),
                Err(e) => error!("Runner error: {}", e),
            }
        }

        self.drain(in_flight).await;
        info!("Runner {} stopped", self.config.runner_id);
    }

    /// Heartbeat this runner's jobs and fail those of runners that went silent.
    async fn renew_leases(&self) -> anyhow::Result<()> {
        self.jobs.heartbeat(&self.config.runner_id).await?;
        self.jobs
            .expire_running(Duration::from_secs(self.config.job_lease_secs))
            .await?;
        Ok(())
    }

    /// Give cancelled jobs the grace period to record their outcome.
    async fn drain(&self, handles: Vec<JoinHandle<()>>) {
        let pending: Vec<_> = handles.into_iter().filter(|h| !h.is_finished()).collect();
        if pending.is_empty() {
            return;
        }
        info!(
            "Waiting up to {} seconds for {} in-flight jobs",
            self.config.shutdown_grace_secs,
            pending.len()
        );

        let deadline = Instant::now() + Duration::from_secs(self.config.shutdown_grace_secs);
        for handle in pending {
            match timeout_at(deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Job task failed: {}", e),
                Err(_) => {
                    warn!("Shutdown grace period elapsed; unfinished jobs are recovered on restart");
                    break;
                }
            }
        }
    }

    /// Claim whatever can be claimed and start a task per job.
    pub async fn run_once(&self) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let claimed = self.claim_pending().await?;

        Ok(claimed
            .into_iter()
            .map(|job| {
                let runner = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = runner.execute(job).await {
                        error!("Failed to record job result: {}", e);
                    }
                })
            })
            .collect())
    }

    /// Claim pending workspace jobs, oldest first. At most one per workspace.
    pub async fn claim_pending(&self) -> anyhow::Result<Vec<Job>> {
        let pending = self
            .jobs
            .list(&JobFilter {
                resource_type: Some(ResourceType::Workspace),
                states: Some(vec![JobState::Pending]),
                ..Default::default()
            })
            .await?;

        let mut claimed = Vec::new();
        for mut job in pending.into_iter().rev() {
            if self.jobs.claim(&job.id, &self.config.runner_id).await? {
                info!("Claimed {} job {} for {}", job.action, job.id, job.resource_id);
                job.state = JobState::Running;
                job.runner_id = Some(self.config.runner_id.clone());
                claimed.push(job);
            }
        }
        Ok(claimed)
    }

    /// Run a claimed job and record its outcome in the ledger.
    #[instrument(skip(self, job), fields(job_id = %job.id, action = %job.action, workspace_id = %job.resource_id))]
    pub async fn execute(&self, job: Job) -> anyhow::Result<Job> {
        let result = self.handle(&job).await;
        let error = match result {
            Ok(()) => {
                info!("Job {} succeeded", job.id);
                None
            }
            Err(e) => {
                error!("Job {} failed: {:#}", job.id, e);
                Some(format!("{:#}", e))
            }
        };
        Ok(self.jobs.complete(&job.id, error).await?)
    }

    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        let params = match self
            .service
            .provisioning_params(&job.resource_id, &self.config.builder_image)
            .await
        {
            Ok(params) => params,
            Err(OrchestratorError::NotFound(_)) if job.action == JobAction::Delete => {
                return self.destroy_purged(&job.resource_id).await;
            }
            Err(e) => return Err(e.into()),
        };

        let executor = self.backend.executor(&params.target)?;
        let provisioner = WorkspaceProvisioner::new(self.backend.runtime(executor.clone()));
        let workspace = &params.workspace;
        let workspace_dir = self
            .config
            .target_dir(&params.target.id)
            .join(workspace.folder_name());

        match job.action {
            JobAction::Create => self.create(&provisioner, &params, executor).await,
            JobAction::Start => {
                provisioner.start_workspace(workspace).await?;
                Ok(())
            }
            JobAction::Stop => Ok(provisioner.stop_workspace(workspace).await?),
            JobAction::Restart => {
                provisioner.stop_workspace(workspace).await?;
                provisioner.start_workspace(workspace).await?;
                Ok(())
            }
            JobAction::Delete => Ok(provisioner
                .destroy_workspace(workspace, Some(&workspace_dir), executor.as_ref())
                .await?),
        }
    }

    async fn create(
        &self,
        provisioner: &WorkspaceProvisioner,
        params: &ProvisioningParams,
        executor: Arc<dyn Executor>,
    ) -> anyhow::Result<()> {
        let workspace = &params.workspace;
        let target_dir = self.config.target_dir(&params.target.id);
        provisioner
            .create_target_dir(executor.as_ref(), &target_dir)
            .await
            .context("Failed to create target directory")?;

        let log_path = self.config.log_dir.join(format!("{}.log", workspace.id));
        let log_writer = LogWriter::to_file(&log_path)
            .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

        let mut env_vars = HashMap::new();
        env_vars.insert("WS_RUNNER_ID".to_string(), self.config.runner_id.clone());

        let opts = CreateWorkspaceOptions {
            workspace: workspace.clone(),
            workspace_dir: target_dir.join(workspace.folder_name()),
            builder_image: self.config.builder_image.clone(),
            container_registries: params.container_registries.clone(),
            git_provider_config: params.git_provider_config.clone(),
            log_writer,
            executor,
            env_vars,
        };

        let outcome = provisioner
            .create_workspace(&opts, &self.cancel.child_token())
            .await?;
        info!(
            "Workspace {} provisioned in container {}",
            workspace.id, outcome.container_id
        );
        Ok(())
    }

    /// Remove containers of a workspace whose row was already purged.
    ///
    /// The target is unknown at this point, so every configured target is
    /// searched by workspace label. The cloned directory cannot be located
    /// without the workspace name and is left in place.
    async fn destroy_purged(&self, workspace_id: &str) -> anyhow::Result<()> {
        let workspace = Workspace {
            id: workspace_id.to_string(),
            ..Default::default()
        };

        for target in &self.config.targets {
            let executor = self.backend.executor(target)?;
            let runtime = self.backend.runtime(executor.clone());
            if runtime
                .find_container_by_label(WORKSPACE_ID_LABEL, workspace_id)
                .await?
                .is_none()
            {
                continue;
            }
            WorkspaceProvisioner::new(runtime)
                .destroy_workspace(&workspace, None, executor.as_ref())
                .await?;
            info!("Removed container of purged workspace {} on {}", workspace_id, target.id);
        }
        warn!(
            "Workspace {} was purged before its delete job ran; its directory is left in place",
            workspace_id
        );
        Ok(())
    }
}
