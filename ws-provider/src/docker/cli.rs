use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};
use ws_core::{
    CancellationToken, ContainerRegistry, ExecOutput, Executor, LogWriter, Result, WsError,
};

use super::command::DockerCommand;
use crate::runtime::{
    ContainerExec, ContainerRuntime, ContainerSpec, DevcontainerUp, ImageBuild, LogStreamError,
};
use crate::WORKSPACE_ID_LABEL;

/// Drives the `docker` and `devcontainer` CLIs through an [`Executor`].
#[derive(Debug, Clone)]
pub struct DockerCli {
    executor: Arc<dyn Executor>,
}

impl DockerCli {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    async fn run(&self, cmd: DockerCommand, what: &str) -> Result<ExecOutput> {
        debug!("Executing Docker command on {}: {}", self.executor.describe(), cmd.redacted());
        self.executor.exec(&cmd.render(), None).await?.check(what)
    }

    async fn run_streaming(
        &self,
        cmd: DockerCommand,
        what: &str,
        log: &LogWriter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        debug!("Streaming Docker command on {}: {}", self.executor.describe(), cmd.redacted());
        let code = self.executor.exec_streaming(&cmd.render(), log, cancel).await?;
        if code == 0 {
            Ok(())
        } else {
            Err(WsError::Command(format!("{} failed with exit code {}", what, code)))
        }
    }

    async fn login(&self, registry: &ContainerRegistry) -> Result<()> {
        let cmd = DockerCommand::new()
            .subcommand("login")
            .arg(&registry.server)
            .arg("--username")
            .arg(&registry.username)
            .arg("--password-stdin");
        self.executor
            .exec(&cmd.render(), Some(registry.password.as_bytes()))
            .await?
            .check(&format!("docker login {}", registry.server))?;
        Ok(())
    }

    fn exec_command(id: &str, exec: &ContainerExec<'_>, interactive: bool) -> DockerCommand {
        let mut cmd = DockerCommand::new().subcommand("exec");
        if interactive {
            cmd = cmd.arg("-i");
        }
        cmd.opt("-u", exec.user)
            .pairs("-e", &exec.env)
            .arg(id)
            .args(["sh", "-c"])
            .arg(&exec.command)
    }
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    #[instrument(skip(self, registry, log, cancel))]
    async fn pull_image(
        &self,
        image: &str,
        registry: Option<&ContainerRegistry>,
        log: &LogWriter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if let Some(registry) = registry {
            self.login(registry).await?;
        }
        log.write_line(&format!("Pulling image {}...", image));
        let cmd = DockerCommand::new().subcommand("pull").arg(image);
        self.run_streaming(cmd, &format!("docker pull {}", image), log, cancel)
            .await?;
        info!("Pulled image {}", image);
        Ok(())
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut cmd = DockerCommand::new()
            .subcommand("create")
            .arg("--name")
            .arg(&spec.name)
            .pairs("--label", &spec.labels)
            .pairs("-e", &spec.env)
            .opt("--entrypoint", spec.entrypoint.as_deref())
            .opt("-u", spec.user.as_deref())
            .opt("-w", spec.working_dir.as_deref());
        for mount in &spec.mounts {
            cmd = cmd
                .arg("-v")
                .arg(format!("{}:{}", path_arg(&mount.source), mount.target));
        }
        cmd = cmd.arg(&spec.image).args(spec.cmd.iter().cloned());

        let output = self.run(cmd, "docker create").await?;
        let id = output.stdout.trim().to_string();
        if id.is_empty() {
            return Err(WsError::Parse(format!(
                "docker create returned no container id for {}",
                spec.name
            )));
        }
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.run(DockerCommand::new().subcommand("start").arg(id), "docker start")
            .await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.run(DockerCommand::new().subcommand("stop").arg(id), "docker stop")
            .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let cmd = DockerCommand::new().subcommand("rm").arg("-f").arg(id);
        self.run(cmd, "docker rm").await?;
        Ok(())
    }

    async fn exec_capture(&self, id: &str, exec: &ContainerExec<'_>) -> Result<ExecOutput> {
        let cmd = Self::exec_command(id, exec, exec.stdin.is_some());
        self.executor.exec(&cmd.render(), exec.stdin).await
    }

    async fn exec_streaming(
        &self,
        id: &str,
        exec: &ContainerExec<'_>,
        log: &LogWriter,
        cancel: &CancellationToken,
    ) -> Result<i32> {
        let cmd = Self::exec_command(id, exec, false);
        self.executor.exec_streaming(&cmd.render(), log, cancel).await
    }

    async fn stream_logs(
        &self,
        id: &str,
        log: &LogWriter,
        stop: &CancellationToken,
    ) -> std::result::Result<(), LogStreamError> {
        let inspect = DockerCommand::new()
            .subcommand("inspect")
            .arg("-f")
            .arg("{{.State.Running}}")
            .arg(id);
        let state = self
            .executor
            .exec(&inspect.render(), None)
            .await
            .map_err(LogStreamError::Failed)?;
        if !state.success() {
            return Err(LogStreamError::NotReady(state.stderr.trim().to_string()));
        }
        if state.stdout.trim() != "true" {
            return Err(LogStreamError::NotReady(format!("container {} is not running", id)));
        }

        let follow = DockerCommand::new()
            .subcommand("logs")
            .arg("--follow")
            .arg(id);
        match self.executor.exec_streaming(&follow.render(), log, stop).await {
            Ok(0) | Err(WsError::Cancelled) => Ok(()),
            Ok(code) => Err(LogStreamError::Failed(WsError::Command(format!(
                "docker logs exited with {}",
                code
            )))),
            Err(e) => Err(LogStreamError::Failed(e)),
        }
    }

    #[instrument(skip(self, log, cancel), fields(tag = %build.tag))]
    async fn build_image(
        &self,
        build: &ImageBuild,
        log: &LogWriter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let cmd = DockerCommand::new()
            .subcommand("build")
            .arg("-f")
            .arg(path_arg(&build.dockerfile))
            .arg("-t")
            .arg(&build.tag)
            .arg(path_arg(&build.context));
        self.run_streaming(cmd, "docker build", log, cancel).await
    }

    #[instrument(skip(self, log, cancel), fields(folder = %up.workspace_folder.display()))]
    async fn devcontainer_up(
        &self,
        up: &DevcontainerUp,
        log: &LogWriter,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let cmd = DockerCommand::program("devcontainer")
            .subcommand("up")
            .arg("--workspace-folder")
            .arg(path_arg(&up.workspace_folder))
            .opt("--config", up.config.as_deref().map(path_arg))
            .pairs("--id-label", &up.id_labels)
            .pairs("--remote-env", &up.env);
        self.run_streaming(cmd, "devcontainer up", log, cancel).await?;

        let workspace_id = up
            .id_labels
            .get(WORKSPACE_ID_LABEL)
            .ok_or_else(|| WsError::Internal("devcontainer id labels lack a workspace id".into()))?;
        self.find_container_by_label(WORKSPACE_ID_LABEL, workspace_id)
            .await?
            .ok_or_else(|| {
                WsError::Command(format!(
                    "devcontainer up finished but no container is labelled {}={}",
                    WORKSPACE_ID_LABEL, workspace_id
                ))
            })
    }

    async fn find_container_by_label(&self, key: &str, value: &str) -> Result<Option<String>> {
        let cmd = DockerCommand::new()
            .subcommand("ps")
            .arg("-a")
            .arg("-q")
            .arg("--filter")
            .arg(format!("label={}={}", key, value));
        let output = self.run(cmd, "docker ps").await?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string))
    }
}
