//! In-memory fakes for the runtime and executor seams.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use ws_core::{
    CancellationToken, ContainerRegistry, ExecOutput, Executor, LogWriter, Result, WsError,
};

use crate::runtime::{
    ContainerExec, ContainerRuntime, ContainerSpec, DevcontainerUp, ImageBuild, LogStreamError,
};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Executor that records commands instead of running them.
#[derive(Debug)]
pub struct FakeExecutor {
    uid_gid: (u32, u32),
    paths: Mutex<HashSet<PathBuf>>,
    commands: Mutex<Vec<String>>,
    responses: Mutex<Vec<(String, ExecOutput)>>,
}

impl FakeExecutor {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid_gid: (uid, gid),
            paths: Mutex::new(HashSet::new()),
            commands: Mutex::new(Vec::new()),
            responses: Mutex::new(Vec::new()),
        }
    }

    /// Mark `path` as present on the target filesystem.
    pub fn with_path(self, path: impl Into<PathBuf>) -> Self {
        lock(&self.paths).insert(path.into());
        self
    }

    /// Answer any command containing `needle` with `output`.
    pub fn respond(self, needle: &str, output: ExecOutput) -> Self {
        lock(&self.responses).push((needle.to_string(), output));
        self
    }

    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }

    fn answer(&self, command: &str) -> ExecOutput {
        lock(&self.commands).push(command.to_string());
        lock(&self.responses)
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    fn describe(&self) -> String {
        "fake".to_string()
    }

    async fn exec(&self, command: &str, _stdin: Option<&[u8]>) -> Result<ExecOutput> {
        Ok(self.answer(command))
    }

    async fn exec_streaming(
        &self,
        command: &str,
        writer: &LogWriter,
        cancel: &CancellationToken,
    ) -> Result<i32> {
        if cancel.is_cancelled() {
            return Err(WsError::Cancelled);
        }
        let output = self.answer(command);
        if !output.stdout.is_empty() {
            writer.write_line(output.stdout.trim_end());
        }
        Ok(output.exit_code)
    }

    async fn user_uid_gid(&self) -> Result<(u32, u32)> {
        Ok(self.uid_gid)
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        lock(&self.commands).push(format!("mkdir -p {}", path.display()));
        lock(&self.paths).insert(path.to_path_buf());
        Ok(())
    }

    async fn path_exists(&self, path: &Path) -> Result<bool> {
        Ok(lock(&self.paths).contains(path))
    }
}

/// One recorded runtime interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Pull {
        image: String,
        registry: Option<String>,
    },
    Create(ContainerSpec),
    Start(String),
    Stop(String),
    Remove(String),
    Exec {
        id: String,
        user: Option<String>,
        command: String,
    },
    Build(ImageBuild),
    DevcontainerUp(DevcontainerUp),
}

/// Runtime that keeps containers in memory and records every call.
#[derive(Debug)]
pub struct MockRuntime {
    calls: Mutex<Vec<RuntimeCall>>,
    containers: Mutex<HashMap<String, ContainerSpec>>,
    files: Mutex<HashMap<String, String>>,
    failing: Mutex<HashSet<&'static str>>,
    log_not_ready: AtomicUsize,
    log_attempts: AtomicUsize,
    next_id: AtomicUsize,
    pull_delay: Mutex<Option<Duration>>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

pub const DEFAULT_PASSWD: &str = "root:x:0:0:root:/root:/bin/bash\n\
ws:x:1000:1000::/home/ws:/bin/bash\n";
pub const DEFAULT_GROUP: &str = "root:x:0:\nws:x:1000:\n";

impl MockRuntime {
    pub fn new() -> Self {
        let mut files = HashMap::new();
        files.insert("/etc/passwd".to_string(), DEFAULT_PASSWD.to_string());
        files.insert("/etc/group".to_string(), DEFAULT_GROUP.to_string());
        Self {
            calls: Mutex::new(Vec::new()),
            containers: Mutex::new(HashMap::new()),
            files: Mutex::new(files),
            failing: Mutex::new(HashSet::new()),
            log_not_ready: AtomicUsize::new(0),
            log_attempts: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
            pull_delay: Mutex::new(None),
        }
    }

    /// Make an operation fail: "pull", "create", "clone", "build", "devcontainer", "logs".
    pub fn fail(self, op: &'static str) -> Self {
        lock(&self.failing).insert(op);
        self
    }

    /// Hold every pull for `delay` unless cancelled first.
    pub fn with_pull_delay(self, delay: Duration) -> Self {
        *lock(&self.pull_delay) = Some(delay);
        self
    }

    /// Report "not ready" this many times before following logs succeeds.
    pub fn log_not_ready_times(self, times: usize) -> Self {
        self.log_not_ready.store(times, Ordering::SeqCst);
        self
    }

    pub fn with_file(self, path: &str, contents: &str) -> Self {
        lock(&self.files).insert(path.to_string(), contents.to_string());
        self
    }

    pub fn file(&self, path: &str) -> String {
        lock(&self.files).get(path).cloned().unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        lock(&self.calls).clone()
    }

    pub fn pulls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RuntimeCall::Pull { image, .. } => Some(image),
                _ => None,
            })
            .collect()
    }

    pub fn created(&self) -> Vec<ContainerSpec> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RuntimeCall::Create(spec) => Some(spec),
                _ => None,
            })
            .collect()
    }

    pub fn removed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RuntimeCall::Remove(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn execs(&self) -> Vec<(Option<String>, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RuntimeCall::Exec { user, command, .. } => Some((user, command)),
                _ => None,
            })
            .collect()
    }

    pub fn log_attempts(&self) -> usize {
        self.log_attempts.load(Ordering::SeqCst)
    }

    pub fn container_count(&self) -> usize {
        lock(&self.containers).len()
    }

    fn fails(&self, op: &str) -> bool {
        lock(&self.failing).contains(op)
    }

    fn record(&self, call: RuntimeCall) {
        lock(&self.calls).push(call);
    }

    fn record_exec(&self, id: &str, exec: &ContainerExec<'_>) {
        self.record(RuntimeCall::Exec {
            id: id.to_string(),
            user: exec.user.map(str::to_string),
            command: exec.command.clone(),
        });
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn pull_image(
        &self,
        image: &str,
        registry: Option<&ContainerRegistry>,
        log: &LogWriter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(WsError::Cancelled);
        }
        self.record(RuntimeCall::Pull {
            image: image.to_string(),
            registry: registry.map(|r| r.server.clone()),
        });
        let delay = *lock(&self.pull_delay);
        if let Some(delay) = delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => return Err(WsError::Cancelled),
            }
        }
        if self.fails("pull") {
            return Err(WsError::Command(format!("pull access denied for {}", image)));
        }
        log.write_line(&format!("pulled {}", image));
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.record(RuntimeCall::Create(spec.clone()));
        if self.fails("create") {
            return Err(WsError::Command("docker create failed".into()));
        }
        let id = format!("c{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        lock(&self.containers).insert(id.clone(), spec.clone());
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.record(RuntimeCall::Start(id.to_string()));
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.record(RuntimeCall::Stop(id.to_string()));
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.record(RuntimeCall::Remove(id.to_string()));
        lock(&self.containers).remove(id);
        Ok(())
    }

    async fn exec_capture(&self, id: &str, exec: &ContainerExec<'_>) -> Result<ExecOutput> {
        self.record_exec(id, exec);
        let command = exec.command.trim();
        if let Some(path) = command.strip_prefix("cat > ") {
            let contents = String::from_utf8_lossy(exec.stdin.unwrap_or_default()).into_owned();
            lock(&self.files).insert(path.to_string(), contents);
            return Ok(ExecOutput::default());
        }
        if let Some(path) = command.strip_prefix("cat ") {
            return Ok(ExecOutput {
                stdout: self.file(path),
                ..Default::default()
            });
        }
        Ok(ExecOutput::default())
    }

    async fn exec_streaming(
        &self,
        id: &str,
        exec: &ContainerExec<'_>,
        log: &LogWriter,
        cancel: &CancellationToken,
    ) -> Result<i32> {
        if cancel.is_cancelled() {
            return Err(WsError::Cancelled);
        }
        self.record_exec(id, exec);
        if exec.command.contains("git clone") && self.fails("clone") {
            log.write_line("fatal: repository not found");
            return Ok(128);
        }
        Ok(0)
    }

    async fn stream_logs(
        &self,
        _id: &str,
        _log: &LogWriter,
        _stop: &CancellationToken,
    ) -> std::result::Result<(), LogStreamError> {
        self.log_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fails("logs") {
            return Err(LogStreamError::Failed(WsError::Command("daemon gone".into())));
        }
        let remaining = self.log_not_ready.load(Ordering::SeqCst);
        if remaining > 0 {
            self.log_not_ready.store(remaining - 1, Ordering::SeqCst);
            return Err(LogStreamError::NotReady("starting".into()));
        }
        Ok(())
    }

    async fn build_image(
        &self,
        build: &ImageBuild,
        _log: &LogWriter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(WsError::Cancelled);
        }
        self.record(RuntimeCall::Build(build.clone()));
        if self.fails("build") {
            return Err(WsError::Command("docker build failed".into()));
        }
        Ok(())
    }

    async fn devcontainer_up(
        &self,
        up: &DevcontainerUp,
        _log: &LogWriter,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(WsError::Cancelled);
        }
        self.record(RuntimeCall::DevcontainerUp(up.clone()));
        if self.fails("devcontainer") {
            return Err(WsError::Command("devcontainer up failed".into()));
        }
        let id = format!("dc{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        lock(&self.containers).insert(
            id.clone(),
            ContainerSpec {
                name: id.clone(),
                labels: up.id_labels.clone(),
                ..Default::default()
            },
        );
        Ok(id)
    }

    async fn find_container_by_label(&self, key: &str, value: &str) -> Result<Option<String>> {
        Ok(lock(&self.containers)
            .iter()
            .find(|(_, spec)| spec.labels.get(key).map(String::as_str) == Some(value))
            .map(|(id, _)| id.clone()))
    }
}

/// Labels map helper for tests.
pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
