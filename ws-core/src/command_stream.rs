// Standard library
use std::path::PathBuf;
use std::process::Stdio;

// External crates
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use which::which;

// Internal imports
use crate::error::{Result, WsError};
use crate::log_writer::LogWriter;

/// Run a command, forwarding stdout and stderr line by line to `writer`.
///
/// Returns the exit code. A process killed by a signal reports `-1`.
/// If `cancel` fires first the child is killed and `WsError::Cancelled` is returned.
pub async fn stream_command(
    mut command: Command,
    writer: &LogWriter,
    cancel: &CancellationToken,
) -> Result<i32> {
    let program = format!("{:?}", command.as_std().get_program());

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| WsError::Command(format!("Failed to start {}: {}", program, e)))?;

    let outcome = tokio::select! {
        status = wait_and_forward(&mut child, writer) => Some(status),
        () = cancel.cancelled() => None,
    };

    match outcome {
        Some(status) => {
            let status = status?;
            debug!("{} exited with {}", program, status);
            Ok(status.code().unwrap_or(-1))
        }
        None => {
            let _ = child.kill().await;
            Err(WsError::Cancelled)
        }
    }
}

async fn wait_and_forward(
    child: &mut Child,
    writer: &LogWriter,
) -> std::io::Result<std::process::ExitStatus> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let (_, _, status) = tokio::join!(
        forward_lines(stdout, writer),
        forward_lines(stderr, writer),
        child.wait()
    );

    status
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: Option<R>, writer: &LogWriter) {
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        writer.write_line(&line);
    }
}

/// Locate `program` on `PATH` before spawning it.
pub fn resolve_program(program: &str) -> Result<PathBuf> {
    which(program).map_err(|_| WsError::Command(format!("{} not found in PATH", program)))
}
