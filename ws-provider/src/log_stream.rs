//! Background log tail for a container.
//!
//! The tail runs as its own task next to the command whose output it follows
//! and never blocks that command. Attempts that fail because the container is
//! not ready yet, or fail transiently, are retried with a fixed backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};
use ws_core::{CancellationToken, LogWriter, WsError};

use crate::runtime::{ContainerRuntime, LogStreamError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: Duration,
    pub max_attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_millis(100),
            max_attempts: 50,
        }
    }
}

/// Handle to a running log tail.
pub struct LogTail {
    stop: CancellationToken,
    handle: JoinHandle<Result<(), WsError>>,
}

impl LogTail {
    pub fn spawn(
        runtime: Arc<dyn ContainerRuntime>,
        container_id: String,
        log: LogWriter,
        policy: RetryPolicy,
        cancel: &CancellationToken,
    ) -> Self {
        let stop = cancel.child_token();
        let task_stop = stop.clone();
        let handle = tokio::spawn(async move {
            follow(runtime.as_ref(), &container_id, &log, policy, &task_stop).await
        });
        Self { stop, handle }
    }

    /// Stop following and report whether the tail ever converged.
    ///
    /// Call once the source command has exited. Give up on a tail that is
    /// still retrying after `grace`.
    pub async fn finish(self, grace: Duration) -> Result<(), WsError> {
        self.stop.cancel();
        match tokio::time::timeout(grace, self.handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(WsError::Internal(format!("log tail task failed: {}", join_err))),
            Err(_) => {
                warn!("Log tail did not stop within {:?}", grace);
                Ok(())
            }
        }
    }
}

async fn follow(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    log: &LogWriter,
    policy: RetryPolicy,
    stop: &CancellationToken,
) -> Result<(), WsError> {
    let mut last_error = String::new();
    for attempt in 1..=policy.max_attempts {
        if stop.is_cancelled() && attempt > 1 {
            return Ok(());
        }
        match runtime.stream_logs(container_id, log, stop).await {
            Ok(()) => return Ok(()),
            Err(LogStreamError::NotReady(reason)) => {
                debug!("Logs for {} not ready (attempt {}): {}", container_id, attempt, reason);
                last_error = reason;
            }
            Err(LogStreamError::Failed(e)) => {
                warn!("Log stream for {} failed (attempt {}): {}", container_id, attempt, e);
                last_error = e.to_string();
            }
        }
        tokio::select! {
            () = tokio::time::sleep(policy.backoff) => {}
            () = stop.cancelled() => {}
        }
    }
    Err(WsError::Command(format!(
        "log stream for {} did not converge after {} attempts: {}",
        container_id, policy.max_attempts, last_error
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRuntime;

    fn fast_policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            backoff: Duration::from_millis(1),
            max_attempts,
        }
    }

    #[tokio::test]
    async fn test_not_ready_is_retried_until_stream_attaches() {
        let runtime = Arc::new(MockRuntime::new().log_not_ready_times(3));
        let tail = LogTail::spawn(
            runtime.clone(),
            "c1".into(),
            LogWriter::sink(),
            fast_policy(10),
            &CancellationToken::new(),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        tail.finish(Duration::from_secs(1)).await.unwrap();

        assert_eq!(runtime.log_attempts(), 4);
    }

    #[tokio::test]
    async fn test_never_converging_tail_reports_error() {
        let runtime = Arc::new(MockRuntime::new().fail("logs"));
        let tail = LogTail::spawn(
            runtime.clone(),
            "c1".into(),
            LogWriter::sink(),
            fast_policy(5),
            &CancellationToken::new(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        let err = tail.finish(Duration::from_secs(1)).await.unwrap_err();

        assert!(err.to_string().contains("did not converge"));
        assert_eq!(runtime.log_attempts(), 5);
    }

    #[tokio::test]
    async fn test_finish_stops_a_retrying_tail() {
        let runtime = Arc::new(MockRuntime::new().log_not_ready_times(usize::MAX));
        let tail = LogTail::spawn(
            runtime.clone(),
            "c1".into(),
            LogWriter::sink(),
            RetryPolicy::default(),
            &CancellationToken::new(),
        );

        tail.finish(Duration::from_secs(1)).await.unwrap();

        assert!(runtime.log_attempts() <= 2);
    }
}
