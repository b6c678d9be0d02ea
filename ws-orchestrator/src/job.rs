//! Durable ledger of actions requested against workspaces and targets.
//!
//! A job is created `pending` when the service accepts an action, moved to
//! `running` by the runner that claims it and finished as `success` or
//! `error`. States only move forward; a finished job never changes again.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::db::now_millis;
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Workspace,
    Target,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobAction {
    Create,
    Start,
    Stop,
    Restart,
    Delete,
}

impl fmt::Display for JobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Delete => "delete",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Success,
    Error,
}

impl JobState {
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Success | Self::Error => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    /// Whether a job in this state may be saved as `next`.
    ///
    /// An unfinished job may be re-saved in its current state. A finished
    /// job accepts nothing.
    pub fn can_transition_to(self, next: JobState) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub resource_id: String,
    pub resource_type: ResourceType,
    pub action: JobAction,
    pub runner_id: Option<String>,
    pub state: JobState,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A fresh `pending` job with a generated id.
    pub fn new(
        resource_id: impl Into<String>,
        resource_type: ResourceType,
        action: JobAction,
        runner_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            resource_id: resource_id.into(),
            resource_type,
            action,
            runner_id,
            state: JobState::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub id: Option<String>,
    pub resource_id: Option<String>,
    pub resource_type: Option<ResourceType>,
    pub action: Option<JobAction>,
    pub states: Option<Vec<JobState>>,
}

impl JobFilter {
    pub fn resource(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: Some(resource_id.into()),
            ..Default::default()
        }
    }

    pub fn action(mut self, action: JobAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn states(mut self, states: &[JobState]) -> Self {
        self.states = Some(states.to_vec());
        self
    }
}

/// Enqueues jobs on behalf of the workspace service.
#[async_trait]
pub trait JobScheduler: Send + Sync {
    async fn create_job(
        &self,
        resource_id: &str,
        resource_type: ResourceType,
        runner_id: Option<&str>,
        action: JobAction,
    ) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or update a job by id.
    ///
    /// Fails with `InvalidStateTransition` if the new state would move the job
    /// backwards or the stored job is finished. Saving a finished job again
    /// with the same outcome is a no-op.
    #[instrument(skip(self, job), fields(job_id = %job.id, state = %job.state))]
    pub async fn save(&self, job: &Job) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<(JobState, Option<String>, Option<String>)> =
            sqlx::query_as("SELECT state, runner_id, error FROM jobs WHERE id = ?")
                .bind(&job.id)
                .fetch_optional(&mut *tx)
                .await?;
        if let Some((current, runner_id, error)) = existing {
            if current.is_terminal()
                && current == job.state
                && runner_id == job.runner_id
                && error == job.error
            {
                debug!("Job {} already finished as {}", job.id, current);
                return Ok(());
            }
            if !current.can_transition_to(job.state) {
                warn!("Rejected job transition {} -> {}", current, job.state);
                return Err(OrchestratorError::InvalidStateTransition {
                    job_id: job.id.clone(),
                    from: current.to_string(),
                    to: job.state.to_string(),
                });
            }
        }

        sqlx::query(
            r#"
            INSERT INTO jobs (id, resource_id, resource_type, action, runner_id, state, error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                runner_id = excluded.runner_id,
                state = excluded.state,
                error = excluded.error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&job.id)
        .bind(&job.resource_id)
        .bind(job.resource_type)
        .bind(job.action)
        .bind(&job.runner_id)
        .bind(job.state)
        .bind(&job.error)
        .bind(job.created_at.timestamp_millis())
        .bind(now_millis())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Most recent job matching `filter`.
    pub async fn find(&self, filter: &JobFilter) -> Result<Job> {
        self.find_optional(filter).await?.ok_or_else(|| {
            OrchestratorError::JobNotFound(
                filter
                    .id
                    .clone()
                    .or_else(|| filter.resource_id.clone())
                    .unwrap_or_default(),
            )
        })
    }

    pub async fn find_optional(&self, filter: &JobFilter) -> Result<Option<Job>> {
        Ok(self.query(filter, Some(1)).await?.into_iter().next())
    }

    /// All jobs matching `filter`, newest first.
    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.query(filter, None).await
    }

    async fn query(&self, filter: &JobFilter, limit: Option<i64>) -> Result<Vec<Job>> {
        let mut query = "SELECT * FROM jobs WHERE 1=1".to_string();

        if filter.id.is_some() {
            query.push_str(" AND id = ?");
        }
        if filter.resource_id.is_some() {
            query.push_str(" AND resource_id = ?");
        }
        if filter.resource_type.is_some() {
            query.push_str(" AND resource_type = ?");
        }
        if filter.action.is_some() {
            query.push_str(" AND action = ?");
        }
        if let Some(states) = &filter.states {
            if states.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders = vec!["?"; states.len()].join(", ");
            query.push_str(&format!(" AND state IN ({})", placeholders));
        }

        // rowid breaks ties between jobs created in the same millisecond.
        query.push_str(" ORDER BY created_at DESC, rowid DESC");
        if limit.is_some() {
            query.push_str(" LIMIT ?");
        }

        let mut q = sqlx::query_as::<_, JobRow>(&query);

        if let Some(id) = &filter.id {
            q = q.bind(id);
        }
        if let Some(resource_id) = &filter.resource_id {
            q = q.bind(resource_id);
        }
        if let Some(resource_type) = filter.resource_type {
            q = q.bind(resource_type);
        }
        if let Some(action) = filter.action {
            q = q.bind(action);
        }
        for state in filter.states.iter().flatten() {
            q = q.bind(*state);
        }
        if let Some(limit) = limit {
            q = q.bind(limit);
        }

        let rows = q.fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(Job::from).collect())
    }

    /// Move a pending job to `running` for `runner_id`.
    ///
    /// Returns `false` when another runner got there first, the job is
    /// addressed to a different runner, or the same resource already has a
    /// running job.
    #[instrument(skip(self))]
    pub async fn claim(&self, job_id: &str, runner_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET state = ?, runner_id = ?, updated_at = ?
            WHERE id = ?
              AND state = ?
              AND (runner_id IS NULL OR runner_id = ?)
              AND NOT EXISTS (
                  SELECT 1 FROM jobs AS other
                  WHERE other.resource_id = jobs.resource_id AND other.state = ?
              )
            "#,
        )
        .bind(JobState::Running)
        .bind(runner_id)
        .bind(now_millis())
        .bind(job_id)
        .bind(JobState::Pending)
        .bind(runner_id)
        .bind(JobState::Running)
        .execute(&self.pool)
        .await?;

        let claimed = result.rows_affected() == 1;
        debug!("Claim of job {} by {}: {}", job_id, runner_id, claimed);
        Ok(claimed)
    }

    /// Refresh `updated_at` on every job `runner_id` is running.
    pub async fn heartbeat(&self, runner_id: &str) -> Result<u64> {
        let result = sqlx::query("UPDATE jobs SET updated_at = ? WHERE state = ? AND runner_id = ?")
            .bind(now_millis())
            .bind(JobState::Running)
            .bind(runner_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Fail every job still marked as running by `runner_id`.
    ///
    /// Called when a runner starts: nothing it claimed before is still
    /// executing, and each of those jobs would otherwise block its resource.
    #[instrument(skip(self))]
    pub async fn abandon_runner(&self, runner_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE jobs SET state = ?, error = ?, updated_at = ? WHERE state = ? AND runner_id = ?",
        )
        .bind(JobState::Error)
        .bind(format!("abandoned: runner {} restarted", runner_id))
        .bind(now_millis())
        .bind(JobState::Running)
        .bind(runner_id)
        .execute(&self.pool)
        .await?;

        let abandoned = result.rows_affected();
        if abandoned > 0 {
            warn!("Abandoned {} running jobs of runner {}", abandoned, runner_id);
        }
        Ok(abandoned)
    }

    /// Fail running jobs whose last heartbeat is older than `lease`.
    #[instrument(skip(self))]
    pub async fn expire_running(&self, lease: std::time::Duration) -> Result<u64> {
        let lease_millis = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_millis().saturating_sub(lease_millis);
        let result = sqlx::query(
            "UPDATE jobs SET state = ?, error = ?, updated_at = ? WHERE state = ? AND updated_at < ?",
        )
        .bind(JobState::Error)
        .bind(format!("expired: no heartbeat for {} seconds", lease.as_secs()))
        .bind(now_millis())
        .bind(JobState::Running)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let expired = result.rows_affected();
        if expired > 0 {
            warn!("Expired {} running jobs past their lease", expired);
        }
        Ok(expired)
    }

    /// Finish a job: `success` when `error` is `None`, otherwise `error`.
    #[instrument(skip(self, error))]
    pub async fn complete(&self, job_id: &str, error: Option<String>) -> Result<Job> {
        let mut job = self
            .find(&JobFilter {
                id: Some(job_id.to_string()),
                ..Default::default()
            })
            .await?;
        job.state = if error.is_some() {
            JobState::Error
        } else {
            JobState::Success
        };
        job.error = error;
        self.save(&job).await?;
        job.updated_at = Utc::now();
        Ok(job)
    }
}

#[async_trait]
impl JobScheduler for JobStore {
    async fn create_job(
        &self,
        resource_id: &str,
        resource_type: ResourceType,
        runner_id: Option<&str>,
        action: JobAction,
    ) -> anyhow::Result<()> {
        let job = Job::new(resource_id, resource_type, action, runner_id.map(str::to_string));
        self.save(&job).await?;
        debug!("Enqueued {} job {} for {}", action, job.id, resource_id);
        Ok(())
    }
}

// Internal row type for sqlx
#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    resource_id: String,
    resource_type: ResourceType,
    action: JobAction,
    runner_id: Option<String>,
    state: JobState,
    error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Self {
            id: row.id,
            resource_id: row.resource_id,
            resource_type: row.resource_type,
            action: row.action,
            runner_id: row.runner_id,
            state: row.state,
            error: row.error,
            created_at: DateTime::from_timestamp_millis(row.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(row.updated_at).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use JobState::*;

        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Error));
        assert!(Running.can_transition_to(Success));
        assert!(Running.can_transition_to(Running));

        assert!(!Running.can_transition_to(Pending));
        assert!(!Success.can_transition_to(Error));
        assert!(!Error.can_transition_to(Running));
        assert!(!Success.can_transition_to(Success));
        assert!(!Error.can_transition_to(Error));
    }
}
