//! Workspace rows and their live metadata.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, instrument};
use ws_core::{BuildConfig, GitRepository, Workspace};

use crate::db::now_millis;
use crate::error::{OrchestratorError, Result};

/// A stored workspace plus bookkeeping columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceRecord {
    pub workspace: Workspace,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct WorkspaceStore {
    pool: SqlitePool,
}

impl WorkspaceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a new workspace.
    ///
    /// An active workspace with the same name, or any row with the same id,
    /// yields `AlreadyExists`.
    #[instrument(skip(self, workspace), fields(workspace_id = %workspace.id, name = %workspace.name))]
    pub async fn insert(&self, workspace: &Workspace) -> Result<()> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO workspaces (id, name, image, user, repository, target_id, build_config, env_vars, labels, api_key, git_provider_config_id, deleted, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(&workspace.id)
        .bind(&workspace.name)
        .bind(&workspace.image)
        .bind(&workspace.user)
        .bind(serde_json::to_string(&workspace.repository)?)
        .bind(&workspace.target_id)
        .bind(
            workspace
                .build_config
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(serde_json::to_string(&workspace.env_vars)?)
        .bind(serde_json::to_string(&workspace.labels)?)
        .bind(&workspace.api_key)
        .bind(&workspace.git_provider_config_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(OrchestratorError::AlreadyExists(workspace.name.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Look a workspace up by id, then by name.
    ///
    /// Active rows win over soft-deleted ones. A match that only exists as a
    /// tombstone is returned when `include_deleted` is set and reported as
    /// `Deleted` otherwise.
    pub async fn find(&self, id_or_name: &str, include_deleted: bool) -> Result<WorkspaceRecord> {
        let row = sqlx::query_as::<_, WorkspaceRow>(
            r#"
            SELECT * FROM workspaces
            WHERE id = ? OR name = ?
            ORDER BY deleted ASC, (id = ?) DESC, created_at DESC
            LIMIT 1
            "#,
        )
        .bind(id_or_name)
        .bind(id_or_name)
        .bind(id_or_name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(id_or_name.to_string()))?;

        let record = WorkspaceRecord::try_from(row)?;
        if record.deleted && !include_deleted {
            return Err(OrchestratorError::Deleted(id_or_name.to_string()));
        }
        Ok(record)
    }

    /// Workspaces ordered by creation, tombstones only when `include_deleted`.
    pub async fn list(&self, include_deleted: bool) -> Result<Vec<WorkspaceRecord>> {
        let mut query = "SELECT * FROM workspaces WHERE 1=1".to_string();
        if !include_deleted {
            query.push_str(" AND deleted = 0");
        }
        query.push_str(" ORDER BY created_at ASC, rowid ASC");

        let rows = sqlx::query_as::<_, WorkspaceRow>(&query)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(WorkspaceRecord::try_from).collect()
    }

    pub async fn active_names(&self) -> Result<Vec<String>> {
        let names = sqlx::query_scalar("SELECT name FROM workspaces WHERE deleted = 0")
            .fetch_all(&self.pool)
            .await?;
        Ok(names)
    }

    pub async fn name_in_use(&self, name: &str) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM workspaces WHERE name = ? AND deleted = 0")
                .bind(name)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    /// Replace the label map of an active workspace.
    #[instrument(skip(self, labels))]
    pub async fn update_labels(&self, id: &str, labels: &HashMap<String, String>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE workspaces SET labels = ?, updated_at = ? WHERE id = ? AND deleted = 0",
        )
        .bind(serde_json::to_string(labels)?)
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Soft delete: the row stays but stops reserving its name.
    #[instrument(skip(self))]
    pub async fn mark_deleted(&self, id: &str) -> Result<()> {
        let result =
            sqlx::query("UPDATE workspaces SET deleted = 1, updated_at = ? WHERE id = ?")
                .bind(now_millis())
                .bind(id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Remove the row for good. Missing rows are not an error.
    #[instrument(skip(self))]
    pub async fn purge(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM workspaces WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        debug!("Purged {} workspace rows for {}", result.rows_affected(), id);
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStatus {
    pub name: String,
    #[serde(default)]
    pub staging: String,
    #[serde(default)]
    pub worktree: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitStatus {
    pub current_branch: String,
    #[serde(default)]
    pub files: Vec<FileStatus>,
    #[serde(default)]
    pub branch_published: bool,
    #[serde(default)]
    pub ahead: u32,
    #[serde(default)]
    pub behind: u32,
}

/// Live state pushed by the agent running inside a workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceMetadata {
    pub uptime: u64,
    #[serde(default)]
    pub git_status: Option<GitStatus>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Metadata lives in its own table so agent pushes never touch workspace rows.
#[derive(Clone)]
pub struct WorkspaceMetadataStore {
    pool: SqlitePool,
}

impl WorkspaceMetadataStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find(&self, workspace_id: &str) -> Result<Option<WorkspaceMetadata>> {
        let row = sqlx::query_as::<_, MetadataRow>(
            "SELECT * FROM workspace_metadata WHERE workspace_id = ?",
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkspaceMetadata::try_from).transpose()
    }

    /// Upsert; the stored `updated_at` is always the time of this write.
    #[instrument(skip(self, metadata))]
    pub async fn save(
        &self,
        workspace_id: &str,
        metadata: &WorkspaceMetadata,
    ) -> Result<WorkspaceMetadata> {
        let now = now_millis();
        sqlx::query(
            r#"
            INSERT INTO workspace_metadata (workspace_id, uptime, git_status, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(workspace_id) DO UPDATE SET
                uptime = excluded.uptime,
                git_status = excluded.git_status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(workspace_id)
        .bind(i64::try_from(metadata.uptime).unwrap_or(i64::MAX))
        .bind(
            metadata
                .git_status
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(WorkspaceMetadata {
            updated_at: DateTime::from_timestamp_millis(now),
            ..metadata.clone()
        })
    }

    pub async fn delete(&self, workspace_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM workspace_metadata WHERE workspace_id = ?")
            .bind(workspace_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// Internal row types for sqlx
#[derive(sqlx::FromRow)]
struct WorkspaceRow {
    id: String,
    name: String,
    image: String,
    user: String,
    repository: String,
    target_id: String,
    build_config: Option<String>,
    env_vars: String,
    labels: String,
    api_key: String,
    git_provider_config_id: Option<String>,
    deleted: bool,
    created_at: i64,
    updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct MetadataRow {
    #[allow(dead_code)]
    workspace_id: String,
    uptime: i64,
    git_status: Option<String>,
    updated_at: i64,
}

impl TryFrom<WorkspaceRow> for WorkspaceRecord {
    type Error = OrchestratorError;

    fn try_from(row: WorkspaceRow) -> Result<Self> {
        let repository: GitRepository = serde_json::from_str(&row.repository)?;
        let build_config: Option<BuildConfig> = row
            .build_config
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Self {
            workspace: Workspace {
                id: row.id,
                name: row.name,
                image: row.image,
                user: row.user,
                repository,
                target_id: row.target_id,
                build_config,
                env_vars: serde_json::from_str(&row.env_vars)?,
                labels: serde_json::from_str(&row.labels)?,
                api_key: row.api_key,
                git_provider_config_id: row.git_provider_config_id,
            },
            deleted: row.deleted,
            created_at: DateTime::from_timestamp_millis(row.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(row.updated_at).unwrap_or_default(),
        })
    }
}

impl TryFrom<MetadataRow> for WorkspaceMetadata {
    type Error = OrchestratorError;

    fn try_from(row: MetadataRow) -> Result<Self> {
        Ok(Self {
            uptime: u64::try_from(row.uptime).unwrap_or_default(),
            git_status: row
                .git_status
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            updated_at: DateTime::from_timestamp_millis(row.updated_at),
        })
    }
}
