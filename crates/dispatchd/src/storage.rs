//! SQLite storage for the dispatch daemon.
//!
//! Persists execution log entries and app profiles. Every mutation is a
//! single statement or transaction, so concurrent writers never clobber each
//! other's rows.

use chrono::{DateTime, Utc};
use dispatch_core::{AppProfile, ExecutionLogEntry, Id, LogStatus};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Schema applied at startup. Statements are idempotent.
const SCHEMA: &str = r"
-- Execution log. seq gives a stable insertion order for eviction and listing.
CREATE TABLE IF NOT EXISTS execution_logs (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    project_id TEXT NOT NULL,
    project_name TEXT NOT NULL,
    script_name TEXT NOT NULL,
    script_path TEXT NOT NULL,
    script_content TEXT NOT NULL,
    command TEXT NOT NULL,
    variables_json TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    output TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_execution_logs_project ON execution_logs (project_id, seq);

CREATE TABLE IF NOT EXISTS app_profiles (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    app_name TEXT NOT NULL,
    description TEXT NOT NULL,
    token_id TEXT NOT NULL,
    token_secret TEXT NOT NULL,
    workspace TEXT NOT NULL,
    suffix TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
";

const LOG_COLUMNS: &str = "id, project_id, project_name, script_name, script_path, \
    script_content, command, variables_json, start_time, end_time, status, output";

const APP_COLUMNS: &str = "id, name, app_name, description, token_id, token_secret, \
    workspace, suffix, created_at, updated_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("execution log not found: {0}")]
    LogNotFound(String),
    #[error("app profile not found: {0}")]
    AppNotFound(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage backend for the daemon.
#[derive(Debug)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Open (or create) the database at the given path.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Create tables and indexes if missing.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let cleaned: String = SCHEMA
            .lines()
            .filter(|line| !line.trim().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n");

        for statement in cleaned.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed).execute(&self.pool).await?;
            }
        }
        Ok(())
    }

    // --- Execution log ---

    /// Insert a log entry and evict everything beyond the newest `retention`
    /// rows, in one transaction. Returns the number of evicted rows.
    pub async fn insert_log(&self, entry: &ExecutionLogEntry, retention: usize) -> Result<u64> {
        let variables_json = serde_json::to_string(&entry.variables)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            INSERT INTO execution_logs (id, project_id, project_name, script_name, script_path,
                                        script_content, command, variables_json, start_time,
                                        end_time, status, output)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ",
        )
        .bind(entry.id.as_ref())
        .bind(&entry.project_id)
        .bind(&entry.project_name)
        .bind(&entry.script_name)
        .bind(&entry.script_path)
        .bind(&entry.script_content)
        .bind(&entry.command)
        .bind(&variables_json)
        .bind(entry.start_time)
        .bind(entry.end_time)
        .bind(entry.status.as_str())
        .bind(&entry.output)
        .execute(&mut *tx)
        .await?;

        let evicted = sqlx::query(
            "DELETE FROM execution_logs WHERE seq NOT IN \
             (SELECT seq FROM execution_logs ORDER BY seq DESC LIMIT ?1)",
        )
        .bind(retention.max(1) as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(evicted)
    }

    /// Set the terminal fields of a log entry.
    pub async fn finish_log(
        &self,
        id: &Id,
        status: LogStatus,
        output: &str,
        end_time: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE execution_logs SET status = ?1, output = ?2, end_time = ?3 WHERE id = ?4",
        )
        .bind(status.as_str())
        .bind(output)
        .bind(end_time)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::LogNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn get_log(&self, id: &Id) -> Result<ExecutionLogEntry> {
        let query = format!("SELECT {LOG_COLUMNS} FROM execution_logs WHERE id = ?1");
        let row = sqlx::query_as::<_, LogRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::LogNotFound(id.to_string()))?;

        row.into_entry()
    }

    /// List entries newest first, optionally filtered by project.
    pub async fn list_logs(
        &self,
        project_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<ExecutionLogEntry>> {
        // SQLite treats a negative LIMIT as unbounded.
        let limit = limit.map_or(-1, |l| l as i64);
        let rows = match project_id {
            Some(project) => {
                let query = format!(
                    "SELECT {LOG_COLUMNS} FROM execution_logs WHERE project_id = ?1 \
                     ORDER BY seq DESC LIMIT ?2"
                );
                sqlx::query_as::<_, LogRow>(&query)
                    .bind(project)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query =
                    format!("SELECT {LOG_COLUMNS} FROM execution_logs ORDER BY seq DESC LIMIT ?1");
                sqlx::query_as::<_, LogRow>(&query)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter().map(LogRow::into_entry).collect()
    }

    /// Delete one entry. Returns whether it existed.
    pub async fn delete_log(&self, id: &Id) -> Result<bool> {
        let result = sqlx::query("DELETE FROM execution_logs WHERE id = ?1")
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete all entries, or only those of one project.
    pub async fn clear_logs(&self, project_id: Option<&str>) -> Result<u64> {
        let result = match project_id {
            Some(project) => {
                sqlx::query("DELETE FROM execution_logs WHERE project_id = ?1")
                    .bind(project)
                    .execute(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("DELETE FROM execution_logs")
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected())
    }

    pub async fn count_logs(&self) -> Result<usize> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM execution_logs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0 as usize)
    }

    // --- App profiles ---

    pub async fn insert_app(&self, app: &AppProfile) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO app_profiles (id, name, app_name, description, token_id, token_secret,
                                      workspace, suffix, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
        )
        .bind(app.id.as_ref())
        .bind(&app.name)
        .bind(&app.app_name)
        .bind(&app.description)
        .bind(&app.token_id)
        .bind(&app.token_secret)
        .bind(&app.workspace)
        .bind(&app.suffix)
        .bind(app.created_at.timestamp_millis())
        .bind(app.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_app(&self, id: &Id) -> Result<AppProfile> {
        let query = format!("SELECT {APP_COLUMNS} FROM app_profiles WHERE id = ?1");
        let row = sqlx::query_as::<_, AppRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::AppNotFound(id.to_string()))?;
        Ok(row.into_app())
    }

    pub async fn list_apps(&self) -> Result<Vec<AppProfile>> {
        let query = format!("SELECT {APP_COLUMNS} FROM app_profiles ORDER BY created_at ASC");
        let rows = sqlx::query_as::<_, AppRow>(&query)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(AppRow::into_app).collect())
    }

    /// Replace the mutable fields of a profile and bump `updated_at`.
    pub async fn update_app(&self, app: &AppProfile) -> Result<AppProfile> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE app_profiles SET name = ?1, app_name = ?2, description = ?3, token_id = ?4, \
             token_secret = ?5, workspace = ?6, suffix = ?7, updated_at = ?8 WHERE id = ?9",
        )
        .bind(&app.name)
        .bind(&app.app_name)
        .bind(&app.description)
        .bind(&app.token_id)
        .bind(&app.token_secret)
        .bind(&app.workspace)
        .bind(&app.suffix)
        .bind(now.timestamp_millis())
        .bind(app.id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::AppNotFound(app.id.to_string()));
        }
        self.get_app(&app.id).await
    }

    pub async fn delete_app(&self, id: &Id) -> Result<()> {
        let result = sqlx::query("DELETE FROM app_profiles WHERE id = ?1")
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::AppNotFound(id.to_string()));
        }
        Ok(())
    }
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct LogRow {
    id: String,
    project_id: String,
    project_name: String,
    script_name: String,
    script_path: String,
    script_content: String,
    command: String,
    variables_json: String,
    start_time: i64,
    end_time: i64,
    status: String,
    output: String,
}

impl LogRow {
    fn into_entry(self) -> Result<ExecutionLogEntry> {
        let variables: BTreeMap<String, String> = serde_json::from_str(&self.variables_json)?;
        Ok(ExecutionLogEntry {
            id: Id::from_string(self.id),
            project_id: self.project_id,
            project_name: self.project_name,
            script_name: self.script_name,
            script_path: self.script_path,
            script_content: self.script_content,
            command: self.command,
            variables,
            start_time: self.start_time,
            end_time: self.end_time,
            status: LogStatus::parse(&self.status).unwrap_or(LogStatus::Failed),
            output: self.output,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AppRow {
    id: String,
    name: String,
    app_name: String,
    description: String,
    token_id: String,
    token_secret: String,
    workspace: String,
    suffix: String,
    created_at: i64,
    updated_at: i64,
}

impl AppRow {
    fn into_app(self) -> AppProfile {
        AppProfile {
            id: Id::from_string(self.id),
            name: self.name,
            app_name: self.app_name,
            description: self.description,
            token_id: self.token_id,
            token_secret: self.token_secret,
            workspace: self.workspace,
            suffix: self.suffix,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        }
    }
}
