use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use log::{debug, error, info};

use crate::error::{Result, SubwardenError};

/// Job lifecycle states. `Succeeded`, `Failed` and `Cancelled` are terminal;
/// a job never leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Running,
    Cancelling,
    Cancelled,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Cancelling => "CANCELLING",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: String,
    pub owner_user_id: String,
    pub folder: String,
    pub language: String,
    pub log_level: String,
    pub retry_of_job_id: Option<String>,
    pub broker_task_id: Option<String>,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub result_message: Option<String>,
    pub log_snippet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_logs: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: String,
    pub owner_user_id: String,
    pub folder: String,
    pub language: String,
    pub log_level: String,
    pub retry_of_job_id: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub email: String,
    pub role: String,
    pub is_superuser: bool,
    pub is_service_account: bool,
    pub api_token: Option<String>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == "admin" || self.is_superuser
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoragePath {
    pub id: String,
    pub path: String,
    pub label: Option<String>,
}

/// Optional overrides stored in the app_settings singleton row. Fields left
/// NULL fall through to the environment values.
#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct SettingOverrides {
    pub job_timeout_sec: Option<i64>,
    pub terminate_grace_period_s: Option<i64>,
    pub result_message_max_len: Option<i64>,
    pub log_snippet_max_len: Option<i64>,
    pub allowed_media_folders: Option<String>,
    pub deepl_api_keys: Option<String>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id              TEXT PRIMARY KEY,
    owner_user_id   TEXT NOT NULL,
    folder          TEXT NOT NULL,
    language        TEXT NOT NULL,
    log_level       TEXT NOT NULL DEFAULT 'info',
    retry_of_job_id TEXT,
    broker_task_id  TEXT,
    status          TEXT NOT NULL,
    submitted_at    TEXT NOT NULL,
    started_at      TEXT,
    completed_at    TEXT,
    exit_code       INTEGER,
    result_message  TEXT,
    log_snippet     TEXT,
    full_logs       TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs(owner_user_id, submitted_at DESC);

CREATE TABLE IF NOT EXISTS users (
    id                 TEXT PRIMARY KEY,
    email              TEXT NOT NULL UNIQUE,
    role               TEXT NOT NULL DEFAULT 'user',
    is_superuser       INTEGER NOT NULL DEFAULT 0,
    is_service_account INTEGER NOT NULL DEFAULT 0,
    api_token          TEXT UNIQUE
);

CREATE TABLE IF NOT EXISTS storage_paths (
    id    TEXT PRIMARY KEY,
    path  TEXT NOT NULL UNIQUE,
    label TEXT
);

CREATE TABLE IF NOT EXISTS stream_tokens (
    token      TEXT PRIMARY KEY,
    user_id    TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS app_settings (
    id                       INTEGER PRIMARY KEY CHECK (id = 1),
    webhook_secret           TEXT,
    job_timeout_sec          INTEGER,
    terminate_grace_period_s INTEGER,
    result_message_max_len   INTEGER,
    log_snippet_max_len      INTEGER,
    allowed_media_folders    TEXT,
    deepl_api_keys           TEXT
);
"#;

#[derive(Clone)]
pub struct JobDatabase {
    pool: SqlitePool,
}

impl JobDatabase {
    pub async fn new(database_url: &str) -> Result<Self> {
        info!("Initializing job database connection: {}", database_url);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| {
                SubwardenError::Database(format!("Failed to connect to database: {}", e))
            })?;

        let database = Self { pool };
        database.ensure_schema().await?;
        info!("Job database initialized successfully");
        Ok(database)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| SubwardenError::Database(format!("Failed to create schema: {}", e)))?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| SubwardenError::Database(format!("Health check failed: {}", e)))?;
        Ok(())
    }

    // ---- jobs ----

    pub async fn insert_job(&self, new_job: &NewJob) -> Result<Job> {
        debug!("Creating job: {}", new_job.id);

        sqlx::query(
            r#"
            INSERT INTO jobs (id, owner_user_id, folder, language, log_level,
                              retry_of_job_id, status, submitted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&new_job.id)
        .bind(&new_job.owner_user_id)
        .bind(&new_job.folder)
        .bind(&new_job.language)
        .bind(&new_job.log_level)
        .bind(&new_job.retry_of_job_id)
        .bind(JobStatus::Pending)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to insert job {}: {}", new_job.id, e);
            SubwardenError::Database(format!("Failed to insert job: {}", e))
        })?;

        self.get_job(&new_job.id).await?.ok_or_else(|| {
            SubwardenError::Database(format!("Job {} vanished after insert", new_job.id))
        })
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SubwardenError::Database(format!("Failed to get job: {}", e)))?;
        Ok(job)
    }

    pub async fn list_jobs_for_owner(
        &self,
        user_id: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM jobs WHERE owner_user_id = ?
            ORDER BY submitted_at DESC LIMIT ? OFFSET ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SubwardenError::Database(format!("Failed to list jobs: {}", e)))?;
        Ok(jobs)
    }

    pub async fn list_jobs(&self, offset: i64, limit: i64) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs ORDER BY submitted_at DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SubwardenError::Database(format!("Failed to list jobs: {}", e)))?;
        Ok(jobs)
    }

    /// Record the broker task handle at dispatch time.
    pub async fn set_broker_task_id(&self, job_id: &str, broker_task_id: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET broker_task_id = ? WHERE id = ?")
            .bind(broker_task_id)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| SubwardenError::Database(format!("Failed to set broker task id: {}", e)))?;
        Ok(())
    }

    /// Transition PENDING → RUNNING, recording the broker task handle and
    /// start time. Returns false when the job was not PENDING (duplicate
    /// delivery, or cancelled while queued); the caller decides what to do.
    pub async fn update_job_start_details(
        &self,
        job_id: &str,
        broker_task_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = ?, broker_task_id = ?, started_at = ?
            WHERE id = ? AND status = 'PENDING'
            "#,
        )
        .bind(JobStatus::Running)
        .bind(broker_task_id)
        .bind(started_at)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to update start details for job {}: {}", job_id, e);
            SubwardenError::Database(format!("Failed to update job start details: {}", e))
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Transition PENDING|RUNNING → CANCELLING. Returns false if the job was
    /// in any other state.
    pub async fn mark_job_cancelling(&self, job_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = ?
            WHERE id = ? AND status IN ('PENDING', 'RUNNING')
            "#,
        )
        .bind(JobStatus::Cancelling)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| SubwardenError::Database(format!("Failed to mark job cancelling: {}", e)))?;
        Ok(result.rows_affected() > 0)
    }

    /// Write the terminal state exactly once. Guarded so an already-terminal
    /// row is never overwritten; returns false when the guard rejected the
    /// write (row raced by another writer).
    #[allow(clippy::too_many_arguments)]
    pub async fn update_job_completion_details(
        &self,
        job_id: &str,
        status: JobStatus,
        exit_code: i64,
        completed_at: DateTime<Utc>,
        result_message: &str,
        log_snippet: &str,
        full_logs: Option<&str>,
    ) -> Result<bool> {
        debug!("Updating job {} to terminal status {}", job_id, status);

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, exit_code = ?, completed_at = ?,
                result_message = ?, log_snippet = ?, full_logs = ?,
                started_at = COALESCE(started_at, submitted_at)
            WHERE id = ? AND status NOT IN ('SUCCEEDED', 'FAILED', 'CANCELLED')
            "#,
        )
        .bind(status)
        .bind(exit_code)
        .bind(completed_at)
        .bind(result_message)
        .bind(log_snippet)
        .bind(full_logs)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to update completion details for job {}: {}", job_id, e);
            SubwardenError::Database(format!("Failed to update job completion details: {}", e))
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Sweep jobs stuck in a non-terminal state (e.g. after an unclean
    /// shutdown) into CANCELLED. Returns the ids that were swept.
    pub async fn cancel_stuck_jobs(&self) -> Result<Vec<String>> {
        let stuck: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM jobs WHERE status IN ('PENDING', 'RUNNING', 'CANCELLING')",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SubwardenError::Database(format!("Failed to list stuck jobs: {}", e)))?;

        let mut cancelled = Vec::new();
        for (job_id,) in stuck {
            let updated = self
                .update_job_completion_details(
                    &job_id,
                    JobStatus::Cancelled,
                    -15,
                    Utc::now(),
                    "Stuck job cancelled",
                    "",
                    None,
                )
                .await?;
            if updated {
                cancelled.push(job_id);
            }
        }
        Ok(cancelled)
    }

    // ---- users ----

    pub async fn insert_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, email, role, is_superuser, is_service_account, api_token)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&user.id)
        .bind(&user.email)
        .bind(&user.role)
        .bind(user.is_superuser)
        .bind(user.is_service_account)
        .bind(&user.api_token)
        .execute(&self.pool)
        .await
        .map_err(|e| SubwardenError::Database(format!("Failed to insert user: {}", e)))?;
        Ok(())
    }

    pub async fn count_users(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SubwardenError::Database(format!("Failed to count users: {}", e)))?;
        Ok(count)
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SubwardenError::Database(format!("Failed to get user: {}", e)))?;
        Ok(user)
    }

    pub async fn get_user_by_token(&self, api_token: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE api_token = ?")
            .bind(api_token)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SubwardenError::Database(format!("Failed to look up token: {}", e)))?;
        Ok(user)
    }

    /// The principal webhook-created jobs are attributed to: the designated
    /// service account if present, else the first superuser.
    pub async fn get_service_account(&self) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT * FROM users
            ORDER BY is_service_account DESC, is_superuser DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SubwardenError::Database(format!("Failed to get service account: {}", e)))?;
        Ok(user.filter(|u| u.is_service_account || u.is_superuser))
    }

    // ---- storage paths ----

    pub async fn list_storage_paths(&self) -> Result<Vec<StoragePath>> {
        let paths = sqlx::query_as::<_, StoragePath>("SELECT * FROM storage_paths ORDER BY path")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SubwardenError::Database(format!("Failed to list storage paths: {}", e)))?;
        Ok(paths)
    }

    pub async fn insert_storage_path(&self, path: &str, label: Option<&str>) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO storage_paths (id, path, label) VALUES (?, ?, ?)")
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(path)
            .bind(label)
            .execute(&self.pool)
            .await
            .map_err(|e| SubwardenError::Database(format!("Failed to insert storage path: {}", e)))?;
        Ok(())
    }

    // ---- stream tokens ----

    pub async fn insert_stream_token(
        &self,
        token: &str,
        user_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        // Opportunistic purge keeps the table from growing unbounded.
        sqlx::query("DELETE FROM stream_tokens WHERE expires_at < ?")
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| SubwardenError::Database(format!("Failed to purge stream tokens: {}", e)))?;

        sqlx::query("INSERT INTO stream_tokens (token, user_id, expires_at) VALUES (?, ?, ?)")
            .bind(token)
            .bind(user_id)
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(|e| SubwardenError::Database(format!("Failed to insert stream token: {}", e)))?;
        Ok(())
    }

    /// Resolve a short-lived stream token to its user. Expired tokens
    /// resolve to None.
    pub async fn resolve_stream_token(&self, token: &str) -> Result<Option<User>> {
        let row: Option<(String, DateTime<Utc>)> =
            sqlx::query_as("SELECT user_id, expires_at FROM stream_tokens WHERE token = ?")
                .bind(token)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    SubwardenError::Database(format!("Failed to resolve stream token: {}", e))
                })?;

        match row {
            Some((user_id, expires_at)) if expires_at > Utc::now() => self.get_user(&user_id).await,
            _ => Ok(None),
        }
    }

    // ---- app settings ----

    pub async fn get_setting_overrides(&self) -> Result<SettingOverrides> {
        let row = sqlx::query_as::<_, SettingOverrides>(
            r#"
            SELECT job_timeout_sec, terminate_grace_period_s, result_message_max_len,
                   log_snippet_max_len, allowed_media_folders, deepl_api_keys
            FROM app_settings WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SubwardenError::Database(format!("Failed to read app settings: {}", e)))?;
        Ok(row.unwrap_or_default())
    }

    pub async fn get_webhook_secret(&self) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT webhook_secret FROM app_settings WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    SubwardenError::Database(format!("Failed to read webhook secret: {}", e))
                })?;
        Ok(row.and_then(|(secret,)| secret))
    }

    pub async fn set_webhook_secret(&self, secret: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO app_settings (id, webhook_secret) VALUES (1, ?)
            ON CONFLICT(id) DO UPDATE SET webhook_secret = excluded.webhook_secret
            "#,
        )
        .bind(secret)
        .execute(&self.pool)
        .await
        .map_err(|e| SubwardenError::Database(format!("Failed to set webhook secret: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Temp-file backed database for tests. The TempDir must outlive the
    /// pool, so it is returned alongside.
    pub async fn temp_database() -> (JobDatabase, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}/test.db?mode=rwc", dir.path().display());
        let database = JobDatabase::new(&url).await.expect("database");
        (database, dir)
    }

    pub fn test_user(role: &str, is_superuser: bool) -> User {
        let id = uuid::Uuid::new_v4().to_string();
        User {
            api_token: Some(format!("token-{}", id)),
            email: format!("{}@example.com", id),
            id,
            role: role.to_string(),
            is_superuser,
            is_service_account: false,
        }
    }

    pub fn test_new_job(owner: &User, folder: &str) -> NewJob {
        NewJob {
            id: uuid::Uuid::new_v4().to_string(),
            owner_user_id: owner.id.clone(),
            folder: folder.to_string(),
            language: "ro".to_string(),
            log_level: "info".to_string(),
            retry_of_job_id: None,
        }
    }
}
