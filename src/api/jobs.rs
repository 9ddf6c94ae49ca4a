use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path as FsPath, PathBuf};
use tracing::{error, info, warn};

use crate::auth::{can_cancel_job, can_read_job, constant_time_eq, mint_stream_token, AuthenticatedUser};
use crate::broker::JobPayload;
use crate::database::{Job, JobStatus, NewJob, User};
use crate::error::{Result, SubwardenError};
use crate::state::AppState;

const VALID_LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub folder: String,
    pub language: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListJobsParams {
    #[serde(default)]
    pub offset: i64,
    pub limit: Option<i64>,
    /// Admin-only owner filter; ignored for regular users.
    pub owner: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StreamTokenResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

pub async fn create_job(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Json(request): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<Job>)> {
    let job = submit_job(&state, &user, &request).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// Trusted-caller intake: shared secret in `X-Webhook-Secret`, compared in
/// constant time; the created job is attributed to the designated service
/// account. No user session is involved.
pub async fn webhook_create_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<Job>)> {
    let provided = headers
        .get("X-Webhook-Secret")
        .and_then(|value| value.to_str().ok())
        .ok_or(SubwardenError::Unauthorized)?;

    let expected = state
        .database
        .get_webhook_secret()
        .await?
        .ok_or_else(|| SubwardenError::Internal("Webhook secret not configured".to_string()))?;

    if !constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
        warn!("Webhook request rejected: secret mismatch");
        return Err(SubwardenError::Unauthorized);
    }

    let service_account = state.database.get_service_account().await?.ok_or_else(|| {
        SubwardenError::Internal("No service account configured for webhook jobs".to_string())
    })?;

    info!("Webhook job accepted, attributed to {}", service_account.email);
    let job = submit_job(&state, &service_account, &request).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

pub async fn list_jobs(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Query(params): Query<ListJobsParams>,
) -> Result<Json<Vec<Job>>> {
    let offset = params.offset.max(0);
    let limit = params.limit.unwrap_or(50).clamp(1, 200);

    let jobs = if user.is_admin() {
        match &params.owner {
            Some(owner) => state.database.list_jobs_for_owner(owner, offset, limit).await?,
            None => state.database.list_jobs(offset, limit).await?,
        }
    } else {
        state
            .database
            .list_jobs_for_owner(&user.id, offset, limit)
            .await?
    };
    Ok(Json(jobs))
}

pub async fn get_job(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Path(job_id): Path<String>,
) -> Result<Json<Job>> {
    let job = load_job(&state, &job_id).await?;
    if !can_read_job(&user, &job) {
        return Err(SubwardenError::Forbidden(
            "Forbidden to access this job".to_string(),
        ));
    }
    Ok(Json(job))
}

/// Cancel is permitted only from PENDING or RUNNING. The API transitions to
/// CANCELLING and revokes the broker task; the supervisor completes the
/// transition to CANCELLED.
pub async fn cancel_job(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Path(job_id): Path<String>,
) -> Result<Json<Job>> {
    let job = load_job(&state, &job_id).await?;
    if !can_cancel_job(&user, &job) {
        return Err(SubwardenError::Forbidden(
            "Forbidden to cancel this job".to_string(),
        ));
    }

    if !state.database.mark_job_cancelling(&job.id).await? {
        return Err(SubwardenError::JobNotCancellable {
            job_id: job.id,
            current_state: job.status.to_string(),
        });
    }

    if let Some(task_id) = &job.broker_task_id {
        state.broker.revoke(task_id);
    }
    info!("Job {} transitioned to CANCELLING by {}", job.id, user.email);

    let job = load_job(&state, &job_id).await?;
    Ok(Json(job))
}

/// Retry is permitted only from FAILED or CANCELLED and creates a fresh job
/// copying the input fields; the original row is untouched.
pub async fn retry_job(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Path(job_id): Path<String>,
) -> Result<(StatusCode, Json<Job>)> {
    let job = load_job(&state, &job_id).await?;
    if !can_read_job(&user, &job) {
        return Err(SubwardenError::Forbidden(
            "Forbidden to retry this job".to_string(),
        ));
    }
    if !matches!(job.status, JobStatus::Failed | JobStatus::Cancelled) {
        return Err(SubwardenError::JobNotRetriable {
            job_id: job.id,
            current_state: job.status.to_string(),
        });
    }

    let new_job = NewJob {
        id: uuid::Uuid::new_v4().to_string(),
        owner_user_id: job.owner_user_id.clone(),
        folder: job.folder.clone(),
        language: job.language.clone(),
        log_level: job.log_level.clone(),
        retry_of_job_id: Some(job.id.clone()),
    };
    let inserted = state.database.insert_job(&new_job).await?;
    let job = dispatch(&state, inserted).await?;
    info!("Job {} retried as {}", job_id, job.id);
    Ok((StatusCode::CREATED, Json(job)))
}

pub async fn create_stream_token(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
) -> Result<Json<StreamTokenResponse>> {
    let (token, expires_at) = mint_stream_token(&state, &user).await?;
    Ok(Json(StreamTokenResponse { token, expires_at }))
}

pub async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let database = match state.database.health_check().await {
        Ok(()) => "healthy",
        Err(_) => "unhealthy",
    };
    Json(serde_json::json!({
        "status": "healthy",
        "service": "subwarden",
        "database": database,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

// ---- shared helpers ----

async fn load_job(state: &AppState, job_id: &str) -> Result<Job> {
    state
        .database
        .get_job(job_id)
        .await?
        .ok_or_else(|| SubwardenError::JobNotFound {
            job_id: job_id.to_string(),
        })
}

async fn submit_job(state: &AppState, user: &User, request: &CreateJobRequest) -> Result<Job> {
    let folder = validate_folder(state, user, &request.folder).await?;
    let language = validate_language(request.language.as_deref())?;
    let log_level = validate_log_level(request.log_level.as_deref())?;

    let new_job = NewJob {
        id: uuid::Uuid::new_v4().to_string(),
        owner_user_id: user.id.clone(),
        folder: folder.display().to_string(),
        language,
        log_level,
        retry_of_job_id: None,
    };
    // The row is committed before the enqueue so a broker failure can be
    // recorded against it.
    let job = state.database.insert_job(&new_job).await?;
    dispatch(state, job).await
}

async fn dispatch(state: &AppState, job: Job) -> Result<Job> {
    let payload = JobPayload {
        job_id: job.id.clone(),
        folder: job.folder.clone(),
        language: job.language.clone(),
        level: job.log_level.clone(),
    };

    match state.broker.enqueue(payload) {
        Ok(task_id) => {
            state.database.set_broker_task_id(&job.id, &task_id).await?;
            info!("Job {} enqueued as broker task {}", job.id, task_id);
            load_job(state, &job.id).await
        }
        Err(e) => {
            error!("Failed to enqueue job {}: {}", job.id, e);
            let _ = state
                .database
                .update_job_completion_details(
                    &job.id,
                    JobStatus::Failed,
                    -1,
                    Utc::now(),
                    &format!("Failed to enqueue job: {}", e),
                    "",
                    None,
                )
                .await;
            Err(e)
        }
    }
}

/// Folder validation: absolute, existing directory whose canonical form is
/// contained in the allow-list. A superuser submitting a folder outside the
/// allow-list extends it atomically with the call.
async fn validate_folder(state: &AppState, user: &User, raw: &str) -> Result<PathBuf> {
    let folder = raw.trim();
    if folder.is_empty() || !FsPath::new(folder).is_absolute() {
        return Err(SubwardenError::Validation(
            "folder must be an absolute path".to_string(),
        ));
    }

    let canonical = tokio::fs::canonicalize(folder)
        .await
        .map_err(|_| SubwardenError::PathNotFound(folder.to_string()))?;
    let metadata = tokio::fs::metadata(&canonical)
        .await
        .map_err(|_| SubwardenError::PathNotFound(folder.to_string()))?;
    if !metadata.is_dir() {
        return Err(SubwardenError::Validation(format!(
            "folder is not a directory: {}",
            folder
        )));
    }

    let mut allowed: Vec<PathBuf> = state
        .config
        .jobs
        .allowed_media_folders
        .iter()
        .map(PathBuf::from)
        .collect();
    for storage_path in state.database.list_storage_paths().await? {
        allowed.push(PathBuf::from(storage_path.path));
    }

    for entry in &allowed {
        let entry = tokio::fs::canonicalize(entry)
            .await
            .unwrap_or_else(|_| entry.clone());
        if canonical.starts_with(&entry) {
            return Ok(canonical);
        }
    }

    if user.is_superuser {
        // Root submission: superusers may extend the policy domain in the
        // same call.
        state
            .database
            .insert_storage_path(&canonical.display().to_string(), None)
            .await?;
        info!(
            "Superuser {} extended the allow-list with {}",
            user.email,
            canonical.display()
        );
        return Ok(canonical);
    }

    Err(SubwardenError::UnauthorizedPath(folder.to_string()))
}

fn validate_language(raw: Option<&str>) -> Result<String> {
    let language = raw.unwrap_or("ro").trim().to_lowercase();
    if !(2..=3).contains(&language.len()) || !language.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(SubwardenError::Validation(format!(
            "unknown language code: {}",
            language
        )));
    }
    Ok(language)
}

fn validate_log_level(raw: Option<&str>) -> Result<String> {
    let level = raw.unwrap_or("info").trim().to_lowercase();
    if !VALID_LOG_LEVELS.contains(&level.as_str()) {
        return Err(SubwardenError::Validation(format!(
            "unknown log level: {}",
            level
        )));
    }
    Ok(level)
}
