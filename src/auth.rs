//! Bearer authentication and the capability predicates used by the core.
//!
//! Two token kinds exist: long-lived API tokens tied to a user row, and
//! short-lived stream tokens minted for WebSocket query-param auth (query
//! params are intrinsically weaker than headers, so stream tokens expire
//! within `STREAM_TOKEN_TTL_SEC`).

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::database::{Job, User};
use crate::error::{Result, SubwardenError};
use crate::state::AppState;

/// Extractor: resolves `Authorization: Bearer <token>` against the users
/// table. Rejections map to 401.
pub struct AuthenticatedUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = SubwardenError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> std::result::Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(SubwardenError::Unauthorized)?;

        let token = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))
            .ok_or(SubwardenError::Unauthorized)?;

        let user = state
            .database
            .get_user_by_token(token)
            .await?
            .ok_or(SubwardenError::Unauthorized)?;

        debug!("Authenticated user {} ({})", user.email, user.id);
        Ok(AuthenticatedUser(user))
    }
}

/// read-job(u, j): owner or admin.
pub fn can_read_job(user: &User, job: &Job) -> bool {
    job.owner_user_id == user.id || user.is_admin()
}

/// cancel-job(u, j): same capability as read-job.
pub fn can_cancel_job(user: &User, job: &Job) -> bool {
    can_read_job(user, job)
}

/// Mint a short-lived stream token for the WebSocket endpoint.
pub async fn mint_stream_token(state: &AppState, user: &User) -> Result<(String, DateTime<Utc>)> {
    let token = uuid::Uuid::new_v4().to_string();
    let expires_at = Utc::now() + Duration::seconds(state.config.server.stream_token_ttl_sec);
    state
        .database
        .insert_stream_token(&token, &user.id, expires_at)
        .await?;
    Ok((token, expires_at))
}

/// Resolve a stream token; expired or unknown tokens resolve to None.
pub async fn resolve_stream_token(state: &AppState, token: &str) -> Result<Option<User>> {
    let user = state.database.resolve_stream_token(token).await?;
    if user.is_none() {
        warn!("Stream token rejected (unknown or expired)");
    }
    Ok(user)
}

/// Constant-time byte comparison for the webhook shared secret. The fold
/// touches every byte regardless of where the first mismatch is.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::test_user;

    fn job_owned_by(user: &User) -> Job {
        Job {
            id: uuid::Uuid::new_v4().to_string(),
            owner_user_id: user.id.clone(),
            folder: "/media/movies/X".to_string(),
            language: "ro".to_string(),
            log_level: "info".to_string(),
            retry_of_job_id: None,
            broker_task_id: None,
            status: crate::database::JobStatus::Pending,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            exit_code: None,
            result_message: None,
            log_snippet: None,
            full_logs: None,
        }
    }

    #[test]
    fn read_job_requires_ownership_or_admin() {
        let owner = test_user("user", false);
        let stranger = test_user("user", false);
        let admin = test_user("admin", false);
        let superuser = test_user("user", true);
        let job = job_owned_by(&owner);

        assert!(can_read_job(&owner, &job));
        assert!(!can_read_job(&stranger, &job));
        assert!(can_read_job(&admin, &job));
        assert!(can_read_job(&superuser, &job));
        assert_eq!(can_cancel_job(&stranger, &job), can_read_job(&stranger, &job));
    }

    #[test]
    fn constant_time_eq_compares_exactly() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret2"));
        assert!(!constant_time_eq(b"", b"x"));
        assert!(constant_time_eq(b"", b""));
    }
}
