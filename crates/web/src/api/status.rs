//! Status and health check endpoints, plus the shared API error type.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use prforge_core::errors::{
    ContentError, CoreError, DatabaseError, GitError, PullRequestError, ReconcileError,
};

use crate::api::blocking;
use crate::AppState;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: String,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    repositories: usize,
    audit_entries: i64,
    default_update_style: String,
    uptime_secs: u64,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/status/health", get(health_check))
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn get_status(State(state): State<Arc<AppState>>) -> Result<Json<StatusResponse>, AppError> {
    let uptime_secs = state.started_at.elapsed().as_secs();
    let default_update_style = state.forge.pulls.default_strategy().to_string();
    let (repositories, audit_entries) = blocking(move || {
        let repos = state.forge.repos.list()?;
        let audit = state
            .forge
            .db
            .count_audit_log()
            .map_err(CoreError::from)?;
        Ok((repos.len(), audit))
    })
    .await?;

    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        repositories,
        audit_entries,
        default_update_style,
        uptime_secs,
    }))
}

// ---------------------------------------------------------------------------
// Shared error type for API handlers
// ---------------------------------------------------------------------------

/// API error type that converts to an Axum response with a JSON
/// `{ "error": ... }` body.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Unauthorized(String),
    Forbidden(String),
    /// 409; `files` lists conflicted paths, `retryable` marks a lost
    /// compare-and-swap.
    Conflict {
        message: String,
        files: Vec<String>,
        retryable: bool,
    },
    Unprocessable(String),
    Timeout(String),
    Internal(String),
}

impl AppError {
    fn conflict(message: String) -> Self {
        Self::Conflict {
            message,
            files: Vec::new(),
            retryable: false,
        }
    }
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, serde_json::json!({ "error": msg })),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, serde_json::json!({ "error": msg })),
            AppError::Unauthorized(msg) => {
                (StatusCode::UNAUTHORIZED, serde_json::json!({ "error": msg }))
            }
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, serde_json::json!({ "error": msg })),
            AppError::Conflict {
                message,
                files,
                retryable,
            } => (
                StatusCode::CONFLICT,
                serde_json::json!({ "error": message, "files": files, "retryable": retryable }),
            ),
            AppError::Unprocessable(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                serde_json::json!({ "error": msg }),
            ),
            AppError::Timeout(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({ "error": msg }),
            ),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "internal API error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({ "error": msg }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

impl From<GitError> for AppError {
    fn from(e: GitError) -> Self {
        let message = e.to_string();
        match e {
            GitError::RepositoryExists(_) => AppError::conflict(message),
            GitError::InvalidName { .. } => AppError::Unprocessable(message),
            GitError::RefModified { .. } => AppError::Conflict {
                message,
                files: Vec::new(),
                retryable: true,
            },
            e if e.is_not_found() => AppError::NotFound(message),
            _ => AppError::Internal(message),
        }
    }
}

impl From<DatabaseError> for AppError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound { .. } => AppError::NotFound(e.to_string()),
            DatabaseError::StateChanged { .. } => AppError::Unprocessable(e.to_string()),
            _ => AppError::Internal(e.to_string()),
        }
    }
}

impl From<ReconcileError> for AppError {
    fn from(e: ReconcileError) -> Self {
        let message = e.to_string();
        match e {
            ReconcileError::ReferenceNotFound { .. } => AppError::NotFound(message),
            ReconcileError::MergeConflict { files, .. }
            | ReconcileError::RebaseConflict { files, .. } => AppError::Conflict {
                message,
                files,
                retryable: false,
            },
            ReconcileError::PermissionDenied { .. } => AppError::Forbidden(message),
            ReconcileError::ConcurrentModification { .. } => AppError::Conflict {
                message,
                files: Vec::new(),
                retryable: true,
            },
            ReconcileError::Cancelled(_) => AppError::Timeout(message),
            ReconcileError::PullRequestNotOpen { .. } => AppError::Unprocessable(message),
            ReconcileError::Identity(_) => AppError::Internal(message),
            ReconcileError::Git(git) => git.into(),
        }
    }
}

impl From<ContentError> for AppError {
    fn from(e: ContentError) -> Self {
        let message = e.to_string();
        match e {
            ContentError::FilenameInvalid(_)
            | ContentError::FilePathInvalid { .. }
            | ContentError::FileAlreadyExists(_)
            | ContentError::ShaDoesNotMatch { .. }
            | ContentError::ShaNotProvided
            | ContentError::BranchAlreadyExists(_) => AppError::Unprocessable(message),
            ContentError::FileNotFound { .. } | ContentError::ReferenceNotFound(_) => {
                AppError::NotFound(message)
            }
            ContentError::UserCannotCommit { .. } => AppError::Forbidden(message),
            ContentError::ConcurrentModification(_) => AppError::Conflict {
                message,
                files: Vec::new(),
                retryable: true,
            },
            ContentError::Identity(_) => AppError::Internal(message),
            ContentError::Git(git) => git.into(),
        }
    }
}

impl From<PullRequestError> for AppError {
    fn from(e: PullRequestError) -> Self {
        let message = e.to_string();
        match e {
            PullRequestError::NotFound { .. } | PullRequestError::BranchNotFound { .. } => {
                AppError::NotFound(message)
            }
            PullRequestError::AlreadyExists(_) => AppError::conflict(message),
            PullRequestError::SameBranch | PullRequestError::AlreadyMerged(_) => {
                AppError::Unprocessable(message)
            }
            PullRequestError::DatabaseError(db) => db.into(),
            PullRequestError::GitError(git) => git.into(),
        }
    }
}

impl From<CoreError> for AppError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::Git(e) => e.into(),
            CoreError::Reconcile(e) => e.into(),
            CoreError::Content(e) => e.into(),
            CoreError::PullRequest(e) => e.into(),
            CoreError::Database(e) => e.into(),
            CoreError::RepositoryNotFound(_) => AppError::NotFound(e.to_string()),
            CoreError::Forbidden { .. } => AppError::Forbidden(e.to_string()),
            CoreError::Config(_) | CoreError::Identity(_) => AppError::Internal(e.to_string()),
        }
    }
}
