//! REST API endpoint modules.

pub mod audit;
pub mod auth;
pub mod contents;
pub mod pulls;
pub mod repos;
pub mod status;

use prforge_core::models::RepoRef;

use crate::api::status::AppError;

/// Run blocking core work (git, SQLite) off the async executor.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, AppError>
where
    F: FnOnce() -> Result<T, AppError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Internal(format!("worker task failed: {}", e)))?
}

pub(crate) fn repo_ref(owner: String, name: String) -> RepoRef {
    RepoRef { owner, name }
}
