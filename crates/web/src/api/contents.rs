//! File contents endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use base64::Engine;
use serde::Deserialize;

use prforge_core::contents::{ChangeFileOptions, FileChange, FileCommitResponse, FileContent};

use crate::api::auth::Actor;
use crate::api::status::AppError;
use crate::api::{blocking, repo_ref};
use crate::AppState;

#[derive(Deserialize)]
pub struct RefQuery {
    #[serde(rename = "ref")]
    pub reference: Option<String>,
}

/// Body of create, update and delete requests.
#[derive(Deserialize)]
pub struct FileRequest {
    /// Base64 file content (create and update).
    #[serde(default)]
    pub content: Option<String>,
    /// Current blob SHA (update and delete).
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(flatten)]
    pub options: ChangeFileOptions,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route(
        "/api/v1/repos/:owner/:repo/contents/*path",
        get(get_file)
            .post(create_file)
            .put(update_file)
            .delete(delete_file),
    )
}

async fn get_file(
    State(state): State<Arc<AppState>>,
    Path((owner, name, path)): Path<(String, String, String)>,
    Query(query): Query<RefQuery>,
) -> Result<Json<FileContent>, AppError> {
    let repo = repo_ref(owner, name);
    let file = blocking(move || {
        Ok(state
            .forge
            .contents
            .get_file(&repo, &path, query.reference.as_deref())?)
    })
    .await?;
    Ok(Json(file))
}

fn decode_content(content: Option<String>) -> Result<Vec<u8>, AppError> {
    let content = content.unwrap_or_default();
    base64::engine::general_purpose::STANDARD
        .decode(content.trim())
        .map_err(|e| AppError::BadRequest(format!("content is not valid base64: {}", e)))
}

async fn create_file(
    state: State<Arc<AppState>>,
    actor: Actor,
    path: Path<(String, String, String)>,
    Json(body): Json<FileRequest>,
) -> Result<(StatusCode, Json<FileCommitResponse>), AppError> {
    let change = FileChange::Create {
        content: decode_content(body.content)?,
    };
    let written = change_file(state, actor, path, change, body.options).await?;
    Ok((StatusCode::CREATED, Json(written)))
}

async fn update_file(
    state: State<Arc<AppState>>,
    actor: Actor,
    path: Path<(String, String, String)>,
    Json(body): Json<FileRequest>,
) -> Result<Json<FileCommitResponse>, AppError> {
    let change = FileChange::Update {
        content: decode_content(body.content)?,
        sha: body.sha,
    };
    Ok(Json(change_file(state, actor, path, change, body.options).await?))
}

async fn delete_file(
    state: State<Arc<AppState>>,
    actor: Actor,
    path: Path<(String, String, String)>,
    Json(body): Json<FileRequest>,
) -> Result<Json<FileCommitResponse>, AppError> {
    let change = FileChange::Delete { sha: body.sha };
    Ok(Json(change_file(state, actor, path, change, body.options).await?))
}

async fn change_file(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path((owner, name, path)): Path<(String, String, String)>,
    change: FileChange,
    options: ChangeFileOptions,
) -> Result<FileCommitResponse, AppError> {
    let actor = actor.require()?;
    let repo = repo_ref(owner, name);
    blocking(move || {
        let target = match (&options.new_branch, &options.branch) {
            (Some(new_branch), _) => new_branch.clone(),
            (None, Some(branch)) => branch.clone(),
            (None, None) => state.forge.store.default_branch().to_string(),
        };
        let grant = state.forge.repos.content_grant(&repo, &actor, &target)?;
        Ok(state
            .forge
            .contents
            .change_file(&repo, &path, change, &options, &actor, grant.as_ref())?)
    })
    .await
}
