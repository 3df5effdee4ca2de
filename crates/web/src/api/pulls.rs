//! Pull request endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use prforge_core::access::UpdatePermission;
use prforge_core::db::queries::ConflictEntry;
use prforge_core::models::{
    DivergenceCount, NewPullRequest, PullRequest, PullRequestState, RepoRef, UpdateOutcome,
    UpdateStrategy,
};

use crate::api::auth::Actor;
use crate::api::status::AppError;
use crate::api::{blocking, repo_ref};
use crate::AppState;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ListQuery {
    /// `open`, `closed`, `merged` or `all` (default `open`).
    pub state: Option<String>,
}

#[derive(Deserialize)]
pub struct CreatePullRequest {
    /// `owner/name` of the head repository; defaults to the base repository.
    pub head_repo: Option<String>,
    pub head: String,
    pub base: String,
    pub title: String,
    #[serde(default)]
    pub allow_maintainer_edit: bool,
}

#[derive(Deserialize)]
pub struct EditPullRequest {
    pub state: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateQuery {
    pub style: Option<String>,
}

#[derive(Serialize)]
struct DivergingResponse {
    ahead: usize,
    behind: usize,
}

impl From<DivergenceCount> for DivergingResponse {
    fn from(c: DivergenceCount) -> Self {
        Self {
            ahead: c.ahead,
            behind: c.behind,
        }
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/api/v1/repos/:owner/:repo/pulls",
            get(list_pulls).post(create_pull),
        )
        .route(
            "/api/v1/repos/:owner/:repo/pulls/:index",
            get(get_pull).patch(edit_pull),
        )
        .route(
            "/api/v1/repos/:owner/:repo/pulls/:index/diverging",
            get(get_diverging),
        )
        .route(
            "/api/v1/repos/:owner/:repo/pulls/:index/update",
            post(update_pull),
        )
        .route(
            "/api/v1/repos/:owner/:repo/pulls/:index/update_permission",
            get(update_permission),
        )
        .route(
            "/api/v1/repos/:owner/:repo/pulls/:index/merge",
            post(merge_pull),
        )
        .route(
            "/api/v1/repos/:owner/:repo/pulls/:index/conflicts",
            get(list_conflicts),
        )
}

async fn list_pulls(
    State(state): State<Arc<AppState>>,
    Path((owner, name)): Path<(String, String)>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<PullRequest>>, AppError> {
    let filter = match query.state.as_deref().unwrap_or("open") {
        "all" => None,
        "open" => Some(PullRequestState::Open),
        "closed" => Some(PullRequestState::Closed),
        "merged" => Some(PullRequestState::Merged),
        other => {
            return Err(AppError::BadRequest(format!(
                "invalid state '{}': must be open, closed, merged or all",
                other
            )))
        }
    };
    let repo = repo_ref(owner, name);
    let pulls = blocking(move || Ok(state.forge.pulls.list(&repo, filter)?)).await?;
    Ok(Json(pulls))
}

async fn create_pull(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path((owner, name)): Path<(String, String)>,
    Json(body): Json<CreatePullRequest>,
) -> Result<(StatusCode, Json<PullRequest>), AppError> {
    let actor = actor.require()?;
    let base = repo_ref(owner, name);
    let head = match body.head_repo {
        Some(head) => head.parse::<RepoRef>().map_err(AppError::BadRequest)?,
        None => base.clone(),
    };
    let req = NewPullRequest {
        base,
        base_branch: body.base,
        head,
        head_branch: body.head,
        title: body.title,
        allow_maintainer_edit: body.allow_maintainer_edit,
    };
    let pr = blocking(move || Ok(state.forge.pulls.create(&actor, &req)?)).await?;
    Ok((StatusCode::CREATED, Json(pr)))
}

async fn get_pull(
    State(state): State<Arc<AppState>>,
    Path((owner, name, index)): Path<(String, String, i64)>,
) -> Result<Json<PullRequest>, AppError> {
    let repo = repo_ref(owner, name);
    let pr = blocking(move || Ok(state.forge.pulls.get(&repo, index)?)).await?;
    Ok(Json(pr))
}

/// Close or reopen.
async fn edit_pull(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path((owner, name, index)): Path<(String, String, i64)>,
    Json(body): Json<EditPullRequest>,
) -> Result<Json<PullRequest>, AppError> {
    let actor = actor.require()?;
    let repo = repo_ref(owner, name);
    let pr = blocking(move || match body.state.as_deref() {
        Some("closed") => Ok(state.forge.pulls.close(&repo, index, &actor)?),
        Some("open") => Ok(state.forge.pulls.reopen(&repo, index, &actor)?),
        None => Ok(state.forge.pulls.get(&repo, index)?),
        Some(other) => Err(AppError::BadRequest(format!(
            "invalid state '{}': must be open or closed",
            other
        ))),
    })
    .await?;
    Ok(Json(pr))
}

async fn get_diverging(
    State(state): State<Arc<AppState>>,
    Path((owner, name, index)): Path<(String, String, i64)>,
) -> Result<Json<DivergingResponse>, AppError> {
    let repo = repo_ref(owner, name);
    let counts = blocking(move || {
        let ctx = state.forge.operation_context();
        Ok(state.forge.pulls.get_diverging(&repo, index, &ctx)?)
    })
    .await?;
    Ok(Json(counts.into()))
}

async fn update_pull(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path((owner, name, index)): Path<(String, String, i64)>,
    Query(query): Query<UpdateQuery>,
) -> Result<Json<UpdateOutcome>, AppError> {
    let actor = actor.require()?;
    let strategy = query
        .style
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<UpdateStrategy>)
        .transpose()
        .map_err(AppError::BadRequest)?;
    let repo = repo_ref(owner, name);
    let outcome = blocking(move || {
        let ctx = state.forge.operation_context();
        Ok(state
            .forge
            .pulls
            .update_pull_request(&repo, index, &actor, strategy, &ctx)?)
    })
    .await?;
    Ok(Json(outcome))
}

async fn update_permission(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path((owner, name, index)): Path<(String, String, i64)>,
) -> Result<Json<UpdatePermission>, AppError> {
    let repo = repo_ref(owner, name);
    let permission = blocking(move || {
        Ok(state
            .forge
            .pulls
            .update_permission(&repo, index, actor.username())?)
    })
    .await?;
    Ok(Json(permission))
}

async fn merge_pull(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path((owner, name, index)): Path<(String, String, i64)>,
) -> Result<Json<PullRequest>, AppError> {
    let actor = actor.require()?;
    let repo = repo_ref(owner, name);
    let pr = blocking(move || {
        let ctx = state.forge.operation_context();
        Ok(state.forge.pulls.merge(&repo, index, &actor, &ctx)?)
    })
    .await?;
    Ok(Json(pr))
}

async fn list_conflicts(
    State(state): State<Arc<AppState>>,
    Path((owner, name, index)): Path<(String, String, i64)>,
) -> Result<Json<Vec<ConflictEntry>>, AppError> {
    let repo = repo_ref(owner, name);
    let conflicts = blocking(move || Ok(state.forge.pulls.conflicts(&repo, index)?)).await?;
    Ok(Json(conflicts))
}
