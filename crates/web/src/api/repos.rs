//! Repository, branch, collaborator and branch protection endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;

use prforge_core::db::queries::CollaboratorEntry;
use prforge_core::git::BranchInfo;
use prforge_core::models::{AccessMode, ProtectedBranch, RepoRef, Repository};

use crate::api::auth::Actor;
use crate::api::status::AppError;
use crate::api::{blocking, repo_ref};
use crate::AppState;

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CreateRepoRequest {
    /// Defaults to the caller.
    pub owner: Option<String>,
    pub name: String,
    pub default_branch: Option<String>,
}

#[derive(Deserialize)]
pub struct CollaboratorRequest {
    pub permission: String,
}

#[derive(Deserialize)]
pub struct ProtectBranchRequest {
    pub branch: String,
    #[serde(default)]
    pub allow_push: bool,
    #[serde(default)]
    pub allow_force_push: bool,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v1/repos", get(list_repos).post(create_repo))
        .route("/api/v1/repos/:owner/:repo", get(get_repo))
        .route("/api/v1/repos/:owner/:repo/branches", get(list_branches))
        .route(
            "/api/v1/repos/:owner/:repo/collaborators",
            get(list_collaborators),
        )
        .route(
            "/api/v1/repos/:owner/:repo/collaborators/:username",
            put(set_collaborator).delete(remove_collaborator),
        )
        .route(
            "/api/v1/repos/:owner/:repo/branch_protections",
            post(protect_branch),
        )
        .route(
            "/api/v1/repos/:owner/:repo/branch_protections/:branch",
            delete(unprotect_branch),
        )
}

async fn list_repos(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Repository>>, AppError> {
    let repos = blocking(move || Ok(state.forge.repos.list()?)).await?;
    Ok(Json(repos))
}

/// Users create repositories under their own name; the service account may
/// create them for anyone.
async fn create_repo(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(body): Json<CreateRepoRequest>,
) -> Result<(StatusCode, Json<Repository>), AppError> {
    let actor = actor.require()?;
    let owner = body.owner.unwrap_or_else(|| actor.clone());
    if owner != actor && actor != state.forge.service_account() {
        return Err(AppError::Forbidden(format!(
            "user '{}' cannot create repositories for '{}'",
            actor, owner
        )));
    }
    let repo = RepoRef::new(owner, body.name);
    let created = blocking(move || {
        Ok(state
            .forge
            .repos
            .create(&repo, body.default_branch.as_deref())?)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_repo(
    State(state): State<Arc<AppState>>,
    Path((owner, name)): Path<(String, String)>,
) -> Result<Json<Repository>, AppError> {
    let repo = repo_ref(owner, name);
    let record = blocking(move || Ok(state.forge.repos.get(&repo)?)).await?;
    Ok(Json(record))
}

async fn list_branches(
    State(state): State<Arc<AppState>>,
    Path((owner, name)): Path<(String, String)>,
) -> Result<Json<Vec<BranchInfo>>, AppError> {
    let repo = repo_ref(owner, name);
    let branches = blocking(move || Ok(state.forge.repos.list_branches(&repo)?)).await?;
    Ok(Json(branches))
}

async fn list_collaborators(
    State(state): State<Arc<AppState>>,
    Path((owner, name)): Path<(String, String)>,
) -> Result<Json<Vec<CollaboratorEntry>>, AppError> {
    let repo = repo_ref(owner, name);
    let collaborators =
        blocking(move || Ok(state.forge.repos.list_collaborators(&repo)?)).await?;
    Ok(Json(collaborators))
}

async fn set_collaborator(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path((owner, name, username)): Path<(String, String, String)>,
    Json(body): Json<CollaboratorRequest>,
) -> Result<StatusCode, AppError> {
    let actor = actor.require()?;
    let mode = AccessMode::from_str_val(&body.permission);
    if mode == AccessMode::None {
        return Err(AppError::BadRequest(format!(
            "invalid permission '{}': must be read, write or admin",
            body.permission
        )));
    }
    let repo = repo_ref(owner, name);
    blocking(move || {
        Ok(state
            .forge
            .repos
            .set_collaborator(&repo, &actor, &username, mode)?)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_collaborator(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path((owner, name, username)): Path<(String, String, String)>,
) -> Result<StatusCode, AppError> {
    let actor = actor.require()?;
    let repo = repo_ref(owner, name);
    blocking(move || {
        Ok(state
            .forge
            .repos
            .set_collaborator(&repo, &actor, &username, AccessMode::None)?)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn protect_branch(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path((owner, name)): Path<(String, String)>,
    Json(body): Json<ProtectBranchRequest>,
) -> Result<(StatusCode, Json<ProtectedBranch>), AppError> {
    let actor = actor.require()?;
    let repo = repo_ref(owner, name);
    let rule = blocking(move || {
        Ok(state.forge.repos.protect_branch(
            &repo,
            &actor,
            &body.branch,
            body.allow_push,
            body.allow_force_push,
        )?)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn unprotect_branch(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path((owner, name, branch)): Path<(String, String, String)>,
) -> Result<StatusCode, AppError> {
    let actor = actor.require()?;
    let repo = repo_ref(owner, name);
    let removed = blocking(move || {
        Ok(state
            .forge
            .repos
            .unprotect_branch(&repo, &actor, &branch)?)
    })
    .await?;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound("branch is not protected".into()))
    }
}
