//! Bearer token authentication.
//!
//! `Authorization: Bearer <token>` (or `token <token>`) identifies the
//! caller. The configured admin token acts as the service account; any
//! other token is looked up by its SHA-256 digest. Requests without a
//! token are anonymous and may only read.

use std::sync::Arc;

use axum::async_trait;
use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::header;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::api::status::AppError;
use crate::AppState;

/// The authenticated caller, if any.
#[derive(Debug, Clone)]
pub struct Actor(pub Option<String>);

impl Actor {
    /// The username, or 401 for anonymous callers.
    pub fn require(&self) -> Result<String, AppError> {
        self.0
            .clone()
            .ok_or_else(|| AppError::Unauthorized("authentication required".into()))
    }

    pub fn username(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Actor {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get(header::AUTHORIZATION) else {
            return Ok(Actor(None));
        };
        let value = value
            .to_str()
            .map_err(|_| AppError::Unauthorized("malformed Authorization header".into()))?;
        let token = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("token "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::Unauthorized("missing or invalid Authorization header".into()))?;

        if let Some(admin) = state.forge.config.web.admin_token.as_deref() {
            if constant_time_eq(token.as_bytes(), admin.as_bytes()) {
                return Ok(Actor(Some(state.forge.service_account().to_string())));
            }
        }

        match state.forge.tokens.verify(token) {
            Ok(Some(username)) => Ok(Actor(Some(username))),
            Ok(None) => Err(AppError::Unauthorized("invalid token".into())),
            Err(e) => Err(AppError::Internal(format!("token lookup failed: {}", e))),
        }
    }
}

/// Compare without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Serialize)]
struct WhoAmI {
    username: Option<String>,
    is_service_account: bool,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/v1/user", get(whoami))
}

async fn whoami(State(state): State<Arc<AppState>>, actor: Actor) -> Json<WhoAmI> {
    let is_service_account = actor.username() == Some(state.forge.service_account());
    Json(WhoAmI {
        username: actor.0,
        is_service_account,
    })
}
