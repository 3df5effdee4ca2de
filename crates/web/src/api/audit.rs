//! Audit log API endpoints. Restricted to the service account.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use prforge_core::db::queries::AuditLogEntry;

use crate::api::auth::Actor;
use crate::api::blocking;
use crate::api::status::AppError;
use crate::AppState;

const DEFAULT_PAGE: u32 = 50;
const MAX_PAGE: u32 = 500;

/// `?limit=` and `?action=` filters.
#[derive(Deserialize)]
pub struct AuditFilter {
    limit: Option<u32>,
    action: Option<String>,
}

#[derive(Serialize)]
struct AuditPage {
    entries: Vec<AuditLogEntry>,
    total: usize,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/v1/admin/audit", get(list_audit))
}

/// Newest entries first.
async fn list_audit(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Query(filter): Query<AuditFilter>,
) -> Result<Json<AuditPage>, AppError> {
    if actor.require()? != state.forge.service_account() {
        return Err(AppError::Forbidden("audit log is restricted to administrators".into()));
    }
    let limit = filter.limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE);

    let entries = blocking(move || {
        let db = &state.forge.db;
        Ok(match filter.action.as_deref() {
            Some(action) => db.list_audit_log_by_action(action, limit)?,
            None => db.list_audit_log(limit)?,
        })
    })
    .await?;

    Ok(Json(AuditPage {
        total: entries.len(),
        entries,
    }))
}
