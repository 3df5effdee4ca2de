//! Wiring of the services that share one database and repository root.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::access::AccessPolicy;
use crate::config::AppConfig;
use crate::contents::ContentService;
use crate::context::OperationContext;
use crate::db::Database;
use crate::errors::CoreError;
use crate::git::RepositoryStore;
use crate::identity::IdentityMapper;
use crate::pulls::PullRequestService;
use crate::reconcile::Reconciler;
use crate::repos::RepositoryService;
use crate::tokens::TokenService;

/// Everything a front end (HTTP API or CLI) needs.
#[derive(Clone)]
pub struct Forge {
    pub config: AppConfig,
    pub db: Arc<Database>,
    pub store: RepositoryStore,
    pub identities: Arc<IdentityMapper>,
    pub repos: RepositoryService,
    pub pulls: PullRequestService,
    pub contents: ContentService,
    pub tokens: TokenService,
}

impl Forge {
    /// Build the services from `config` on top of an initialised database.
    pub fn new(config: AppConfig, db: Arc<Database>) -> Result<Self, CoreError> {
        let store = RepositoryStore::new(
            &config.repositories.root,
            &config.repositories.default_branch,
        );
        let identities = Arc::new(IdentityMapper::new(&config.identity)?);
        let policy = AccessPolicy::new(db.clone(), config.pulls.allow_rebase_update)
            .with_site_admin(&config.identity.committer_name);
        let reconciler = Reconciler::new(store.clone(), identities.clone(), config.pulls.clone())
            .with_conflict_log(db.clone());

        info!(
            root = %config.repositories.root.display(),
            service_account = %config.identity.committer_name,
            "forge services ready"
        );
        Ok(Self {
            repos: RepositoryService::new(db.clone(), store.clone(), policy.clone()),
            pulls: PullRequestService::new(
                db.clone(),
                policy,
                reconciler,
                config.pulls.default_update_style,
            ),
            contents: ContentService::new(store.clone(), identities.clone())
                .with_lock_timeout(Duration::from_secs(config.web.operation_timeout_secs)),
            tokens: TokenService::new(db.clone()),
            config,
            db,
            store,
            identities,
        })
    }

    /// Username the admin token and the CLI act as.
    pub fn service_account(&self) -> &str {
        &self.config.identity.committer_name
    }

    /// Context bounded by `web.operation_timeout_secs`.
    pub fn operation_context(&self) -> OperationContext {
        OperationContext::with_timeout(Duration::from_secs(self.config.web.operation_timeout_secs))
    }
}
