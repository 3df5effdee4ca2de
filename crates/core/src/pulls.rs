//! Pull request lifecycle and the two divergence operations exposed to
//! callers: `get_diverging` and `update_pull_request`.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::access::{AccessPolicy, UpdatePermission};
use crate::context::OperationContext;
use crate::db::queries::ConflictEntry;
use crate::db::Database;
use crate::divergence::DivergenceCounter;
use crate::errors::{CoreError, DatabaseError, PullRequestError, ReconcileError};
use crate::git::RepositoryStore;
use crate::models::{
    AuditEntry, DivergenceCount, NewPullRequest, PullRequest, PullRequestState, RepoRef,
    Repository, UpdateOutcome, UpdateStrategy,
};
use crate::reconcile::Reconciler;

#[derive(Clone)]
pub struct PullRequestService {
    db: Arc<Database>,
    store: RepositoryStore,
    policy: AccessPolicy,
    counter: DivergenceCounter,
    reconciler: Reconciler,
    default_strategy: UpdateStrategy,
}

impl PullRequestService {
    pub fn new(
        db: Arc<Database>,
        policy: AccessPolicy,
        reconciler: Reconciler,
        default_strategy: UpdateStrategy,
    ) -> Self {
        let store = reconciler.store().clone();
        Self {
            db,
            counter: DivergenceCounter::new(store.clone()),
            store,
            policy,
            reconciler,
            default_strategy,
        }
    }

    pub fn default_strategy(&self) -> UpdateStrategy {
        self.default_strategy
    }

    fn repository(&self, repo: &RepoRef) -> Result<Repository, CoreError> {
        self.db
            .get_repository(repo)?
            .ok_or_else(|| CoreError::RepositoryNotFound(repo.to_string()))
    }

    /// Look up a pull request by its per-repository index.
    pub fn get(&self, repo: &RepoRef, index: i64) -> Result<PullRequest, CoreError> {
        let base = self.repository(repo)?;
        self.db
            .get_pull_request(base.id, index)?
            .ok_or_else(|| {
                PullRequestError::NotFound {
                    repo: repo.to_string(),
                    index,
                }
                .into()
            })
    }

    pub fn list(
        &self,
        repo: &RepoRef,
        state: Option<PullRequestState>,
    ) -> Result<Vec<PullRequest>, CoreError> {
        let base = self.repository(repo)?;
        Ok(self.db.list_pull_requests(base.id, state)?)
    }

    /// Open a pull request from `req.head`/`head_branch` into
    /// `req.base`/`base_branch`.
    #[instrument(skip(self, req), fields(base = %req.base, head = %req.head))]
    pub fn create(&self, poster: &str, req: &NewPullRequest) -> Result<PullRequest, CoreError> {
        let base = self.repository(&req.base)?;
        let head = self.repository(&req.head)?;
        if base.id == head.id && req.base_branch == req.head_branch {
            return Err(PullRequestError::SameBranch.into());
        }
        self.require_branch(&req.base, &req.base_branch)?;
        self.require_branch(&req.head, &req.head_branch)?;
        if let Some(index) =
            self.db
                .find_open_pull_request(base.id, &req.base_branch, head.id, &req.head_branch)?
        {
            return Err(PullRequestError::AlreadyExists(index).into());
        }

        let (_, index) = self.db.insert_pull_request(
            base.id,
            &req.base_branch,
            head.id,
            &req.head_branch,
            &req.title,
            poster,
            req.allow_maintainer_edit,
        )?;
        self.audit(
            AuditEntry::success(
                "pull.create",
                &format!("#{} {}:{} -> {}", index, req.head, req.head_branch, req.base_branch),
            )
            .by(poster)
            .on(&req.base),
        );
        info!(index, "pull request opened");
        self.get(&req.base, index)
    }

    /// Close an open pull request. Closing a closed one is a no-op.
    pub fn close(&self, repo: &RepoRef, index: i64, actor: &str) -> Result<PullRequest, CoreError> {
        let pr = self.get(repo, index)?;
        self.require_poster_or_writer(&pr, actor, "close pull requests")?;
        match pr.state {
            PullRequestState::Merged => return Err(PullRequestError::AlreadyMerged(index).into()),
            PullRequestState::Closed => return Ok(pr),
            PullRequestState::Open => {}
        }
        self.db.set_pull_request_state(pr.id, PullRequestState::Closed)?;
        self.audit(AuditEntry::success("pull.close", &format!("#{}", index)).by(actor).on(repo));
        self.get(repo, index)
    }

    /// Reopen a closed pull request whose branches still exist.
    pub fn reopen(&self, repo: &RepoRef, index: i64, actor: &str) -> Result<PullRequest, CoreError> {
        let pr = self.get(repo, index)?;
        self.require_poster_or_writer(&pr, actor, "reopen pull requests")?;
        match pr.state {
            PullRequestState::Merged => return Err(PullRequestError::AlreadyMerged(index).into()),
            PullRequestState::Open => return Ok(pr),
            PullRequestState::Closed => {}
        }
        self.require_branch(&pr.base, &pr.base_branch)?;
        self.require_branch(&pr.head, &pr.head_branch)?;
        if let Some(other) = self.db.find_open_pull_request(
            pr.base_repo_id,
            &pr.base_branch,
            pr.head_repo_id,
            &pr.head_branch,
        )? {
            return Err(PullRequestError::AlreadyExists(other).into());
        }
        self.db.set_pull_request_state(pr.id, PullRequestState::Open)?;
        self.audit(AuditEntry::success("pull.reopen", &format!("#{}", index)).by(actor).on(repo));
        self.get(repo, index)
    }

    /// Commits unique to head (`ahead`) and to base (`behind`).
    pub fn get_diverging(
        &self,
        repo: &RepoRef,
        index: i64,
        ctx: &OperationContext,
    ) -> Result<DivergenceCount, CoreError> {
        let pr = self.get(repo, index)?;
        Ok(self.counter.compute(&pr, ctx)?)
    }

    /// Which update styles `actor` may use on the pull request.
    pub fn update_permission(
        &self,
        repo: &RepoRef,
        index: i64,
        actor: Option<&str>,
    ) -> Result<UpdatePermission, CoreError> {
        let Some(actor) = actor else {
            return Ok(UpdatePermission::default());
        };
        let pr = self.get(repo, index)?;
        let head = self.db.get_repository_by_id(pr.head_repo_id)?;
        let base = self.db.get_repository_by_id(pr.base_repo_id)?;
        Ok(self.policy.update_permission(&pr, actor, &head, &base)?)
    }

    /// Bring the head branch up to date with base.
    ///
    /// `strategy` falls back to the configured default style.
    #[instrument(skip(self, ctx), fields(repo = %repo))]
    pub fn update_pull_request(
        &self,
        repo: &RepoRef,
        index: i64,
        actor: &str,
        strategy: Option<UpdateStrategy>,
        ctx: &OperationContext,
    ) -> Result<UpdateOutcome, CoreError> {
        let strategy = strategy.unwrap_or(self.default_strategy);
        let pr = self.get(repo, index)?;
        if !pr.is_open() {
            return Err(ReconcileError::PullRequestNotOpen {
                index,
                state: pr.state.to_string(),
            }
            .into());
        }
        let head = self.db.get_repository_by_id(pr.head_repo_id)?;
        let base = self.db.get_repository_by_id(pr.base_repo_id)?;
        let grant = self.policy.grant_update(&pr, actor, strategy, &head, &base)?;

        let result = self
            .reconciler
            .update(&pr, actor, strategy, grant.as_ref(), ctx);
        match &result {
            Ok(outcome) => {
                if let UpdateOutcome::Updated { old_head, new_head, .. } = outcome {
                    self.db.touch_pull_request(pr.id)?;
                    self.audit(
                        AuditEntry::success(
                            "pull.update",
                            &format!("#{} {} {}..{}", index, strategy, old_head, new_head),
                        )
                        .by(actor)
                        .on(repo),
                    );
                }
            }
            Err(e) => self.audit(
                AuditEntry::failure("pull.update", &format!("#{} {}: {}", index, strategy, e))
                    .by(actor)
                    .on(repo),
            ),
        }
        Ok(result?)
    }

    /// Merge the pull request into its base branch and mark it merged.
    #[instrument(skip(self, ctx), fields(repo = %repo))]
    pub fn merge(
        &self,
        repo: &RepoRef,
        index: i64,
        actor: &str,
        ctx: &OperationContext,
    ) -> Result<PullRequest, CoreError> {
        let pr = self.get(repo, index)?;
        if !pr.is_open() {
            return Err(ReconcileError::PullRequestNotOpen {
                index,
                state: pr.state.to_string(),
            }
            .into());
        }
        let base = self.db.get_repository_by_id(pr.base_repo_id)?;
        let grant = self.policy.grant_merge(&pr, actor, &base)?;
        let merged = self
            .reconciler
            .merge_into_base(&pr, actor, grant.as_ref(), ctx)
            .map_err(CoreError::from)
            .and_then(|merged| self.record_merge(repo, &pr, &merged.merge_commit, actor));
        match merged {
            Ok(merge_commit) => {
                self.audit(
                    AuditEntry::success("pull.merge", &format!("#{} as {}", index, merge_commit))
                        .by(actor)
                        .on(repo),
                );
                self.get(repo, index)
            }
            Err(e) => {
                self.audit(
                    AuditEntry::failure("pull.merge", &format!("#{}: {}", index, e))
                        .by(actor)
                        .on(repo),
                );
                Err(e)
            }
        }
    }

    /// Flip the row to merged. A pull request closed while its merge commit
    /// was being built reports its current state instead.
    fn record_merge(
        &self,
        repo: &RepoRef,
        pr: &PullRequest,
        merge_commit: &str,
        actor: &str,
    ) -> Result<String, CoreError> {
        match self.db.mark_pull_request_merged(pr.id, merge_commit, actor) {
            Ok(()) => Ok(merge_commit.to_string()),
            Err(DatabaseError::StateChanged { .. }) => {
                let current = self.get(repo, pr.index)?;
                Err(ReconcileError::PullRequestNotOpen {
                    index: pr.index,
                    state: current.state.to_string(),
                }
                .into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Conflicts recorded by the last failed update or merge.
    pub fn conflicts(&self, repo: &RepoRef, index: i64) -> Result<Vec<ConflictEntry>, CoreError> {
        let pr = self.get(repo, index)?;
        Ok(self.db.list_conflicts_for_pull(pr.id)?)
    }

    fn require_branch(&self, repo: &RepoRef, branch: &str) -> Result<(), CoreError> {
        if self.store.open(repo)?.branch_exists(branch)? {
            return Ok(());
        }
        Err(PullRequestError::BranchNotFound {
            repo: repo.to_string(),
            branch: branch.to_string(),
        }
        .into())
    }

    fn require_poster_or_writer(
        &self,
        pr: &PullRequest,
        actor: &str,
        action: &str,
    ) -> Result<(), CoreError> {
        if pr.poster == actor {
            return Ok(());
        }
        let base = self.db.get_repository_by_id(pr.base_repo_id)?;
        if self.policy.can_write(actor, &base)? {
            return Ok(());
        }
        Err(CoreError::Forbidden {
            actor: actor.to_string(),
            action: action.to_string(),
            repo: pr.base.to_string(),
        })
    }

    fn audit(&self, entry: AuditEntry) {
        if let Err(e) = self.db.insert_audit_entry(&entry) {
            warn!(action = %entry.action, error = %e, "failed to write audit entry");
        }
    }
}
