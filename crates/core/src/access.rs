//! Repository access rules and write capabilities.
//!
//! [`AccessPolicy`] answers "may this user write here" from repository
//! ownership, collaborator grants and branch protection. A positive answer is
//! handed out as a [`WriteGrant`], which the reconciler and the contents API
//! require before they move any ref.

use std::sync::Arc;

use tracing::debug;

use crate::db::Database;
use crate::errors::DatabaseError;
use crate::models::{AccessMode, PullRequest, RepoRef, Repository, UpdateStrategy};

/// Proof that `actor` may advance `branch` of `repo`.
///
/// Only [`AccessPolicy`] can mint one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteGrant {
    actor: String,
    repo: RepoRef,
    branch: String,
    history_rewrite: bool,
}

impl WriteGrant {
    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn repo(&self) -> &RepoRef {
        &self.repo
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// The grant also covers replacing history (rebase).
    pub fn allows_history_rewrite(&self) -> bool {
        self.history_rewrite
    }

    /// Whether this grant covers a write of the given kind to `repo`/`branch`.
    pub fn covers(&self, repo: &RepoRef, branch: &str, rewrite: bool) -> bool {
        self.repo == *repo && self.branch == branch && (!rewrite || self.history_rewrite)
    }

    #[cfg(test)]
    pub(crate) fn for_tests(actor: &str, repo: &RepoRef, branch: &str, rewrite: bool) -> Self {
        Self {
            actor: actor.to_string(),
            repo: repo.clone(),
            branch: branch.to_string(),
            history_rewrite: rewrite,
        }
    }
}

/// Which update styles a user may apply to a pull request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct UpdatePermission {
    pub merge: bool,
    pub rebase: bool,
}

impl UpdatePermission {
    pub fn allows(&self, strategy: UpdateStrategy) -> bool {
        match strategy {
            UpdateStrategy::Merge => self.merge,
            UpdateStrategy::Rebase => self.rebase,
        }
    }
}

/// Access rules backed by the repository metadata database.
#[derive(Clone)]
pub struct AccessPolicy {
    db: Arc<Database>,
    allow_rebase_update: bool,
    site_admin: Option<String>,
}

impl AccessPolicy {
    pub fn new(db: Arc<Database>, allow_rebase_update: bool) -> Self {
        Self {
            db,
            allow_rebase_update,
            site_admin: None,
        }
    }

    /// Treat `username` as an administrator of every repository.
    pub fn with_site_admin(mut self, username: &str) -> Self {
        self.site_admin = Some(username.to_string());
        self
    }

    /// Effective access mode of `actor` on `repo`.
    ///
    /// Repositories are world-readable, so anonymous callers get `Read`.
    pub fn access_mode(
        &self,
        actor: Option<&str>,
        repo: &Repository,
    ) -> Result<AccessMode, DatabaseError> {
        let Some(actor) = actor else {
            return Ok(AccessMode::Read);
        };
        if actor == repo.owner || self.site_admin.as_deref() == Some(actor) {
            return Ok(AccessMode::Admin);
        }
        let granted = self.db.get_collaborator_mode(repo.id, actor)?;
        Ok(granted.unwrap_or(AccessMode::Read).max(AccessMode::Read))
    }

    pub fn can_write(&self, actor: &str, repo: &Repository) -> Result<bool, DatabaseError> {
        Ok(self.access_mode(Some(actor), repo)? >= AccessMode::Write)
    }

    pub fn is_admin(&self, actor: &str, repo: &Repository) -> Result<bool, DatabaseError> {
        Ok(self.access_mode(Some(actor), repo)? >= AccessMode::Admin)
    }

    /// Branch protection allows pushing new commits.
    fn branch_accepts_push(&self, repo: &Repository, branch: &str) -> Result<bool, DatabaseError> {
        Ok(self
            .db
            .get_protected_branch(repo.id, branch)?
            .map_or(true, |rule| rule.allow_push))
    }

    /// Branch protection allows rewriting history.
    fn branch_accepts_force_push(
        &self,
        repo: &Repository,
        branch: &str,
    ) -> Result<bool, DatabaseError> {
        Ok(self
            .db
            .get_protected_branch(repo.id, branch)?
            .map_or(true, |rule| rule.allow_force_push))
    }

    /// Grant a plain (non-rewriting) write to `branch` of `repo`.
    pub fn grant_branch_write(
        &self,
        actor: &str,
        repo: &Repository,
        branch: &str,
    ) -> Result<Option<WriteGrant>, DatabaseError> {
        if !self.can_write(actor, repo)? || !self.branch_accepts_push(repo, branch)? {
            return Ok(None);
        }
        Ok(Some(WriteGrant {
            actor: actor.to_string(),
            repo: repo.repo_ref(),
            branch: branch.to_string(),
            history_rewrite: false,
        }))
    }

    /// Which update styles `actor` may apply to `pr`.
    ///
    /// Merge needs push rights on the head branch: write access to the head
    /// repository, or write access to the base repository when the pull
    /// request allows maintainer edits. Rebase additionally needs the head
    /// branch to accept force pushes and rebase updates to be enabled.
    pub fn update_permission(
        &self,
        pr: &PullRequest,
        actor: &str,
        head_repo: &Repository,
        base_repo: &Repository,
    ) -> Result<UpdatePermission, DatabaseError> {
        let mut can_push = self.can_write(actor, head_repo)?;
        if !can_push && pr.allow_maintainer_edit {
            can_push = self.can_write(actor, base_repo)?;
        }
        if !can_push || !self.branch_accepts_push(head_repo, &pr.head_branch)? {
            debug!(actor, head = %pr.head, branch = %pr.head_branch, "update not permitted");
            return Ok(UpdatePermission::default());
        }
        let rebase = self.allow_rebase_update
            && self.branch_accepts_force_push(head_repo, &pr.head_branch)?;
        Ok(UpdatePermission {
            merge: true,
            rebase,
        })
    }

    /// Grant the write needed to update `pr` with `strategy`, if permitted.
    pub fn grant_update(
        &self,
        pr: &PullRequest,
        actor: &str,
        strategy: UpdateStrategy,
        head_repo: &Repository,
        base_repo: &Repository,
    ) -> Result<Option<WriteGrant>, DatabaseError> {
        let permission = self.update_permission(pr, actor, head_repo, base_repo)?;
        if !permission.allows(strategy) {
            return Ok(None);
        }
        Ok(Some(WriteGrant {
            actor: actor.to_string(),
            repo: head_repo.repo_ref(),
            branch: pr.head_branch.clone(),
            history_rewrite: strategy == UpdateStrategy::Rebase,
        }))
    }

    /// Grant the base-branch write needed to merge `pr`, if permitted.
    pub fn grant_merge(
        &self,
        pr: &PullRequest,
        actor: &str,
        base_repo: &Repository,
    ) -> Result<Option<WriteGrant>, DatabaseError> {
        self.grant_branch_write(actor, base_repo, &pr.base_branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProtectedBranch, PullRequestState};

    struct Fixture {
        db: Arc<Database>,
        base: Repository,
        fork: Repository,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::in_memory().unwrap());
        db.initialize().unwrap();
        let base_id = db.insert_repository("acme", "widgets", "main").unwrap();
        let fork_id = db.insert_repository("carol", "widgets", "main").unwrap();
        Fixture {
            base: db.get_repository_by_id(base_id).unwrap(),
            fork: db.get_repository_by_id(fork_id).unwrap(),
            db,
        }
    }

    fn fork_pr(f: &Fixture, allow_maintainer_edit: bool) -> PullRequest {
        PullRequest {
            id: 1,
            index: 1,
            base_repo_id: f.base.id,
            base: f.base.repo_ref(),
            base_branch: "main".into(),
            head_repo_id: f.fork.id,
            head: f.fork.repo_ref(),
            head_branch: "feature".into(),
            title: "t".into(),
            poster: "carol".into(),
            state: PullRequestState::Open,
            allow_maintainer_edit,
            merged_commit: None,
            merged_by: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_owner_is_admin_and_anonymous_reads() {
        let f = fixture();
        let policy = AccessPolicy::new(f.db.clone(), true);
        assert_eq!(policy.access_mode(Some("acme"), &f.base).unwrap(), AccessMode::Admin);
        assert_eq!(policy.access_mode(None, &f.base).unwrap(), AccessMode::Read);
        assert_eq!(policy.access_mode(Some("zed"), &f.base).unwrap(), AccessMode::Read);

        let policy = policy.with_site_admin("root");
        assert!(policy.is_admin("root", &f.base).unwrap());
    }

    #[test]
    fn test_head_owner_may_merge_and_rebase() {
        let f = fixture();
        let policy = AccessPolicy::new(f.db.clone(), true);
        let pr = fork_pr(&f, false);
        let perm = policy.update_permission(&pr, "carol", &f.fork, &f.base).unwrap();
        assert_eq!(perm, UpdatePermission { merge: true, rebase: true });
    }

    #[test]
    fn test_base_maintainer_needs_maintainer_edit() {
        let f = fixture();
        f.db.set_collaborator(f.base.id, "mia", AccessMode::Write).unwrap();
        let policy = AccessPolicy::new(f.db.clone(), true);

        let closed = fork_pr(&f, false);
        assert!(!policy
            .update_permission(&closed, "mia", &f.fork, &f.base)
            .unwrap()
            .merge);

        let open = fork_pr(&f, true);
        let grant = policy
            .grant_update(&open, "mia", UpdateStrategy::Merge, &f.fork, &f.base)
            .unwrap()
            .unwrap();
        assert!(grant.covers(&f.fork.repo_ref(), "feature", false));
        assert!(!grant.covers(&f.fork.repo_ref(), "feature", true));
    }

    #[test]
    fn test_reader_is_denied() {
        let f = fixture();
        f.db.set_collaborator(f.fork.id, "rita", AccessMode::Read).unwrap();
        let policy = AccessPolicy::new(f.db.clone(), true);
        let pr = fork_pr(&f, true);
        assert!(policy
            .grant_update(&pr, "rita", UpdateStrategy::Merge, &f.fork, &f.base)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_protection_limits_update_styles() {
        let f = fixture();
        let policy = AccessPolicy::new(f.db.clone(), true);
        let pr = fork_pr(&f, false);

        f.db.upsert_protected_branch(&ProtectedBranch {
            repo_id: f.fork.id,
            branch: "feature".into(),
            allow_push: true,
            allow_force_push: false,
        })
        .unwrap();
        let perm = policy.update_permission(&pr, "carol", &f.fork, &f.base).unwrap();
        assert_eq!(perm, UpdatePermission { merge: true, rebase: false });

        f.db.upsert_protected_branch(&ProtectedBranch {
            repo_id: f.fork.id,
            branch: "feature".into(),
            allow_push: false,
            allow_force_push: false,
        })
        .unwrap();
        let perm = policy.update_permission(&pr, "carol", &f.fork, &f.base).unwrap();
        assert_eq!(perm, UpdatePermission::default());
    }

    #[test]
    fn test_rebase_update_can_be_disabled() {
        let f = fixture();
        let policy = AccessPolicy::new(f.db.clone(), false);
        let pr = fork_pr(&f, false);
        let perm = policy.update_permission(&pr, "carol", &f.fork, &f.base).unwrap();
        assert!(perm.merge);
        assert!(!perm.rebase);
    }

    #[test]
    fn test_merge_grant_targets_base_branch() {
        let f = fixture();
        let policy = AccessPolicy::new(f.db.clone(), true);
        let pr = fork_pr(&f, false);
        assert!(policy.grant_merge(&pr, "carol", &f.base).unwrap().is_none());
        let grant = policy.grant_merge(&pr, "acme", &f.base).unwrap().unwrap();
        assert_eq!(grant.branch(), "main");
        assert_eq!(grant.repo(), &f.base.repo_ref());
        assert!(!grant.allows_history_rewrite());
    }
}
