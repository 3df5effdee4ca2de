//! Repository registry: metadata rows plus the bare repositories they name.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::access::{AccessPolicy, WriteGrant};
use crate::db::queries::CollaboratorEntry;
use crate::db::Database;
use crate::errors::{CoreError, GitError};
use crate::git::store::{validate_branch_name, validate_repo_name};
use crate::git::{BranchInfo, RepositoryStore};
use crate::models::{AccessMode, AuditEntry, ProtectedBranch, RepoRef, Repository};

#[derive(Clone)]
pub struct RepositoryService {
    db: Arc<Database>,
    store: RepositoryStore,
    policy: AccessPolicy,
}

impl RepositoryService {
    pub fn new(db: Arc<Database>, store: RepositoryStore, policy: AccessPolicy) -> Self {
        Self { db, store, policy }
    }

    /// Register `repo` and initialise its bare repository.
    #[instrument(skip(self), fields(repo = %repo))]
    pub fn create(
        &self,
        repo: &RepoRef,
        default_branch: Option<&str>,
    ) -> Result<Repository, CoreError> {
        validate_repo_name(&repo.owner)?;
        validate_repo_name(&repo.name)?;
        let branch = default_branch.unwrap_or(self.store.default_branch());
        validate_branch_name(branch)?;
        if self.db.get_repository(repo)?.is_some() {
            return Err(GitError::RepositoryExists(repo.to_string()).into());
        }

        self.store.create(repo, Some(branch))?;
        let id = self.db.insert_repository(&repo.owner, &repo.name, branch)?;
        self.audit(AuditEntry::success("repo.create", &format!("default branch {}", branch)).on(repo));
        info!(id, "repository created");
        Ok(self.db.get_repository_by_id(id)?)
    }

    pub fn get(&self, repo: &RepoRef) -> Result<Repository, CoreError> {
        self.db
            .get_repository(repo)?
            .ok_or_else(|| CoreError::RepositoryNotFound(repo.to_string()))
    }

    pub fn list(&self) -> Result<Vec<Repository>, CoreError> {
        Ok(self.db.list_repositories()?)
    }

    pub fn list_branches(&self, repo: &RepoRef) -> Result<Vec<BranchInfo>, CoreError> {
        self.get(repo)?;
        Ok(self.store.open(repo)?.list_branches()?)
    }

    /// Give `username` `mode` on `repo`; `AccessMode::None` removes them.
    pub fn set_collaborator(
        &self,
        repo: &RepoRef,
        actor: &str,
        username: &str,
        mode: AccessMode,
    ) -> Result<(), CoreError> {
        let record = self.require_admin(repo, actor, "manage collaborators")?;
        self.db.set_collaborator(record.id, username, mode)?;
        self.audit(
            AuditEntry::success("repo.collaborator", &format!("{} -> {}", username, mode))
                .by(actor)
                .on(repo),
        );
        Ok(())
    }

    pub fn list_collaborators(&self, repo: &RepoRef) -> Result<Vec<CollaboratorEntry>, CoreError> {
        let record = self.get(repo)?;
        Ok(self.db.list_collaborators(record.id)?)
    }

    pub fn protect_branch(
        &self,
        repo: &RepoRef,
        actor: &str,
        branch: &str,
        allow_push: bool,
        allow_force_push: bool,
    ) -> Result<ProtectedBranch, CoreError> {
        let record = self.require_admin(repo, actor, "protect branches")?;
        validate_branch_name(branch)?;
        let rule = ProtectedBranch {
            repo_id: record.id,
            branch: branch.to_string(),
            allow_push,
            allow_force_push,
        };
        self.db.upsert_protected_branch(&rule)?;
        self.audit(
            AuditEntry::success(
                "repo.protect",
                &format!("{} push={} force_push={}", branch, allow_push, allow_force_push),
            )
            .by(actor)
            .on(repo),
        );
        Ok(rule)
    }

    pub fn unprotect_branch(
        &self,
        repo: &RepoRef,
        actor: &str,
        branch: &str,
    ) -> Result<bool, CoreError> {
        let record = self.require_admin(repo, actor, "protect branches")?;
        let removed = self.db.remove_protected_branch(record.id, branch)?;
        if removed {
            self.audit(AuditEntry::success("repo.unprotect", branch).by(actor).on(repo));
        }
        Ok(removed)
    }

    /// Write grant for a single-file commit to `branch`.
    ///
    /// Fails with `Forbidden` when the actor cannot write to the repository
    /// at all; `Ok(None)` means branch protection refuses the push.
    pub fn content_grant(
        &self,
        repo: &RepoRef,
        actor: &str,
        branch: &str,
    ) -> Result<Option<WriteGrant>, CoreError> {
        let record = self.get(repo)?;
        if !self.policy.can_write(actor, &record)? {
            return Err(CoreError::Forbidden {
                actor: actor.to_string(),
                action: "write files".into(),
                repo: repo.to_string(),
            });
        }
        Ok(self.policy.grant_branch_write(actor, &record, branch)?)
    }

    fn require_admin(
        &self,
        repo: &RepoRef,
        actor: &str,
        action: &str,
    ) -> Result<Repository, CoreError> {
        let record = self.get(repo)?;
        if !self.policy.is_admin(actor, &record)? {
            return Err(CoreError::Forbidden {
                actor: actor.to_string(),
                action: action.to_string(),
                repo: repo.to_string(),
            });
        }
        Ok(record)
    }

    fn audit(&self, entry: AuditEntry) {
        if let Err(e) = self.db.insert_audit_entry(&entry) {
            warn!(action = %entry.action, error = %e, "failed to write audit entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (tempfile::TempDir, RepositoryService) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::in_memory().unwrap());
        db.initialize().unwrap();
        let store = RepositoryStore::new(dir.path(), "main");
        let policy = AccessPolicy::new(db.clone(), true);
        (dir, RepositoryService::new(db, store, policy))
    }

    #[test]
    fn test_create_and_get() {
        let (_dir, svc) = service();
        let repo = RepoRef::new("acme", "widgets");
        let created = svc.create(&repo, None).unwrap();
        assert_eq!(created.default_branch, "main");
        assert_eq!(svc.get(&repo).unwrap().id, created.id);
        assert!(svc.list_branches(&repo).unwrap().is_empty());

        let err = svc.create(&repo, None).unwrap_err();
        assert!(matches!(err, CoreError::Git(_)));
        let err = svc.get(&RepoRef::new("acme", "missing")).unwrap_err();
        assert!(matches!(err, CoreError::RepositoryNotFound(_)));
    }

    #[test]
    fn test_invalid_names_rejected() {
        let (_dir, svc) = service();
        assert!(svc.create(&RepoRef::new("acme", "bad..name"), None).is_err());
        assert!(svc.create(&RepoRef::new("acme", "ok"), Some("bad branch")).is_err());
    }

    #[test]
    fn test_only_admins_manage_collaborators() {
        let (_dir, svc) = service();
        let repo = RepoRef::new("acme", "widgets");
        svc.create(&repo, None).unwrap();

        let err = svc
            .set_collaborator(&repo, "mallory", "mallory", AccessMode::Admin)
            .unwrap_err();
        assert!(matches!(err, CoreError::Forbidden { .. }));

        svc.set_collaborator(&repo, "acme", "bob", AccessMode::Write).unwrap();
        let collaborators = svc.list_collaborators(&repo).unwrap();
        assert_eq!(collaborators.len(), 1);
        assert_eq!(collaborators[0].mode, AccessMode::Write);
    }

    #[test]
    fn test_content_grant_respects_protection() {
        let (_dir, svc) = service();
        let repo = RepoRef::new("acme", "widgets");
        svc.create(&repo, None).unwrap();
        svc.set_collaborator(&repo, "acme", "bob", AccessMode::Write).unwrap();

        assert!(svc.content_grant(&repo, "bob", "main").unwrap().is_some());
        assert!(matches!(
            svc.content_grant(&repo, "eve", "main"),
            Err(CoreError::Forbidden { .. })
        ));

        svc.protect_branch(&repo, "acme", "main", false, false).unwrap();
        assert!(svc.content_grant(&repo, "bob", "main").unwrap().is_none());
        assert!(svc.unprotect_branch(&repo, "acme", "main").unwrap());
        assert!(svc.content_grant(&repo, "bob", "main").unwrap().is_some());
    }
}
