//! On-disk layout of hosted repositories.
//!
//! Every repository lives at `<root>/<owner>/<name>.git` as a bare git
//! repository. The store also owns the ref-lock registry shared by all
//! writers in this process.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Instant;

use regex_lite::Regex;
use tracing::info;

use super::client::{branch_ref, GitClient};
use super::ref_lock::{RefLockGuard, RefLocks};
use crate::errors::GitError;
use crate::models::RepoRef;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]*$").expect("static regex"))
}

/// Check an owner or repository name.
pub fn validate_repo_name(name: &str) -> Result<(), GitError> {
    let invalid = |detail: &str| GitError::InvalidName {
        name: name.to_string(),
        detail: detail.to_string(),
    };
    if name.is_empty() || name.len() > 100 {
        return Err(invalid("must be between 1 and 100 characters"));
    }
    if !name_pattern().is_match(name) {
        return Err(invalid("may only contain letters, digits, '-', '_' and '.'"));
    }
    if name.ends_with(".git") || name.contains("..") {
        return Err(invalid("must not end in .git or contain '..'"));
    }
    Ok(())
}

/// Check a branch name against git's ref-format rules.
pub fn validate_branch_name(name: &str) -> Result<(), GitError> {
    if name.is_empty() || !git2::Reference::is_valid_name(&branch_ref(name)) {
        return Err(GitError::InvalidName {
            name: name.to_string(),
            detail: "not a valid branch name".to_string(),
        });
    }
    Ok(())
}

/// Filesystem registry of bare repositories.
#[derive(Clone)]
pub struct RepositoryStore {
    root: PathBuf,
    default_branch: String,
    locks: RefLocks,
}

impl RepositoryStore {
    pub fn new<P: AsRef<Path>>(root: P, default_branch: &str) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            default_branch: default_branch.to_string(),
            locks: RefLocks::new(),
        }
    }

    pub fn default_branch(&self) -> &str {
        &self.default_branch
    }

    /// Path of the bare repository for `repo`.
    pub fn repo_path(&self, repo: &RepoRef) -> PathBuf {
        self.root
            .join(&repo.owner)
            .join(format!("{}.git", repo.name))
    }

    pub fn exists(&self, repo: &RepoRef) -> bool {
        self.repo_path(repo).join("HEAD").exists()
    }

    /// Initialise a new bare repository.
    pub fn create(&self, repo: &RepoRef, default_branch: Option<&str>) -> Result<GitClient, GitError> {
        validate_repo_name(&repo.owner)?;
        validate_repo_name(&repo.name)?;
        let branch = default_branch.unwrap_or(&self.default_branch);
        validate_branch_name(branch)?;
        let client = GitClient::init_bare(&self.repo_path(repo), branch)?;
        info!(repo = %repo, default_branch = branch, "created repository");
        Ok(client)
    }

    pub fn open(&self, repo: &RepoRef) -> Result<GitClient, GitError> {
        let path = self.repo_path(repo);
        if !path.exists() {
            return Err(GitError::RepositoryNotFound(repo.to_string()));
        }
        GitClient::open(path)
    }

    /// Serialize writers of `refname` in `repo`. `None` on timeout.
    pub fn lock_ref(
        &self,
        repo: &RepoRef,
        refname: &str,
        deadline: Option<Instant>,
    ) -> Option<RefLockGuard> {
        self.locks.acquire(&lock_key(&self.repo_path(repo), refname), deadline)
    }

    pub fn locks(&self) -> &RefLocks {
        &self.locks
    }
}

pub fn lock_key(repo_path: &Path, refname: &str) -> String {
    format!("{}:{}", repo_path.display(), refname)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = RepositoryStore::new(dir.path(), "main");
        let repo = RepoRef::new("acme", "widgets");
        assert!(!store.exists(&repo));
        store.create(&repo, None).unwrap();
        assert!(store.exists(&repo));
        assert!(store.repo_path(&repo).ends_with("acme/widgets.git"));
        let client = store.open(&repo).unwrap();
        assert!(client.repo().is_bare());
        assert!(matches!(
            store.create(&repo, None),
            Err(GitError::RepositoryExists(_))
        ));
    }

    #[test]
    fn test_open_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = RepositoryStore::new(dir.path(), "main");
        assert!(matches!(
            store.open(&RepoRef::new("acme", "ghost")),
            Err(GitError::RepositoryNotFound(_))
        ));
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_repo_name("widgets").is_ok());
        assert!(validate_repo_name("my-repo.rs").is_ok());
        assert!(validate_repo_name("").is_err());
        assert!(validate_repo_name("../etc").is_err());
        assert!(validate_repo_name("repo.git").is_err());
        assert!(validate_repo_name(".hidden").is_err());

        assert!(validate_branch_name("feature/login").is_ok());
        assert!(validate_branch_name("bad..name").is_err());
        assert!(validate_branch_name("trailing.lock").is_err());
        assert!(validate_branch_name("").is_err());
    }

    #[test]
    fn test_ref_locks_are_per_repo() {
        let dir = tempfile::tempdir().unwrap();
        let store = RepositoryStore::new(dir.path(), "main");
        let a = RepoRef::new("acme", "a");
        let b = RepoRef::new("acme", "b");
        let _held = store.lock_ref(&a, "refs/heads/main", None).unwrap();
        assert!(store.lock_ref(&b, "refs/heads/main", None).is_some());
        assert!(store
            .locks()
            .try_acquire(&lock_key(&store.repo_path(&a), "refs/heads/main"))
            .is_none());
    }
}
