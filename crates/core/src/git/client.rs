//! Bare repository operations via `git2`.
//!
//! [`GitClient`] is the commit-store boundary used by divergence counting,
//! reconciliation and the contents API. It never touches a working tree:
//! commits are written as loose objects first and published afterwards with a
//! compare-and-swap ref update.

use std::path::{Path, PathBuf};

use git2::{BranchType, ErrorCode, Oid, Repository, Signature, Sort, Tree};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::errors::GitError;

/// Namespace for scratch refs holding fetched base branches of fork PRs.
pub const BASE_SCRATCH_NAMESPACE: &str = "refs/prforge/base";

/// High-level Git client wrapping a bare `git2::Repository`.
pub struct GitClient {
    repo: Repository,
    repo_path: PathBuf,
}

/// Information about a single Git commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitCommitInfo {
    pub sha: String,
    pub message: String,
    pub author_name: String,
    pub author_email: String,
    pub author_time: i64,
    pub committer_name: String,
    pub committer_email: String,
    pub parents: Vec<String>,
}

/// A branch name and the commit it points at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BranchInfo {
    pub name: String,
    pub sha: String,
}

pub fn branch_ref(branch: &str) -> String {
    format!("refs/heads/{}", branch)
}

impl GitClient {
    /// Open an existing repository at `repo_path`.
    pub fn open<P: AsRef<Path>>(repo_path: P) -> Result<Self, GitError> {
        let path = repo_path.as_ref();
        debug!(path = %path.display(), "opening git repository");
        let repo = Repository::open_bare(path)
            .or_else(|_| Repository::open(path))
            .map_err(|_| GitError::RepositoryNotFound(path.display().to_string()))?;
        Ok(Self {
            repo,
            repo_path: path.to_path_buf(),
        })
    }

    /// Initialise a new bare repository whose HEAD names `default_branch`.
    #[instrument(fields(path = %path.display()))]
    pub fn init_bare(path: &Path, default_branch: &str) -> Result<Self, GitError> {
        if path.exists() {
            return Err(GitError::RepositoryExists(path.display().to_string()));
        }
        info!("initialising bare repository");
        let mut opts = git2::RepositoryInitOptions::new();
        opts.bare(true)
            .mkpath(true)
            .initial_head(default_branch);
        let repo = Repository::init_opts(path, &opts)?;
        Ok(Self {
            repo,
            repo_path: path.to_path_buf(),
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    /// Directory holding this repository's object database.
    pub fn objects_dir(&self) -> PathBuf {
        self.repo.path().join("objects")
    }

    // -- refs ---------------------------------------------------------------

    /// Resolve `refs/heads/<branch>` to the commit it points at.
    pub fn resolve_branch(&self, branch: &str) -> Result<Oid, GitError> {
        self.resolve_ref(&branch_ref(branch))
    }

    /// Resolve a full ref name to a commit id.
    pub fn resolve_ref(&self, refname: &str) -> Result<Oid, GitError> {
        match self.repo.find_reference(refname) {
            Ok(reference) => Ok(reference.peel_to_commit()?.id()),
            Err(e) if e.code() == ErrorCode::NotFound => {
                Err(GitError::RefNotFound(refname.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve `refs/tags/<tag>` to the commit it points at.
    pub fn resolve_tag(&self, tag: &str) -> Result<Oid, GitError> {
        self.resolve_ref(&format!("refs/tags/{}", tag))
    }

    /// Resolve a full (or unambiguous abbreviated) commit id.
    pub fn resolve_commit(&self, rev: &str) -> Result<Oid, GitError> {
        let not_found = || GitError::RefNotFound(rev.to_string());
        if rev.len() < 4 || !rev.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(not_found());
        }
        let object = self.repo.revparse_single(rev).map_err(|_| not_found())?;
        let commit = object.peel_to_commit().map_err(|_| not_found())?;
        Ok(commit.id())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool, GitError> {
        match self.repo.find_branch(branch, BranchType::Local) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// List all local branches with their tips.
    pub fn list_branches(&self) -> Result<Vec<BranchInfo>, GitError> {
        let branches = self.repo.branches(Some(BranchType::Local))?;
        let mut infos = Vec::new();
        for branch_result in branches {
            let (branch, _) = branch_result?;
            let Some(name) = branch.name()? else {
                continue;
            };
            let Some(target) = branch.get().target() else {
                continue;
            };
            infos.push(BranchInfo {
                name: name.to_string(),
                sha: target.to_string(),
            });
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    /// Point `refname` at `new`, but only if it currently equals `expected`.
    ///
    /// `expected == None` means the ref must not exist yet. A ref that moved
    /// yields [`GitError::RefModified`]; a ref that vanished yields
    /// [`GitError::RefNotFound`].
    #[instrument(skip(self, log_message))]
    pub fn compare_and_swap_ref(
        &self,
        refname: &str,
        new: Oid,
        expected: Option<Oid>,
        log_message: &str,
    ) -> Result<(), GitError> {
        let result = match expected {
            Some(current) => self
                .repo
                .reference_matching(refname, new, true, current, log_message)
                .map(|_| ()),
            None => self.repo.reference(refname, new, false, log_message).map(|_| ()),
        };
        let expected_str = expected
            .map(|oid| oid.to_string())
            .unwrap_or_else(|| "<absent>".to_string());
        match result {
            Ok(()) => {
                info!(refname, expected = %expected_str, "ref advanced");
                Ok(())
            }
            Err(e) if e.code() == ErrorCode::Modified || e.code() == ErrorCode::Exists => {
                warn!(refname, expected = %expected_str, "ref moved during update");
                Err(GitError::RefModified {
                    reference: refname.to_string(),
                    expected: expected_str,
                })
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                Err(GitError::RefNotFound(refname.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Create a new branch pointing at `target`. Fails if it already exists.
    #[instrument(skip(self))]
    pub fn create_branch(&self, name: &str, target: Oid) -> Result<(), GitError> {
        self.compare_and_swap_ref(
            &branch_ref(name),
            target,
            None,
            &format!("prforge: create branch {}", name),
        )
    }

    /// Delete a local branch.
    #[instrument(skip(self))]
    pub fn delete_branch(&self, name: &str) -> Result<(), GitError> {
        let mut branch = self
            .repo
            .find_branch(name, BranchType::Local)
            .map_err(|_| GitError::RefNotFound(branch_ref(name)))?;
        branch.delete()?;
        info!(name, "deleted branch");
        Ok(())
    }

    // -- commits ------------------------------------------------------------

    /// Parent ids of a commit, in order.
    pub fn commit_parents(&self, oid: Oid) -> Result<Vec<Oid>, GitError> {
        let commit = self.repo.find_commit(oid)?;
        Ok(commit.parent_ids().collect())
    }

    pub fn commit_info(&self, oid: Oid) -> Result<GitCommitInfo, GitError> {
        let commit = self.repo.find_commit(oid)?;
        let author = commit.author();
        let committer = commit.committer();
        Ok(GitCommitInfo {
            sha: oid.to_string(),
            message: commit.message().unwrap_or("").to_string(),
            author_name: author.name().unwrap_or("").to_string(),
            author_email: author.email().unwrap_or("").to_string(),
            author_time: author.when().seconds(),
            committer_name: committer.name().unwrap_or("").to_string(),
            committer_email: committer.email().unwrap_or("").to_string(),
            parents: commit.parent_ids().map(|p| p.to_string()).collect(),
        })
    }

    /// Commits reachable from `include` but not from `exclude`, oldest first.
    pub fn commits_between(&self, include: Oid, exclude: Oid) -> Result<Vec<Oid>, GitError> {
        let mut revwalk = self.repo.revwalk()?;
        revwalk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)?;
        revwalk.push(include)?;
        revwalk.hide(exclude)?;
        let commits = revwalk.collect::<Result<Vec<_>, _>>()?;
        debug!(count = commits.len(), %include, %exclude, "walked commit range");
        Ok(commits)
    }

    /// Write a commit object without moving any ref.
    pub fn write_commit(
        &self,
        author: &Signature<'_>,
        committer: &Signature<'_>,
        message: &str,
        tree: &Tree<'_>,
        parents: &[Oid],
    ) -> Result<Oid, GitError> {
        let parent_commits = parents
            .iter()
            .map(|p| self.repo.find_commit(*p))
            .collect::<Result<Vec<_>, _>>()?;
        let parent_refs: Vec<&git2::Commit<'_>> = parent_commits.iter().collect();
        let oid = self
            .repo
            .commit(None, author, committer, message, tree, &parent_refs)?;
        debug!(sha = %oid, parents = parents.len(), "wrote commit object");
        Ok(oid)
    }

    // -- cross-repository plumbing -----------------------------------------

    /// Fetch `branch` from another repository on disk into `into_ref`.
    ///
    /// Returns the fetched tip.
    #[instrument(skip(self), fields(source = %source.display()))]
    pub fn fetch_branch_from(
        &self,
        source: &Path,
        branch: &str,
        into_ref: &str,
    ) -> Result<Oid, GitError> {
        let url = source
            .to_str()
            .ok_or_else(|| GitError::RepositoryNotFound(source.display().to_string()))?;
        if let Ok(mut stale) = self.repo.find_reference(into_ref) {
            stale.delete()?;
        }
        let mut remote = self.repo.remote_anonymous(url)?;
        let refspec = format!("+{}:{}", branch_ref(branch), into_ref);
        remote
            .fetch(&[refspec.as_str()], None, None)
            .map_err(|e| {
                if e.code() == ErrorCode::NotFound {
                    GitError::RefNotFound(branch_ref(branch))
                } else {
                    GitError::Git2Error(e)
                }
            })?;
        let tip = self.resolve_ref(into_ref)?;
        info!(branch, into_ref, %tip, "fetched branch");
        Ok(tip)
    }

    /// Let this handle read objects from another repository.
    ///
    /// The alternate only lives in this in-memory object database; nothing is
    /// written to `objects/info/alternates`.
    pub fn add_object_alternate(&self, other: &GitClient) -> Result<(), GitError> {
        let odb = self.repo.odb()?;
        let dir = other.objects_dir();
        let dir = dir
            .to_str()
            .ok_or_else(|| GitError::RepositoryNotFound(dir.display().to_string()))?;
        odb.add_disk_alternate(dir)?;
        debug!(alternate = dir, "added object alternate");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig() -> Signature<'static> {
        Signature::now("Test", "test@test.com").unwrap()
    }

    fn commit_file(client: &GitClient, parents: &[Oid], name: &str, body: &str) -> Oid {
        let repo = client.repo();
        let blob = repo.blob(body.as_bytes()).unwrap();
        let mut builder = repo.treebuilder(None).unwrap();
        builder.insert(name, blob, 0o100644).unwrap();
        let tree = repo.find_tree(builder.write().unwrap()).unwrap();
        client
            .write_commit(&sig(), &sig(), "commit", &tree, parents)
            .unwrap()
    }

    #[test]
    fn test_init_and_compare_and_swap() {
        let dir = tempfile::tempdir().unwrap();
        let client = GitClient::init_bare(&dir.path().join("r.git"), "main").unwrap();
        let first = commit_file(&client, &[], "a.txt", "one");
        client.create_branch("main", first).unwrap();
        assert_eq!(client.resolve_branch("main").unwrap(), first);

        let second = commit_file(&client, &[first], "a.txt", "two");
        client
            .compare_and_swap_ref("refs/heads/main", second, Some(first), "advance")
            .unwrap();
        assert_eq!(client.resolve_branch("main").unwrap(), second);

        let third = commit_file(&client, &[first], "a.txt", "three");
        let err = client
            .compare_and_swap_ref("refs/heads/main", third, Some(first), "stale")
            .unwrap_err();
        assert!(matches!(err, GitError::RefModified { .. }));
        assert_eq!(client.resolve_branch("main").unwrap(), second);
    }

    #[test]
    fn test_create_branch_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let client = GitClient::init_bare(&dir.path().join("r.git"), "main").unwrap();
        let oid = commit_file(&client, &[], "f.txt", "c");
        client.create_branch("feature", oid).unwrap();
        assert!(matches!(
            client.create_branch("feature", oid),
            Err(GitError::RefModified { .. })
        ));
        let names: Vec<String> = client
            .list_branches()
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, vec!["feature".to_string()]);
        client.delete_branch("feature").unwrap();
        assert!(!client.branch_exists("feature").unwrap());
    }

    #[test]
    fn test_commits_between_is_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let client = GitClient::init_bare(&dir.path().join("r.git"), "main").unwrap();
        let a = commit_file(&client, &[], "f", "a");
        let b = commit_file(&client, &[a], "f", "b");
        let c = commit_file(&client, &[b], "f", "c");
        assert_eq!(client.commits_between(c, a).unwrap(), vec![b, c]);
        assert_eq!(client.commit_parents(c).unwrap(), vec![b]);
    }

    #[test]
    fn test_missing_refs() {
        let dir = tempfile::tempdir().unwrap();
        let client = GitClient::init_bare(&dir.path().join("r.git"), "main").unwrap();
        assert!(matches!(
            client.resolve_branch("nope"),
            Err(GitError::RefNotFound(_))
        ));
        assert!(client.resolve_commit("zzzz").is_err());
        assert!(matches!(
            GitClient::init_bare(&dir.path().join("r.git"), "main"),
            Err(GitError::RepositoryExists(_))
        ));
    }

    #[test]
    fn test_repo_not_found() {
        assert!(matches!(
            GitClient::open("/nonexistent"),
            Err(GitError::RepositoryNotFound(_))
        ));
    }
}
