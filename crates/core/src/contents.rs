//! Reading and writing single files of a repository.
//!
//! Writes are optimistic: updates and deletes carry the blob SHA the caller
//! last saw, and the branch moves with a compare-and-swap so a concurrent
//! push is never overwritten.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use git2::build::TreeUpdateBuilder;
use git2::{FileMode, ObjectType, Oid, Tree};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::access::WriteGrant;
use crate::errors::{ContentError, GitError};
use crate::git::store::validate_branch_name;
use crate::git::{branch_ref, GitClient, RepositoryStore};
use crate::identity::IdentityMapper;
use crate::models::RepoRef;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// A file as returned by the contents API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    pub name: String,
    pub path: String,
    /// Blob id.
    pub sha: String,
    pub size: usize,
    pub encoding: String,
    /// Base64 of the blob.
    pub content: String,
}

impl FileContent {
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(&self.content)
    }
}

/// What to do with the file at a path.
#[derive(Debug, Clone)]
pub enum FileChange {
    Create { content: Vec<u8> },
    Update { content: Vec<u8>, sha: Option<String> },
    Delete { sha: Option<String> },
}

impl FileChange {
    fn verb(&self) -> &'static str {
        match self {
            Self::Create { .. } => "Add",
            Self::Update { .. } => "Update",
            Self::Delete { .. } => "Delete",
        }
    }
}

/// Where and how to commit a [`FileChange`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeFileOptions {
    /// Branch to base the commit on; the default branch when absent.
    #[serde(default)]
    pub branch: Option<String>,
    /// Commit to this new branch instead of advancing `branch`.
    #[serde(default)]
    pub new_branch: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Result of a successful file write.
#[derive(Debug, Clone, Serialize)]
pub struct FileCommitResponse {
    pub commit: String,
    pub branch: String,
    /// The written file; absent for deletes.
    pub content: Option<FileContent>,
}

/// Normalize a repository path.
///
/// Empty segments and `.` are dropped and `..` climbs, so the result never
/// escapes the root. Empty paths and paths through `.git` are rejected.
pub fn clean_path(path: &str) -> Result<String, ContentError> {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    if parts.is_empty() || parts.iter().any(|p| p.eq_ignore_ascii_case(".git")) {
        return Err(ContentError::FilenameInvalid(path.to_string()));
    }
    Ok(parts.join("/"))
}

/// File reads and single-file commits against a [`RepositoryStore`].
#[derive(Clone)]
pub struct ContentService {
    store: RepositoryStore,
    identities: Arc<IdentityMapper>,
    lock_timeout: Duration,
}

impl ContentService {
    pub fn new(store: RepositoryStore, identities: Arc<IdentityMapper>) -> Self {
        Self {
            store,
            identities,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// How long a write waits for another writer of the same branch.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Read `path` at `reference`.
    ///
    /// The reference is tried as a branch, a tag, then a commit id; `None`
    /// means the repository's default branch.
    #[instrument(skip(self), fields(repo = %repo))]
    pub fn get_file(
        &self,
        repo: &RepoRef,
        path: &str,
        reference: Option<&str>,
    ) -> Result<FileContent, ContentError> {
        let path = clean_path(path)?;
        let client = self.store.open(repo)?;
        let reference = reference.unwrap_or(self.store.default_branch()).to_string();
        let commit = resolve_reference(&client, &reference)?;
        let tree = client.repo().find_commit(commit)?.tree()?;
        let entry = tree
            .get_path(std::path::Path::new(&path))
            .map_err(|_| ContentError::FileNotFound {
                path: path.clone(),
                reference: reference.clone(),
            })?;
        if entry.kind() != Some(ObjectType::Blob) {
            return Err(ContentError::FilePathInvalid {
                path,
                detail: "path is a directory".into(),
            });
        }
        file_content(&client, &path, entry.id())
    }

    pub fn create_file(
        &self,
        repo: &RepoRef,
        path: &str,
        content: Vec<u8>,
        opts: &ChangeFileOptions,
        actor: &str,
        grant: Option<&WriteGrant>,
    ) -> Result<FileCommitResponse, ContentError> {
        self.change_file(repo, path, FileChange::Create { content }, opts, actor, grant)
    }

    pub fn update_file(
        &self,
        repo: &RepoRef,
        path: &str,
        content: Vec<u8>,
        sha: Option<String>,
        opts: &ChangeFileOptions,
        actor: &str,
        grant: Option<&WriteGrant>,
    ) -> Result<FileCommitResponse, ContentError> {
        self.change_file(repo, path, FileChange::Update { content, sha }, opts, actor, grant)
    }

    pub fn delete_file(
        &self,
        repo: &RepoRef,
        path: &str,
        sha: Option<String>,
        opts: &ChangeFileOptions,
        actor: &str,
        grant: Option<&WriteGrant>,
    ) -> Result<FileCommitResponse, ContentError> {
        self.change_file(repo, path, FileChange::Delete { sha }, opts, actor, grant)
    }

    /// Commit one file change. `grant` must cover the branch being written
    /// (`new_branch` when given).
    #[instrument(skip(self, change, grant), fields(repo = %repo, op = change.verb()))]
    pub fn change_file(
        &self,
        repo: &RepoRef,
        path: &str,
        change: FileChange,
        opts: &ChangeFileOptions,
        actor: &str,
        grant: Option<&WriteGrant>,
    ) -> Result<FileCommitResponse, ContentError> {
        let path = clean_path(path)?;
        let branch = opts
            .branch
            .clone()
            .unwrap_or_else(|| self.store.default_branch().to_string());
        let target = opts.new_branch.clone().unwrap_or_else(|| branch.clone());
        validate_branch_name(&target)?;

        match grant {
            Some(g) if g.actor() == actor && g.covers(repo, &target, false) => {}
            _ => {
                return Err(ContentError::UserCannotCommit {
                    actor: actor.to_string(),
                    branch: target,
                })
            }
        }
        let signature = self.identities.signature_for(actor)?;

        let target_ref = branch_ref(&target);
        let _lock = self
            .store
            .lock_ref(repo, &target_ref, Some(Instant::now() + self.lock_timeout))
            .ok_or_else(|| ContentError::ConcurrentModification(target.clone()))?;

        let client = self.store.open(repo)?;
        let parent = match client.resolve_branch(&branch) {
            Ok(oid) => Some(oid),
            // The first commit of an empty repository.
            Err(GitError::RefNotFound(_)) if client.list_branches()?.is_empty() => None,
            Err(GitError::RefNotFound(_)) => {
                return Err(ContentError::ReferenceNotFound(branch));
            }
            Err(e) => return Err(e.into()),
        };
        if opts.new_branch.is_some() && client.branch_exists(&target)? {
            return Err(ContentError::BranchAlreadyExists(target));
        }

        let repo_handle = client.repo();
        let baseline = match parent {
            Some(oid) => repo_handle.find_commit(oid)?.tree()?,
            None => {
                let empty = repo_handle.treebuilder(None)?.write()?;
                repo_handle.find_tree(empty)?
            }
        };

        let existing = lookup(&baseline, &path)?;
        let verb = change.verb();
        let mut update = TreeUpdateBuilder::new();
        let written_blob = match change {
            FileChange::Create { content } => {
                if existing.is_some() {
                    return Err(ContentError::FileAlreadyExists(path));
                }
                check_parents_are_dirs(&baseline, &path)?;
                let blob = repo_handle.blob(&content)?;
                update.upsert(path.as_str(), blob, FileMode::Blob);
                Some(blob)
            }
            FileChange::Update { content, sha } => {
                let (current, mode) = existing_blob(existing, &path, &branch)?;
                check_sha(&path, sha, current)?;
                let blob = repo_handle.blob(&content)?;
                update.upsert(path.as_str(), blob, mode);
                Some(blob)
            }
            FileChange::Delete { sha } => {
                let (current, _) = existing_blob(existing, &path, &branch)?;
                check_sha(&path, sha, current)?;
                update.remove(path.as_str());
                None
            }
        };
        let tree_id = update.create_updated(repo_handle, &baseline)?;
        let tree = repo_handle.find_tree(tree_id)?;

        let message = opts
            .message
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| format!("{} '{}'", verb, path));
        let parents: Vec<Oid> = parent.into_iter().collect();
        let commit = client.write_commit(&signature, &signature, &message, &tree, &parents)?;

        let expected = if opts.new_branch.is_some() { None } else { parent };
        client.compare_and_swap_ref(
            &target_ref,
            commit,
            expected,
            &format!("prforge: {} {} by {}", verb.to_lowercase(), path, actor),
        )?;
        info!(%commit, branch = %target, path = %path, "file committed");

        let content = match written_blob {
            Some(blob) => Some(file_content(&client, &path, blob)?),
            None => None,
        };
        Ok(FileCommitResponse {
            commit: commit.to_string(),
            branch: target,
            content,
        })
    }
}

/// Branch, then tag, then commit id.
fn resolve_reference(client: &GitClient, reference: &str) -> Result<Oid, ContentError> {
    if let Ok(oid) = client.resolve_branch(reference) {
        return Ok(oid);
    }
    if let Ok(oid) = client.resolve_tag(reference) {
        return Ok(oid);
    }
    client
        .resolve_commit(reference)
        .map_err(|_| ContentError::ReferenceNotFound(reference.to_string()))
}

fn file_content(client: &GitClient, path: &str, blob: Oid) -> Result<FileContent, ContentError> {
    let blob = client.repo().find_blob(blob)?;
    let name = path.rsplit('/').next().unwrap_or(path).to_string();
    debug!(path, size = blob.size(), "loaded blob");
    Ok(FileContent {
        name,
        path: path.to_string(),
        sha: blob.id().to_string(),
        size: blob.size(),
        encoding: "base64".into(),
        content: base64::engine::general_purpose::STANDARD.encode(blob.content()),
    })
}

/// Entry at `path` as `(id, kind, mode)`, if any.
fn lookup(tree: &Tree<'_>, path: &str) -> Result<Option<(Oid, ObjectType, i32)>, ContentError> {
    match tree.get_path(std::path::Path::new(path)) {
        Ok(entry) => Ok(Some((
            entry.id(),
            entry.kind().unwrap_or(ObjectType::Any),
            entry.filemode(),
        ))),
        Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn existing_blob(
    existing: Option<(Oid, ObjectType, i32)>,
    path: &str,
    branch: &str,
) -> Result<(Oid, FileMode), ContentError> {
    match existing {
        Some((id, ObjectType::Blob, mode)) => {
            let mode = [FileMode::BlobExecutable, FileMode::Link]
                .into_iter()
                .find(|m| i32::from(*m) == mode)
                .unwrap_or(FileMode::Blob);
            Ok((id, mode))
        }
        Some((_, ObjectType::Tree, _)) => Err(ContentError::FilePathInvalid {
            path: path.to_string(),
            detail: "a directory exists where a file was expected".into(),
        }),
        Some(_) => Err(ContentError::FilePathInvalid {
            path: path.to_string(),
            detail: "a submodule exists where a file was expected".into(),
        }),
        None => Err(ContentError::FileNotFound {
            path: path.to_string(),
            reference: branch.to_string(),
        }),
    }
}

fn check_sha(path: &str, given: Option<String>, current: Oid) -> Result<(), ContentError> {
    let given = given
        .filter(|s| !s.is_empty())
        .ok_or(ContentError::ShaNotProvided)?;
    if given != current.to_string() {
        return Err(ContentError::ShaDoesNotMatch {
            path: path.to_string(),
            given,
            current: current.to_string(),
        });
    }
    Ok(())
}

/// Every leading component of `path` must be a directory (or absent).
fn check_parents_are_dirs(tree: &Tree<'_>, path: &str) -> Result<(), ContentError> {
    let mut prefix = String::new();
    let components: Vec<&str> = path.split('/').collect();
    for component in &components[..components.len() - 1] {
        if !prefix.is_empty() {
            prefix.push('/');
        }
        prefix.push_str(component);
        match lookup(tree, &prefix)? {
            Some((_, ObjectType::Tree, _)) => {}
            None => return Ok(()),
            Some(_) => {
                return Err(ContentError::FilePathInvalid {
                    path: path.to_string(),
                    detail: format!("a file exists where a directory is needed: '{}'", prefix),
                })
            }
        }
    }
    Ok(())
}
