//! Error types for the prforge core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Content(#[from] ContentError),

    #[error(transparent)]
    PullRequest(#[from] PullRequestError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// The repository is not registered.
    #[error("repository '{0}' not found")]
    RepositoryNotFound(String),

    /// The actor lacks the access level needed.
    #[error("user '{actor}' is not allowed to {action} in '{repo}'")]
    Forbidden {
        actor: String,
        action: String,
        repo: String,
    },
}

// ---------------------------------------------------------------------------
// Git store errors
// ---------------------------------------------------------------------------

/// Errors from the repository store (git2 operations).
#[derive(Debug, Error)]
pub enum GitError {
    /// The repository path does not exist or is not a git repo.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// A repository with that owner/name already exists on disk.
    #[error("git repository already exists at '{0}'")]
    RepositoryExists(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// A ref (branch, tag, SHA) could not be resolved.
    #[error("git ref not found: {0}")]
    RefNotFound(String),

    /// A compare-and-swap ref update found a different value than expected.
    #[error("ref '{reference}' no longer points at {expected}")]
    RefModified {
        reference: String,
        expected: String,
    },

    /// A branch or repository name failed validation.
    #[error("invalid name '{name}': {detail}")]
    InvalidName {
        name: String,
        detail: String,
    },

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl GitError {
    /// Whether this error means a ref or object was missing.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::RefNotFound(_) | Self::RepositoryNotFound(_) => true,
            Self::Git2Error(e) => e.code() == git2::ErrorCode::NotFound,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Reconciliation errors
// ---------------------------------------------------------------------------

/// Errors from divergence counting and head-branch reconciliation.
///
/// Every variant is terminal for the invocation that produced it; none are
/// retried internally. Only [`ReconcileError::ConcurrentModification`] is
/// worth retrying by the caller.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A branch tip or commit could not be resolved.
    #[error("reference '{reference}' not found in {repo}")]
    ReferenceNotFound {
        repo: String,
        reference: String,
    },

    /// A merge produced content conflicts. For head updates `from` is the
    /// base branch and `into` the head branch; merging a pull request swaps
    /// them.
    #[error("merge of '{from}' into '{into}' failed because of conflicts in: {}", .files.join(", "))]
    MergeConflict {
        from: String,
        into: String,
        files: Vec<String>,
    },

    /// Replaying a head commit onto base produced content conflicts.
    #[error("rebase failed at commit {commit} because of conflicts in: {}", .files.join(", "))]
    RebaseConflict {
        commit: String,
        files: Vec<String>,
    },

    /// The actor has no write access to the head branch.
    #[error("user '{actor}' is not allowed to update '{repo}'")]
    PermissionDenied {
        actor: String,
        repo: String,
    },

    /// The ref moved between reading the tip and advancing it.
    #[error("reference '{reference}' was modified concurrently (expected {expected})")]
    ConcurrentModification {
        reference: String,
        expected: String,
    },

    /// The operation deadline passed or the caller cancelled it.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// The pull request is closed or already merged.
    #[error("pull request #{index} is {state} and cannot be updated")]
    PullRequestNotOpen {
        index: i64,
        state: String,
    },

    /// No commit identity could be derived for the actor.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Underlying repository store error.
    #[error(transparent)]
    Git(GitError),
}

impl From<git2::Error> for ReconcileError {
    fn from(e: git2::Error) -> Self {
        Self::Git(GitError::Git2Error(e))
    }
}

impl From<GitError> for ReconcileError {
    fn from(e: GitError) -> Self {
        match e {
            GitError::RefModified {
                reference,
                expected,
            } => Self::ConcurrentModification {
                reference,
                expected,
            },
            other => Self::Git(other),
        }
    }
}

impl ReconcileError {
    /// Whether re-invoking the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }
}

// ---------------------------------------------------------------------------
// Repository content errors
// ---------------------------------------------------------------------------

/// Errors from the file contents read/write API.
#[derive(Debug, Error)]
pub enum ContentError {
    /// The supplied path is empty or points inside `.git`.
    #[error("file name is invalid: '{0}'")]
    FilenameInvalid(String),

    /// A path component collides with an existing entry of another kind.
    #[error("{detail} [path: {path}]")]
    FilePathInvalid {
        path: String,
        detail: String,
    },

    /// Creating a file that already exists.
    #[error("repository file already exists [path: {0}]")]
    FileAlreadyExists(String),

    /// The file does not exist at the requested ref.
    #[error("file '{path}' not found at '{reference}'")]
    FileNotFound {
        path: String,
        reference: String,
    },

    /// The caller's blob SHA is stale.
    #[error("sha does not match [given: {given}, expected: {current}]")]
    ShaDoesNotMatch {
        path: String,
        given: String,
        current: String,
    },

    /// Update and delete require the current blob SHA.
    #[error("a SHA must be provided to update or delete a file")]
    ShaNotProvided,

    /// The requested new branch is already present.
    #[error("branch already exists [name: {0}]")]
    BranchAlreadyExists(String),

    /// The branch is protected against pushes by this actor.
    #[error("user '{actor}' cannot commit to protected branch '{branch}'")]
    UserCannotCommit {
        actor: String,
        branch: String,
    },

    /// A ref given by the caller could not be resolved.
    #[error("reference '{0}' not found")]
    ReferenceNotFound(String),

    /// The branch advanced while the commit was being written.
    #[error("branch '{0}' was modified concurrently")]
    ConcurrentModification(String),

    /// No commit identity could be derived for the actor.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Underlying repository store error.
    #[error(transparent)]
    Git(GitError),
}

impl From<git2::Error> for ContentError {
    fn from(e: git2::Error) -> Self {
        Self::Git(GitError::Git2Error(e))
    }
}

impl From<GitError> for ContentError {
    fn from(e: GitError) -> Self {
        match e {
            GitError::RefModified { reference, .. } => Self::ConcurrentModification(reference),
            GitError::RefNotFound(reference) => Self::ReferenceNotFound(reference),
            other => Self::Git(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Pull request errors
// ---------------------------------------------------------------------------

/// Errors from pull request bookkeeping.
#[derive(Debug, Error)]
pub enum PullRequestError {
    /// No pull request with that index exists in the repository.
    #[error("pull request {repo}#{index} not found")]
    NotFound {
        repo: String,
        index: i64,
    },

    /// An open pull request already covers the same branch pair.
    #[error("an open pull request already exists for these branches (#{0})")]
    AlreadyExists(i64),

    /// Head and base point at the same branch of the same repository.
    #[error("head and base must be different branches")]
    SameBranch,

    /// A branch named by the pull request does not exist.
    #[error("branch '{branch}' not found in {repo}")]
    BranchNotFound {
        repo: String,
        branch: String,
    },

    /// Reopening or closing a merged pull request.
    #[error("pull request #{0} has already been merged")]
    AlreadyMerged(i64),

    /// Database error while persisting pull request data.
    #[error("pull request database error: {0}")]
    DatabaseError(#[from] DatabaseError),

    /// Repository store error.
    #[error("pull request git error: {0}")]
    GitError(#[from] GitError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A required environment variable is not set.
    #[error("required environment variable '{var}' is not set (referenced by config field '{field}')")]
    EnvVarMissing {
        var: String,
        field: String,
    },

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue {
        field: String,
        detail: String,
    },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed {
        version: u32,
        detail: String,
    },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        entity: String,
        id: String,
    },

    /// A conditional state change found the record in another state.
    #[error("{entity} {id} is no longer {expected}")]
    StateChanged {
        entity: String,
        id: String,
        expected: String,
    },

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Identity errors
// ---------------------------------------------------------------------------

/// Errors from the committer identity subsystem.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The mapping file could not be loaded.
    #[error("identity mapping file error at '{path}': {detail}")]
    MappingFileError {
        path: String,
        detail: String,
    },

    /// No mapping and no fallback domain for the given actor.
    #[error("no commit identity for user '{0}'")]
    UserNotFound(String),

    /// A resolved identity is not usable as a git signature.
    #[error("invalid signature for '{name} <{email}>': {detail}")]
    InvalidSignature {
        name: String,
        email: String,
        detail: String,
    },

    /// TOML parse error when reading the mapping file.
    #[error("identity mapping parse error: {0}")]
    ParseError(String),

    /// Cache lock was poisoned by a panicking writer.
    #[error("identity cache lock poisoned")]
    LockPoisoned,

    /// Generic I/O error.
    #[error("identity I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
