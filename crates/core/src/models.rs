//! Domain model types used throughout prforge.
//!
//! These types bridge the reconciliation core, database layer, and web API.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Repositories
// ---------------------------------------------------------------------------

/// `owner/name` pair identifying a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for RepoRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(owner, name))
            }
            _ => Err(format!("'{}' is not in owner/name format", s)),
        }
    }
}

/// A registered repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub owner: String,
    pub name: String,
    pub default_branch: String,
    pub created_at: String,
}

impl Repository {
    pub fn repo_ref(&self) -> RepoRef {
        RepoRef::new(&self.owner, &self.name)
    }
}

// ---------------------------------------------------------------------------
// Access
// ---------------------------------------------------------------------------

/// Access level a user holds on a repository, ordered from least to most.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    None,
    Read,
    Write,
    Admin,
}

impl AccessMode {
    /// Parse a stored access string; unknown values grant nothing.
    pub fn from_str_val(s: &str) -> Self {
        match s {
            "read" => Self::Read,
            "write" => Self::Write,
            "admin" => Self::Admin,
            _ => Self::None,
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

/// Branch protection rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedBranch {
    pub repo_id: i64,
    pub branch: String,
    /// Writers may push new commits on top of the branch.
    pub allow_push: bool,
    /// Writers may rewrite the branch history.
    pub allow_force_push: bool,
}

// ---------------------------------------------------------------------------
// Pull requests
// ---------------------------------------------------------------------------

/// Lifecycle state of a pull request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestState {
    Open,
    Closed,
    Merged,
}

impl PullRequestState {
    /// Parse a state string into a `PullRequestState`.
    pub fn from_str_val(s: &str) -> Self {
        match s {
            "closed" => Self::Closed,
            "merged" => Self::Merged,
            _ => Self::Open,
        }
    }
}

impl fmt::Display for PullRequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
            Self::Merged => write!(f, "merged"),
        }
    }
}

/// A pull request proposing `head_branch` of `head` into `base_branch` of `base`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: i64,
    /// Per-base-repository number.
    pub index: i64,
    pub base_repo_id: i64,
    pub base: RepoRef,
    pub base_branch: String,
    pub head_repo_id: i64,
    pub head: RepoRef,
    pub head_branch: String,
    pub title: String,
    pub poster: String,
    pub state: PullRequestState,
    /// Base-repository writers may push to the head branch.
    pub allow_maintainer_edit: bool,
    pub merged_commit: Option<String>,
    pub merged_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl PullRequest {
    pub fn is_open(&self) -> bool {
        self.state == PullRequestState::Open
    }

    /// Head lives in a different repository than base.
    pub fn is_cross_repo(&self) -> bool {
        self.base_repo_id != self.head_repo_id
    }
}

/// Parameters for opening a pull request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPullRequest {
    pub base: RepoRef,
    pub base_branch: String,
    pub head: RepoRef,
    pub head_branch: String,
    pub title: String,
    #[serde(default)]
    pub allow_maintainer_edit: bool,
}

// ---------------------------------------------------------------------------
// Divergence & reconciliation
// ---------------------------------------------------------------------------

/// Commits unique to each side of a pull request. Never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivergenceCount {
    pub ahead: usize,
    pub behind: usize,
}

/// How the head branch is brought up to date with base.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStrategy {
    /// Merge the base tip into head with a merge commit.
    #[default]
    Merge,
    /// Replay head-only commits onto the base tip.
    Rebase,
}

impl fmt::Display for UpdateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Merge => write!(f, "merge"),
            Self::Rebase => write!(f, "rebase"),
        }
    }
}

impl FromStr for UpdateStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "merge" => Ok(Self::Merge),
            "rebase" => Ok(Self::Rebase),
            other => Err(format!(
                "invalid update style '{}': must be merge or rebase",
                other
            )),
        }
    }
}

/// Result of a successful update invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateOutcome {
    /// Head already contained all of base; nothing was written.
    AlreadyUpToDate { head: String },
    /// The head ref was advanced.
    Updated {
        strategy: UpdateStrategy,
        old_head: String,
        new_head: String,
        /// Number of commit objects written.
        commits_created: usize,
    },
}

impl UpdateOutcome {
    /// Tip of the head branch after the call.
    pub fn head(&self) -> &str {
        match self {
            Self::AlreadyUpToDate { head } => head,
            Self::Updated { new_head, .. } => new_head,
        }
    }
}

// ---------------------------------------------------------------------------
// Audit Entry
// ---------------------------------------------------------------------------

/// An audit-log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: String,
    pub actor: Option<String>,
    pub repo: Option<String>,
    pub details: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    /// Create a success audit entry.
    pub fn success(action: &str, details: &str) -> Self {
        Self {
            action: action.to_string(),
            actor: None,
            repo: None,
            details: details.to_string(),
            success: true,
            timestamp: Utc::now(),
        }
    }

    /// Create a failure audit entry.
    pub fn failure(action: &str, details: &str) -> Self {
        Self {
            success: false,
            ..Self::success(action, details)
        }
    }

    pub fn by(mut self, actor: &str) -> Self {
        self.actor = Some(actor.to_string());
        self
    }

    pub fn on(mut self, repo: &RepoRef) -> Self {
        self.repo = Some(repo.to_string());
        self
    }
}
