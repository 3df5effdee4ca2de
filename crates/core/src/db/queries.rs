//! Typed query helpers for every table in the prforge database.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;
use uuid::Uuid;

use super::Database;
use crate::errors::DatabaseError;
use crate::models::{
    self, AccessMode, ProtectedBranch, PullRequest, PullRequestState, RepoRef, Repository,
};

// ---------------------------------------------------------------------------
// Domain structs returned by queries
// ---------------------------------------------------------------------------

/// A row from the `audit_log` table.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditLogEntry {
    pub id: i64,
    pub action: String,
    pub actor: Option<String>,
    pub repo: Option<String>,
    pub details: Option<String>,
    pub success: bool,
    pub created_at: String,
}

/// A row from the `conflicts` table.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConflictEntry {
    pub id: String,
    pub pull_id: i64,
    pub strategy: String,
    pub commit_sha: Option<String>,
    pub file_path: String,
    pub base_content: Option<String>,
    pub ours_content: Option<String>,
    pub theirs_content: Option<String>,
    pub merged_preview: Option<String>,
    pub region_count: i64,
    pub created_at: String,
}

/// A row from the `access_tokens` table (the hash never leaves the database).
#[derive(Debug, Clone, serde::Serialize)]
pub struct AccessTokenEntry {
    pub id: i64,
    pub username: String,
    pub name: String,
    pub created_at: String,
    pub last_used_at: Option<String>,
}

/// A row from the `collaborators` table.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CollaboratorEntry {
    pub username: String,
    pub mode: AccessMode,
}

const PULL_SELECT: &str = "SELECT p.id, p.pr_index, p.base_repo_id, b.owner, b.name, p.base_branch,
        p.head_repo_id, h.owner, h.name, p.head_branch, p.title, p.poster, p.state,
        p.allow_maintainer_edit, p.merged_commit, p.merged_by, p.created_at, p.updated_at
     FROM pull_requests p
     JOIN repositories b ON b.id = p.base_repo_id
     JOIN repositories h ON h.id = p.head_repo_id";

fn pull_from_row(row: &Row<'_>) -> rusqlite::Result<PullRequest> {
    let state: String = row.get(12)?;
    Ok(PullRequest {
        id: row.get(0)?,
        index: row.get(1)?,
        base_repo_id: row.get(2)?,
        base: RepoRef::new(row.get::<_, String>(3)?, row.get::<_, String>(4)?),
        base_branch: row.get(5)?,
        head_repo_id: row.get(6)?,
        head: RepoRef::new(row.get::<_, String>(7)?, row.get::<_, String>(8)?),
        head_branch: row.get(9)?,
        title: row.get(10)?,
        poster: row.get(11)?,
        state: PullRequestState::from_str_val(&state),
        allow_maintainer_edit: row.get(13)?,
        merged_commit: row.get(14)?,
        merged_by: row.get(15)?,
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}

fn repository_from_row(row: &Row<'_>) -> rusqlite::Result<Repository> {
    Ok(Repository {
        id: row.get(0)?,
        owner: row.get(1)?,
        name: row.get(2)?,
        default_branch: row.get(3)?,
        created_at: row.get(4)?,
    })
}

// ---------------------------------------------------------------------------
// Query implementations
// ---------------------------------------------------------------------------

impl Database {
    // -- repositories -------------------------------------------------------

    /// Register a repository and return its id.
    pub fn insert_repository(
        &self,
        owner: &str,
        name: &str,
        default_branch: &str,
    ) -> Result<i64, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO repositories (owner, name, default_branch, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![owner, name, default_branch, now],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, owner, name, "inserted repository");
        Ok(id)
    }

    /// Look up a repository by `owner/name`.
    pub fn get_repository(&self, repo: &RepoRef) -> Result<Option<Repository>, DatabaseError> {
        let conn = self.conn();
        let result = conn
            .query_row(
                "SELECT id, owner, name, default_branch, created_at
                 FROM repositories WHERE owner = ?1 AND name = ?2",
                params![repo.owner, repo.name],
                repository_from_row,
            )
            .optional()?;
        Ok(result)
    }

    /// Look up a repository by id (returns an error if not found).
    pub fn get_repository_by_id(&self, id: i64) -> Result<Repository, DatabaseError> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, owner, name, default_branch, created_at FROM repositories WHERE id = ?1",
            params![id],
            repository_from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DatabaseError::NotFound {
                entity: "repository".into(),
                id: id.to_string(),
            },
            other => other.into(),
        })
    }

    /// List all repositories ordered by owner and name.
    pub fn list_repositories(&self) -> Result<Vec<Repository>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, owner, name, default_branch, created_at
             FROM repositories ORDER BY owner, name",
        )?;
        let repos = stmt
            .query_map([], repository_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(repos)
    }

    // -- collaborators ------------------------------------------------------

    /// Grant (or change) a collaborator's access mode.
    pub fn set_collaborator(
        &self,
        repo_id: i64,
        username: &str,
        mode: AccessMode,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        if mode == AccessMode::None {
            conn.execute(
                "DELETE FROM collaborators WHERE repo_id = ?1 AND username = ?2",
                params![repo_id, username],
            )?;
        } else {
            conn.execute(
                "INSERT INTO collaborators (repo_id, username, mode) VALUES (?1, ?2, ?3)
                 ON CONFLICT(repo_id, username) DO UPDATE SET mode = excluded.mode",
                params![repo_id, username, mode.to_string()],
            )?;
        }
        debug!(repo_id, username, %mode, "set collaborator");
        Ok(())
    }

    /// Explicit access mode granted to `username`, if any.
    pub fn get_collaborator_mode(
        &self,
        repo_id: i64,
        username: &str,
    ) -> Result<Option<AccessMode>, DatabaseError> {
        let conn = self.conn();
        let mode: Option<String> = conn
            .query_row(
                "SELECT mode FROM collaborators WHERE repo_id = ?1 AND username = ?2",
                params![repo_id, username],
                |row| row.get(0),
            )
            .optional()?;
        Ok(mode.map(|m| AccessMode::from_str_val(&m)))
    }

    pub fn list_collaborators(&self, repo_id: i64) -> Result<Vec<CollaboratorEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT username, mode FROM collaborators WHERE repo_id = ?1 ORDER BY username",
        )?;
        let entries = stmt
            .query_map(params![repo_id], |row| {
                let mode: String = row.get(1)?;
                Ok(CollaboratorEntry {
                    username: row.get(0)?,
                    mode: AccessMode::from_str_val(&mode),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // -- protected_branches -------------------------------------------------

    /// Insert or replace a branch protection rule.
    pub fn upsert_protected_branch(&self, rule: &ProtectedBranch) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO protected_branches (repo_id, branch, allow_push, allow_force_push)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(repo_id, branch) DO UPDATE SET
                allow_push = excluded.allow_push,
                allow_force_push = excluded.allow_force_push",
            params![rule.repo_id, rule.branch, rule.allow_push, rule.allow_force_push],
        )?;
        debug!(repo_id = rule.repo_id, branch = %rule.branch, "upserted branch protection");
        Ok(())
    }

    pub fn get_protected_branch(
        &self,
        repo_id: i64,
        branch: &str,
    ) -> Result<Option<ProtectedBranch>, DatabaseError> {
        let conn = self.conn();
        let rule = conn
            .query_row(
                "SELECT repo_id, branch, allow_push, allow_force_push
                 FROM protected_branches WHERE repo_id = ?1 AND branch = ?2",
                params![repo_id, branch],
                |row| {
                    Ok(ProtectedBranch {
                        repo_id: row.get(0)?,
                        branch: row.get(1)?,
                        allow_push: row.get(2)?,
                        allow_force_push: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(rule)
    }

    /// Remove a protection rule. Returns whether one existed.
    pub fn remove_protected_branch(&self, repo_id: i64, branch: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let rows = conn.execute(
            "DELETE FROM protected_branches WHERE repo_id = ?1 AND branch = ?2",
            params![repo_id, branch],
        )?;
        Ok(rows > 0)
    }

    // -- pull_requests ------------------------------------------------------

    /// Insert a pull request, assigning the next per-repository index.
    ///
    /// Returns `(id, index)`.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_pull_request(
        &self,
        base_repo_id: i64,
        base_branch: &str,
        head_repo_id: i64,
        head_branch: &str,
        title: &str,
        poster: &str,
        allow_maintainer_edit: bool,
    ) -> Result<(i64, i64), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let (id, index) = self.transaction(|conn| {
            let index: i64 = conn.query_row(
                "SELECT COALESCE(MAX(pr_index), 0) + 1 FROM pull_requests WHERE base_repo_id = ?1",
                params![base_repo_id],
                |row| row.get(0),
            )?;
            conn.execute(
                "INSERT INTO pull_requests (base_repo_id, pr_index, base_branch, head_repo_id,
                 head_branch, title, poster, state, allow_maintainer_edit, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'open', ?8, ?9, ?9)",
                params![
                    base_repo_id,
                    index,
                    base_branch,
                    head_repo_id,
                    head_branch,
                    title,
                    poster,
                    allow_maintainer_edit,
                    now
                ],
            )?;
            Ok((conn.last_insert_rowid(), index))
        })?;
        debug!(id, index, base_repo_id, head_branch, "inserted pull request");
        Ok((id, index))
    }

    /// Get a pull request by its per-repository index.
    pub fn get_pull_request(
        &self,
        base_repo_id: i64,
        index: i64,
    ) -> Result<Option<PullRequest>, DatabaseError> {
        let conn = self.conn();
        let sql = format!("{PULL_SELECT} WHERE p.base_repo_id = ?1 AND p.pr_index = ?2");
        let pr = conn
            .query_row(&sql, params![base_repo_id, index], pull_from_row)
            .optional()?;
        Ok(pr)
    }

    /// List pull requests of a base repository, newest first.
    pub fn list_pull_requests(
        &self,
        base_repo_id: i64,
        state: Option<PullRequestState>,
    ) -> Result<Vec<PullRequest>, DatabaseError> {
        let conn = self.conn();
        let prs = match state {
            Some(state) => {
                let sql = format!(
                    "{PULL_SELECT} WHERE p.base_repo_id = ?1 AND p.state = ?2 ORDER BY p.pr_index DESC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![base_repo_id, state.to_string()], pull_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let sql = format!("{PULL_SELECT} WHERE p.base_repo_id = ?1 ORDER BY p.pr_index DESC");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![base_repo_id], pull_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(prs)
    }

    /// Index of an open pull request on the same branch pair, if one exists.
    pub fn find_open_pull_request(
        &self,
        base_repo_id: i64,
        base_branch: &str,
        head_repo_id: i64,
        head_branch: &str,
    ) -> Result<Option<i64>, DatabaseError> {
        let conn = self.conn();
        let index = conn
            .query_row(
                "SELECT pr_index FROM pull_requests
                 WHERE base_repo_id = ?1 AND base_branch = ?2 AND head_repo_id = ?3
                   AND head_branch = ?4 AND state = 'open'",
                params![base_repo_id, base_branch, head_repo_id, head_branch],
                |row| row.get(0),
            )
            .optional()?;
        Ok(index)
    }

    /// Change the lifecycle state of a pull request.
    pub fn set_pull_request_state(
        &self,
        id: i64,
        state: PullRequestState,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        let rows = conn.execute(
            "UPDATE pull_requests SET state = ?1, updated_at = ?2 WHERE id = ?3",
            params![state.to_string(), now, id],
        )?;
        if rows == 0 {
            return Err(DatabaseError::NotFound {
                entity: "pull_request".into(),
                id: id.to_string(),
            });
        }
        debug!(id, %state, "pull request state changed");
        Ok(())
    }

    /// Move an open pull request to merged and record the merge commit.
    /// Fails with [`DatabaseError::StateChanged`] unless the row is open.
    pub fn mark_pull_request_merged(
        &self,
        id: i64,
        merged_commit: &str,
        merged_by: &str,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        let rows = conn.execute(
            "UPDATE pull_requests SET state = 'merged', merged_commit = ?1, merged_by = ?2,
             updated_at = ?3 WHERE id = ?4 AND state = 'open'",
            params![merged_commit, merged_by, now, id],
        )?;
        if rows > 0 {
            return Ok(());
        }
        let exists = conn
            .query_row("SELECT 1 FROM pull_requests WHERE id = ?1", [id], |_| Ok(()))
            .optional()?
            .is_some();
        if exists {
            Err(DatabaseError::StateChanged {
                entity: "pull_request".into(),
                id: id.to_string(),
                expected: "open".into(),
            })
        } else {
            Err(DatabaseError::NotFound {
                entity: "pull_request".into(),
                id: id.to_string(),
            })
        }
    }

    /// Bump `updated_at` after the head branch was rewritten.
    pub fn touch_pull_request(&self, id: i64) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "UPDATE pull_requests SET updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        Ok(())
    }

    // -- access_tokens ------------------------------------------------------

    /// Store a token digest for `username`.
    pub fn insert_access_token(
        &self,
        username: &str,
        name: &str,
        token_hash: &str,
    ) -> Result<i64, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO access_tokens (username, name, token_hash, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![username, name, token_hash, now],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, username, name, "inserted access token");
        Ok(id)
    }

    /// Resolve a token digest to its owner, stamping `last_used_at`.
    pub fn find_token_user(&self, token_hash: &str) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn();
        let user: Option<(i64, String)> = conn
            .query_row(
                "SELECT id, username FROM access_tokens WHERE token_hash = ?1",
                params![token_hash],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((id, _)) = &user {
            conn.execute(
                "UPDATE access_tokens SET last_used_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), id],
            )?;
        }
        Ok(user.map(|(_, name)| name))
    }

    pub fn list_access_tokens(&self, username: &str) -> Result<Vec<AccessTokenEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, username, name, created_at, last_used_at
             FROM access_tokens WHERE username = ?1 ORDER BY id",
        )?;
        let entries = stmt
            .query_map(params![username], |row| {
                Ok(AccessTokenEntry {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    name: row.get(2)?,
                    created_at: row.get(3)?,
                    last_used_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn delete_access_token(&self, id: i64) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let rows = conn.execute("DELETE FROM access_tokens WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // -- conflicts ----------------------------------------------------------

    /// Record one conflicted file of a failed update.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_conflict(
        &self,
        pull_id: i64,
        strategy: &str,
        commit_sha: Option<&str>,
        file_path: &str,
        base_content: Option<&str>,
        ours_content: Option<&str>,
        theirs_content: Option<&str>,
        merged_preview: Option<&str>,
        region_count: i64,
    ) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO conflicts (id, pull_id, strategy, commit_sha, file_path, base_content,
             ours_content, theirs_content, merged_preview, region_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                id,
                pull_id,
                strategy,
                commit_sha,
                file_path,
                base_content,
                ours_content,
                theirs_content,
                merged_preview,
                region_count,
                now
            ],
        )?;
        debug!(id = %id, pull_id, file_path, "inserted conflict");
        Ok(id)
    }

    /// Conflicts recorded for a pull request, most recent first.
    pub fn list_conflicts_for_pull(&self, pull_id: i64) -> Result<Vec<ConflictEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, pull_id, strategy, commit_sha, file_path, base_content, ours_content,
             theirs_content, merged_preview, region_count, created_at
             FROM conflicts WHERE pull_id = ?1 ORDER BY created_at DESC, file_path",
        )?;
        let entries = stmt
            .query_map(params![pull_id], |row| {
                Ok(ConflictEntry {
                    id: row.get(0)?,
                    pull_id: row.get(1)?,
                    strategy: row.get(2)?,
                    commit_sha: row.get(3)?,
                    file_path: row.get(4)?,
                    base_content: row.get(5)?,
                    ours_content: row.get(6)?,
                    theirs_content: row.get(7)?,
                    merged_preview: row.get(8)?,
                    region_count: row.get(9)?,
                    created_at: row.get(10)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Drop stale conflict reports once an update succeeds.
    pub fn clear_conflicts_for_pull(&self, pull_id: i64) -> Result<usize, DatabaseError> {
        let conn = self.conn();
        let rows = conn.execute("DELETE FROM conflicts WHERE pull_id = ?1", params![pull_id])?;
        Ok(rows)
    }

    // -- audit_log ----------------------------------------------------------

    /// Insert an audit-log entry.
    pub fn insert_audit_log(
        &self,
        action: &str,
        actor: Option<&str>,
        repo: Option<&str>,
        details: Option<&str>,
        success: bool,
    ) -> Result<i64, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO audit_log (action, actor, repo, details, success, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![action, actor, repo, details, success, now],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, action, "inserted audit_log entry");
        Ok(id)
    }

    /// Insert an audit entry from a model struct.
    pub fn insert_audit_entry(&self, entry: &models::AuditEntry) -> Result<i64, DatabaseError> {
        self.insert_audit_log(
            &entry.action,
            entry.actor.as_deref(),
            entry.repo.as_deref(),
            Some(&entry.details),
            entry.success,
        )
    }

    /// List recent audit-log entries.
    pub fn list_audit_log(&self, limit: u32) -> Result<Vec<AuditLogEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, action, actor, repo, details, success, created_at
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit], audit_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// List recent audit-log entries with the given action.
    pub fn list_audit_log_by_action(
        &self,
        action: &str,
        limit: u32,
    ) -> Result<Vec<AuditLogEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, action, actor, repo, details, success, created_at
             FROM audit_log WHERE action = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(params![action, limit], audit_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Count total audit-log entries.
    pub fn count_audit_log(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditLogEntry> {
    Ok(AuditLogEntry {
        id: row.get(0)?,
        action: row.get(1)?,
        actor: row.get(2)?,
        repo: row.get(3)?,
        details: row.get(4)?,
        success: row.get(5)?,
        created_at: row.get(6)?,
    })
}
