//! Commit construction for the two update strategies.
//!
//! Nothing here moves a ref: every function writes new objects into the
//! repository and returns the id of the tip that should be published.

use git2::{Oid, Repository, Signature};
use tracing::{debug, info};

use crate::conflict::ConflictReport;
use crate::context::OperationContext;
use crate::errors::ReconcileError;
use crate::git::GitClient;
use crate::models::UpdateStrategy;

/// Tip produced by a strategy, plus how many commit objects it wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltTip {
    pub tip: Oid,
    pub commits_created: usize,
}

/// Outcome of a strategy that hit conflicts.
#[derive(Debug)]
pub struct Conflicted {
    pub report: ConflictReport,
    /// Commit being replayed when a rebase stopped.
    pub commit: Option<Oid>,
}

pub enum Built {
    Tip(BuiltTip),
    Conflicted(Conflicted),
}

/// Create a merge commit with parents `[ours, theirs]`.
///
/// Always produces a new commit, even when `ours` could be fast-forwarded.
pub fn merge_commit(
    client: &GitClient,
    ours: Oid,
    theirs: Oid,
    message: &str,
    signature: &Signature<'_>,
) -> Result<Built, ReconcileError> {
    let repo = client.repo();
    let ours_commit = repo.find_commit(ours)?;
    let theirs_commit = repo.find_commit(theirs)?;

    let mut index = repo.merge_commits(&ours_commit, &theirs_commit, None)?;
    if index.has_conflicts() {
        let report = ConflictReport::from_index(repo, &index, UpdateStrategy::Merge, None)?;
        debug!(files = report.files.len(), "merge conflicted");
        return Ok(Built::Conflicted(Conflicted {
            report,
            commit: None,
        }));
    }

    let tree_id = index.write_tree_to(repo)?;
    let tree = repo.find_tree(tree_id)?;
    let tip = client.write_commit(signature, signature, message, &tree, &[ours, theirs])?;
    info!(%tip, %ours, %theirs, "merge commit written");
    Ok(Built::Tip(BuiltTip {
        tip,
        commits_created: 1,
    }))
}

/// Replay the non-merge commits reachable from `head` but not `onto` on top
/// of `onto`, oldest first.
///
/// Authorship is preserved, the committer becomes `committer`. Replays that
/// change nothing are dropped.
pub fn rebase_onto(
    client: &GitClient,
    head: Oid,
    onto: Oid,
    committer: &Signature<'_>,
    ctx: &OperationContext,
) -> Result<Built, ReconcileError> {
    let repo = client.repo();
    let to_replay = client.commits_between(head, onto)?;
    let mut tip = onto;
    let mut created = 0usize;
    let mut skipped_merges = 0usize;
    let mut dropped = 0usize;

    for oid in to_replay {
        ctx.check(&format!("replaying {}", oid))?;
        let commit = repo.find_commit(oid)?;
        if commit.parent_count() > 1 {
            skipped_merges += 1;
            continue;
        }

        let tip_commit = repo.find_commit(tip)?;
        let mut index = repo.cherrypick_commit(&commit, &tip_commit, 0, None)?;
        if index.has_conflicts() {
            let report =
                ConflictReport::from_index(repo, &index, UpdateStrategy::Rebase, Some(oid))?;
            debug!(commit = %oid, files = report.files.len(), "replay conflicted");
            return Ok(Built::Conflicted(Conflicted {
                report,
                commit: Some(oid),
            }));
        }

        let tree_id = index.write_tree_to(repo)?;
        if tree_id == tip_commit.tree_id() {
            dropped += 1;
            continue;
        }
        let tree = repo.find_tree(tree_id)?;
        let message = commit.message_raw().unwrap_or("");
        tip = client.write_commit(&commit.author(), committer, message, &tree, &[tip])?;
        created += 1;
    }

    info!(%tip, created, skipped_merges, dropped, "rebase built");
    Ok(Built::Tip(BuiltTip {
        tip,
        commits_created: created,
    }))
}

/// Whether `ancestor` is reachable from `descendant` (or equal to it).
pub fn contains(repo: &Repository, descendant: Oid, ancestor: Oid) -> Result<bool, git2::Error> {
    Ok(descendant == ancestor || repo.graph_descendant_of(descendant, ancestor)?)
}
