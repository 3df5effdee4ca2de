//! Bringing a pull request's head branch up to date with its base.
//!
//! One invocation runs through
//! `Idle -> Fetching -> Reconciling(strategy) -> Committed | Aborted`.
//! All new objects are written before the head ref moves, and the ref moves
//! with a compare-and-swap against the tip read during `Fetching`. An
//! aborted invocation leaves every visible ref as it was.

pub mod strategy;

use std::fmt;
use std::sync::Arc;

use git2::Oid;
use tracing::{debug, info, instrument, warn};

use crate::access::WriteGrant;
use crate::config::PullsConfig;
use crate::conflict::ConflictReport;
use crate::context::OperationContext;
use crate::db::Database;
use crate::divergence::{count_divergence, resolve_tip};
use crate::errors::ReconcileError;
use crate::git::client::BASE_SCRATCH_NAMESPACE;
use crate::git::{branch_ref, GitClient, RefLockGuard, RepositoryStore};
use crate::identity::IdentityMapper;
use crate::models::{PullRequest, PullRequestState, UpdateOutcome, UpdateStrategy};

use self::strategy::{Built, BuiltTip};

/// Phase of a single reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileState {
    Idle,
    Fetching,
    Reconciling(UpdateStrategy),
    Committed,
    Aborted,
}

impl fmt::Display for ReconcileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Fetching => write!(f, "fetching"),
            Self::Reconciling(s) => write!(f, "reconciling({})", s),
            Self::Committed => write!(f, "committed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Notified on every state transition.
pub trait StateObserver: Send + Sync {
    fn on_transition(&self, pr: &PullRequest, from: ReconcileState, to: ReconcileState);
}

/// Default observer: a debug log line per transition.
pub struct LogObserver;

impl StateObserver for LogObserver {
    fn on_transition(&self, pr: &PullRequest, from: ReconcileState, to: ReconcileState) {
        debug!(repo = %pr.base, index = pr.index, %from, %to, "reconcile transition");
    }
}

struct Invocation<'a> {
    pr: &'a PullRequest,
    state: ReconcileState,
    observer: &'a dyn StateObserver,
}

impl<'a> Invocation<'a> {
    fn new(pr: &'a PullRequest, observer: &'a dyn StateObserver) -> Self {
        Self {
            pr,
            state: ReconcileState::Idle,
            observer,
        }
    }

    fn advance(&mut self, to: ReconcileState) {
        let from = self.state;
        debug_assert!(
            matches!(
                (from, to),
                (ReconcileState::Idle, ReconcileState::Fetching)
                    | (ReconcileState::Fetching, ReconcileState::Reconciling(_))
                    | (ReconcileState::Fetching, ReconcileState::Committed)
                    | (ReconcileState::Reconciling(_), ReconcileState::Committed)
                    | (_, ReconcileState::Aborted)
            ),
            "invalid reconcile transition {from} -> {to}"
        );
        self.state = to;
        self.observer.on_transition(self.pr, from, to);
    }

    /// Move to `Aborted` unless the invocation already finished.
    fn abort(&mut self) {
        if !matches!(
            self.state,
            ReconcileState::Committed | ReconcileState::Aborted
        ) {
            self.advance(ReconcileState::Aborted);
        }
    }
}

/// Deletes a scratch ref when dropped.
struct ScratchRef<'a> {
    client: &'a GitClient,
    name: String,
}

impl Drop for ScratchRef<'_> {
    fn drop(&mut self) {
        if let Ok(mut reference) = self.client.repo().find_reference(&self.name) {
            if let Err(e) = reference.delete() {
                warn!(name = %self.name, error = %e, "failed to remove scratch ref");
            }
        }
    }
}

/// Result of merging a pull request into its base branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedPull {
    pub merge_commit: String,
    pub old_base: String,
}

/// Applies merge or rebase updates to pull request head branches.
#[derive(Clone)]
pub struct Reconciler {
    store: RepositoryStore,
    identities: Arc<IdentityMapper>,
    pulls: PullsConfig,
    conflict_log: Option<Arc<Database>>,
    observer: Arc<dyn StateObserver>,
}

impl Reconciler {
    pub fn new(store: RepositoryStore, identities: Arc<IdentityMapper>, pulls: PullsConfig) -> Self {
        Self {
            store,
            identities,
            pulls,
            conflict_log: None,
            observer: Arc::new(LogObserver),
        }
    }

    /// Record conflict reports of failed updates in `db`.
    pub fn with_conflict_log(mut self, db: Arc<Database>) -> Self {
        self.conflict_log = Some(db);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn StateObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn store(&self) -> &RepositoryStore {
        &self.store
    }

    /// Bring the head branch of `pr` up to date with its base branch.
    ///
    /// `grant` must cover the head branch (and history rewrite for rebase);
    /// without it the call fails with [`ReconcileError::PermissionDenied`].
    /// When head already contains base the call returns
    /// [`UpdateOutcome::AlreadyUpToDate`] and writes nothing.
    #[instrument(skip(self, pr, grant, ctx), fields(repo = %pr.base, index = pr.index))]
    pub fn update(
        &self,
        pr: &PullRequest,
        actor: &str,
        strategy: UpdateStrategy,
        grant: Option<&WriteGrant>,
        ctx: &OperationContext,
    ) -> Result<UpdateOutcome, ReconcileError> {
        let mut run = Invocation::new(pr, self.observer.as_ref());
        let result = self.run_update(&mut run, actor, strategy, grant, ctx);
        match &result {
            Ok(outcome) => info!(%strategy, head = outcome.head(), "pull request head reconciled"),
            Err(e) => {
                run.abort();
                warn!(%strategy, error = %e, "pull request update aborted");
            }
        }
        result
    }

    fn run_update(
        &self,
        run: &mut Invocation<'_>,
        actor: &str,
        strategy: UpdateStrategy,
        grant: Option<&WriteGrant>,
        ctx: &OperationContext,
    ) -> Result<UpdateOutcome, ReconcileError> {
        let pr = run.pr;
        ensure_open(pr)?;
        let rewrite = strategy == UpdateStrategy::Rebase;
        match grant {
            Some(g) if g.actor() == actor && g.covers(&pr.head, &pr.head_branch, rewrite) => {}
            _ => {
                return Err(ReconcileError::PermissionDenied {
                    actor: actor.to_string(),
                    repo: pr.head.to_string(),
                })
            }
        }
        let committer = self.identities.signature_for(actor)?;

        ctx.check("fetching")?;
        run.advance(ReconcileState::Fetching);
        let head_ref = branch_ref(&pr.head_branch);
        let _lock = self.lock(&pr.head, &head_ref, ctx)?;

        let head = self.store.open(&pr.head)?;
        let head_tip = resolve_tip(&head, &pr.head.to_string(), &pr.head_branch)?;
        let (base_tip, _scratch) = self.fetch_base(pr, &head)?;

        ctx.check("counting divergence")?;
        let divergence = count_divergence(&head, head_tip, base_tip, ctx)?;
        debug!(ahead = divergence.ahead, behind = divergence.behind, "divergence before update");
        if divergence.behind == 0 {
            run.advance(ReconcileState::Committed);
            return Ok(UpdateOutcome::AlreadyUpToDate {
                head: head_tip.to_string(),
            });
        }

        ctx.check("reconciling")?;
        run.advance(ReconcileState::Reconciling(strategy));
        let built = match strategy {
            UpdateStrategy::Merge => {
                let message = self.pulls.merge_message(&pr.base_branch, &pr.head_branch);
                strategy::merge_commit(&head, head_tip, base_tip, &message, &committer)?
            }
            UpdateStrategy::Rebase => {
                strategy::rebase_onto(&head, head_tip, base_tip, &committer, ctx)?
            }
        };
        let BuiltTip {
            tip,
            commits_created,
        } = match built {
            Built::Tip(tip) => tip,
            Built::Conflicted(conflicted) => {
                self.log_conflicts(pr, &conflicted.report);
                let files = conflicted.report.paths();
                return Err(match conflicted.commit {
                    Some(commit) => ReconcileError::RebaseConflict {
                        commit: commit.to_string(),
                        files,
                    },
                    None => ReconcileError::MergeConflict {
                        from: pr.base_branch.clone(),
                        into: pr.head_branch.clone(),
                        files,
                    },
                });
            }
        };

        ctx.check("publishing")?;
        head.compare_and_swap_ref(
            &head_ref,
            tip,
            Some(head_tip),
            &format!("prforge: update pull #{} by {} ({})", pr.index, actor, strategy),
        )?;
        run.advance(ReconcileState::Committed);
        self.clear_conflicts(pr);

        Ok(UpdateOutcome::Updated {
            strategy,
            old_head: head_tip.to_string(),
            new_head: tip.to_string(),
            commits_created,
        })
    }

    /// Merge the head branch of `pr` into its base branch.
    ///
    /// `grant` must cover the base branch. Returns the new merge commit.
    #[instrument(skip(self, pr, grant, ctx), fields(repo = %pr.base, index = pr.index))]
    pub fn merge_into_base(
        &self,
        pr: &PullRequest,
        actor: &str,
        grant: Option<&WriteGrant>,
        ctx: &OperationContext,
    ) -> Result<MergedPull, ReconcileError> {
        ensure_open(pr)?;
        match grant {
            Some(g) if g.actor() == actor && g.covers(&pr.base, &pr.base_branch, false) => {}
            _ => {
                return Err(ReconcileError::PermissionDenied {
                    actor: actor.to_string(),
                    repo: pr.base.to_string(),
                })
            }
        }
        let committer = self.identities.signature_for(actor)?;

        ctx.check("fetching")?;
        let base_ref = branch_ref(&pr.base_branch);
        let _lock = self.lock(&pr.base, &base_ref, ctx)?;
        let base = self.store.open(&pr.base)?;
        let base_tip = resolve_tip(&base, &pr.base.to_string(), &pr.base_branch)?;
        let (head_tip, _scratch) = if pr.is_cross_repo() {
            let head_repo = self.store.open(&pr.head)?;
            resolve_tip(&head_repo, &pr.head.to_string(), &pr.head_branch)?;
            let name = format!("refs/prforge/head/{}", pr.id);
            let tip = base.fetch_branch_from(head_repo.repo_path(), &pr.head_branch, &name)?;
            (tip, Some(ScratchRef { client: &base, name }))
        } else {
            (resolve_tip(&base, &pr.base.to_string(), &pr.head_branch)?, None)
        };
        // Another merge of this pull request won the lock first.
        if strategy::contains(base.repo(), base_tip, head_tip)? {
            return Err(ReconcileError::PullRequestNotOpen {
                index: pr.index,
                state: PullRequestState::Merged.to_string(),
            });
        }

        ctx.check("merging")?;
        let message = format!(
            "Merge pull request '{}' (#{}) from {} into {}",
            pr.title, pr.index, pr.head_branch, pr.base_branch
        );
        let tip = match strategy::merge_commit(&base, base_tip, head_tip, &message, &committer)? {
            Built::Tip(built) => built.tip,
            Built::Conflicted(conflicted) => {
                self.log_conflicts(pr, &conflicted.report);
                return Err(ReconcileError::MergeConflict {
                    from: pr.head_branch.clone(),
                    into: pr.base_branch.clone(),
                    files: conflicted.report.paths(),
                });
            }
        };

        ctx.check("publishing")?;
        base.compare_and_swap_ref(
            &base_ref,
            tip,
            Some(base_tip),
            &format!("prforge: merge pull #{} by {}", pr.index, actor),
        )?;
        self.clear_conflicts(pr);
        info!(merge_commit = %tip, "pull request merged");
        Ok(MergedPull {
            merge_commit: tip.to_string(),
            old_base: base_tip.to_string(),
        })
    }

    fn lock(
        &self,
        repo: &crate::models::RepoRef,
        refname: &str,
        ctx: &OperationContext,
    ) -> Result<RefLockGuard, ReconcileError> {
        self.store
            .lock_ref(repo, refname, ctx.deadline())
            .ok_or_else(|| {
                ReconcileError::Cancelled(format!("timed out waiting for lock on {}", refname))
            })
    }

    /// Resolve the base tip as seen from the head repository, fetching it
    /// into a scratch ref for cross-repository pull requests.
    fn fetch_base<'c>(
        &self,
        pr: &PullRequest,
        head: &'c GitClient,
    ) -> Result<(Oid, Option<ScratchRef<'c>>), ReconcileError> {
        if !pr.is_cross_repo() {
            let tip = resolve_tip(head, &pr.head.to_string(), &pr.base_branch)?;
            return Ok((tip, None));
        }
        let base = self.store.open(&pr.base)?;
        resolve_tip(&base, &pr.base.to_string(), &pr.base_branch)?;
        let name = format!("{}/{}", BASE_SCRATCH_NAMESPACE, pr.id);
        let tip = head.fetch_branch_from(base.repo_path(), &pr.base_branch, &name)?;
        Ok((tip, Some(ScratchRef { client: head, name })))
    }

    fn log_conflicts(&self, pr: &PullRequest, report: &ConflictReport) {
        if let Some(db) = &self.conflict_log {
            if let Err(e) = report.record(db, pr.id) {
                warn!(error = %e, "failed to record conflict report");
            }
        }
    }

    fn clear_conflicts(&self, pr: &PullRequest) {
        if let Some(db) = &self.conflict_log {
            if let Err(e) = db.clear_conflicts_for_pull(pr.id) {
                warn!(error = %e, "failed to clear conflict report");
            }
        }
    }
}

fn ensure_open(pr: &PullRequest) -> Result<(), ReconcileError> {
    if pr.is_open() {
        return Ok(());
    }
    Err(ReconcileError::PullRequestNotOpen {
        index: pr.index,
        state: pr.state.to_string(),
    })
}
