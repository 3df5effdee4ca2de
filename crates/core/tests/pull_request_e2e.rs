//! End-to-end tests for pull request divergence and head-branch updates.
//!
//! These tests exercise the real services with:
//! - Bare git repositories in a temporary directory
//! - Commits written through the contents API
//! - A real SQLite database (in memory)
//!
//! No network I/O: fork fetches use local paths.

use std::sync::{Arc, Barrier};
use std::thread;

use tempfile::TempDir;

use prforge_core::access::AccessPolicy;
use prforge_core::config::AppConfig;
use prforge_core::contents::ChangeFileOptions;
use prforge_core::db::Database;
use prforge_core::errors::{CoreError, PullRequestError, ReconcileError};
use prforge_core::git::branch_ref;
use prforge_core::models::{
    AccessMode, NewPullRequest, PullRequestState, RepoRef, UpdateOutcome, UpdateStrategy,
};
use prforge_core::{Forge, Reconciler};

// ===========================================================================
// Helpers
// ===========================================================================

fn setup() -> (TempDir, Forge) {
    let dir = TempDir::new().unwrap();
    let mut config = AppConfig::default();
    config.daemon.data_dir = dir.path().join("data");
    config.repositories.root = dir.path().join("repos");
    let db = Arc::new(Database::in_memory().unwrap());
    db.initialize().unwrap();
    let forge = Forge::new(config, db).unwrap();
    (dir, forge)
}

fn acme() -> RepoRef {
    RepoRef::new("acme", "widgets")
}

/// Commit a file as `actor`, optionally starting a new branch.
fn write(forge: &Forge, repo: &RepoRef, actor: &str, branch: &str, new_branch: Option<&str>, path: &str, body: &str) -> String {
    let target = new_branch.unwrap_or(branch);
    let grant = forge.repos.content_grant(repo, actor, target).unwrap();
    let opts = ChangeFileOptions {
        branch: Some(branch.to_string()),
        new_branch: new_branch.map(str::to_string),
        message: None,
    };
    forge
        .contents
        .create_file(repo, path, body.as_bytes().to_vec(), &opts, actor, grant.as_ref())
        .unwrap()
        .commit
}

fn tip(forge: &Forge, repo: &RepoRef, branch: &str) -> String {
    forge
        .store
        .open(repo)
        .unwrap()
        .resolve_branch(branch)
        .unwrap()
        .to_string()
}

/// `acme/widgets` with main and feature each one commit past their root,
/// plus an open pull request feature -> main (index 1).
fn diverged_pull(forge: &Forge) -> i64 {
    forge.repos.create(&acme(), None).unwrap();
    write(forge, &acme(), "acme", "main", None, "README.md", "hello\n");
    write(forge, &acme(), "acme", "main", Some("feature"), "feature.txt", "feature\n");
    write(forge, &acme(), "acme", "main", None, "base.txt", "base\n");
    open_feature_pull(forge)
}

/// Open feature -> main on `acme/widgets`.
fn open_feature_pull(forge: &Forge) -> i64 {
    forge
        .pulls
        .create(
            "acme",
            &NewPullRequest {
                base: acme(),
                base_branch: "main".into(),
                head: acme(),
                head_branch: "feature".into(),
                title: "Add feature".into(),
                allow_maintainer_edit: false,
            },
        )
        .unwrap()
        .index
}

/// Create or overwrite `path` on an existing branch with an explicit message.
fn commit_file(forge: &Forge, branch: &str, path: &str, body: &str, message: &str) {
    let grant = forge.repos.content_grant(&acme(), "acme", branch).unwrap();
    let opts = ChangeFileOptions {
        branch: Some(branch.to_string()),
        new_branch: None,
        message: Some(message.to_string()),
    };
    let content = body.as_bytes().to_vec();
    match forge.contents.get_file(&acme(), path, Some(branch)) {
        Ok(current) => forge
            .contents
            .update_file(&acme(), path, content, Some(current.sha), &opts, "acme", grant.as_ref())
            .unwrap(),
        Err(_) => forge
            .contents
            .create_file(&acme(), path, content, &opts, "acme", grant.as_ref())
            .unwrap(),
    };
}

fn read(forge: &Forge, branch: &str, path: &str) -> String {
    let file = forge.contents.get_file(&acme(), path, Some(branch)).unwrap();
    String::from_utf8(file.decode().unwrap()).unwrap()
}

/// Messages of the last `n` commits on `branch`, oldest first, following
/// first parents.
fn first_parent_messages(forge: &Forge, branch: &str, n: usize) -> Vec<String> {
    let client = forge.store.open(&acme()).unwrap();
    let mut oid = client.resolve_branch(branch).unwrap();
    let mut messages = Vec::new();
    for _ in 0..n {
        let info = client.commit_info(oid).unwrap();
        messages.push(info.message.trim_end().to_string());
        match info.parents.first() {
            Some(parent) => oid = git2::Oid::from_str(parent).unwrap(),
            None => break,
        }
    }
    messages.reverse();
    messages
}

fn ctx(forge: &Forge) -> prforge_core::OperationContext {
    forge.operation_context()
}

// ===========================================================================
// Divergence and updates
// ===========================================================================

#[test]
fn test_one_ahead_one_behind() {
    let (_dir, forge) = setup();
    let index = diverged_pull(&forge);
    let counts = forge.pulls.get_diverging(&acme(), index, &ctx(&forge)).unwrap();
    assert_eq!((counts.ahead, counts.behind), (1, 1));
}

#[test]
fn test_merge_update_then_two_ahead() {
    let (_dir, forge) = setup();
    let index = diverged_pull(&forge);
    let old_head = tip(&forge, &acme(), "feature");

    let outcome = forge
        .pulls
        .update_pull_request(&acme(), index, "acme", Some(UpdateStrategy::Merge), &ctx(&forge))
        .unwrap();
    match &outcome {
        UpdateOutcome::Updated { old_head: old, new_head, commits_created, .. } => {
            assert_eq!(old, &old_head);
            assert_eq!(new_head, &tip(&forge, &acme(), "feature"));
            assert_eq!(*commits_created, 1);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let counts = forge.pulls.get_diverging(&acme(), index, &ctx(&forge)).unwrap();
    assert_eq!((counts.ahead, counts.behind), (2, 0));
    assert_eq!(forge.db.list_audit_log_by_action("pull.update", 10).unwrap().len(), 1);

    // A second update has nothing to do.
    let again = forge
        .pulls
        .update_pull_request(&acme(), index, "acme", None, &ctx(&forge))
        .unwrap();
    assert!(matches!(again, UpdateOutcome::AlreadyUpToDate { .. }));
    assert_eq!(again.head(), outcome.head());
}

#[test]
fn test_rebase_update_then_one_ahead() {
    let (_dir, forge) = setup();
    let index = diverged_pull(&forge);
    let base_tip = tip(&forge, &acme(), "main");

    forge
        .pulls
        .update_pull_request(&acme(), index, "acme", Some(UpdateStrategy::Rebase), &ctx(&forge))
        .unwrap();

    let counts = forge.pulls.get_diverging(&acme(), index, &ctx(&forge)).unwrap();
    assert_eq!((counts.ahead, counts.behind), (1, 0));
    let client = forge.store.open(&acme()).unwrap();
    let head = client.resolve_branch("feature").unwrap();
    assert_eq!(client.commit_info(head).unwrap().parents, vec![base_tip]);
}

#[test]
fn test_concurrent_updates_do_not_lose_writes() {
    let (_dir, forge) = setup();
    let index = diverged_pull(&forge);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let forge = forge.clone();
            thread::spawn(move || {
                forge.pulls.update_pull_request(
                    &acme(),
                    index,
                    "acme",
                    Some(UpdateStrategy::Merge),
                    &forge.operation_context(),
                )
            })
        })
        .collect();
    let outcomes: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();

    let updated = outcomes
        .iter()
        .filter(|o| matches!(o, UpdateOutcome::Updated { .. }))
        .count();
    assert_eq!(updated, 1);
    let final_head = tip(&forge, &acme(), "feature");
    assert!(outcomes.iter().all(|o| o.head() == final_head));

    let counts = forge.pulls.get_diverging(&acme(), index, &ctx(&forge)).unwrap();
    assert_eq!((counts.ahead, counts.behind), (2, 0));
}

#[test]
fn test_conflicting_update_is_reported() {
    let (_dir, forge) = setup();
    forge.repos.create(&acme(), None).unwrap();
    write(&forge, &acme(), "acme", "main", None, "README.md", "hello\n");
    write(&forge, &acme(), "acme", "main", Some("feature"), "notes.txt", "feature side\n");
    write(&forge, &acme(), "acme", "main", None, "notes.txt", "base side\n");
    let pr = forge
        .pulls
        .create(
            "acme",
            &NewPullRequest {
                base: acme(),
                base_branch: "main".into(),
                head: acme(),
                head_branch: "feature".into(),
                title: "Notes".into(),
                allow_maintainer_edit: false,
            },
        )
        .unwrap();
    let head_before = tip(&forge, &acme(), "feature");

    let err = forge
        .pulls
        .update_pull_request(&acme(), pr.index, "acme", Some(UpdateStrategy::Merge), &ctx(&forge))
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::Reconcile(ReconcileError::MergeConflict { .. })
    ));
    assert_eq!(tip(&forge, &acme(), "feature"), head_before);

    let conflicts = forge.pulls.conflicts(&acme(), pr.index).unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].file_path, "notes.txt");
    assert!(!forge.db.list_audit_log_by_action("pull.update", 10).unwrap()[0].success);
}

// ===========================================================================
// Permissions
// ===========================================================================

#[test]
fn test_permission_denied_leaves_head_unchanged() {
    let (_dir, forge) = setup();
    let index = diverged_pull(&forge);
    let before = tip(&forge, &acme(), "feature");

    let err = forge
        .pulls
        .update_pull_request(&acme(), index, "mallory", None, &ctx(&forge))
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::Reconcile(ReconcileError::PermissionDenied { .. })
    ));
    assert_eq!(tip(&forge, &acme(), "feature"), before);

    let permission = forge
        .pulls
        .update_permission(&acme(), index, Some("mallory"))
        .unwrap();
    assert!(!permission.merge && !permission.rebase);
}

#[test]
fn test_branch_protection_limits_update_styles() {
    let (_dir, forge) = setup();
    let index = diverged_pull(&forge);
    forge
        .repos
        .set_collaborator(&acme(), "acme", "bob", AccessMode::Write)
        .unwrap();
    forge
        .repos
        .protect_branch(&acme(), "acme", "feature", true, false)
        .unwrap();

    let permission = forge.pulls.update_permission(&acme(), index, Some("bob")).unwrap();
    assert!(permission.merge);
    assert!(!permission.rebase);

    let err = forge
        .pulls
        .update_pull_request(&acme(), index, "bob", Some(UpdateStrategy::Rebase), &ctx(&forge))
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::Reconcile(ReconcileError::PermissionDenied { .. })
    ));
    forge
        .pulls
        .update_pull_request(&acme(), index, "bob", Some(UpdateStrategy::Merge), &ctx(&forge))
        .unwrap();
}

// ===========================================================================
// Forks
// ===========================================================================

fn fork_pull(forge: &Forge, allow_maintainer_edit: bool) -> i64 {
    let fork = RepoRef::new("carol", "widgets");
    forge.repos.create(&acme(), None).unwrap();
    forge.repos.create(&fork, None).unwrap();
    write(forge, &acme(), "acme", "main", None, "README.md", "hello\n");

    let base_path = forge.store.repo_path(&acme());
    forge
        .store
        .open(&fork)
        .unwrap()
        .fetch_branch_from(&base_path, "main", &branch_ref("feature"))
        .unwrap();
    write(forge, &fork, "carol", "feature", None, "feature.txt", "feature\n");
    write(forge, &acme(), "acme", "main", None, "base.txt", "base\n");

    forge
        .pulls
        .create(
            "carol",
            &NewPullRequest {
                base: acme(),
                base_branch: "main".into(),
                head: fork,
                head_branch: "feature".into(),
                title: "From a fork".into(),
                allow_maintainer_edit,
            },
        )
        .unwrap()
        .index
}

#[test]
fn test_fork_divergence_and_maintainer_update() {
    let (_dir, forge) = setup();
    let index = fork_pull(&forge, true);
    let counts = forge.pulls.get_diverging(&acme(), index, &ctx(&forge)).unwrap();
    assert_eq!((counts.ahead, counts.behind), (1, 1));

    // acme only has write access to the base repository.
    forge
        .pulls
        .update_pull_request(&acme(), index, "acme", Some(UpdateStrategy::Merge), &ctx(&forge))
        .unwrap();
    let counts = forge.pulls.get_diverging(&acme(), index, &ctx(&forge)).unwrap();
    assert_eq!((counts.ahead, counts.behind), (2, 0));
}

#[test]
fn test_fork_without_maintainer_edit_denies_base_owner() {
    let (_dir, forge) = setup();
    let index = fork_pull(&forge, false);
    let err = forge
        .pulls
        .update_pull_request(&acme(), index, "acme", None, &ctx(&forge))
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::Reconcile(ReconcileError::PermissionDenied { .. })
    ));
    forge
        .pulls
        .update_pull_request(&acme(), index, "carol", None, &ctx(&forge))
        .unwrap();
}

// ===========================================================================
// Lifecycle
// ===========================================================================

#[test]
fn test_closed_pull_request_cannot_be_updated() {
    let (_dir, forge) = setup();
    let index = diverged_pull(&forge);
    let closed = forge.pulls.close(&acme(), index, "acme").unwrap();
    assert_eq!(closed.state, PullRequestState::Closed);

    let err = forge
        .pulls
        .update_pull_request(&acme(), index, "acme", None, &ctx(&forge))
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::Reconcile(ReconcileError::PullRequestNotOpen { .. })
    ));

    let reopened = forge.pulls.reopen(&acme(), index, "acme").unwrap();
    assert!(reopened.is_open());
}

#[test]
fn test_merge_marks_pull_request_merged() {
    let (_dir, forge) = setup();
    let index = diverged_pull(&forge);
    let merged = forge.pulls.merge(&acme(), index, "acme", &ctx(&forge)).unwrap();
    assert_eq!(merged.state, PullRequestState::Merged);
    assert_eq!(merged.merged_commit.as_deref(), Some(tip(&forge, &acme(), "main").as_str()));
    assert_eq!(merged.merged_by.as_deref(), Some("acme"));

    let err = forge.pulls.reopen(&acme(), index, "acme").unwrap_err();
    assert!(matches!(
        err,
        CoreError::PullRequest(PullRequestError::AlreadyMerged(_))
    ));
}

#[test]
fn test_duplicate_and_same_branch_pulls_rejected() {
    let (_dir, forge) = setup();
    diverged_pull(&forge);
    let mut req = NewPullRequest {
        base: acme(),
        base_branch: "main".into(),
        head: acme(),
        head_branch: "feature".into(),
        title: "Again".into(),
        allow_maintainer_edit: false,
    };
    assert!(matches!(
        forge.pulls.create("acme", &req).unwrap_err(),
        CoreError::PullRequest(PullRequestError::AlreadyExists(1))
    ));

    req.head_branch = "main".into();
    assert!(matches!(
        forge.pulls.create("acme", &req).unwrap_err(),
        CoreError::PullRequest(PullRequestError::SameBranch)
    ));

    req.head_branch = "missing".into();
    assert!(matches!(
        forge.pulls.create("acme", &req).unwrap_err(),
        CoreError::PullRequest(PullRequestError::BranchNotFound { .. })
    ));
}

#[test]
fn test_deleted_head_branch_is_reference_not_found() {
    let (_dir, forge) = setup();
    let index = diverged_pull(&forge);
    forge.store.open(&acme()).unwrap().delete_branch("feature").unwrap();

    let err = forge
        .pulls
        .get_diverging(&acme(), index, &ctx(&forge))
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::Reconcile(ReconcileError::ReferenceNotFound { .. })
    ));
}

// ===========================================================================
// Longer histories
// ===========================================================================

#[test]
fn test_rebase_replays_several_commits_in_order() {
    let (_dir, forge) = setup();
    forge.repos.create(&acme(), None).unwrap();
    write(&forge, &acme(), "acme", "main", None, "README.md", "hello\n");
    write(&forge, &acme(), "acme", "main", Some("feature"), "notes.txt", "one\n");
    commit_file(&forge, "feature", "notes.txt", "one\ntwo\n", "Second note");
    commit_file(&forge, "feature", "notes.txt", "one\ntwo\nthree\n", "Third note");
    commit_file(&forge, "main", "base.txt", "base\n", "Base one");
    commit_file(&forge, "main", "base.txt", "base\nmore\n", "Base two");
    let index = open_feature_pull(&forge);

    let before = forge.pulls.get_diverging(&acme(), index, &ctx(&forge)).unwrap();
    assert_eq!((before.ahead, before.behind), (3, 2));

    let outcome = forge
        .pulls
        .update_pull_request(&acme(), index, "acme", Some(UpdateStrategy::Rebase), &ctx(&forge))
        .unwrap();
    assert!(matches!(outcome, UpdateOutcome::Updated { commits_created: 3, .. }));

    let after = forge.pulls.get_diverging(&acme(), index, &ctx(&forge)).unwrap();
    assert_eq!((after.ahead, after.behind), (before.ahead, 0));
    assert_eq!(
        first_parent_messages(&forge, "feature", 5),
        vec!["Base one", "Base two", "Add 'notes.txt'", "Second note", "Third note"]
    );
    assert_eq!(read(&forge, "feature", "notes.txt"), "one\ntwo\nthree\n");
    assert_eq!(read(&forge, "feature", "base.txt"), "base\nmore\n");
}

#[test]
fn test_rebase_drops_commit_already_on_base() {
    let (_dir, forge) = setup();
    forge.repos.create(&acme(), None).unwrap();
    write(&forge, &acme(), "acme", "main", None, "README.md", "hello\n");
    write(&forge, &acme(), "acme", "main", Some("feature"), "feature.txt", "feature\n");
    commit_file(&forge, "feature", "shared.txt", "same\n", "Shared on feature");
    commit_file(&forge, "main", "shared.txt", "same\n", "Shared on main");
    commit_file(&forge, "main", "base.txt", "base\n", "Base work");
    let index = open_feature_pull(&forge);

    let before = forge.pulls.get_diverging(&acme(), index, &ctx(&forge)).unwrap();
    assert_eq!((before.ahead, before.behind), (2, 2));

    let outcome = forge
        .pulls
        .update_pull_request(&acme(), index, "acme", Some(UpdateStrategy::Rebase), &ctx(&forge))
        .unwrap();
    assert!(matches!(outcome, UpdateOutcome::Updated { commits_created: 1, .. }));

    let after = forge.pulls.get_diverging(&acme(), index, &ctx(&forge)).unwrap();
    assert_eq!((after.ahead, after.behind), (1, 0));
    assert_eq!(
        first_parent_messages(&forge, "feature", 2),
        vec!["Base work", "Add 'feature.txt'"]
    );
    assert_eq!(read(&forge, "feature", "shared.txt"), "same\n");
}

#[test]
fn test_rebase_skips_earlier_update_merge() {
    let (_dir, forge) = setup();
    let index = diverged_pull(&forge);
    forge
        .pulls
        .update_pull_request(&acme(), index, "acme", Some(UpdateStrategy::Merge), &ctx(&forge))
        .unwrap();
    commit_file(&forge, "main", "later.txt", "later\n", "Later base work");
    let base_tip = tip(&forge, &acme(), "main");

    let before = forge.pulls.get_diverging(&acme(), index, &ctx(&forge)).unwrap();
    assert_eq!((before.ahead, before.behind), (2, 1));

    forge
        .pulls
        .update_pull_request(&acme(), index, "acme", Some(UpdateStrategy::Rebase), &ctx(&forge))
        .unwrap();

    let after = forge.pulls.get_diverging(&acme(), index, &ctx(&forge)).unwrap();
    assert_eq!((after.ahead, after.behind), (1, 0));
    let client = forge.store.open(&acme()).unwrap();
    let head = client.commit_info(client.resolve_branch("feature").unwrap()).unwrap();
    assert_eq!(head.parents, vec![base_tip]);
    assert_eq!(head.message.trim_end(), "Add 'feature.txt'");
    assert_eq!(read(&forge, "feature", "later.txt"), "later\n");
}

#[test]
fn test_merge_update_adds_one_commit_to_longer_head() {
    let (_dir, forge) = setup();
    forge.repos.create(&acme(), None).unwrap();
    write(&forge, &acme(), "acme", "main", None, "README.md", "hello\n");
    write(&forge, &acme(), "acme", "main", Some("feature"), "a.txt", "a\n");
    commit_file(&forge, "feature", "b.txt", "b\n", "Add b");
    for n in 1..=3 {
        commit_file(&forge, "main", &format!("base{n}.txt"), "x\n", &format!("Base {n}"));
    }
    let index = open_feature_pull(&forge);

    let before = forge.pulls.get_diverging(&acme(), index, &ctx(&forge)).unwrap();
    assert_eq!((before.ahead, before.behind), (2, 3));

    forge
        .pulls
        .update_pull_request(&acme(), index, "acme", Some(UpdateStrategy::Merge), &ctx(&forge))
        .unwrap();

    let after = forge.pulls.get_diverging(&acme(), index, &ctx(&forge)).unwrap();
    assert_eq!((after.ahead, after.behind), (before.ahead + 1, 0));
}

// ===========================================================================
// Merging
// ===========================================================================

#[test]
fn test_concurrent_merges_of_one_pull_request_land_once() {
    for _ in 0..5 {
        let (_dir, forge) = setup();
        let index = diverged_pull(&forge);
        let old_main = tip(&forge, &acme(), "main");

        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let forge = forge.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    forge
                        .pulls
                        .merge(&acme(), index, "acme", &forge.operation_context())
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let merged: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(merged.len(), 1);
        for result in &results {
            if let Err(e) = result {
                assert!(
                    matches!(e, CoreError::Reconcile(ReconcileError::PullRequestNotOpen { .. })),
                    "unexpected error: {e}"
                );
            }
        }

        let main = tip(&forge, &acme(), "main");
        assert_eq!(merged[0].merged_commit.as_deref(), Some(main.as_str()));
        let client = forge.store.open(&acme()).unwrap();
        let merge = client.commit_info(git2::Oid::from_str(&main).unwrap()).unwrap();
        assert_eq!(merge.parents[0], old_main);
        assert_eq!(
            forge.pulls.get(&acme(), index).unwrap().state,
            PullRequestState::Merged
        );
        let audit = forge.db.list_audit_log_by_action("pull.merge", 10).unwrap();
        assert_eq!(audit.iter().filter(|e| e.success).count(), 1);
    }
}

#[test]
fn test_merge_of_already_contained_head_is_rejected() {
    let (_dir, forge) = setup();
    let index = diverged_pull(&forge);
    let stale = forge.pulls.get(&acme(), index).unwrap();
    forge.pulls.merge(&acme(), index, "acme", &ctx(&forge)).unwrap();
    let main = tip(&forge, &acme(), "main");

    // The stale row still says open; the base branch already holds the head.
    let base = forge.db.get_repository_by_id(stale.base_repo_id).unwrap();
    let grant = AccessPolicy::new(forge.db.clone(), true)
        .grant_merge(&stale, "acme", &base)
        .unwrap();
    let reconciler = Reconciler::new(
        forge.store.clone(),
        forge.identities.clone(),
        forge.config.pulls.clone(),
    );
    let err = reconciler
        .merge_into_base(&stale, "acme", grant.as_ref(), &ctx(&forge))
        .unwrap_err();
    assert!(matches!(err, ReconcileError::PullRequestNotOpen { .. }));
    assert_eq!(tip(&forge, &acme(), "main"), main);
}
