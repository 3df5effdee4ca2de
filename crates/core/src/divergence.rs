//! Ahead/behind counting between a pull request's head and base tips.
//!
//! Both tips are painted into an arena of commit nodes. Every node carries a
//! two-bit colour set (reachable from head, reachable from base) and colours
//! flow from child to parent. A node goes back on the frontier only when its
//! colour set grows, so each commit is expanded at most three times and the
//! walk needs no recursion. Commit timestamps are never consulted, which
//! keeps the result exact for clock-skewed histories.

use std::collections::{HashMap, VecDeque};

use git2::Oid;
use tracing::{debug, instrument};

use crate::context::OperationContext;
use crate::errors::{GitError, ReconcileError};
use crate::git::{GitClient, RepositoryStore};
use crate::models::{DivergenceCount, PullRequest};

const FROM_HEAD: u8 = 0b01;
const FROM_BASE: u8 = 0b10;

/// How many nodes are expanded between cancellation checks.
const CHECK_INTERVAL: usize = 1024;

/// Read-only view of the commit graph.
pub trait CommitSource {
    fn parents(&self, commit: Oid) -> Result<Vec<Oid>, GitError>;
}

impl CommitSource for GitClient {
    fn parents(&self, commit: Oid) -> Result<Vec<Oid>, GitError> {
        self.commit_parents(commit)
    }
}

struct Node {
    oid: Oid,
    flags: u8,
    parents: Option<Vec<usize>>,
}

/// Arena of commit nodes indexed by object id.
#[derive(Default)]
struct CommitArena {
    nodes: Vec<Node>,
    index: HashMap<Oid, usize>,
}

impl CommitArena {
    fn intern(&mut self, oid: Oid) -> usize {
        if let Some(&idx) = self.index.get(&oid) {
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(Node {
            oid,
            flags: 0,
            parents: None,
        });
        self.index.insert(oid, idx);
        idx
    }

    /// Add `flags` to a node. Returns whether its colour set grew.
    fn paint(&mut self, idx: usize, flags: u8) -> bool {
        let node = &mut self.nodes[idx];
        let merged = node.flags | flags;
        if merged == node.flags {
            return false;
        }
        node.flags = merged;
        true
    }

    fn parents_of<S: CommitSource + ?Sized>(
        &mut self,
        idx: usize,
        source: &S,
    ) -> Result<Vec<usize>, GitError> {
        if let Some(parents) = &self.nodes[idx].parents {
            return Ok(parents.clone());
        }
        let oids = source.parents(self.nodes[idx].oid)?;
        let parents: Vec<usize> = oids.into_iter().map(|p| self.intern(p)).collect();
        self.nodes[idx].parents = Some(parents.clone());
        Ok(parents)
    }
}

/// Count commits reachable from `head` but not `base` (ahead) and the
/// reverse (behind).
pub fn count_divergence<S: CommitSource + ?Sized>(
    source: &S,
    head: Oid,
    base: Oid,
    ctx: &OperationContext,
) -> Result<DivergenceCount, ReconcileError> {
    let mut arena = CommitArena::default();
    let mut frontier = VecDeque::new();

    let head_idx = arena.intern(head);
    arena.paint(head_idx, FROM_HEAD);
    frontier.push_back(head_idx);
    let base_idx = arena.intern(base);
    if arena.paint(base_idx, FROM_BASE) && base_idx != head_idx {
        frontier.push_back(base_idx);
    }

    let mut expanded = 0usize;
    while let Some(idx) = frontier.pop_front() {
        expanded += 1;
        if expanded % CHECK_INTERVAL == 0 {
            ctx.check("next divergence batch")?;
        }
        let flags = arena.nodes[idx].flags;
        for parent in arena.parents_of(idx, source)? {
            if arena.paint(parent, flags) {
                frontier.push_back(parent);
            }
        }
    }

    let mut count = DivergenceCount::default();
    for node in &arena.nodes {
        match node.flags {
            FROM_HEAD => count.ahead += 1,
            FROM_BASE => count.behind += 1,
            _ => {}
        }
    }
    debug!(
        visited = arena.nodes.len(),
        expanded,
        ahead = count.ahead,
        behind = count.behind,
        "divergence counted"
    );
    Ok(count)
}

/// Computes [`DivergenceCount`] for pull requests stored in a
/// [`RepositoryStore`].
#[derive(Clone)]
pub struct DivergenceCounter {
    store: RepositoryStore,
}

impl DivergenceCounter {
    pub fn new(store: RepositoryStore) -> Self {
        Self { store }
    }

    /// Ahead/behind counts of `pr`. Takes no lock and writes nothing.
    #[instrument(skip(self, pr, ctx), fields(pr = %pr.base, index = pr.index))]
    pub fn compute(
        &self,
        pr: &PullRequest,
        ctx: &OperationContext,
    ) -> Result<DivergenceCount, ReconcileError> {
        ctx.check("resolving tips")?;
        let base_repo = self.store.open(&pr.base)?;
        let base_tip = resolve_tip(&base_repo, &pr.base.to_string(), &pr.base_branch)?;

        let head_tip = if pr.is_cross_repo() {
            let head_repo = self.store.open(&pr.head)?;
            let tip = resolve_tip(&head_repo, &pr.head.to_string(), &pr.head_branch)?;
            base_repo.add_object_alternate(&head_repo)?;
            tip
        } else {
            resolve_tip(&base_repo, &pr.base.to_string(), &pr.head_branch)?
        };

        count_divergence(&base_repo, head_tip, base_tip, ctx)
    }
}

/// Resolve a branch tip, reporting a missing branch as
/// [`ReconcileError::ReferenceNotFound`].
pub fn resolve_tip(
    client: &GitClient,
    repo_name: &str,
    branch: &str,
) -> Result<Oid, ReconcileError> {
    client.resolve_branch(branch).map_err(|e| match e {
        GitError::RefNotFound(_) => ReconcileError::ReferenceNotFound {
            repo: repo_name.to_string(),
            reference: branch.to_string(),
        },
        other => other.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory DAG keyed by small integers encoded as oids.
    struct Graph(HashMap<Oid, Vec<Oid>>);

    fn oid(n: u8) -> Oid {
        let mut bytes = [0u8; 20];
        bytes[19] = n;
        Oid::from_bytes(&bytes).unwrap()
    }

    impl Graph {
        fn new(edges: &[(u8, &[u8])]) -> Self {
            Graph(
                edges
                    .iter()
                    .map(|(c, ps)| (oid(*c), ps.iter().map(|p| oid(*p)).collect()))
                    .collect(),
            )
        }
    }

    impl CommitSource for Graph {
        fn parents(&self, commit: Oid) -> Result<Vec<Oid>, GitError> {
            self.0
                .get(&commit)
                .cloned()
                .ok_or_else(|| GitError::RefNotFound(commit.to_string()))
        }
    }

    fn count(graph: &Graph, head: u8, base: u8) -> DivergenceCount {
        count_divergence(graph, oid(head), oid(base), &OperationContext::background()).unwrap()
    }

    #[test]
    fn test_one_ahead_one_behind() {
        // 1 <- 2 (base), 1 <- 3 (head)
        let g = Graph::new(&[(1, &[]), (2, &[1]), (3, &[1])]);
        assert_eq!(count(&g, 3, 2), DivergenceCount { ahead: 1, behind: 1 });
    }

    #[test]
    fn test_identical_tips() {
        let g = Graph::new(&[(1, &[]), (2, &[1])]);
        assert_eq!(count(&g, 2, 2), DivergenceCount::default());
    }

    #[test]
    fn test_head_contains_base() {
        let g = Graph::new(&[(1, &[]), (2, &[1]), (3, &[2])]);
        assert_eq!(count(&g, 3, 1), DivergenceCount { ahead: 2, behind: 0 });
        assert_eq!(count(&g, 1, 3), DivergenceCount { ahead: 0, behind: 2 });
    }

    #[test]
    fn test_merge_commits_follow_all_parents() {
        // base: 1 <- 2 <- 4
        // head: 1 <- 3, merge 5 = [3, 2]
        let g = Graph::new(&[(1, &[]), (2, &[1]), (3, &[1]), (4, &[2]), (5, &[3, 2])]);
        // head-only: 3, 5; base-only: 4
        assert_eq!(count(&g, 5, 4), DivergenceCount { ahead: 2, behind: 1 });
    }

    #[test]
    fn test_late_discovered_common_ancestry() {
        // A long head-only chain whose root is only reached from base through
        // a second parent deep in history.
        // 1 <- 2 <- 3 <- 4 <- 5 (head)
        // 1 <- 6, 7 = [6, 4] (base)
        let g = Graph::new(&[
            (1, &[]),
            (2, &[1]),
            (3, &[2]),
            (4, &[3]),
            (5, &[4]),
            (6, &[1]),
            (7, &[6, 4]),
        ]);
        assert_eq!(count(&g, 5, 7), DivergenceCount { ahead: 1, behind: 2 });
    }

    #[test]
    fn test_unrelated_histories() {
        let g = Graph::new(&[(1, &[]), (2, &[1]), (10, &[]), (11, &[10])]);
        assert_eq!(count(&g, 2, 11), DivergenceCount { ahead: 2, behind: 2 });
    }
}
