//! Conflict reports built from a conflicted git2 index.

use git2::{Index, IndexEntry, Oid, Repository};
use serde::Serialize;
use tracing::{debug, warn};

use super::merger::Merger;
use crate::db::Database;
use crate::errors::DatabaseError;
use crate::models::UpdateStrategy;

/// Files larger than this are reported without content.
const MAX_CONTENT_BYTES: usize = 512 * 1024;

/// One conflicted path.
#[derive(Debug, Clone, Serialize)]
pub struct FileConflict {
    pub path: String,
    pub base_content: Option<String>,
    pub ours_content: Option<String>,
    pub theirs_content: Option<String>,
    /// Merged text with conflict markers, for text files.
    pub merged_preview: Option<String>,
    /// Number of conflicting regions (1 for binary or add/delete conflicts).
    pub region_count: usize,
}

/// All conflicts from one failed merge or replayed commit.
#[derive(Debug, Clone, Serialize)]
pub struct ConflictReport {
    pub strategy: UpdateStrategy,
    /// The commit being replayed when a rebase stopped.
    pub commit: Option<String>,
    pub files: Vec<FileConflict>,
}

impl ConflictReport {
    /// Collect the conflicted entries of `index`.
    pub fn from_index(
        repo: &Repository,
        index: &Index,
        strategy: UpdateStrategy,
        commit: Option<Oid>,
    ) -> Result<Self, git2::Error> {
        let mut files = Vec::new();
        for conflict in index.conflicts()? {
            let conflict = conflict?;
            let path = [&conflict.our, &conflict.their, &conflict.ancestor]
                .into_iter()
                .flatten()
                .next()
                .map(|entry| String::from_utf8_lossy(&entry.path).into_owned())
                .unwrap_or_default();

            let base = load_text(repo, conflict.ancestor.as_ref());
            let ours = load_text(repo, conflict.our.as_ref());
            let theirs = load_text(repo, conflict.their.as_ref());

            let (merged_preview, region_count) = match (&base, &ours, &theirs) {
                (Some(b), Some(o), Some(t)) => {
                    let result = Merger::three_way_merge(b, o, t);
                    let regions = result.conflict_markers.len().max(1);
                    (Some(result.merged_content), regions)
                }
                _ => (None, 1),
            };

            files.push(FileConflict {
                path,
                base_content: base,
                ours_content: ours,
                theirs_content: theirs,
                merged_preview,
                region_count,
            });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(files = files.len(), %strategy, "collected conflicts");
        Ok(Self {
            strategy,
            commit: commit.map(|c| c.to_string()),
            files,
        })
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }

    /// Replace any earlier report for `pull_id` with this one.
    pub fn record(&self, db: &Database, pull_id: i64) -> Result<(), DatabaseError> {
        db.clear_conflicts_for_pull(pull_id)?;
        let strategy = self.strategy.to_string();
        for file in &self.files {
            db.insert_conflict(
                pull_id,
                &strategy,
                self.commit.as_deref(),
                &file.path,
                file.base_content.as_deref(),
                file.ours_content.as_deref(),
                file.theirs_content.as_deref(),
                file.merged_preview.as_deref(),
                file.region_count as i64,
            )?;
        }
        Ok(())
    }
}

/// Blob content of an index entry if it is reasonably small UTF-8 text.
fn load_text(repo: &Repository, entry: Option<&IndexEntry>) -> Option<String> {
    let entry = entry?;
    let blob = match repo.find_blob(entry.id) {
        Ok(blob) => blob,
        Err(e) => {
            warn!(id = %entry.id, error = %e, "conflicted blob missing");
            return None;
        }
    };
    if blob.is_binary() || blob.size() > MAX_CONTENT_BYTES {
        return None;
    }
    String::from_utf8(blob.content().to_vec()).ok()
}
