//! Three-way text merge used to describe conflicted files.
//!
//! libgit2 decides whether a merge conflicts; this module only renders the
//! conflicted content with standard markers so callers can show where the
//! two sides disagree.

use tracing::debug;

/// The result of a three-way merge attempt.
#[derive(Debug, Clone)]
pub struct MergeResult {
    /// The merged content (contains conflict markers if `has_conflicts`).
    pub merged_content: String,
    /// Whether the merge completed without conflicts.
    pub has_conflicts: bool,
    /// Locations of conflict marker blocks within the merged content.
    pub conflict_markers: Vec<ConflictMarker>,
}

/// A single conflict region within merged output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictMarker {
    /// Line (1-indexed) of the opening `<<<<<<<` marker.
    pub start_line: usize,
    /// Line (1-indexed) of the closing `>>>>>>>` marker.
    pub end_line: usize,
}

/// Stateless three-way merge engine.
pub struct Merger;

impl Merger {
    /// Merge `ours` and `theirs` relative to their common `base`.
    pub fn three_way_merge(base: &str, ours: &str, theirs: &str) -> MergeResult {
        match diffy::merge(base, ours, theirs) {
            Ok(merged) => MergeResult {
                merged_content: merged,
                has_conflicts: false,
                conflict_markers: Vec::new(),
            },
            Err(conflicted) => {
                let conflict_markers = find_markers(&conflicted);
                debug!(regions = conflict_markers.len(), "three-way merge conflicted");
                MergeResult {
                    merged_content: conflicted,
                    has_conflicts: true,
                    conflict_markers,
                }
            }
        }
    }
}

fn find_markers(content: &str) -> Vec<ConflictMarker> {
    let mut markers = Vec::new();
    let mut open = None;
    for (i, line) in content.lines().enumerate() {
        if line.starts_with("<<<<<<<") {
            open = Some(i + 1);
        } else if line.starts_with(">>>>>>>") {
            if let Some(start_line) = open.take() {
                markers.push(ConflictMarker {
                    start_line,
                    end_line: i + 1,
                });
            }
        }
    }
    markers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_merge_of_disjoint_edits() {
        let base = "a\nb\nc\nd\ne\n";
        let ours = "A\nb\nc\nd\ne\n";
        let theirs = "a\nb\nc\nd\nE\n";
        let result = Merger::three_way_merge(base, ours, theirs);
        assert!(!result.has_conflicts);
        assert_eq!(result.merged_content, "A\nb\nc\nd\nE\n");
        assert!(result.conflict_markers.is_empty());
    }

    #[test]
    fn test_overlapping_edits_conflict() {
        let base = "line1\nline2\nline3\n";
        let ours = "line1\nours\nline3\n";
        let theirs = "line1\ntheirs\nline3\n";
        let result = Merger::three_way_merge(base, ours, theirs);
        assert!(result.has_conflicts);
        assert_eq!(result.conflict_markers.len(), 1);
        assert!(result.merged_content.contains("<<<<<<<"));
        assert!(result.merged_content.contains("ours"));
        assert!(result.merged_content.contains("theirs"));
    }

    #[test]
    fn test_identical_changes_merge_cleanly() {
        let result = Merger::three_way_merge("x\n", "y\n", "y\n");
        assert!(!result.has_conflicts);
        assert_eq!(result.merged_content, "y\n");
    }

    #[test]
    fn test_find_markers_ignores_unbalanced() {
        let text = "a\n<<<<<<< ours\nb\n=======\nc\n>>>>>>> theirs\n>>>>>>> stray\n";
        assert_eq!(
            find_markers(text),
            vec![ConflictMarker {
                start_line: 2,
                end_line: 6
            }]
        );
    }
}
