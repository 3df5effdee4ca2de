//! Conflict reporting for failed head-branch updates and merges.
//!
//! 1. **Detection** -- libgit2 marks conflicted paths in the merge index.
//! 2. **Rendering** -- a diffy three-way merge shows the conflicting regions.
//! 3. **Recording** -- the report is stored per pull request.

pub mod merger;
pub mod report;

pub use merger::{ConflictMarker, MergeResult, Merger};
pub use report::{ConflictReport, FileConflict};
