//! Git storage for prforge.

pub mod client;
pub mod ref_lock;
pub mod store;

pub use client::{branch_ref, BranchInfo, GitClient, GitCommitInfo};
pub use ref_lock::{RefLockGuard, RefLocks};
pub use store::RepositoryStore;
