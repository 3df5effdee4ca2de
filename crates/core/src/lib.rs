//! prforge core library.
//!
//! Pull request bookkeeping on top of bare git repositories: divergence
//! counting between head and base, bringing a head branch up to date by
//! merge or rebase, merging pull requests, and a small file contents API.
//! Every ref update is a compare-and-swap, so concurrent pushes are never
//! lost.

pub mod access;
pub mod config;
pub mod conflict;
pub mod contents;
pub mod context;
pub mod db;
pub mod divergence;
pub mod errors;
pub mod forge;
pub mod git;
pub mod identity;
pub mod models;
pub mod pulls;
pub mod reconcile;
pub mod repos;
pub mod tokens;

// Re-exports for convenience.
pub use config::AppConfig;
pub use context::OperationContext;
pub use db::Database;
pub use divergence::DivergenceCounter;
pub use forge::Forge;
pub use identity::IdentityMapper;
pub use reconcile::Reconciler;
