//! Author and committer signatures for platform users.
//!
//! An entry in the users file wins; anyone else gets `<username>@<domain>`.

pub mod mapper;

pub use mapper::{GitIdentity, IdentityMapper};
