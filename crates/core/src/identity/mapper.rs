//! Core identity mapping logic.
//!
//! [`IdentityMapper`] turns a platform username into the name and email that
//! go on commits written for that user.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use git2::Signature;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::IdentityConfig;
use crate::errors::IdentityError;

/// A Git author/committer identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitIdentity {
    /// Display name.
    pub name: String,
    /// Email address.
    pub email: String,
}

impl GitIdentity {
    /// A signature stamped with the current time.
    pub fn signature(&self) -> Result<Signature<'static>, IdentityError> {
        Signature::now(&self.name, &self.email).map_err(|e| IdentityError::InvalidSignature {
            name: self.name.clone(),
            email: self.email.clone(),
            detail: e.message().to_string(),
        })
    }
}

/// Contents of the identity mapping file:
///
/// ```toml
/// [users]
/// alice = { name = "Alice Smith", email = "alice@corp.example" }
/// ```
#[derive(Debug, Default, Deserialize)]
struct UsersFile {
    #[serde(default)]
    users: HashMap<String, GitIdentity>,
}

/// Read the mapping file. Entries whose email has no `@` are rejected so a
/// typo never ends up on a commit.
fn load_users(path: &Path) -> Result<HashMap<String, GitIdentity>, IdentityError> {
    let file_error = |detail: String| IdentityError::MappingFileError {
        path: path.display().to_string(),
        detail,
    };
    let text = std::fs::read_to_string(path)?;
    let parsed: UsersFile =
        toml::from_str(&text).map_err(|e| IdentityError::ParseError(e.to_string()))?;
    if let Some((user, _)) = parsed.users.iter().find(|(_, id)| !id.email.contains('@')) {
        return Err(file_error(format!("user '{}' has an invalid email", user)));
    }
    debug!(path = %path.display(), count = parsed.users.len(), "loaded identity mappings");
    Ok(parsed.users)
}

/// Username -> commit identity mapper.
///
/// Thread-safe: the mapping cache is wrapped in an `RwLock` so request
/// handlers can read concurrently and `reload()` can swap it.
pub struct IdentityMapper {
    cache: Arc<RwLock<HashMap<String, GitIdentity>>>,
    mapping_file_path: Option<PathBuf>,
    email_domain: Option<String>,
    service: GitIdentity,
}

impl IdentityMapper {
    /// Create a new `IdentityMapper` from an [`IdentityConfig`].
    ///
    /// If a mapping file is specified, it is loaded immediately.
    pub fn new(config: &IdentityConfig) -> Result<Self, IdentityError> {
        info!("initializing identity mapper");

        let entries = match &config.mapping_file {
            Some(path) if path.exists() => load_users(path)?,
            Some(path) => {
                warn!(path = %path.display(), "mapping file not found, starting with empty map");
                HashMap::new()
            }
            None => {
                debug!("no mapping file configured");
                HashMap::new()
            }
        };

        Ok(Self {
            cache: Arc::new(RwLock::new(entries)),
            mapping_file_path: config.mapping_file.clone(),
            email_domain: config.email_domain.clone(),
            service: GitIdentity {
                name: config.committer_name.clone(),
                email: config.committer_email.clone(),
            },
        })
    }

    /// Identity of the service account.
    pub fn service_identity(&self) -> &GitIdentity {
        &self.service
    }

    /// Map a username to a commit identity.
    ///
    /// Lookup order:
    /// 1. The service account name maps to the configured committer
    /// 2. Mapping file entry
    /// 3. `username@<email_domain>`
    /// 4. `username@<domain of the service committer email>`
    pub fn identity_for(&self, username: &str) -> Result<GitIdentity, IdentityError> {
        if username == self.service.name {
            return Ok(self.service.clone());
        }

        {
            let cache = self.cache.read().map_err(|_| IdentityError::LockPoisoned)?;
            if let Some(identity) = cache.get(username) {
                debug!(username, "found in mapping file cache");
                return Ok(identity.clone());
            }
        }

        let domain = self
            .email_domain
            .as_deref()
            .or_else(|| self.service.email.split_once('@').map(|(_, d)| d))
            .filter(|d| !d.is_empty());
        match domain {
            Some(domain) => {
                let identity = GitIdentity {
                    name: username.to_string(),
                    email: format!("{}@{}", username, domain),
                };
                debug!(username, email = %identity.email, "using fallback identity");
                Ok(identity)
            }
            None => Err(IdentityError::UserNotFound(username.to_string())),
        }
    }

    /// Signature for commits written on behalf of `username`.
    pub fn signature_for(&self, username: &str) -> Result<Signature<'static>, IdentityError> {
        self.identity_for(username)?.signature()
    }

    /// Reload the mapping file from disk.
    pub fn reload(&self) -> Result<(), IdentityError> {
        let Some(path) = &self.mapping_file_path else {
            debug!("no mapping file to reload");
            return Ok(());
        };

        let entries = load_users(path)?;
        let mut cache = self.cache.write().map_err(|_| IdentityError::LockPoisoned)?;
        *cache = entries;
        info!(path = %path.display(), count = cache.len(), "identity mapping reloaded");
        Ok(())
    }
}
