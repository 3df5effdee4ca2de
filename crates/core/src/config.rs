//! Daemon and CLI configuration, read from one TOML file.
//!
//! Secrets never appear in the file itself: `*_env` fields name the
//! environment variable that carries them.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::ConfigError;
use crate::models::UpdateStrategy;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon / process settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Where bare repositories live.
    #[serde(default)]
    pub repositories: RepositoriesConfig,

    /// HTTP API settings.
    #[serde(default)]
    pub web: WebConfig,

    /// Commit identity settings.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Pull request update behaviour.
    #[serde(default)]
    pub pulls: PullsConfig,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Daemon / process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for persistent data (database).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// If set, logs are also written to a daily rolling file in this directory.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/prforge")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
            log_dir: None,
        }
    }
}

impl DaemonConfig {
    /// Path of the SQLite database inside `data_dir`.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("prforge.db")
    }
}

// ---------------------------------------------------------------------------
// Repositories
// ---------------------------------------------------------------------------

/// Repository storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoriesConfig {
    /// Root directory; repositories are stored as `<root>/<owner>/<name>.git`.
    #[serde(default = "default_repo_root")]
    pub root: PathBuf,

    /// Branch created as default for new repositories.
    #[serde(default = "default_branch")]
    pub default_branch: String,
}

fn default_repo_root() -> PathBuf {
    PathBuf::from("/var/lib/prforge/repositories")
}
fn default_branch() -> String {
    "main".into()
}

impl Default for RepositoriesConfig {
    fn default() -> Self {
        Self {
            root: default_repo_root(),
            default_branch: default_branch(),
        }
    }
}

// ---------------------------------------------------------------------------
// Web API
// ---------------------------------------------------------------------------

/// HTTP API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Listen address (default `127.0.0.1:3000`).
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Upper bound for a single git-mutating request, in seconds.
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,

    /// Maximum accepted request body size in bytes.
    #[serde(default = "default_max_body")]
    pub max_body_bytes: usize,

    /// Environment variable holding a site-admin bearer token.
    #[serde(default)]
    pub admin_token_env: Option<String>,

    /// Resolved admin token.
    #[serde(skip)]
    pub admin_token: Option<String>,
}

fn default_listen() -> String {
    "127.0.0.1:3000".into()
}
fn default_operation_timeout() -> u64 {
    60
}
fn default_max_body() -> usize {
    8 * 1024 * 1024
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            operation_timeout_secs: default_operation_timeout(),
            max_body_bytes: default_max_body(),
            admin_token_env: None,
            admin_token: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Identity configuration for translating platform usernames to git
/// author/committer signatures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Path to the TOML identity mapping file.
    #[serde(default)]
    pub mapping_file: Option<PathBuf>,

    /// Email domain used when no mapping exists
    /// (e.g. `example.com` produces `jdoe@example.com`).
    #[serde(default)]
    pub email_domain: Option<String>,

    /// Name of the service account; the admin token acts as this user.
    #[serde(default = "default_committer_name")]
    pub committer_name: String,

    /// Email of the service account. Its domain also backs users that have
    /// no mapping when `email_domain` is unset.
    #[serde(default = "default_committer_email")]
    pub committer_email: String,
}

fn default_committer_name() -> String {
    "prforge".into()
}
fn default_committer_email() -> String {
    "noreply@prforge.local".into()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            mapping_file: None,
            email_domain: None,
            committer_name: default_committer_name(),
            committer_email: default_committer_email(),
        }
    }
}

// ---------------------------------------------------------------------------
// Pull requests
// ---------------------------------------------------------------------------

/// Pull request update behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullsConfig {
    /// Strategy used when the request does not name one.
    #[serde(default)]
    pub default_update_style: UpdateStrategy,

    /// Whether update-by-rebase is offered at all.
    #[serde(default = "default_true")]
    pub allow_rebase_update: bool,

    /// Message for update merge commits; `{base}` and `{head}` are substituted.
    #[serde(default = "default_merge_message")]
    pub merge_message_template: String,
}

fn default_true() -> bool {
    true
}
fn default_merge_message() -> String {
    "Merge branch '{base}' into {head}".into()
}

impl Default for PullsConfig {
    fn default() -> Self {
        Self {
            default_update_style: UpdateStrategy::default(),
            allow_rebase_update: true,
            merge_message_template: default_merge_message(),
        }
    }
}

impl PullsConfig {
    /// Render the update merge commit message for a branch pair.
    pub fn merge_message(&self, base: &str, head: &str) -> String {
        self.merge_message_template
            .replace("{base}", base)
            .replace("{head}", head)
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            repositories: RepositoriesConfig::default(),
            web: WebConfig::default(),
            identity: IdentityConfig::default(),
            pulls: PullsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Parse the TOML file at `path`. Secrets referenced through `*_env`
    /// fields stay unresolved.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::FileNotFound(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let config = toml::from_str(&text).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Fill in secrets from the environment. An admin token variable that is
    /// named but unset only disables the service account's API access.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        self.web.admin_token = self
            .web
            .admin_token_env
            .as_deref()
            .and_then(|var| read_secret(var, "web.admin_token_env"));
        Ok(())
    }

    /// Reject settings the services cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&str, bool, &str); 4] = [
            (
                "repositories.root",
                self.repositories.root.as_os_str().is_empty(),
                "repository root must not be empty",
            ),
            (
                "repositories.default_branch",
                self.repositories.default_branch.trim().is_empty(),
                "default branch must not be empty",
            ),
            (
                "web.operation_timeout_secs",
                self.web.operation_timeout_secs == 0,
                "operation timeout must be > 0",
            ),
            (
                "identity.committer_email",
                !self.identity.committer_email.contains('@'),
                "committer email must contain '@'",
            ),
        ];
        if let Some((field, _, detail)) = checks.iter().find(|(_, bad, _)| *bad) {
            return Err(ConfigError::InvalidValue {
                field: (*field).into(),
                detail: (*detail).into(),
            });
        }

        if !self.pulls.merge_message_template.contains("{base}") {
            warn!("pulls.merge_message_template does not mention {{base}}");
        }
        Ok(())
    }

    /// Load, resolve secrets and validate.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }
}

fn read_secret(var: &str, field: &str) -> Option<String> {
    match std::env::var(var) {
        Ok(value) if !value.is_empty() => Some(value),
        Ok(_) => {
            warn!(field, var, "secret variable is empty");
            None
        }
        Err(_) => {
            warn!(field, var, "secret variable is not set");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[daemon]
log_level = "debug"
data_dir = "/tmp/prforge"
log_dir = "/tmp/prforge/logs"

[repositories]
root = "/tmp/prforge/repos"
default_branch = "trunk"

[web]
listen = "0.0.0.0:8080"
operation_timeout_secs = 30
admin_token_env = "PRFORGE_ADMIN_TOKEN"

[identity]
mapping_file = "/etc/prforge/authors.toml"
email_domain = "example.com"
committer_name = "Forge Bot"
committer_email = "bot@example.com"

[pulls]
default_update_style = "rebase"
allow_rebase_update = false
merge_message_template = "Sync {base} -> {head}"
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: AppConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.repositories.default_branch, "trunk");
        assert_eq!(config.web.operation_timeout_secs, 30);
        assert_eq!(config.identity.committer_name, "Forge Bot");
        assert_eq!(config.pulls.default_update_style, UpdateStrategy::Rebase);
        assert!(!config.pulls.allow_rebase_update);
        assert_eq!(
            config.daemon.database_path(),
            PathBuf::from("/tmp/prforge/prforge.db")
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = AppConfig::load_from_file(&path).expect("load_from_file failed");
        assert_eq!(config.web.listen, "0.0.0.0:8080");
    }

    #[test]
    fn test_file_not_found() {
        let result = AppConfig::load_from_file("/nonexistent/config.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.web.operation_timeout_secs = 0;
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "web.operation_timeout_secs"
        ));
    }

    #[test]
    fn test_validate_rejects_bad_committer_email() {
        let mut config = AppConfig::default();
        config.identity.committer_email = "nobody".into();
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "identity.committer_email"
        ));
    }

    #[test]
    fn test_resolve_env_vars() {
        std::env::set_var("TEST_PRFORGE_ADMIN", "tok-123");

        let toml_str = r#"
[web]
admin_token_env = "TEST_PRFORGE_ADMIN"
"#;
        let mut config: AppConfig = toml::from_str(toml_str).unwrap();
        config.resolve_env_vars().unwrap();
        assert_eq!(config.web.admin_token.as_deref(), Some("tok-123"));

        std::env::remove_var("TEST_PRFORGE_ADMIN");
    }

    #[test]
    fn test_unset_admin_token_variable_leaves_token_empty() {
        let mut config: AppConfig = toml::from_str(
            r#"
[web]
admin_token_env = "TEST_PRFORGE_NEVER_SET"
"#,
        )
        .unwrap();
        config.resolve_env_vars().unwrap();
        assert!(config.web.admin_token.is_none());
    }

    #[test]
    fn test_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.repositories.default_branch, "main");
        assert_eq!(config.web.listen, "127.0.0.1:3000");
        assert_eq!(config.pulls.default_update_style, UpdateStrategy::Merge);
        assert!(config.pulls.allow_rebase_update);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_merge_message_template() {
        let pulls = PullsConfig::default();
        assert_eq!(
            pulls.merge_message("main", "feature/login"),
            "Merge branch 'main' into feature/login"
        );
    }
}
