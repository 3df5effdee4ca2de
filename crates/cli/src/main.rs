//! prforge command-line management tool.
//!
//! Operates directly on the configured database and repository root, acting
//! as the service account unless `--as` names another user. Provides
//! subcommands for repositories, collaborators, branch protection, API
//! tokens, pull requests and the audit log, plus config generation and
//! validation.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use tracing_subscriber::EnvFilter;

use prforge_core::config::AppConfig;
use prforge_core::db::Database;
use prforge_core::models::{
    AccessMode, NewPullRequest, PullRequestState, RepoRef, UpdateOutcome, UpdateStrategy,
};
use prforge_core::Forge;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// prforge command-line management tool.
#[derive(Parser, Debug)]
#[command(
    name = "prforge",
    version,
    about = "Manage repositories and pull requests on a prforge server"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(
        short,
        long,
        global = true,
        default_value = "/etc/prforge/config.toml"
    )]
    config: PathBuf,

    /// Act as this user instead of the service account.
    #[arg(long = "as", global = true, value_name = "USER")]
    as_user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./prforge.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,

    /// Manage repositories.
    Repo {
        #[command(subcommand)]
        action: RepoAction,
    },

    /// Inspect branches.
    Branch {
        #[command(subcommand)]
        action: BranchAction,
    },

    /// Manage repository collaborators.
    Collaborator {
        #[command(subcommand)]
        action: CollaboratorAction,
    },

    /// Protect a branch, or lift protection with `--remove`.
    Protect {
        /// Repository as owner/name.
        repo: RepoRef,
        branch: String,
        /// Writers may push new commits.
        #[arg(long)]
        allow_push: bool,
        /// Writers may rewrite history (needed for rebase updates).
        #[arg(long)]
        allow_force_push: bool,
        #[arg(long, conflicts_with_all = ["allow_push", "allow_force_push"])]
        remove: bool,
    },

    /// Manage API tokens.
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },

    /// Work with pull requests.
    Pr {
        #[command(subcommand)]
        action: PrAction,
    },

    /// Show recent audit log entries.
    Audit {
        /// Maximum number of entries to show.
        #[arg(short, long, default_value = "20")]
        limit: u32,
        /// Only show this action, e.g. pull.update.
        #[arg(long)]
        action: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum RepoAction {
    /// Create a repository.
    Create {
        /// owner/name
        repo: RepoRef,
        #[arg(long)]
        default_branch: Option<String>,
    },
    /// List repositories.
    List,
}

#[derive(Subcommand, Debug)]
enum BranchAction {
    /// List branches and their tips.
    List { repo: RepoRef },
}

#[derive(Subcommand, Debug)]
enum CollaboratorAction {
    /// Grant a user access (read, write or admin).
    Add {
        repo: RepoRef,
        username: String,
        #[arg(long, default_value = "write")]
        permission: String,
    },
    /// Revoke a user's access.
    Remove { repo: RepoRef, username: String },
    /// List collaborators.
    List { repo: RepoRef },
}

#[derive(Subcommand, Debug)]
enum TokenAction {
    /// Issue a token for a user. The secret is shown once.
    Issue {
        username: String,
        #[arg(long, default_value = "cli")]
        name: String,
    },
    /// List a user's tokens.
    List { username: String },
    /// Revoke a token by id.
    Revoke { id: i64 },
}

#[derive(Subcommand, Debug)]
enum PrAction {
    /// Open a pull request.
    Open {
        /// Base repository as owner/name.
        repo: RepoRef,
        /// Head branch.
        #[arg(long)]
        head: String,
        /// Base branch; the repository default when omitted.
        #[arg(long)]
        base: Option<String>,
        #[arg(long)]
        title: String,
        /// Repository holding the head branch, for fork pull requests.
        #[arg(long)]
        head_repo: Option<RepoRef>,
        /// Let base-repository writers update the head branch.
        #[arg(long)]
        allow_maintainer_edit: bool,
    },
    /// List pull requests.
    List {
        repo: RepoRef,
        /// open, closed, merged or all.
        #[arg(long, default_value = "open")]
        state: String,
    },
    /// Show how far head and base have diverged.
    Diverging { repo: RepoRef, index: i64 },
    /// Bring the head branch up to date with base.
    Update {
        repo: RepoRef,
        index: i64,
        /// merge or rebase; the configured default when omitted.
        #[arg(long)]
        style: Option<UpdateStrategy>,
    },
    /// Merge into the base branch.
    Merge { repo: RepoRef, index: i64 },
    /// Close without merging.
    Close { repo: RepoRef, index: i64 },
    /// Reopen a closed pull request.
    Reopen { repo: RepoRef, index: i64 },
    /// Show conflicts recorded by failed updates.
    Conflicts { repo: RepoRef, index: i64 },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    // Minimal logging for CLI
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("warn"))
        .with_target(false)
        .without_time()
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { output } => return cmd_init(&output),
        Commands::Validate => return cmd_validate(&cli.config),
        _ => {}
    }

    let config = AppConfig::load_and_resolve(&cli.config).context("failed to load configuration")?;
    let forge = open_forge(config)?;
    let actor = cli
        .as_user
        .unwrap_or_else(|| forge.service_account().to_string());

    match cli.command {
        Commands::Repo { action } => cmd_repo(&forge, action),
        Commands::Branch { action } => cmd_branch(&forge, action),
        Commands::Collaborator { action } => cmd_collaborator(&forge, &actor, action),
        Commands::Protect {
            repo,
            branch,
            allow_push,
            allow_force_push,
            remove,
        } => cmd_protect(&forge, &actor, &repo, &branch, allow_push, allow_force_push, remove),
        Commands::Token { action } => cmd_token(&forge, action),
        Commands::Pr { action } => cmd_pr(&forge, &actor, action),
        Commands::Audit { limit, action } => cmd_audit(&forge.db, limit, action.as_deref()),
        Commands::Init { .. } | Commands::Validate => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn open_forge(config: AppConfig) -> Result<Forge> {
    std::fs::create_dir_all(&config.daemon.data_dir).context("failed to create data directory")?;
    std::fs::create_dir_all(&config.repositories.root)
        .context("failed to create repository root")?;
    let db = Database::new(config.daemon.database_path()).context("failed to open database")?;
    db.initialize().context("failed to initialize database")?;
    Forge::new(config, Arc::new(db)).context("failed to initialize services")
}

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(header);
    table
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_init(output: &Path) -> Result<()> {
    let default_config = r#"# prforge configuration

[daemon]
log_level = "info"
data_dir = "/var/lib/prforge"
# log_dir = "/var/log/prforge"

[repositories]
root = "/var/lib/prforge/repositories"
default_branch = "main"

[web]
listen = "127.0.0.1:3000"
operation_timeout_secs = 30
admin_token_env = "PRFORGE_ADMIN_TOKEN"

[identity]
# mapping_file = "/etc/prforge/authors.toml"
email_domain = "example.com"
committer_name = "prforge"
committer_email = "noreply@example.com"

[pulls]
default_update_style = "merge"
allow_rebase_update = true
merge_message_template = "Merge branch '{base}' into {head}"
"#;

    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, default_config).context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Edit the repository root and committer identity");
    println!("  2. Set PRFORGE_ADMIN_TOKEN for service-account API access");
    println!("  3. Validate with: prforge validate --config {}", output.display());
    println!(
        "  4. Start the daemon: prforge-daemon --config {}",
        output.display()
    );

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    println!("  [OK] Environment variable references processed");

    match config.validate() {
        Ok(()) => println!("  [OK] All required fields are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    println!();
    println!("Configuration summary:");
    println!("  Repository root : {}", config.repositories.root.display());
    println!("  Default branch  : {}", config.repositories.default_branch);
    println!("  Web listen      : {}", config.web.listen);
    println!(
        "  Admin token     : {}",
        if config.web.admin_token.is_some() {
            "set"
        } else {
            "NOT SET"
        }
    );
    println!("  Update style    : {}", config.pulls.default_update_style);
    println!("  Rebase updates  : {}", config.pulls.allow_rebase_update);
    println!("  Data directory  : {}", config.daemon.data_dir.display());
    println!();
    println!("Configuration is valid.");

    Ok(())
}

fn cmd_repo(forge: &Forge, action: RepoAction) -> Result<()> {
    match action {
        RepoAction::Create {
            repo,
            default_branch,
        } => {
            let created = forge
                .repos
                .create(&repo, default_branch.as_deref())
                .with_context(|| format!("failed to create {}", repo))?;
            println!(
                "Created {}/{} (default branch {})",
                created.owner, created.name, created.default_branch
            );
            Ok(())
        }
        RepoAction::List => {
            let repos = forge.repos.list().context("failed to list repositories")?;
            if repos.is_empty() {
                println!("No repositories found.");
                return Ok(());
            }
            let mut table = new_table(vec!["Repository", "Default branch", "Created"]);
            for r in &repos {
                table.add_row(vec![
                    Cell::new(format!("{}/{}", r.owner, r.name)),
                    Cell::new(&r.default_branch),
                    Cell::new(&r.created_at),
                ]);
            }
            println!("{}", table);
            Ok(())
        }
    }
}

fn cmd_branch(forge: &Forge, action: BranchAction) -> Result<()> {
    match action {
        BranchAction::List { repo } => {
            let branches = forge
                .repos
                .list_branches(&repo)
                .with_context(|| format!("failed to list branches of {}", repo))?;
            if branches.is_empty() {
                println!("{} has no branches yet.", repo);
                return Ok(());
            }
            let mut table = new_table(vec!["Branch", "Tip"]);
            for b in &branches {
                table.add_row(vec![Cell::new(&b.name), Cell::new(&b.sha)]);
            }
            println!("{}", table);
            Ok(())
        }
    }
}

fn cmd_collaborator(forge: &Forge, actor: &str, action: CollaboratorAction) -> Result<()> {
    match action {
        CollaboratorAction::Add {
            repo,
            username,
            permission,
        } => {
            let mode = AccessMode::from_str_val(&permission);
            if mode == AccessMode::None {
                anyhow::bail!(
                    "invalid permission '{}': use read, write or admin",
                    permission
                );
            }
            forge
                .repos
                .set_collaborator(&repo, actor, &username, mode)
                .context("failed to add collaborator")?;
            println!("{} now has {} access to {}", username, mode, repo);
            Ok(())
        }
        CollaboratorAction::Remove { repo, username } => {
            forge
                .repos
                .set_collaborator(&repo, actor, &username, AccessMode::None)
                .context("failed to remove collaborator")?;
            println!("{} removed from {}", username, repo);
            Ok(())
        }
        CollaboratorAction::List { repo } => {
            let collaborators = forge
                .repos
                .list_collaborators(&repo)
                .context("failed to list collaborators")?;
            if collaborators.is_empty() {
                println!("{} has no collaborators.", repo);
                return Ok(());
            }
            let mut table = new_table(vec!["User", "Permission"]);
            for c in &collaborators {
                table.add_row(vec![Cell::new(&c.username), Cell::new(c.mode)]);
            }
            println!("{}", table);
            Ok(())
        }
    }
}

fn cmd_protect(
    forge: &Forge,
    actor: &str,
    repo: &RepoRef,
    branch: &str,
    allow_push: bool,
    allow_force_push: bool,
    remove: bool,
) -> Result<()> {
    if remove {
        let removed = forge
            .repos
            .unprotect_branch(repo, actor, branch)
            .context("failed to remove branch protection")?;
        if removed {
            println!("{}:{} is no longer protected", repo, branch);
        } else {
            println!("{}:{} was not protected", repo, branch);
        }
        return Ok(());
    }

    let rule = forge
        .repos
        .protect_branch(repo, actor, branch, allow_push, allow_force_push)
        .context("failed to protect branch")?;
    println!(
        "{}:{} protected (push: {}, force push: {})",
        repo, rule.branch, rule.allow_push, rule.allow_force_push
    );
    Ok(())
}

fn cmd_token(forge: &Forge, action: TokenAction) -> Result<()> {
    match action {
        TokenAction::Issue { username, name } => {
            let issued = forge
                .tokens
                .issue(&username, &name)
                .context("failed to issue token")?;
            println!("Token {} for {}:", issued.id, issued.username);
            println!();
            println!("  {}", issued.token);
            println!();
            println!("Store it now; it cannot be shown again.");
            Ok(())
        }
        TokenAction::List { username } => {
            let tokens = forge
                .tokens
                .list(&username)
                .context("failed to list tokens")?;
            if tokens.is_empty() {
                println!("{} has no tokens.", username);
                return Ok(());
            }
            let mut table = new_table(vec!["ID", "Name", "Created", "Last used"]);
            for t in &tokens {
                table.add_row(vec![
                    Cell::new(t.id),
                    Cell::new(&t.name),
                    Cell::new(&t.created_at),
                    Cell::new(t.last_used_at.as_deref().unwrap_or("never")),
                ]);
            }
            println!("{}", table);
            Ok(())
        }
        TokenAction::Revoke { id } => {
            if forge.tokens.revoke(id).context("failed to revoke token")? {
                println!("Token {} revoked", id);
                Ok(())
            } else {
                anyhow::bail!("token {} not found", id)
            }
        }
    }
}

fn cmd_pr(forge: &Forge, actor: &str, action: PrAction) -> Result<()> {
    match action {
        PrAction::Open {
            repo,
            head,
            base,
            title,
            head_repo,
            allow_maintainer_edit,
        } => {
            let base_branch = match base {
                Some(b) => b,
                None => forge.repos.get(&repo)?.default_branch,
            };
            let req = NewPullRequest {
                head: head_repo.unwrap_or_else(|| repo.clone()),
                base: repo,
                base_branch,
                head_branch: head,
                title,
                allow_maintainer_edit,
            };
            let pr = forge
                .pulls
                .create(actor, &req)
                .context("failed to open pull request")?;
            println!(
                "Opened #{} {}:{} -> {}:{}",
                pr.index, pr.head, pr.head_branch, pr.base, pr.base_branch
            );
            Ok(())
        }
        PrAction::List { repo, state } => {
            let filter = match state.as_str() {
                "all" => None,
                other => Some(PullRequestState::from_str_val(other)),
            };
            let pulls = forge
                .pulls
                .list(&repo, filter)
                .context("failed to list pull requests")?;
            if pulls.is_empty() {
                println!("No pull requests found.");
                return Ok(());
            }
            let mut table = new_table(vec!["#", "Title", "Head", "Base", "State", "Author"]);
            for pr in &pulls {
                let state_cell = match pr.state {
                    PullRequestState::Open => Cell::new("open").fg(Color::Green),
                    PullRequestState::Merged => Cell::new("merged").fg(Color::Magenta),
                    PullRequestState::Closed => Cell::new("closed").fg(Color::Red),
                };
                let head = if pr.is_cross_repo() {
                    format!("{}:{}", pr.head, pr.head_branch)
                } else {
                    pr.head_branch.clone()
                };
                table.add_row(vec![
                    Cell::new(format!("#{}", pr.index)),
                    Cell::new(&pr.title),
                    Cell::new(head),
                    Cell::new(&pr.base_branch),
                    state_cell,
                    Cell::new(&pr.poster),
                ]);
            }
            println!("{}", table);
            Ok(())
        }
        PrAction::Diverging { repo, index } => {
            let counts = forge
                .pulls
                .get_diverging(&repo, index, &forge.operation_context())
                .context("failed to count divergence")?;
            println!(
                "#{}: {} commit(s) ahead, {} commit(s) behind",
                index, counts.ahead, counts.behind
            );
            Ok(())
        }
        PrAction::Update { repo, index, style } => {
            let outcome = forge
                .pulls
                .update_pull_request(&repo, index, actor, style, &forge.operation_context())
                .context("failed to update pull request")?;
            match outcome {
                UpdateOutcome::AlreadyUpToDate { head } => {
                    println!("#{} is already up to date ({})", index, head)
                }
                UpdateOutcome::Updated {
                    strategy,
                    old_head,
                    new_head,
                    commits_created,
                } => println!(
                    "#{} updated by {}: {} -> {} ({} new commit(s))",
                    index, strategy, old_head, new_head, commits_created
                ),
            }
            Ok(())
        }
        PrAction::Merge { repo, index } => {
            let pr = forge
                .pulls
                .merge(&repo, index, actor, &forge.operation_context())
                .context("failed to merge pull request")?;
            println!(
                "#{} merged into {} as {}",
                index,
                pr.base_branch,
                pr.merged_commit.as_deref().unwrap_or("-")
            );
            Ok(())
        }
        PrAction::Close { repo, index } => {
            forge
                .pulls
                .close(&repo, index, actor)
                .context("failed to close pull request")?;
            println!("#{} closed", index);
            Ok(())
        }
        PrAction::Reopen { repo, index } => {
            forge
                .pulls
                .reopen(&repo, index, actor)
                .context("failed to reopen pull request")?;
            println!("#{} reopened", index);
            Ok(())
        }
        PrAction::Conflicts { repo, index } => {
            let conflicts = forge
                .pulls
                .conflicts(&repo, index)
                .context("failed to list conflicts")?;
            if conflicts.is_empty() {
                println!("No conflicts recorded for #{}.", index);
                return Ok(());
            }
            let mut table = new_table(vec!["File", "Strategy", "Commit", "Regions", "Recorded"]);
            for c in &conflicts {
                table.add_row(vec![
                    Cell::new(&c.file_path),
                    Cell::new(&c.strategy),
                    Cell::new(c.commit_sha.as_deref().map(short_sha).unwrap_or("-")),
                    Cell::new(c.region_count),
                    Cell::new(&c.created_at),
                ]);
            }
            println!("{}", table);
            Ok(())
        }
    }
}

fn cmd_audit(db: &Database, limit: u32, action: Option<&str>) -> Result<()> {
    let entries = match action {
        Some(action) => db.list_audit_log_by_action(action, limit),
        None => db.list_audit_log(limit),
    }
    .context("failed to list audit entries")?;

    if entries.is_empty() {
        println!("No audit log entries found.");
        return Ok(());
    }

    let mut table = new_table(vec!["Timestamp", "Action", "Actor", "Repository", "Details"]);
    for entry in &entries {
        let action = if entry.success {
            Cell::new(&entry.action)
        } else {
            Cell::new(&entry.action).fg(Color::Red)
        };
        table.add_row(vec![
            Cell::new(&entry.created_at),
            action,
            Cell::new(entry.actor.as_deref().unwrap_or("-")),
            Cell::new(entry.repo.as_deref().unwrap_or("-")),
            Cell::new(truncate(entry.details.as_deref().unwrap_or(""), 60)),
        ]);
    }
    println!("{}", table);
    println!("{} entries shown", entries.len());

    Ok(())
}

// ---------------------------------------------------------------------------
// Utilities
// ---------------------------------------------------------------------------

fn short_sha(sha: &str) -> &str {
    &sha[..sha.len().min(10)]
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghijkl", 8), "abcde...");
    }

    #[test]
    fn test_parse_update_command() {
        let cli = Cli::try_parse_from([
            "prforge", "--as", "alice", "pr", "update", "acme/widgets", "3", "--style", "rebase",
        ])
        .unwrap();
        assert_eq!(cli.as_user.as_deref(), Some("alice"));
        match cli.command {
            Commands::Pr {
                action: PrAction::Update { repo, index, style },
            } => {
                assert_eq!(repo, RepoRef::new("acme", "widgets"));
                assert_eq!(index, 3);
                assert_eq!(style, Some(UpdateStrategy::Rebase));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_bad_repo_and_style() {
        assert!(Cli::try_parse_from(["prforge", "pr", "diverging", "widgets", "1"]).is_err());
        assert!(Cli::try_parse_from([
            "prforge", "pr", "update", "acme/widgets", "1", "--style", "squash"
        ])
        .is_err());
    }

    #[test]
    fn test_init_writes_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prforge.toml");
        cmd_init(&path).unwrap();
        let config = AppConfig::load_from_file(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.pulls.default_update_style, UpdateStrategy::Merge);
        assert!(cmd_init(&path).is_err());
    }
}
