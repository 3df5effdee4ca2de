//! Metadata schema and its forward-only migrations.
//!
//! `PRAGMA user_version` records the last step applied. Each step runs in
//! its own transaction together with the version bump.

use rusqlite::Connection;
use tracing::debug;

use crate::errors::DatabaseError;

struct Migration {
    version: u32,
    label: &'static str,
    sql: &'static str,
}

static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        label: "repositories, pulls, tokens and audit",
        sql: r#"
        CREATE TABLE IF NOT EXISTS repositories (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            owner           TEXT NOT NULL,
            name            TEXT NOT NULL,
            default_branch  TEXT NOT NULL DEFAULT 'main',
            created_at      TEXT NOT NULL,
            UNIQUE (owner, name)
        );

        CREATE TABLE IF NOT EXISTS collaborators (
            repo_id     INTEGER NOT NULL REFERENCES repositories (id) ON DELETE CASCADE,
            username    TEXT NOT NULL,
            mode        TEXT NOT NULL CHECK (mode IN ('read', 'write', 'admin')),
            PRIMARY KEY (repo_id, username)
        );

        CREATE TABLE IF NOT EXISTS protected_branches (
            repo_id           INTEGER NOT NULL REFERENCES repositories (id) ON DELETE CASCADE,
            branch            TEXT NOT NULL,
            allow_push        INTEGER NOT NULL DEFAULT 0,
            allow_force_push  INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (repo_id, branch)
        );

        CREATE TABLE IF NOT EXISTS pull_requests (
            id                     INTEGER PRIMARY KEY AUTOINCREMENT,
            base_repo_id           INTEGER NOT NULL REFERENCES repositories (id) ON DELETE CASCADE,
            pr_index               INTEGER NOT NULL,
            base_branch            TEXT NOT NULL,
            head_repo_id           INTEGER NOT NULL REFERENCES repositories (id) ON DELETE CASCADE,
            head_branch            TEXT NOT NULL,
            title                  TEXT NOT NULL DEFAULT '',
            poster                 TEXT NOT NULL,
            state                  TEXT NOT NULL DEFAULT 'open'
                                   CHECK (state IN ('open', 'closed', 'merged')),
            allow_maintainer_edit  INTEGER NOT NULL DEFAULT 0,
            merged_commit          TEXT,
            merged_by              TEXT,
            created_at             TEXT NOT NULL,
            updated_at             TEXT NOT NULL,
            UNIQUE (base_repo_id, pr_index)
        );

        CREATE INDEX IF NOT EXISTS idx_pull_requests_state ON pull_requests (base_repo_id, state);

        CREATE TABLE IF NOT EXISTS access_tokens (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            username      TEXT NOT NULL,
            name          TEXT NOT NULL,
            token_hash    TEXT NOT NULL UNIQUE,
            created_at    TEXT NOT NULL,
            last_used_at  TEXT
        );

        CREATE TABLE IF NOT EXISTS audit_log (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            action      TEXT NOT NULL,
            actor       TEXT,
            repo        TEXT,
            details     TEXT,
            success     INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_log_created_at ON audit_log (created_at);
        CREATE INDEX IF NOT EXISTS idx_audit_log_action ON audit_log (action);
        "#,
    },
    Migration {
        version: 2,
        label: "conflict reports",
        sql: r#"
        CREATE TABLE IF NOT EXISTS conflicts (
            id              TEXT PRIMARY KEY,
            pull_id         INTEGER NOT NULL REFERENCES pull_requests (id) ON DELETE CASCADE,
            strategy        TEXT NOT NULL,
            commit_sha      TEXT,
            file_path       TEXT NOT NULL,
            base_content    TEXT,
            ours_content    TEXT,
            theirs_content  TEXT,
            merged_preview  TEXT,
            region_count    INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_conflicts_pull ON conflicts (pull_id);
        "#,
    },
];

/// Bring `conn` up to the newest schema. Returns how many steps ran.
pub fn run_migrations(conn: &Connection) -> Result<usize, DatabaseError> {
    let from: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > from).collect();

    for step in &pending {
        debug!(version = step.version, label = step.label, "migrating metadata schema");
        apply(conn, step).map_err(|e| DatabaseError::MigrationFailed {
            version: step.version,
            detail: e.to_string(),
        })?;
    }
    Ok(pending.len())
}

fn apply(conn: &Connection, step: &Migration) -> rusqlite::Result<()> {
    conn.execute_batch("BEGIN")?;
    let result = conn
        .execute_batch(step.sql)
        .and_then(|()| conn.pragma_update(None, "user_version", step.version));
    match result {
        Ok(()) => conn.execute_batch("COMMIT"),
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}
