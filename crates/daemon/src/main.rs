//! prforge daemon entry point.
//!
//! Loads configuration, opens the database and repository store, serves the
//! REST API and shuts down gracefully on SIGINT/SIGTERM.

mod signals;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use prforge_core::config::AppConfig;
use prforge_core::db::Database;
use prforge_core::Forge;
use prforge_web::WebServer;

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// prforge server daemon.
#[derive(Parser, Debug)]
#[command(
    name = "prforge-daemon",
    version,
    about = "Pull request divergence and head-branch update service"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Install the global subscriber. The returned guard flushes the file
/// writer and must live until exit.
fn init_tracing(config: &AppConfig, level: &str) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false);

    match &config.daemon.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "prforge.log");
            let (file, guard) = tracing_appender::non_blocking(appender);
            builder
                .with_writer(std::io::stdout.and(file))
                .init();
            Ok(Some(guard))
        }
        None => {
            builder.init();
            Ok(None)
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = AppConfig::load_and_resolve(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config.display()))?;

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.daemon.log_level.clone());
    let _log_guard = init_tracing(&config, &log_level)?;

    info!("========================================");
    info!("  prforge daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Config file     : {}", args.config.display());
    info!("Repository root : {}", config.repositories.root.display());
    info!("Web listen      : {}", config.web.listen);
    info!("Data dir        : {}", config.daemon.data_dir.display());
    info!("Update style    : {}", config.pulls.default_update_style);
    info!("Log level       : {}", log_level);
    info!("========================================");

    std::fs::create_dir_all(&config.daemon.data_dir).context("failed to create data directory")?;
    std::fs::create_dir_all(&config.repositories.root)
        .context("failed to create repository root")?;

    let db_path = config.daemon.database_path();
    let db = Database::new(&db_path).context("failed to open database")?;
    db.initialize()
        .context("failed to initialize database schema")?;
    info!("Database initialized at {}", db_path.display());

    if config.web.admin_token.is_none() {
        info!("no admin token configured; the service account has no API access");
    }

    let listen_addr = config.web.listen.clone();
    let forge = Forge::new(config, Arc::new(db)).context("failed to initialize services")?;
    let server = WebServer::new(forge);

    server
        .start(&listen_addr, signals::wait_for_shutdown())
        .await
        .context("web server failed")?;

    info!("prforge daemon stopped.");
    Ok(())
}
