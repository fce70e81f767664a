//! labsync daemon entry point.
//!
//! Loads configuration, checks forge access, starts the webhook listener
//! and the poll scheduler, and handles graceful shutdown.

mod scheduler;
mod signals;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use labsync_core::config::AppConfig;
use labsync_core::db::Database;
use labsync_core::{Forge, GitLabForge, PollEngine, RosterFile};
use labsync_web::{PollTrigger, WebServer};

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// labsync polling daemon.
#[derive(Parser, Debug)]
#[command(
    name = "labsync-daemon",
    version,
    about = "Watches lab group projects for submissions and tracks their grading"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the course identifier from the config file.
    #[arg(long)]
    course: Option<String>,

    /// Override the port of the webhook listener.
    #[arg(long)]
    port: Option<u16>,

    /// Only poll these labs (comma separated).
    #[arg(long, value_delimiter = ',')]
    labs: Vec<String>,

    /// Override the poll interval in seconds.
    #[arg(long)]
    sync_period: Option<u64>,

    /// Increase verbosity (-v debug, -vv trace).
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn log_level<'a>(&'a self, config: &'a AppConfig) -> &'a str {
        match (self.log_level.as_deref(), self.verbose) {
            (Some(level), _) => level,
            (None, 0) => &config.daemon.log_level,
            (None, 1) => "debug",
            (None, _) => "trace",
        }
    }

    fn apply_overrides(&self, config: &mut AppConfig) -> Result<()> {
        if let Some(ref course) = self.course {
            config.daemon.course = course.clone();
        }
        if let Some(secs) = self.sync_period {
            config.daemon.poll_interval_secs = secs;
        }
        if let Some(port) = self.port {
            let mut addr: SocketAddr = config
                .web
                .listen
                .parse()
                .with_context(|| format!("invalid listen address '{}'", config.web.listen))?;
            addr.set_port(port);
            config.web.listen = addr.to_string();
        }
        config
            .validate()
            .context("configuration validation failed after command-line overrides")?;
        config
            .selected_labs(&self.labs)
            .context("invalid --labs selection")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config =
        AppConfig::load_and_resolve(&args.config).context("failed to load configuration file")?;
    args.apply_overrides(&mut config)?;

    // Initialize tracing
    let log_level = args.log_level(&config);
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .init();

    // Startup banner
    let labs: Vec<&str> = config
        .selected_labs(&args.labs)?
        .iter()
        .map(|l| l.id.as_str())
        .collect();
    info!("========================================");
    info!("  labsync daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Config file   : {}", args.config.display());
    info!("Course        : {}", config.daemon.course);
    info!("Forge API     : {}", config.forge.api_url);
    info!("Labs          : {}", labs.join(", "));
    info!("Grading mode  : {:?}", config.grading.mode);
    info!("Poll interval : {}s", config.daemon.poll_interval_secs);
    info!("Web listen    : {}", config.web.listen);
    info!("Data dir      : {}", config.daemon.data_dir.display());
    info!("Log level     : {}", log_level);
    info!("========================================");

    std::fs::create_dir_all(&config.daemon.data_dir).context("failed to create data directory")?;

    // Initialize database
    let db_path = config.daemon.database_path();
    let db = Database::new(&db_path).context("failed to open database")?;
    db.initialize()
        .context("failed to initialize database schema")?;
    let db = Arc::new(db);
    info!("Database initialized at {}", db_path.display());

    // Verify forge access before anything else touches it
    let forge = GitLabForge::from_config(&config).context("failed to create forge client")?;
    let bot = forge
        .current_user()
        .await
        .context("forge is not reachable with the configured token")?;
    info!(username = %bot.username, "authenticated against forge");
    let forge: Arc<dyn Forge> = Arc::new(forge);

    let roster = Arc::new(RosterFile::new(config.roster.file.clone()));
    let engine = Arc::new(
        PollEngine::new(config.clone(), Arc::clone(&db), forge, roster)
            .context("failed to initialize poll engine")?,
    );
    info!("Poll engine initialized");

    // Webhook -> scheduler trigger channel
    let (trigger_tx, trigger_rx) = tokio::sync::mpsc::channel::<PollTrigger>(16);

    let web_server = WebServer::new(config.clone(), Arc::clone(&db), trigger_tx);
    let listen_addr = config.web.listen.clone();
    let web_handle = tokio::spawn(async move {
        if let Err(e) = web_server.start(&listen_addr).await {
            error!("Web server error: {}", e);
        }
    });

    // The stop flag is checked by the engine between groups; the notify
    // wakes an idle scheduler.
    let stop = Arc::new(AtomicBool::new(false));
    let shutdown = Arc::new(tokio::sync::Notify::new());
    let scheduler_shutdown = Arc::clone(&shutdown);

    let poll_interval = Duration::from_secs(config.daemon.poll_interval_secs);
    let mut sched = scheduler::Scheduler::new(
        engine,
        poll_interval,
        args.labs.clone(),
        trigger_rx,
        Arc::clone(&stop),
    );
    let stats = sched.stats();

    let scheduler_handle = tokio::spawn(async move {
        sched.run(scheduler_shutdown).await;
    });

    signals::wait_for_shutdown().await;

    info!("Shutdown signal received, stopping...");
    stop.store(true, Ordering::SeqCst);
    shutdown.notify_waiters();

    // The current group always finishes; give it time to do so.
    match tokio::time::timeout(Duration::from_secs(60), scheduler_handle).await {
        Ok(Ok(())) => info!("scheduler stopped gracefully"),
        Ok(Err(e)) => warn!("scheduler task error: {}", e),
        Err(_) => warn!("scheduler did not stop within 60s, forcing shutdown"),
    }

    web_handle.abort();

    info!(
        cycles = stats.total_cycles.load(Ordering::SeqCst),
        submissions = stats.total_submissions.load(Ordering::SeqCst),
        errors = stats.total_errors.load(Ordering::SeqCst),
        "labsync daemon stopped"
    );
    Ok(())
}
