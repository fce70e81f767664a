//! labsync command-line management tool.
//!
//! Provides subcommands for generating and validating configuration,
//! provisioning group projects, running a one-shot poll, propagating
//! hotfixes, and inspecting group status, grading history and the audit log.

mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use tracing_subscriber::EnvFilter;

use labsync_core::config::AppConfig;
use labsync_core::db::Database;
use labsync_core::forge::NewHook;
use labsync_core::models::{CycleReport, HotfixOutcome, HotfixReport};
use labsync_core::provision::ProvisionedGroup;
use labsync_core::{
    CycleFilter, Forge, GitLabForge, HotfixOptions, HotfixPropagator, PollEngine, Provisioner,
    Registry, RosterFile,
};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// labsync command-line management tool.
#[derive(Parser, Debug)]
#[command(
    name = "labsync",
    version,
    about = "Manage lab submissions, grading and hotfixes"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value = "/etc/labsync/config.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./labsync.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,

    /// Register the webhook and protect submission tags on group projects.
    Provision {
        #[arg(long)]
        lab: String,

        /// Webhook URL (default: derived from web.public_url).
        #[arg(long)]
        hook_url: Option<String>,

        /// Only protect tags; register no webhook.
        #[arg(long, conflicts_with = "hook_url")]
        no_hook: bool,
    },

    /// Run one poll cycle now.
    Poll {
        /// Only poll this lab.
        #[arg(long)]
        lab: Option<String>,

        /// Only poll this group (requires --lab).
        #[arg(long, requires = "lab")]
        group: Option<String>,
    },

    /// Merge a hotfix branch of the primary project into group projects.
    Hotfix {
        #[arg(long)]
        lab: String,

        /// Hotfix branch on the primary project.
        #[arg(long)]
        branch: String,

        /// Problem branch the hotfix was forked from (default: the lab's first).
        #[arg(long)]
        problem: Option<String>,

        /// Group id glob patterns, comma separated (default: all active groups).
        #[arg(long, value_delimiter = ',')]
        groups: Vec<String>,

        /// Classify every group without pushing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the grading status of every group of a lab.
    Status {
        #[arg(long)]
        lab: String,
    },

    /// Show the submissions and grading history of one group.
    History {
        #[arg(long)]
        lab: String,

        #[arg(long)]
        group: String,
    },

    /// Manage the group roster.
    Roster {
        #[command(subcommand)]
        action: RosterAction,
    },

    /// Show recent audit log entries.
    Audit {
        /// Maximum number of entries to show.
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },
}

#[derive(Subcommand, Debug)]
enum RosterAction {
    /// Reload the roster file into the database.
    Sync {
        /// Only this lab (default: every enabled lab).
        #[arg(long)]
        lab: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_target(false)
        .without_time()
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", style::error(&format!("{:#}", e)));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    if let Commands::Init { ref output } = cli.command {
        return cmd_init(output);
    }
    if let Commands::Validate = cli.command {
        return cmd_validate(&cli.config);
    }

    let config = AppConfig::load_and_resolve(&cli.config)
        .context("failed to load configuration file")?;
    let db = open_database(&config)?;

    match cli.command {
        Commands::Provision {
            lab,
            hook_url,
            no_hook,
        } => {
            let hook_url = if no_hook {
                None
            } else {
                Some(hook_url.or_else(|| config.web.hook_url()).context(
                    "no webhook URL: pass --hook-url, set web.public_url, or use --no-hook",
                )?)
            };
            cmd_provision(&config, db, &lab, hook_url).await
        }
        Commands::Poll { lab, group } => cmd_poll(config, db, lab, group).await,
        Commands::Hotfix {
            lab,
            branch,
            problem,
            groups,
            dry_run,
        } => {
            let options = HotfixOptions {
                groups,
                problem_branch: problem,
                dry_run,
            };
            cmd_hotfix(&config, db, &lab, &branch, &options).await
        }
        Commands::Status { lab } => cmd_status(&config, &db, &lab),
        Commands::History { lab, group } => cmd_history(&config, &db, &lab, &group),
        Commands::Roster {
            action: RosterAction::Sync { lab },
        } => cmd_roster_sync(&config, db, lab.as_deref()).await,
        Commands::Audit { limit } => cmd_audit(&db, limit),
        Commands::Init { .. } | Commands::Validate => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn open_database(config: &AppConfig) -> Result<Arc<Database>> {
    std::fs::create_dir_all(&config.daemon.data_dir).context("failed to create data directory")?;
    let db = Database::new(config.daemon.database_path()).context("failed to open database")?;
    db.initialize().context("failed to initialize database")?;
    Ok(Arc::new(db))
}

fn registry(config: &AppConfig, db: Arc<Database>) -> Registry {
    Registry::new(config, db, Arc::new(RosterFile::new(config.roster.file.clone())))
}

fn table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(header);
    table
}

fn join_or_dash(items: &[String]) -> String {
    if items.is_empty() {
        "-".into()
    } else {
        items.join(", ")
    }
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

const DEFAULT_CONFIG: &str = r#"# labsync configuration

[daemon]
course = "cs101"
poll_interval_secs = 300
log_level = "info"
data_dir = "/var/lib/labsync"
lineage_warn_after_cycles = 3

[forge]
api_url = "https://gitlab.com/api/v4"
token_env = "LABSYNC_TOKEN"
webhook_secret_env = "LABSYNC_WEBHOOK_SECRET"
system_users = []
graders = []
# grader_group = "cs101/teachers"

[retry]
max_attempts = 4
initial_backoff_ms = 500
max_backoff_ms = 8000

[grading]
mode = "merge_request"
awaiting_label = "awaiting-grading"
in_progress_label = "grading"
complete_label = "complete"
incomplete_label = "incomplete"
# maximum_reserve_secs = 86400

[web]
listen = "127.0.0.1:4200"
# public_url = "https://labsync.example.edu"

[roster]
file = "/etc/labsync/roster.toml"

[[labs]]
id = "lab1"
name = "Lab 1"
primary_project = "cs101/lab1"
group_namespace = "cs101/groups"
problem_branches = ["problem"]
"#;

fn cmd_init(output: &Path) -> Result<()> {
    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, DEFAULT_CONFIG).context("failed to write config file")?;

    println!(
        "{}",
        style::success(&format!(
            "Default configuration written to {}",
            output.display()
        ))
    );
    println!();
    println!("Next steps:");
    println!("  1. Edit the config file with your course, forge and lab details");
    println!("  2. Set the referenced environment variables (LABSYNC_TOKEN, ...)");
    println!("  3. Validate with: labsync validate --config {}", output.display());
    println!("  4. Start the daemon: labsync-daemon --config {}", output.display());

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  {}", style::success("TOML structure is valid"));

    let _ = config.resolve_env_vars();
    println!("  {}", style::success("Environment variable references processed"));

    if let Err(e) = config.validate() {
        println!("  {}", style::error(&format!("Validation error: {}", e)));
        anyhow::bail!("configuration validation failed");
    }
    println!("  {}", style::success("All required fields are valid"));

    let set = |present: bool| if present { "set" } else { "NOT SET" };
    println!();
    println!("{}", style::header("Configuration summary:"));
    println!("  Course        : {}", config.daemon.course);
    println!("  Forge API     : {}", config.forge.api_url);
    println!("  Forge token   : {}", set(config.forge.token.is_some()));
    println!("  Webhook secret: {}", set(config.forge.webhook_secret.is_some()));
    println!("  Grading mode  : {:?}", config.grading.mode);
    println!("  Roster file   : {}", config.roster.file.display());
    println!("  Poll interval : {}s", config.daemon.poll_interval_secs);
    println!("  Data directory: {}", config.daemon.data_dir.display());
    for lab in &config.labs {
        println!(
            "  Lab {:<10}: {} [{}]{}",
            lab.id,
            lab.primary_project,
            lab.problem_branches.join(", "),
            if lab.enabled { "" } else { " (disabled)" }
        );
    }
    if config.forge.token.is_none() {
        println!();
        println!(
            "{}",
            style::warn(&format!("{} is not set; polling will fail", config.forge.token_env))
        );
    }
    println!();
    println!("Configuration is valid.");

    Ok(())
}

async fn cmd_poll(
    config: AppConfig,
    db: Arc<Database>,
    lab: Option<String>,
    group: Option<String>,
) -> Result<()> {
    let filter = match (lab, group) {
        (Some(lab), Some(group)) => CycleFilter::group(lab, group),
        (Some(lab), None) => CycleFilter::labs(vec![lab]),
        (None, _) => CycleFilter::all(),
    };

    let forge = GitLabForge::from_config(&config).context("failed to create forge client")?;
    let forge: Arc<dyn Forge> = Arc::new(forge);
    let roster = Arc::new(RosterFile::new(config.roster.file.clone()));
    let engine =
        PollEngine::new(config, db, forge, roster).context("failed to initialize poll engine")?;

    println!("Running poll cycle...");
    let report = engine
        .run_cycle(&filter, &AtomicBool::new(false))
        .await
        .context("poll cycle failed")?;
    print_cycle_report(&report);

    if report.failed_groups() > 0 {
        anyhow::bail!("{} group(s) could not be polled", report.failed_groups());
    }
    Ok(())
}

fn print_cycle_report(report: &CycleReport) {
    let mut t = table(vec![
        "Lab",
        "Group",
        "New tags",
        "Registered",
        "Status changes",
        "Held back",
        "Notes",
    ]);
    for g in &report.groups {
        let notes = match &g.error {
            Some(err) => Cell::new(err).fg(comfy_table::Color::Red),
            None if !g.warnings.is_empty() => {
                Cell::new(g.warnings.join("; ")).fg(comfy_table::Color::Yellow)
            }
            None if !g.deferred.is_empty() => Cell::new(format!("{} deferred", g.deferred.len())),
            None => Cell::new(""),
        };
        let changes: Vec<String> = g
            .status_changes
            .iter()
            .map(|(id, status)| format!("#{id} {status}"))
            .collect();
        t.add_row(vec![
            Cell::new(&g.lab_id),
            Cell::new(&g.group_id),
            Cell::new(join_or_dash(&g.new_submissions)),
            Cell::new(g.registered.len()),
            Cell::new(join_or_dash(&changes)),
            Cell::new(join_or_dash(&g.held_back)),
            notes,
        ]);
    }
    println!("{t}");
    println!();
    let summary = format!(
        "{} group(s), {} new submission(s), {} failed{}",
        report.groups.len(),
        report.new_submissions(),
        report.failed_groups(),
        if report.interrupted { ", interrupted" } else { "" }
    );
    if report.failed_groups() == 0 {
        println!("{}", style::success(&summary));
    } else {
        println!("{}", style::warn(&summary));
    }
}

async fn cmd_provision(
    config: &AppConfig,
    db: Arc<Database>,
    lab_id: &str,
    hook_url: Option<String>,
) -> Result<()> {
    let lab = config.lab(lab_id)?;
    let mut registry = registry(config, db);
    registry
        .sync_roster(lab)
        .await
        .context("failed to load roster")?;

    let hook = hook_url.map(|url| NewHook {
        url,
        secret: config.forge.webhook_secret.clone(),
    });
    if hook.as_ref().is_some_and(|h| h.secret.is_none()) {
        println!(
            "{}",
            style::warn("no webhook secret configured; the listener will reject deliveries")
        );
    }

    let forge = GitLabForge::from_config(config).context("failed to create forge client")?;
    let results = Provisioner::new(Arc::new(forge))
        .run(&registry, lab, hook.as_ref())
        .await
        .context("provisioning aborted")?;
    print_provision_results(lab_id, &results);

    let failed = results.iter().filter(|r| r.error.is_some()).count();
    if failed > 0 {
        anyhow::bail!("provisioning failed for {} group(s)", failed);
    }
    Ok(())
}

fn print_provision_results(lab_id: &str, results: &[ProvisionedGroup]) {
    println!("{}", style::header(&format!("Provisioned group projects of {lab_id}")));
    println!();

    let mut t = table(vec!["Group", "Project", "Webhook", "Protected tags", "Error"]);
    for r in results {
        let error = match &r.error {
            Some(e) => Cell::new(e).fg(comfy_table::Color::Red),
            None => Cell::new(""),
        };
        t.add_row(vec![
            Cell::new(&r.group_id),
            Cell::new(&r.project),
            Cell::new(format!("{:?}", r.hook).to_lowercase()),
            Cell::new(r.protected.as_deref().unwrap_or("-")),
            error,
        ]);
    }
    println!("{t}");
}

async fn cmd_hotfix(
    config: &AppConfig,
    db: Arc<Database>,
    lab_id: &str,
    branch: &str,
    options: &HotfixOptions,
) -> Result<()> {
    let lab = config.lab(lab_id)?;
    let mut registry = registry(config, Arc::clone(&db));
    registry
        .sync_roster(lab)
        .await
        .context("failed to load roster")?;

    let propagator = HotfixPropagator::new(db, config.retry.policy(), config.forge.token.clone());
    let report = propagator
        .run(&mut registry, lab, branch, options)
        .context("hotfix run aborted")?;
    print_hotfix_report(&report);

    let (_, _, _, failed) = report.counts();
    if failed > 0 {
        anyhow::bail!("hotfix failed for {} group(s)", failed);
    }
    Ok(())
}

fn print_hotfix_report(report: &HotfixReport) {
    println!(
        "{}",
        style::header(&format!(
            "Hotfix {} onto {} ({}){}",
            report.hotfix_branch,
            report.problem_branch,
            report.lab_id,
            if report.dry_run { " [dry run]" } else { "" }
        ))
    );
    println!();

    let mut t = table(vec!["Group", "Outcome", "Details"]);
    for attempt in &report.attempts {
        let details: String = match &attempt.outcome {
            HotfixOutcome::AppliedClean { commit } => commit.chars().take(12).collect(),
            HotfixOutcome::AlreadyApplied => String::new(),
            HotfixOutcome::Conflict { paths } => paths.join(", "),
            HotfixOutcome::Failed { error } => error.clone(),
        };
        t.add_row(vec![
            Cell::new(&attempt.group_id),
            style::outcome_cell(&attempt.outcome),
            Cell::new(details),
        ]);
    }
    println!("{t}");

    let (applied, already, conflicts, failed) = report.counts();
    println!();
    println!(
        "applied: {applied}, already applied: {already}, conflicts: {conflicts}, failed: {failed}"
    );
    if conflicts > 0 {
        println!(
            "{}",
            style::warn("groups with conflicts must merge the hotfix branch themselves")
        );
    }
}

fn cmd_status(config: &AppConfig, db: &Database, lab_id: &str) -> Result<()> {
    let lab = config.lab(lab_id)?;
    let rows = db
        .group_status_rows(&lab.id)
        .context("failed to read group status")?;

    println!();
    println!("{}", style::header(&format!("{} ({} groups)", lab.display_name(), rows.len())));
    if let Some(last) = db.get_state("last_poll_at").context("failed to read poll state")? {
        println!("{}", style::dim(&format!("last poll: {last}")));
    }
    println!();

    if rows.is_empty() {
        println!("No groups recorded yet. Run `labsync roster sync` or `labsync poll`.");
        return Ok(());
    }

    let mut t = table(vec!["Group", "Submissions", "Latest tag", "Status", "Grader", "Updated"]);
    for row in &rows {
        let group = if row.active {
            Cell::new(&row.group_id)
        } else {
            Cell::new(format!("{} (inactive)", row.group_id)).fg(comfy_table::Color::DarkGrey)
        };
        t.add_row(vec![
            group,
            Cell::new(row.submissions),
            Cell::new(row.latest_tag.as_deref().unwrap_or("-")),
            style::status_cell(row.status),
            Cell::new(row.grader.as_deref().unwrap_or("-")),
            Cell::new(
                row.updated_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".into()),
            ),
        ]);
    }
    println!("{t}");
    Ok(())
}

fn cmd_history(config: &AppConfig, db: &Database, lab_id: &str, group_id: &str) -> Result<()> {
    let lab = config.lab(lab_id)?;
    let submissions = db
        .list_submissions(&lab.id, group_id)
        .context("failed to list submissions")?;
    if submissions.is_empty() {
        println!("No submissions recorded for group '{group_id}' in {}.", lab.id);
        return Ok(());
    }

    println!();
    println!("{}", style::header(&format!("Submissions of {group_id} ({})", lab.id)));
    let mut t = table(vec!["#", "Tag", "Commit", "Problem", "Detected"]);
    for s in &submissions {
        t.add_row(vec![
            Cell::new(s.sequence),
            Cell::new(&s.tag),
            Cell::new(s.commit_hash.chars().take(12).collect::<String>()),
            Cell::new(&s.problem_branch),
            Cell::new(s.detected_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }
    println!("{t}");

    let requests = db
        .list_grading_requests(&lab.id, group_id)
        .context("failed to list grading requests")?;
    for request in &requests {
        let tag = submissions
            .iter()
            .find(|s| s.id == request.submission_id)
            .map(|s| s.tag.as_str())
            .unwrap_or("?");
        println!();
        println!(
            "{}",
            style::header(&format!("Grading request #{} for {tag}", request.id))
        );
        println!("{}", style::dim(&request.thread.web_url));
        for change in &request.history {
            println!(
                "  {}  {:<17} {}",
                change.at.format("%Y-%m-%d %H:%M:%S"),
                change.status.to_string(),
                change.actor.as_deref().unwrap_or("")
            );
        }
    }
    Ok(())
}

async fn cmd_roster_sync(config: &AppConfig, db: Arc<Database>, lab: Option<&str>) -> Result<()> {
    let only: Vec<String> = lab.map(|l| vec![l.to_string()]).unwrap_or_default();
    let labs = config.selected_labs(&only)?;
    let mut registry = registry(config, db);

    for lab in labs {
        let sync = registry
            .sync_roster(lab)
            .await
            .with_context(|| format!("failed to sync roster for {}", lab.id))?;
        println!(
            "{}",
            style::success(&format!(
                "{}: {} added, {} updated, {} deactivated",
                lab.id,
                sync.added.len(),
                sync.updated.len(),
                sync.deactivated
            ))
        );
        for group in &sync.added {
            println!("    + {group}");
        }
        for group in &sync.updated {
            println!("    ~ {group}");
        }
    }
    Ok(())
}

fn cmd_audit(db: &Database, limit: u32) -> Result<()> {
    let entries = db
        .list_audit_log(limit)
        .context("failed to list audit entries")?;

    if entries.is_empty() {
        println!("No audit log entries found.");
        return Ok(());
    }

    let mut t = table(vec!["Timestamp", "Action", "Result", "Details"]);
    for entry in &entries {
        let result = if entry.success {
            Cell::new("ok").fg(comfy_table::Color::Green)
        } else {
            Cell::new("failed").fg(comfy_table::Color::Red)
        };
        t.add_row(vec![
            Cell::new(&entry.created_at),
            Cell::new(&entry.action),
            result,
            Cell::new(entry.details.as_deref().unwrap_or("")),
        ]);
    }
    println!("{t}");
    println!("{} entries shown", entries.len());

    Ok(())
}
