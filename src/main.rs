mod batch;
mod collect;
mod config;
mod db;
mod error;
mod formatting;
mod github;
mod http;
mod priority;
mod quota;
mod reconcile;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use batch::split_full_name;
use collect::{run_collection, RunOutcome, RunSummary};
use config::{CollectorConfig, Config};
use db::Database;
use formatting::{format_age, format_count, format_delta, format_repo_link, truncate_str};
use github::{GitHubApi, GitHubClient};

#[derive(Parser)]
#[command(name = "starwatch")]
#[command(about = "Track GitHub repository popularity over time")]
#[command(after_help = "\x1b[36mExamples:\x1b[0m
  starwatch add qdrant/qdrant     # Start tracking a repo
  starwatch load repos.txt        # Track every repo listed in a file
  starwatch collect --limit 500   # Snapshot up to 500 due repos
  starwatch serve --port 8080     # Expose POST /collect for a scheduler")]
struct Cli {
    /// Database file (default: platform data directory)
    #[arg(long, global = true, env = "STARWATCH_DB")]
    db: Option<PathBuf>,

    /// GitHub API root (GitHub Enterprise)
    #[arg(long, global = true, env = "GITHUB_API_URL")]
    api_url: Option<String>,

    /// Skip runs when fewer GraphQL points than this remain
    #[arg(long, global = true, env = "STARWATCH_MIN_BUDGET")]
    min_budget: Option<u32>,

    /// Repos per GraphQL request (max 100)
    #[arg(long, global = true, env = "STARWATCH_CHUNK_SIZE")]
    chunk_size: Option<usize>,

    /// Pause between GraphQL requests, in milliseconds
    #[arg(long, global = true, env = "STARWATCH_CHUNK_DELAY_MS")]
    chunk_delay_ms: Option<u64>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Snapshot every due repo once
    Collect {
        /// Maximum repos to look up this run
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Serve the HTTP trigger (POST /collect, GET /health)
    Serve {
        #[arg(short, long, default_value = "8080")]
        port: u16,

        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
    },

    /// Start tracking a repository by name (resolved on the next run)
    Add {
        /// Repository full name (e.g., "qdrant/qdrant")
        repo: String,
    },

    /// Load repo names from file (one per line, # comments)
    Load {
        file: PathBuf,
    },

    /// Show store statistics
    Stats,

    /// Show recorded snapshots for a repo, newest first
    History {
        repo: String,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Clear failure state so the repo is collected again
    Reset {
        repo: String,
    },

    /// Check GitHub GraphQL rate limit
    RateLimit,
}

fn init_tracing(verbose: bool, serving: bool) -> Result<()> {
    let level = if verbose {
        "debug"
    } else if serving {
        "info"
    } else {
        "warn"
    };

    let filter = tracing_subscriber::EnvFilter::try_from_env("STARWATCH_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, matches!(cli.command, Some(Commands::Serve { .. })))?;

    let Some(command) = cli.command else {
        use clap::CommandFactory;
        Cli::command().print_help()?;
        eprintln!();
        std::process::exit(0);
    };

    let db_path = Config::db_path(cli.db)?;
    let db = Database::open(&db_path)?;
    tracing::debug!("using database {}", db.path().display());

    let token = Config::github_token();
    let client = match cli.api_url.as_deref() {
        Some(url) => GitHubClient::with_base_url(token, url)?,
        None => GitHubClient::new(token)?,
    };
    let config = CollectorConfig::with_overrides(cli.min_budget, cli.chunk_size, cli.chunk_delay_ms);

    match command {
        Commands::Collect { limit } => collect_once(&client, &db, &config, limit).await,
        Commands::Serve { port, bind } => {
            if !client.is_authenticated() {
                eprintln!("\x1b[33m..\x1b[0m No GitHub token found; /collect will fail until one is set");
                eprintln!("  Set GITHUB_TOKEN or run: gh auth login");
            }
            let state = http::AppState {
                api: Arc::new(client),
                db: Arc::new(db),
                config: Arc::new(config),
            };
            http::start_server(state, &bind, port).await
        }
        Commands::Add { repo } => add_repo(&db, &repo),
        Commands::Load { file } => load_repo_stubs(&db, &file),
        Commands::Stats => show_stats(&db),
        Commands::History { repo, limit } => show_history(&db, &repo, limit),
        Commands::Reset { repo } => reset_repo(&db, &repo),
        Commands::RateLimit => check_rate_limit(&client).await,
    }
}

async fn collect_once(
    client: &GitHubClient,
    db: &Database,
    config: &CollectorConfig,
    limit: Option<usize>,
) -> Result<()> {
    let summary = run_collection(client, db, config, limit).await?;
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    match &summary.outcome {
        RunOutcome::LowBudget {
            remaining,
            floor,
            retry_after_secs,
        } => {
            eprintln!(
                "\x1b[33m..\x1b[0m Budget too low ({} remaining, floor {}); nothing fetched",
                remaining, floor
            );
            eprintln!("    Resets in {}m", retry_after_secs.div_ceil(60));
            return;
        }
        RunOutcome::NothingDue => {
            eprintln!(
                "\x1b[32mok\x1b[0m Nothing due ({} tracked repos due, limit {})",
                summary.due, summary.requested_limit
            );
            return;
        }
        RunOutcome::Completed => {}
    }

    eprintln!(
        "\x1b[32mok\x1b[0m Collected {} of {} due repos in {:.1}s",
        summary.selected,
        summary.due,
        summary.duration_ms as f64 / 1000.0
    );
    eprintln!("  \x1b[90mResolved:\x1b[0m        {} ({} newly resolved)", summary.resolved, summary.promoted);
    eprintln!("  \x1b[90mSnapshots:\x1b[0m       {}", summary.snapshots_written);
    if summary.not_found > 0 {
        eprintln!("  \x1b[90mNot found:\x1b[0m       {}", summary.not_found);
    }
    if summary.transient_failed > 0 {
        eprintln!("  \x1b[90mFailed (retry):\x1b[0m  {}", summary.transient_failed);
    }
    if summary.unreachable > 0 {
        eprintln!("  \x1b[90mGave up:\x1b[0m         {} (see `starwatch reset`)", summary.unreachable);
    }
    if summary.write_errors > 0 {
        eprintln!("  \x1b[31mWrite errors:\x1b[0m    {}", summary.write_errors);
    }
    eprintln!(
        "  \x1b[90mBudget:\x1b[0m          {} used, {} left{}",
        summary.budget_consumed,
        summary.budget_remaining,
        if summary.budget.degraded { " (estimated)" } else { "" }
    );
}

fn add_repo(db: &Database, full_name: &str) -> Result<()> {
    let full_name = full_name.trim();
    if split_full_name(full_name).is_none() {
        anyhow::bail!("expected owner/name, got {:?}", full_name);
    }

    let context = serde_json::json!({ "source": "cli" });
    if db.add_repo_stub(full_name, Some(&context))? {
        eprintln!("\x1b[32mok\x1b[0m Tracking {} (resolved on next collect)", format_repo_link(full_name));
    } else {
        eprintln!("\x1b[33m..\x1b[0m {} is already tracked", full_name);
    }
    Ok(())
}

/// Repo names from a list file: one per line, blank lines and `#` comments skipped
fn read_repo_list(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| {
            let valid = split_full_name(l).is_some();
            if !valid {
                tracing::warn!("skipping invalid repo name {:?}", l);
            }
            valid.then(|| l.to_string())
        })
        .collect())
}

fn load_repo_stubs(db: &Database, path: &Path) -> Result<()> {
    let all_repos = read_repo_list(path)?;

    let total = all_repos.len();
    eprintln!("\x1b[36m..\x1b[0m Loading {} repo names from {}", total, path.display());

    if total == 0 {
        eprintln!("\x1b[33m..\x1b[0m No repos to load");
        return Ok(());
    }

    let context = serde_json::json!({ "source": "file", "path": path.display().to_string() });

    // Batches keep each transaction short
    const BATCH_SIZE: usize = 10000;
    let mut total_inserted = 0;
    let mut total_skipped = 0;

    for (batch_idx, batch) in all_repos.chunks(BATCH_SIZE).enumerate() {
        let (inserted, skipped) = db.add_repo_stubs_bulk(batch, Some(&context))?;
        total_inserted += inserted;
        total_skipped += skipped;

        if (batch_idx + 1) % 10 == 0 {
            let processed = (batch_idx + 1) * BATCH_SIZE;
            eprintln!("  ... processed {}/{}", processed.min(total), total);
        }
    }

    eprintln!(
        "\x1b[32mok\x1b[0m Loaded {} new repos ({} already tracked)",
        total_inserted, total_skipped
    );
    eprintln!("    Run: starwatch collect");

    Ok(())
}

fn show_stats(db: &Database) -> Result<()> {
    let stats = db.stats()?;

    eprintln!("\x1b[36mStore Statistics\x1b[0m\n");
    eprintln!("  \x1b[90mTracked repos:\x1b[0m   {}", stats.tracked);
    eprintln!("  \x1b[90mResolved:\x1b[0m        {}", stats.tracked - stats.stubs);
    eprintln!("  \x1b[90mAwaiting lookup:\x1b[0m {}", stats.stubs);
    eprintln!("  \x1b[90mSnapshots:\x1b[0m       {}", format_count(stats.snapshots as u64));
    if stats.retrying > 0 {
        eprintln!("  \x1b[90mRetrying:\x1b[0m        {}", stats.retrying);
    }
    if stats.excluded > 0 {
        eprintln!("  \x1b[90mExcluded:\x1b[0m        {}", stats.excluded);
    }

    Ok(())
}

fn show_history(db: &Database, full_name: &str, limit: usize) -> Result<()> {
    let repo = db
        .get_repo(full_name)?
        .with_context(|| format!("{} is not tracked", full_name))?;

    let Some(github_id) = repo.github_id else {
        eprintln!("\x1b[33m..\x1b[0m {} has not been resolved yet", repo.full_name);
        return Ok(());
    };

    eprintln!(
        "{} \x1b[90m{}\x1b[0m",
        format_repo_link(&repo.full_name),
        repo.description
            .as_deref()
            .map(|d| truncate_str(d, 60))
            .unwrap_or_default()
    );
    let mut details = vec![format!("★ {}", format_count(repo.stars))];
    details.extend(repo.language.clone());
    details.extend(repo.license.clone());
    if !repo.topics.is_empty() {
        details.push(repo.topics.join(", "));
    }
    eprintln!("  \x1b[90m{}\x1b[0m", details.join(" · "));
    if let Some(reason) = &repo.failure_reason {
        eprintln!("  \x1b[33m{}:\x1b[0m {}", repo.status.as_str(), reason);
    }

    let snapshots = db.snapshots_for(github_id, limit)?;
    if snapshots.is_empty() {
        eprintln!("  no snapshots yet");
        return Ok(());
    }

    let now = chrono::Utc::now();
    for (i, snap) in snapshots.iter().enumerate() {
        let delta = snapshots
            .get(i + 1)
            .map(|older| format_delta(snap.stars, older.stars))
            .unwrap_or_default();
        println!(
            "  {:>10}  \x1b[33m★ {:>6}\x1b[0m {:>6}  forks {:>6}  issues {:>5}",
            format_age(snap.recorded_at, now),
            format_count(snap.stars),
            delta,
            format_count(snap.forks),
            snap.open_issues
        );
    }

    Ok(())
}

fn reset_repo(db: &Database, full_name: &str) -> Result<()> {
    if db.reset_failures(full_name)? {
        eprintln!("\x1b[32mok\x1b[0m {} will be collected on the next run", full_name);
    } else {
        eprintln!("\x1b[33m..\x1b[0m {} is not tracked", full_name);
    }
    Ok(())
}

async fn check_rate_limit(client: &GitHubClient) -> Result<()> {
    let rate = client.rate_limit().await?;

    let reset_time = chrono::DateTime::from_timestamp(rate.reset, 0)
        .map(|dt| dt.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "?".to_string());

    eprintln!("\x1b[36mGitHub GraphQL Rate Limit\x1b[0m\n");
    eprintln!("  \x1b[90mLimit:\x1b[0m     {}/hour", rate.limit);
    eprintln!("  \x1b[90mRemaining:\x1b[0m {}", rate.remaining);
    eprintln!("  \x1b[90mResets at:\x1b[0m {}", reset_time);

    Ok(())
}
