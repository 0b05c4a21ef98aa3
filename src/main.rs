// Lectern Quota - Main Entry Point
//
// Command-line access to the quota guard:
// - check: admission decision for one action
// - consume: record one action (optionally enforcing the limit first)
// - stats: today's usage summary for a user
// - policy: the effective limits table
//
// Results are printed as JSON on stdout; logs go to stderr.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use lectern_quota::config::Config;
use lectern_quota::metrics;
use lectern_quota::quota::{
    ActionType, AppendOutcome, FileLedger, InMemoryUserDirectory, PolicyStrategy, QuotaGuard,
    RateLimitPayload, SystemClock, User,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Exit status when an action is over its limit
const EXIT_RATE_LIMITED: i32 = 2;

/// Lectern Quota: usage accounting and rate limiting
#[derive(Parser, Debug)]
#[command(name = "lectern-quota")]
#[command(author = "Lectern Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Usage accounting and rate limiting for metered learner actions", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (defaults to LECTERN_CONFIG or ./lectern-quota.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print Prometheus metrics to stderr when done
    #[arg(long)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Decide whether an action may proceed
    Check {
        /// User id
        #[arg(long)]
        user: String,

        /// explanation, chat_message or file_upload
        #[arg(long)]
        action: ActionType,

        /// Evaluate against the rolling-window table
        #[arg(long)]
        rolling: bool,

        /// Evaluate at this RFC 3339 instant instead of now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Record one performed action
    Consume {
        #[arg(long)]
        user: String,

        #[arg(long)]
        action: ActionType,

        /// Idempotency key; repeated keys are recorded once
        #[arg(long)]
        key: Option<String>,

        /// Check the limit first and record only when allowed
        #[arg(long)]
        enforce: bool,

        /// Use the rolling-window table with --enforce
        #[arg(long)]
        rolling: bool,

        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Show today's usage for a user
    Stats {
        #[arg(long)]
        user: String,

        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Print the effective policy table
    Policy,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    init_tracing(&config, args.verbose)?;
    if let Err(e) = metrics::init() {
        warn!("Failed to register metrics: {}", e);
    }

    debug!(storage = ?config.storage, "Configuration loaded");

    let exit_code = run(args.command, &config).await?;

    if args.print_metrics {
        eprintln!("{}", metrics::gather_metrics()?);
    }

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let filter = if verbose {
        Level::DEBUG
    } else {
        config.log_level()?
    };
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(filter)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(filter.into())
                .from_env_lossy(),
        );

    match config.logging.format.to_lowercase().as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
    Ok(())
}

async fn run(command: Commands, config: &Config) -> Result<i32> {
    if let Commands::Policy = command {
        println!("{}", serde_json::to_string_pretty(&config.guard.policy)?);
        return Ok(0);
    }

    let guard = build_guard(config)?;

    match command {
        Commands::Check {
            user,
            action,
            rolling,
            at,
        } => {
            let now = at.unwrap_or_else(|| guard.now());
            let decision = guard
                .check_at(&user, action, strategy(rolling), now)
                .await
                .context("Quota check failed")?;

            match RateLimitPayload::from_decision(&decision, now) {
                Some(payload) => {
                    println!("{}", serde_json::to_string_pretty(&payload)?);
                    Ok(EXIT_RATE_LIMITED)
                }
                None => {
                    println!("{}", serde_json::to_string_pretty(&decision)?);
                    Ok(0)
                }
            }
        }
        Commands::Consume {
            user,
            action,
            key,
            enforce,
            rolling,
            at,
        } => {
            let now = at.unwrap_or_else(|| guard.now());
            if enforce {
                let outcome = guard
                    .check_and_consume_at(&user, action, strategy(rolling), now, key.as_deref())
                    .await
                    .context("Quota admission failed")?;
                if let Some(payload) = RateLimitPayload::from_decision(&outcome.decision, now) {
                    println!("{}", serde_json::to_string_pretty(&payload)?);
                    return Ok(EXIT_RATE_LIMITED);
                }
                print_recorded(&user, action, outcome.recorded)?;
            } else {
                let recorded = guard
                    .consume_at(&user, action, now, key.as_deref())
                    .await
                    .context("Failed to record usage")?;
                print_recorded(&user, action, Some(recorded))?;
            }
            Ok(0)
        }
        Commands::Stats { user, at } => {
            let now = at.unwrap_or_else(|| guard.now());
            let summary = guard
                .stats_at(&user, now)
                .await
                .context("Failed to read usage stats")?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(0)
        }
        Commands::Policy => Ok(0),
    }
}

fn strategy(rolling: bool) -> PolicyStrategy {
    if rolling {
        PolicyStrategy::Rolling
    } else {
        PolicyStrategy::Tiered
    }
}

fn print_recorded(user: &str, action: ActionType, recorded: Option<AppendOutcome>) -> Result<()> {
    let recorded = match recorded {
        Some(AppendOutcome::Recorded) => "recorded",
        Some(AppendOutcome::Duplicate) => "duplicate",
        None => "skipped",
    };
    let body = json!({
        "userId": user,
        "action": action,
        "outcome": recorded,
    });
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

fn build_guard(config: &Config) -> Result<QuotaGuard> {
    let users = load_users(&config.storage.users_path)?;
    let ledger = FileLedger::open(&config.storage.ledger_path).with_context(|| {
        format!(
            "Failed to open usage ledger at {:?}",
            config.storage.ledger_path
        )
    })?;
    info!(path = ?ledger.path(), "Usage ledger opened");

    QuotaGuard::new(
        config.guard.clone(),
        Arc::new(users),
        Arc::new(ledger),
        Arc::new(SystemClock),
    )
    .context("Failed to initialize quota guard")
}

fn load_users(path: &Path) -> Result<InMemoryUserDirectory> {
    if !path.exists() {
        warn!("Users file not found at {:?}, every lookup will fail", path);
        return Ok(InMemoryUserDirectory::new());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read users file from {:?}", path))?;
    let users: Vec<User> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse users file from {:?}", path))?;

    debug!(count = users.len(), "Loaded user records");
    Ok(InMemoryUserDirectory::from_users(users))
}
