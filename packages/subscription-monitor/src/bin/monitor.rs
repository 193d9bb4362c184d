//! Operator CLI for the subscription monitor.
//!
//! Human-readable output by default; `--json` prints machine-readable JSON on
//! stdout. Logs always go to stderr.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use subscription_monitor::{
    parse_subscription_list, ExtractionResult, HttpExtractor, Monitor, MonitorConfig,
    MonitorStats, NewSubscription, RunReport, ScrapeSession, SessionStatus, SqliteStore,
    Subscription, SubscriptionId,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type AppMonitor = Monitor<SqliteStore, HttpExtractor>;

#[derive(Parser)]
#[command(name = "monitor")]
#[command(about = "Scrape subscribed pages and record what changed")]
struct Cli {
    /// Print JSON instead of a human summary
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one session over every due subscription (Ctrl-C aborts)
    Run,

    /// Show the most recent session summary
    LastSession,

    /// List subscriptions over the consecutive-failure ceiling
    Flagged,

    /// Aggregate statistics
    Stats,

    /// List recent sessions, newest first
    Sessions {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Show the latest result for a subscription
    Latest { id: SubscriptionId },

    /// List all subscriptions
    List,

    /// Upsert subscriptions from a file of `url` or `label<TAB>url` lines
    Sync {
        /// Defaults to SUBSCRIPTIONS_FILE
        file: Option<PathBuf>,
    },

    /// Resume polling a subscription
    Enable { id: SubscriptionId },

    /// Stop polling a subscription
    Disable { id: SubscriptionId },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,subscription_monitor=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = MonitorConfig::from_env().context("Failed to load configuration")?;
    let store = SqliteStore::new(&config.database_url)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_url))?;
    let extractor =
        HttpExtractor::new(config.selectors.clone()).context("Failed to build extractor")?;
    let monitor = Monitor::new(store, extractor, config.scheduler.clone());

    let code = match cli.command {
        Commands::Run => run(&monitor, &config, cli.json).await?,
        Commands::LastSession => {
            let session = monitor.last_session().await?;
            if cli.json {
                print_json(&session)?;
            } else {
                match session {
                    Some(session) => print_session(&session),
                    None => println!("No sessions recorded yet"),
                }
            }
            0
        }
        Commands::Flagged => {
            let flagged = monitor.flagged().await?;
            if cli.json {
                print_json(&flagged)?;
            } else if flagged.is_empty() {
                println!("{}", "No flagged subscriptions".green());
            } else {
                println!(
                    "{}",
                    format!(
                        "{} subscription(s) over the failure ceiling ({})",
                        flagged.len(),
                        monitor.config().failure_ceiling
                    )
                    .yellow()
                    .bold()
                );
                print_subscriptions(&flagged);
            }
            0
        }
        Commands::Stats => {
            let stats = monitor.stats().await?;
            if cli.json {
                print_json(&stats)?;
            } else {
                print_stats(&stats);
            }
            0
        }
        Commands::Sessions { limit } => {
            let sessions = monitor.sessions(limit).await?;
            if cli.json {
                print_json(&sessions)?;
            } else {
                for session in &sessions {
                    print_session(session);
                }
            }
            0
        }
        Commands::Latest { id } => {
            let result = monitor.latest_result(id).await?;
            if cli.json {
                print_json(&result)?;
            } else {
                match result {
                    Some(result) => print_result(&result),
                    None => println!("No results for {}", id),
                }
            }
            0
        }
        Commands::List => {
            let subscriptions = monitor.subscriptions().await?;
            if cli.json {
                print_json(&subscriptions)?;
            } else {
                print_subscriptions(&subscriptions);
            }
            0
        }
        Commands::Sync { file } => {
            let Some(path) = file.or_else(|| config.subscriptions_file.clone()) else {
                bail!("No subscription file given and SUBSCRIPTIONS_FILE is not set");
            };
            let text = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let entries = parse_subscription_list(&text, config.default_interval_secs)?;
            let stored = monitor.sync_subscriptions(entries).await?;
            if cli.json {
                print_json(&stored)?;
            } else {
                println!("{}", format!("Synced {} subscription(s)", stored.len()).green());
            }
            0
        }
        Commands::Enable { id } => {
            monitor.set_enabled(id, true).await?;
            println!("Enabled {}", id);
            0
        }
        Commands::Disable { id } => {
            monitor.set_enabled(id, false).await?;
            println!("Disabled {}", id);
            0
        }
    };

    Ok(ExitCode::from(code))
}

async fn run(monitor: &AppMonitor, config: &MonitorConfig, json: bool) -> Result<u8> {
    if let Some(url) = &config.dashboard_url {
        monitor
            .upsert_subscription(NewSubscription::new(
                url.clone(),
                "dashboard",
                config.default_interval_secs,
            ))
            .await
            .context("Failed to register dashboard")?;
    }

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, letting in-flight items finish");
            signal_token.cancel();
        }
    });

    let mut progress = monitor.subscribe_progress();
    let watcher = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let snapshot = progress.borrow_and_update().clone();
            if snapshot.running {
                eprintln!(
                    "{}",
                    format!("[{}/{}] {}", snapshot.completed, snapshot.total, snapshot.message)
                        .dimmed()
                );
            }
        }
    });

    let report = monitor.run_once(&cancel).await;
    watcher.abort();
    let report = report.context("Run failed")?;

    if json {
        print_json(&report)?;
    } else {
        match &report {
            RunReport::NothingDue { enabled } => {
                println!(
                    "{}",
                    format!("Nothing due ({} enabled subscription(s))", enabled).yellow()
                );
            }
            RunReport::Finished { session, summary } => {
                print_session(session);
                if !summary.flagged.is_empty() {
                    println!(
                        "{}",
                        format!("{} subscription(s) flagged", summary.flagged.len()).yellow()
                    );
                }
            }
        }
    }

    Ok(u8::try_from(report.exit_code()).unwrap_or(1))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_session(session: &ScrapeSession) {
    let status = match session.status {
        SessionStatus::Completed => session.status.as_str().green().bold(),
        SessionStatus::Aborted => session.status.as_str().red().bold(),
        SessionStatus::Running => session.status.as_str().yellow().bold(),
    };
    let counts = session.counts;

    println!("Session {} [{}]", session.id, status);
    println!("  started:  {}", session.started_at.to_rfc3339());
    if let Some(ended_at) = session.ended_at {
        println!("  ended:    {}", ended_at.to_rfc3339());
    }
    println!(
        "  items:    {} planned, {} attempted, {} succeeded, {} failed, {} new",
        session.planned, counts.attempted, counts.succeeded, counts.failed, counts.new_content
    );
    if let Some(notes) = &session.notes {
        println!("  notes:    {}", notes.dimmed());
    }
}

fn print_subscriptions(subscriptions: &[Subscription]) {
    for subscription in subscriptions {
        let state = if subscription.enabled {
            "enabled".green()
        } else {
            "disabled".dimmed()
        };
        let last = subscription
            .last_attempted_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());

        println!(
            "{}  {} [{}]  {}  failures={} last={}",
            subscription.id,
            subscription.label.bold(),
            state,
            subscription.url,
            subscription.consecutive_failures,
            last
        );
    }
}

fn print_stats(stats: &MonitorStats) {
    println!("Subscriptions: {} ({} enabled)", stats.total_subscriptions, stats.enabled_subscriptions);
    println!("Results:       {} ({} with new content)", stats.total_results, stats.new_content_results);
    println!("Sessions:      {}", stats.total_sessions);
    match stats.last_visit_at {
        Some(at) => println!("Last visit:    {}", at.to_rfc3339()),
        None => println!("Last visit:    never"),
    }
}

fn print_result(result: &ExtractionResult) {
    let status = if result.is_success() {
        result.status.as_str().green()
    } else {
        result.status.as_str().red()
    };
    let novelty = if result.is_new { "new content" } else { "unchanged" };

    println!(
        "{} [{}] at {} after {} attempt(s)",
        result.subscription_id,
        status,
        result.visited_at.to_rfc3339(),
        result.attempts
    );
    if result.is_success() {
        println!("  {}", novelty.bold());
    }
    if let Some(error) = &result.error {
        println!("  error: {}", error.red());
    }
    if let Some(fields) = &result.fields {
        match serde_json::to_string_pretty(fields) {
            Ok(rendered) => println!("{}", rendered),
            Err(e) => println!("  (fields not printable: {})", e),
        }
    }
}
