// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Promptpost: cooldown-gated image publishing for Telegram
//!
//! Runs the publishing daemon and a handful of maintenance commands
//! over the same index database.

use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use promptpost::access::AccessGate;
use promptpost::bot::{poll_updates, Bot};
use promptpost::config::{AppConfig, ConfigHandle};
use promptpost::db::Database;
use promptpost::handoff::Archiver;
use promptpost::index::GroupIndex;
use promptpost::metadata::{GroupKeyExtractor, PngTextCodec};
use promptpost::scheduler::{Scheduler, SchedulerStatus};
use promptpost::store::ImageStore;
use promptpost::transport::telegram::TelegramClient;
use promptpost::watcher::run_watcher;
use promptpost::{CycleLock, PromptpostError, Result};

/// Promptpost CLI - publishes generated images to Telegram
#[derive(Parser, Debug)]
#[command(name = "promptpost")]
#[command(author = "Jonathan D. A. Jewell <hyperpolymath>")]
#[command(version = "1.0.0")]
#[command(about = "Cooldown-gated image publisher for Telegram channels", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (JSON format)
    #[arg(short, long, default_value = "config.json", global = true)]
    config: PathBuf,

    /// Enable verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable trace logging (most verbose)
    #[arg(long, global = true)]
    trace: bool,

    /// Suppress non-essential output (quiet mode)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the publisher daemon
    Run {
        /// Skip the Telegram token check on startup
        #[arg(long)]
        skip_health_check: bool,

        /// Don't watch the image directory for changes (poll only)
        #[arg(long)]
        no_watch: bool,
    },

    /// Reconcile the index with the image directory once
    Sync,

    /// Show candidates, cooldown and pending handoff
    Status,

    /// Publish a group now, ignoring the cooldown
    Publish {
        /// Image to publish with its group (default: oldest)
        file: Option<String>,
    },

    /// Show the group an image belongs to
    Group {
        file: String,
    },

    /// Inspect or drop the pending handoff
    Handoff {
        #[command(subcommand)]
        action: HandoffCommands,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum HandoffCommands {
    /// Show the batch awaiting archival
    Show,

    /// Forget the pending batch without archiving it
    Clear {
        /// Skip confirmation
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show effective configuration (file plus environment)
    Show,

    /// Generate default configuration file
    Generate {
        /// Output file path
        #[arg(short, long, default_value = "config.json")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,
}

/// Everything that works on the index, without a transport
struct Core {
    config: ConfigHandle,
    db: Database,
    index: GroupIndex,
}

impl Core {
    fn open(config_path: &Path) -> Result<Self> {
        let config = ConfigHandle::from_file(config_path)?;
        let app = config.snapshot();

        let store = ImageStore::new(app.image_dir(), &app.image_extension);
        store.ensure_dir()?;
        let db = Database::open(&app.database.path)?;
        info!("Database initialized: {}", app.database.path);

        let extractor = GroupKeyExtractor::new(Arc::new(PngTextCodec), &app.metadata);
        let index = GroupIndex::new(db.clone(), store, extractor);
        Ok(Self { config, db, index })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Some(Commands::Run { skip_health_check, no_watch }) => {
            run_daemon(&cli.config, skip_health_check, no_watch).await
        }
        Some(Commands::Sync) => run_sync(&cli.config),
        Some(Commands::Status) => run_status(&cli.config),
        Some(Commands::Publish { file }) => run_publish(&cli.config, file).await,
        Some(Commands::Group { file }) => run_group(&cli.config, &file),
        Some(Commands::Handoff { action }) => run_handoff_command(&cli.config, action),
        Some(Commands::Config { action }) => run_config_command(&cli.config, action),
        None => run_daemon(&cli.config, false, false).await,
    }
}

/// Run the daemon: scheduler loop, update poller and directory watcher
async fn run_daemon(config_path: &Path, skip_health_check: bool, no_watch: bool) -> Result<()> {
    info!("Promptpost v1.0.0");
    let core = Core::open(config_path)?;
    let app = core.config.snapshot();

    if app.telegram.channel.is_empty() {
        return Err(PromptpostError::Config("Telegram channel is not set".to_string()));
    }
    if app.access.user_whitelist.is_empty() {
        warn!("User whitelist is empty; commands are disabled");
    }

    let client = Arc::new(TelegramClient::new(&app.telegram)?);
    if !skip_health_check {
        let me = client.health_check().await?;
        info!("Logged in as @{}", me.username.as_deref().unwrap_or("?"));
    } else {
        warn!("Skipping Telegram health check");
    }

    let report = core.index.reconcile()?;
    info!(
        "Index ready: {} added, {} removed, {} unreadable",
        report.added.len(),
        report.removed.len(),
        report.failed.len()
    );

    let lock = CycleLock::default();
    let scheduler = Arc::new(Scheduler::new(
        core.config.clone(),
        core.db.clone(),
        core.index.clone(),
        client.clone(),
        lock.clone(),
    ));
    let archiver = Arc::new(Archiver::new(
        core.config.clone(),
        core.db.clone(),
        core.index.clone(),
        client.clone(),
        lock,
    ));
    let bot = Arc::new(Bot::new(
        core.config.clone(),
        AccessGate::new(&app.access),
        scheduler.clone(),
        archiver,
        client.clone(),
    ));

    // Setup graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = terminate => info!("Received SIGTERM, shutting down..."),
        }

        let _ = shutdown_tx.send(true);
    });

    let poller = tokio::spawn(poll_updates(client, bot, shutdown_rx.clone()));

    let watcher = if no_watch {
        None
    } else {
        let store = core.index.store().clone();
        let scheduler = scheduler.clone();
        let shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = run_watcher(store, scheduler, shutdown).await {
                warn!("Directory watcher unavailable, polling only: {}", e);
            }
        }))
    };

    info!(
        "Publishing to {} every {} min (poll {}s). Press Ctrl+C to stop.",
        app.telegram.channel, app.schedule.cooldown_minutes, app.schedule.poll_interval_secs
    );
    scheduler.run(shutdown_rx).await;

    let _ = poller.await;
    if let Some(watcher) = watcher {
        let _ = watcher.await;
    }

    info!("Promptpost stopped.");
    Ok(())
}

/// Reconcile once and print what changed
fn run_sync(config_path: &Path) -> Result<()> {
    let core = Core::open(config_path)?;
    let report = core.index.reconcile()?;

    println!("Added: {}", report.added.len());
    for name in &report.added {
        println!("  + {}", name);
    }
    println!("Removed: {}", report.removed.len());
    for name in &report.removed {
        println!("  - {}", name);
    }
    if !report.failed.is_empty() {
        println!("Unreadable (retried next pass): {}", report.failed.len());
        for name in &report.failed {
            println!("  ! {}", name);
        }
    }
    Ok(())
}

fn run_status(config_path: &Path) -> Result<()> {
    let core = Core::open(config_path)?;
    let status = SchedulerStatus::collect(&core.config.snapshot(), &core.db, &core.index, Utc::now())?;
    let stats = core.db.get_stats()?;

    println!("Promptpost v1.0.0 Status");
    println!("========================");
    println!("{}", status.summary());
    println!("Groups indexed: {}", stats.group_count);
    Ok(())
}

/// One-shot publish through the same path as `/instant`
async fn run_publish(config_path: &Path, file: Option<String>) -> Result<()> {
    let core = Core::open(config_path)?;
    let app = core.config.snapshot();
    let client = Arc::new(TelegramClient::new(&app.telegram)?);

    let scheduler = Scheduler::new(core.config, core.db, core.index, client, CycleLock::default());
    match scheduler.publish_now(file.as_deref()).await {
        Ok(sent) => {
            println!("Sent {} image(s): {}", sent.len(), sent.join(", "));
            println!("Archival happens when the running daemon sees the channel post.");
            Ok(())
        }
        Err(PromptpostError::FileNotCandidate(_)) => {
            println!("No image available.");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn run_group(config_path: &Path, file: &str) -> Result<()> {
    let core = Core::open(config_path)?;
    let group = core.index.group_of(file)?;
    let key = core.db.group_key_of(file)?.unwrap_or_default();

    println!("Group key: {}", key);
    for name in group {
        println!("  {}", name);
    }
    Ok(())
}

fn run_handoff_command(config_path: &Path, action: HandoffCommands) -> Result<()> {
    let core = Core::open(config_path)?;

    match action {
        HandoffCommands::Show => match core.db.load_handoff()? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => println!("No batch awaiting archival"),
        },
        HandoffCommands::Clear { force } => {
            if !force {
                eprintln!("Use --force to confirm dropping the pending batch");
                return Ok(());
            }
            if core.db.clear_handoff()? {
                println!("Pending batch dropped; its files stay in the image directory");
            } else {
                println!("No batch awaiting archival");
            }
        }
    }
    Ok(())
}

fn run_config_command(config_path: &Path, action: ConfigCommands) -> Result<()> {
    match action {
        ConfigCommands::Show => {
            let mut config = AppConfig::load_with_env(config_path)?;
            if !config.telegram.token.is_empty() {
                config.telegram.token = "<redacted>".to_string();
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigCommands::Generate { output } => {
            AppConfig::default().save(&output)?;
            println!("Generated config at {:?}", output);
        }
        ConfigCommands::Validate => {
            let config = AppConfig::load_with_env(config_path)?;
            config.validate()?;
            println!("Configuration at {:?} is valid", config_path);
            println!("  Image dir: {}", config.image_dir);
            println!("  Archive dir: {}", config.archive_dir);
            println!("  Database: {}", config.database.path);
            println!("  Channel: {}", config.telegram.channel);
            println!("  Cooldown: {} min", config.schedule.cooldown_minutes);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["promptpost"]).unwrap();
        assert!(!cli.verbose);
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from("config.json"));
    }

    #[test]
    fn test_cli_run_command() {
        let cli = Cli::try_parse_from([
            "promptpost", "run", "--no-watch", "-c", "/etc/promptpost.json"
        ]).unwrap();

        match cli.command {
            Some(Commands::Run { no_watch, skip_health_check }) => {
                assert!(no_watch);
                assert!(!skip_health_check);
            }
            _ => panic!("Expected Run command"),
        }
        assert_eq!(cli.config, PathBuf::from("/etc/promptpost.json"));
    }

    #[test]
    fn test_cli_publish_command() {
        let cli = Cli::try_parse_from(["promptpost", "publish", "0042.png"]).unwrap();
        match cli.command {
            Some(Commands::Publish { file }) => assert_eq!(file.as_deref(), Some("0042.png")),
            _ => panic!("Expected Publish command"),
        }

        let cli = Cli::try_parse_from(["promptpost", "publish"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Publish { file: None })));
    }

    #[test]
    fn test_cli_handoff_clear() {
        let cli = Cli::try_parse_from(["promptpost", "handoff", "clear", "--force"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Handoff { action: HandoffCommands::Clear { force: true } })
        ));
    }
}
