use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use tapeconf::{ConfigSources, TapeConfig};
use tokio_util::sync::CancellationToken;

use tapedeck::capture::{validate_source, CaptureProcess, CaptureSettings};
use tapedeck::cron::{CronExpr, CronZone};
use tapedeck::processing::FfmpegProcessor;
use tapedeck::scheduler::NewTrigger;
use tapedeck::telemetry;
use tapedeck::transfer::{Destination, QueueSettings, SshTransferClient, TransferClient, TransferQueue};
use tapedeck::workflow::{LoggingSessionObserver, WorkflowContext};
use tapedeck::{
    Admission, JobScheduler, SchedulerSettings, SqliteStore, Store, StreamConfig, StreamId,
    TransferHandOff, TransferId, TriggerId, WorkflowCoordinator,
};

/// How often the daemon logs a status line.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);
/// How often failed transfers and old sessions past retention are purged.
const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Scheduled stream recorder
#[derive(Parser, Debug)]
#[command(name = "tapedeck", version, about, long_about = None)]
struct Cli {
    /// Config file to use instead of ./tapedeck.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the recording daemon
    Run,
    /// Manage source streams
    Stream {
        #[command(subcommand)]
        action: StreamCommand,
    },
    /// Manage schedule triggers
    Trigger {
        #[command(subcommand)]
        action: TriggerCommand,
    },
    /// Cron expression helpers
    Cron {
        #[command(subcommand)]
        action: CronCommand,
    },
    /// Inspect and manage the transfer queue
    Queue {
        #[command(subcommand)]
        action: QueueCommand,
    },
    /// Show recent recording sessions
    Sessions {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        /// Only sessions fired by this trigger
        #[arg(short, long)]
        trigger: Option<String>,
    },
    /// Connect and authenticate to a destination, then disconnect
    TestConnection { destination: String },
    /// Validate and probe a stream source without recording
    TestStream { url: String },
    /// Print the effective configuration and its sources
    Config,
}

#[derive(Subcommand, Debug)]
enum StreamCommand {
    Add {
        name: String,
        url: String,
        /// user@host[:port]:/path
        destination: String,
        #[arg(long)]
        artist: Option<String>,
        #[arg(long)]
        album: Option<String>,
        #[arg(long)]
        album_artist: Option<String>,
        #[arg(long)]
        artwork: Option<PathBuf>,
        /// Output filename pattern ({date}, {name}, {timestamp})
        #[arg(long)]
        pattern: Option<String>,
    },
    List,
    Remove { id: String },
}

#[derive(Subcommand, Debug)]
enum TriggerCommand {
    Add {
        stream_id: String,
        /// Five-field cron expression, e.g. "0 22 * * 1-5"
        cron: String,
        #[arg(long)]
        name: Option<String>,
        /// Recording length in minutes (defaults to recording.default_duration_minutes)
        #[arg(long)]
        duration: Option<u32>,
        #[arg(long, default_value_t = 0)]
        max_retries: u32,
        /// Create the trigger disabled
        #[arg(long)]
        inactive: bool,
    },
    List,
    Remove { id: String },
    Enable { id: String },
    Disable { id: String },
    /// Session outcomes per trigger (all triggers when no id is given)
    Stats {
        id: Option<String>,
        #[arg(long, default_value_t = 30)]
        days: u32,
    },
}

#[derive(Subcommand, Debug)]
enum CronCommand {
    /// Validate an expression and print its next fire times
    Check {
        expr: String,
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
    },
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
    Status,
    Pending {
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
    /// Re-queue a permanently failed transfer
    Retry { id: String },
    Remove { id: String },
    /// Drop failed transfers past retention
    Purge,
}

/// Everything the daemon wires together.
struct Engine {
    store: Arc<dyn Store>,
    queue: Arc<TransferQueue>,
    coordinator: Arc<WorkflowCoordinator>,
    scheduler: Arc<JobScheduler>,
}

impl Engine {
    fn open(config: &TapeConfig) -> Result<Self> {
        let db_path = config.infra.paths.database_path();
        let store: Arc<dyn Store> = Arc::new(
            SqliteStore::open(&db_path)
                .with_context(|| format!("Failed to open database {}", db_path.display()))?,
        );

        let client = Arc::new(SshTransferClient::from_config(config));
        let queue = Arc::new(TransferQueue::new(
            Arc::clone(&store),
            client,
            QueueSettings::from_config(config),
        ));

        let recording = &config.defaults.recording;
        let admission = Admission::new(recording.max_concurrent_sessions);
        let ctx = Arc::new(WorkflowContext {
            store: Arc::clone(&store),
            capture: CaptureProcess::new(CaptureSettings::from_config(config)),
            processor: Arc::new(FfmpegProcessor::new(config.infra.tools.ffmpeg.clone())),
            sink: Arc::new(TransferHandOff::new(Arc::clone(&store), Arc::clone(&queue))),
            observer: Arc::new(LoggingSessionObserver),
            recordings_dir: config.infra.paths.recordings_dir.clone(),
        });
        let coordinator = Arc::new(WorkflowCoordinator::new(
            ctx,
            admission.clone(),
            recording.stop_timeout(),
        ));
        let scheduler = Arc::new(JobScheduler::new(
            Arc::clone(&store),
            coordinator.clone(),
            admission,
            SchedulerSettings::from_config(config),
        ));

        Ok(Self {
            store,
            queue,
            coordinator,
            scheduler,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, sources) = TapeConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Command::Run => run_daemon(config).await,
        command => {
            telemetry::init_console(&config.infra.telemetry);
            run_command(command, &config, &sources).await
        }
    }
}

async fn run_command(command: Command, config: &TapeConfig, sources: &ConfigSources) -> Result<()> {
    match command {
        Command::Config => {
            if sources.files.is_empty() {
                println!("# sources: compiled defaults only");
            }
            for file in &sources.files {
                println!("# source: {}", file.display());
            }
            for var in &sources.env_overrides {
                println!("# env: {}", var);
            }
            println!("{}", config.to_toml());
        }
        Command::Cron {
            action: CronCommand::Check { expr, count },
        } => cron_check(&expr, count)?,
        Command::TestStream { url } => {
            let capture = CaptureProcess::new(CaptureSettings::from_config(config));
            let kind = capture.test_source(&url).await?;
            println!("ok: {} source reachable ({:?})", url, kind);
        }
        Command::TestConnection { destination } => {
            let dest = Destination::parse(&destination)?;
            SshTransferClient::from_config(config)
                .test_connection(&dest)
                .await?;
            println!("ok: connected to {}", dest);
        }
        command => {
            let engine = Engine::open(config)?;
            admin(&engine, config, command)?;
        }
    }
    Ok(())
}

async fn run_daemon(config: TapeConfig) -> Result<()> {
    let _telemetry = telemetry::init(&config.infra.telemetry)
        .context("Failed to initialize telemetry")?;

    std::fs::create_dir_all(&config.infra.paths.recordings_dir).with_context(|| {
        format!(
            "Failed to create recordings directory {}",
            config.infra.paths.recordings_dir.display()
        )
    })?;

    let engine = Engine::open(&config)?;
    engine.coordinator.recover_interrupted()?;
    engine.queue.rehydrate()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        database = %config.infra.paths.database_path().display(),
        recordings = %config.infra.paths.recordings_dir.display(),
        max_sessions = config.defaults.recording.max_concurrent_sessions,
        workers = config.defaults.transfer.workers,
        "tapedeck starting"
    );

    let shutdown = CancellationToken::new();
    let workers = engine
        .queue
        .spawn_workers(config.defaults.transfer.workers, &shutdown);
    let scheduler = tokio::spawn(Arc::clone(&engine.scheduler).run(shutdown.child_token()));
    let housekeeping = tokio::spawn(housekeeping(
        Arc::clone(&engine.store),
        Arc::clone(&engine.queue),
        Arc::clone(&engine.coordinator),
        session_retention(&config),
        shutdown.child_token(),
    ));

    wait_for_signal().await;
    tracing::info!("Shutdown requested");
    shutdown.cancel();

    // No new sessions may start once stop_all has taken its snapshot.
    if let Err(e) = scheduler.await {
        tracing::error!(error = %e, "Scheduler task failed");
    }
    let stuck = engine.coordinator.stop_all().await;
    if stuck > 0 {
        tracing::warn!(count = stuck, "Sessions still running at shutdown");
    }
    let _ = housekeeping.await;
    futures::future::join_all(workers).await;

    tracing::info!("tapedeck stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "Cannot listen for SIGTERM"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Cannot listen for Ctrl-C");
    }
}

fn session_retention(config: &TapeConfig) -> chrono::Duration {
    chrono::Duration::days(config.defaults.recording.session_retention_days as i64)
}

/// Periodic status line and purge of old failed transfers and sessions.
async fn housekeeping(
    store: Arc<dyn Store>,
    queue: Arc<TransferQueue>,
    coordinator: Arc<WorkflowCoordinator>,
    retention: chrono::Duration,
    cancel: CancellationToken,
) {
    let mut status = tokio::time::interval(STATUS_INTERVAL);
    let mut purge = tokio::time::interval(PURGE_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = status.tick() => {
                let active = coordinator.list_active_sessions();
                match queue.status() {
                    Ok(q) => tracing::info!(
                        active_sessions = active.len(),
                        queued = q.queued,
                        in_progress = q.in_progress,
                        failed = q.failed,
                        workers = q.workers_running,
                        "Status"
                    ),
                    Err(e) => tracing::warn!(error = %e, "Failed to read queue status"),
                }
            }
            _ = purge.tick() => {
                if let Err(e) = queue.purge() {
                    tracing::warn!(error = %e, "Failed to purge transfers");
                }
                match store.purge_sessions(Utc::now() - retention) {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(count = n, "Purged old sessions"),
                    Err(e) => tracing::warn!(error = %e, "Failed to purge sessions"),
                }
            }
        }
    }
}

fn cron_check(expr: &str, count: usize) -> Result<()> {
    let parsed = CronExpr::parse(expr)?;
    println!("valid: {}", parsed);
    let mut base = Utc::now();
    for _ in 0..count {
        let Some(next) = CronZone::Local.next_fire(&parsed, base) else {
            println!("(no further fire times)");
            break;
        };
        println!("  {}", next.with_timezone(&Local).format("%Y-%m-%d %H:%M %Z"));
        base = next;
    }
    Ok(())
}

fn admin(engine: &Engine, config: &TapeConfig, command: Command) -> Result<()> {
    match command {
        Command::Stream { action } => stream_command(engine, action)?,
        Command::Trigger { action } => trigger_command(engine, config, action)?,
        Command::Queue { action } => queue_command(engine, action)?,
        Command::Sessions { limit, trigger } => {
            let sessions = match trigger {
                Some(id) => engine
                    .store
                    .list_sessions_for_trigger(&TriggerId::from(id.as_str()), limit)?,
                None => engine.store.list_sessions(limit)?,
            };
            for s in sessions {
                println!(
                    "{}\t{}\tattempt {}\t{}\t{}",
                    s.id,
                    s.stage,
                    s.attempt,
                    s.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
                    s.failure_reason.as_deref().unwrap_or("")
                );
            }
        }
        other => bail!("unexpected command {:?}", other),
    }
    Ok(())
}

fn stream_command(engine: &Engine, action: StreamCommand) -> Result<()> {
    match action {
        StreamCommand::Add {
            name,
            url,
            destination,
            artist,
            album,
            album_artist,
            artwork,
            pattern,
        } => {
            validate_source(&url)?;
            Destination::parse(&destination)?;
            let mut stream = StreamConfig::new(name, url, destination);
            stream.artist = artist;
            stream.album = album;
            stream.album_artist = album_artist;
            stream.artwork_path = artwork;
            if let Some(pattern) = pattern {
                stream.filename_pattern = pattern;
            }
            engine.store.create_stream(&stream)?;
            println!("{}", stream.id);
        }
        StreamCommand::List => {
            for s in engine.store.list_streams()? {
                println!("{}\t{}\t{}\t{}", s.id, s.name, s.source_url, s.destination);
            }
        }
        StreamCommand::Remove { id } => {
            if !engine.store.delete_stream(&StreamId::from(id.as_str()))? {
                bail!("stream {} not found", id);
            }
        }
    }
    Ok(())
}

fn trigger_command(engine: &Engine, config: &TapeConfig, action: TriggerCommand) -> Result<()> {
    let scheduler = &engine.scheduler;
    match action {
        TriggerCommand::Add {
            stream_id,
            cron,
            name,
            duration,
            max_retries,
            inactive,
        } => {
            let trigger = scheduler.add_trigger(NewTrigger {
                stream_id: StreamId::from(stream_id.as_str()),
                name: name.unwrap_or_else(|| cron.clone()),
                cron,
                duration_minutes: duration
                    .unwrap_or(config.defaults.recording.default_duration_minutes),
                max_retries,
                active: !inactive,
            })?;
            println!("{}", trigger.id);
        }
        TriggerCommand::List => {
            for t in scheduler.list_triggers()? {
                let next = t
                    .next_fire
                    .map(|d| d.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}\t{}\t{}\t{}m\t{}\tnext {}",
                    t.id,
                    t.name,
                    t.cron,
                    t.duration_minutes,
                    if t.active { "active" } else { "inactive" },
                    next
                );
            }
        }
        TriggerCommand::Remove { id } => {
            if !scheduler.remove_trigger(&TriggerId::from(id.as_str()))? {
                bail!("trigger {} not found", id);
            }
        }
        TriggerCommand::Enable { id } => {
            scheduler.set_active(&TriggerId::from(id.as_str()), true)?;
        }
        TriggerCommand::Disable { id } => {
            scheduler.set_active(&TriggerId::from(id.as_str()), false)?;
        }
        TriggerCommand::Stats { id, days } => {
            let triggers = match id {
                Some(id) => {
                    let id = TriggerId::from(id.as_str());
                    match engine.store.get_trigger(&id)? {
                        Some(t) => vec![t],
                        None => bail!("trigger {} not found", id),
                    }
                }
                None => scheduler.list_triggers()?,
            };
            let since = Utc::now() - chrono::Duration::days(days as i64);
            println!("last {} days", days);
            for t in triggers {
                let stats = engine.store.trigger_stats(&t.id, since)?;
                let last = engine
                    .store
                    .list_sessions_for_trigger(&t.id, 1)?
                    .into_iter()
                    .next()
                    .map(|s| s.stage.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}\t{}\t{} sessions\t{} ok\t{} failed\t{} cancelled\t{:.1}%\t{}m recorded\t{:.1} MiB\tlast {}",
                    t.id,
                    t.name,
                    stats.total,
                    stats.completed,
                    stats.failed,
                    stats.cancelled,
                    stats.success_rate(),
                    stats.recorded_secs / 60,
                    stats.bytes_captured as f64 / (1024.0 * 1024.0),
                    last
                );
            }
        }
    }
    Ok(())
}

fn queue_command(engine: &Engine, action: QueueCommand) -> Result<()> {
    let queue = &engine.queue;
    match action {
        QueueCommand::Status => {
            let status = queue.status()?;
            println!(
                "queued {}  in progress {}  failed {}",
                status.queued, status.in_progress, status.failed
            );
        }
        QueueCommand::Pending { limit } => {
            for t in queue.list_pending(limit)? {
                println!(
                    "{}\t{}\tprio {}\t{}/{}\t{}\t{}\t{}",
                    t.id,
                    t.status,
                    t.priority,
                    t.attempts,
                    t.max_retries,
                    t.eligible_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
                    t.local_path.display(),
                    t.last_error.as_deref().unwrap_or("")
                );
            }
        }
        QueueCommand::Retry { id } => queue.retry(&TransferId::from(id.as_str()))?,
        QueueCommand::Remove { id } => {
            if !queue.remove(&TransferId::from(id.as_str()))? {
                bail!("transfer {} not found", id);
            }
        }
        QueueCommand::Purge => println!("purged {}", queue.purge()?),
    }
    Ok(())
}
