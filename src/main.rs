//! dispatchd binary: daemon loop plus one-shot and inspection commands.

use anyhow::Result;
use clap::{Parser, Subcommand};
use dispatchd::config::Config;
use dispatchd::credentials::Credentials;
use dispatchd::db::Database;
use dispatchd::engine::{CycleOutcome, Engine};
use dispatchd::scheduler::{Scheduler, SensorRegistry};
use dispatchd::types::NewTask;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "dispatchd", version, about = "Single-host task dispatch daemon")]
struct Cli {
    /// Config file path (defaults to the user data dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Database path override
    #[arg(long)]
    database: Option<PathBuf>,

    /// Logging destination: off, stdout, stderr, or a file path
    #[arg(long, default_value = "stderr")]
    log: String,

    /// Enable debug-level logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon: sensor ticks and dispatch cycles on their intervals
    Run,
    /// Run a single dispatch cycle and exit
    Cycle,
    /// Run a single sensor tick and exit
    Tick,
    /// Enqueue a task
    Enqueue {
        subject: String,
        /// Task body; defaults to the subject
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        priority: Option<i32>,
        /// Provenance key for de-duplication
        #[arg(long)]
        source: Option<String>,
        /// Skill names, comma-separated
        #[arg(long, value_delimiter = ',')]
        skills: Vec<String>,
    },
    /// Show queue depth and recent cycles
    Status,
}

fn init_logging(log: &str, verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    match log {
        "0" | "off" => {}
        "1" | "stdout" => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_writer(std::io::stdout)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        "2" | "stderr" => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        filename => {
            let file = OpenOptions::new().create(true).append(true).open(filename)?;
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_writer(file)
                .with_ansi(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log, cli.verbose)?;

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(db_path) = &cli.database {
        config.db_path = db_path.clone();
    }
    config.ensure_dirs()?;

    let db = Database::open(&config.db_path)?;
    let credentials = Credentials::new(&config.credentials_path);

    match cli.command {
        Command::Run => run_daemon(db, credentials, config).await,
        Command::Cycle => {
            let engine = Engine::new(db, config);
            let outcome = engine.run_cycle().await?;
            println!("{outcome:?}");
            Ok(())
        }
        Command::Tick => {
            let scheduler = Scheduler::new(build_registry(), db, credentials);
            let reports = scheduler.run_tick().await?;
            for report in reports {
                println!("{}", serde_json::to_string(&report)?);
            }
            Ok(())
        }
        Command::Enqueue {
            subject,
            description,
            priority,
            source,
            skills,
        } => {
            let mut task = NewTask::new(&subject).with_skills(skills);
            task.description = description.unwrap_or_else(|| subject.clone());
            task.priority = priority;
            task.source = source;
            let id = db.enqueue(task)?;
            println!("enqueued task {id}");
            Ok(())
        }
        Command::Status => run_status(&db),
    }
}

/// Sensors are registered here at startup. Domain sensors live outside this
/// crate against the `Sensor` trait; the default build ships an empty
/// registry.
fn build_registry() -> SensorRegistry {
    SensorRegistry::new()
}

async fn run_daemon(db: Database, credentials: Credentials, config: Config) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        db = %config.db_path.display(),
        "starting dispatchd"
    );

    let sensor_tick = Duration::from_secs(config.sensor_tick_secs);
    let dispatch_tick = Duration::from_secs(config.dispatch_tick_secs);

    let scheduler = Arc::new(Scheduler::new(
        build_registry(),
        db.clone(),
        credentials,
    ));
    let sensor_loop = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sensor_tick);
        loop {
            interval.tick().await;
            if let Err(e) = scheduler.run_tick().await {
                warn!(error = %e, "sensor tick failed");
            }
        }
    });

    let engine = Engine::new(db, config);
    let mut interval = tokio::time::interval(dispatch_tick);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match engine.run_cycle().await {
                    Ok(CycleOutcome::Idle) => {}
                    Ok(outcome) => info!(?outcome, "cycle finished"),
                    Err(e) => warn!(error = %e, "dispatch cycle failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                sensor_loop.abort();
                return Ok(());
            }
        }
    }
}

fn run_status(db: &Database) -> Result<()> {
    println!("Tasks:");
    let counts = db.count_by_status()?;
    if counts.is_empty() {
        println!("  (none)");
    }
    for (status, count) in counts {
        println!("  {status}: {count}");
    }

    println!("\nRecent cycles:");
    let cycles = db.list_recent_cycles(10)?;
    if cycles.is_empty() {
        println!("  (none)");
    }
    for cycle in cycles {
        let task = cycle
            .task_id
            .map(|id| format!("task {id}"))
            .unwrap_or_else(|| "-".to_string());
        let cost = cycle.cost_usd.unwrap_or(0.0);
        let summary = cycle.summary.as_deref().unwrap_or("(in flight)");
        println!("  #{} {} ${:.4} {}", cycle.id, task, cost, summary);
    }
    Ok(())
}
