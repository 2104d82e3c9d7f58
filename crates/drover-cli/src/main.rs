//! Drover CLI - task orchestration against a simulated worker fleet
//!
//! Usage:
//!   drover init [path]          Write a default drover.toml
//!   drover config [path]        Show the effective configuration
//!   drover simulate             Run a scripted backlog against mock workers
//!   drover inspect <snapshot>   Print the contents of an engine snapshot

use anyhow::Result;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use drover_core::fail_open::fail_open;
use drover_core::{
    DroverConfig, EngineEvent, LifecycleEvent, Task, TaskConfig, TaskId, WorkerId,
};
use drover_engine::{Coordinator, EngineSnapshot};
use drover_workers::WorkerEndpoint;
use rand::Rng;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "drover")]
#[command(author, version, about = "Task orchestration for worker agent fleets")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default drover.toml
    Init {
        /// Directory for the config file (defaults to current directory)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Show the effective configuration
    Config {
        /// Directory containing drover.toml (defaults to current directory)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Run a scripted backlog against a simulated worker fleet
    Simulate {
        /// Number of workers
        #[arg(short, long, default_value = "3")]
        workers: usize,

        /// Number of tasks
        #[arg(short, long, default_value = "12")]
        tasks: usize,

        /// Make every fourth task outcome a failure
        #[arg(long)]
        flaky: bool,

        /// Write an engine snapshot here when the run ends
        #[arg(long, value_name = "FILE")]
        snapshot: Option<PathBuf>,
    },

    /// Print the contents of an engine snapshot
    Inspect {
        /// Snapshot file written by `simulate --snapshot`
        snapshot: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init { path } => cmd_init(path),
        Commands::Config { path } => cmd_config(path),
        Commands::Simulate {
            workers,
            tasks,
            flaky,
            snapshot,
        } => cmd_simulate(workers, tasks, flaky, snapshot).await,
        Commands::Inspect { snapshot } => cmd_inspect(snapshot),
    }
}

fn cmd_init(path: PathBuf) -> Result<()> {
    DroverConfig::write_default(&path)?;
    info!("Wrote default configuration to {:?}", path.join("drover.toml"));
    Ok(())
}

fn cmd_config(path: PathBuf) -> Result<()> {
    let config = DroverConfig::load_or_default(&path)?;
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

/// Mock fleet: every assignment completes (or fails) after a short
/// simulated working delay, reported back through an event channel
struct SimulatedFleet {
    outcomes: mpsc::UnboundedSender<EngineEvent>,
    flaky: bool,
    handed_out: AtomicU32,
}

impl SimulatedFleet {
    fn new(outcomes: mpsc::UnboundedSender<EngineEvent>, flaky: bool) -> Self {
        Self {
            outcomes,
            flaky,
            handed_out: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl WorkerEndpoint for SimulatedFleet {
    async fn notify_assigned(&self, worker_id: &WorkerId, task: &Task) -> drover_core::Result<()> {
        let n = self.handed_out.fetch_add(1, Ordering::SeqCst);
        let fail = self.flaky && n % 4 == 3;
        let delay = Duration::from_millis(rand::thread_rng().gen_range(20..80));
        let outcomes = self.outcomes.clone();
        let task_id = task.id;

        debug!("{} starts '{}'", worker_id, task.title);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let event = if fail {
                EngineEvent::TaskOutcome {
                    task_id,
                    success: false,
                    detail: "simulated failure".to_string(),
                }
            } else {
                EngineEvent::TaskOutcome {
                    task_id,
                    success: true,
                    detail: String::new(),
                }
            };
            let _ = outcomes.send(event);
        });
        Ok(())
    }

    async fn notify_cancelled(&self, worker_id: &WorkerId, task_id: TaskId) -> drover_core::Result<()> {
        debug!("{} drops {}", worker_id, task_id);
        Ok(())
    }
}

const ROLES: &[(&str, &[&str])] = &[
    ("builder", &["rust", "build"]),
    ("tester", &["rust", "testing"]),
    ("writer", &["docs"]),
];

async fn cmd_simulate(
    workers: usize,
    tasks: usize,
    flaky: bool,
    snapshot_path: Option<PathBuf>,
) -> Result<()> {
    let mut config = DroverConfig::default();
    config.retry.base_delay_ms = 100;
    config.retry.max_delay_ms = 1_000;
    config.timeouts.sweep_interval_ms = 500;

    let (tx, mut outcomes) = mpsc::unbounded_channel();
    let coordinator = Coordinator::new(config, SimulatedFleet::new(tx, flaky));
    let sweep = coordinator.spawn_sweep();

    // Narrate lifecycle events as they happen
    let mut events = coordinator.subscribe();
    let narrator = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                LifecycleEvent::Transition(t) => {
                    info!("task {} {} -> {} ({})", short(t.task_id), t.from, t.to, t.reason);
                }
                LifecycleEvent::DeadLettered { task_id, error } => {
                    warn!("task {} dead-lettered: {}", short(task_id), error);
                }
                LifecycleEvent::Stuck { task_ids } => {
                    warn!("{} tasks stuck", task_ids.len());
                }
                _ => {}
            }
        }
    });

    for i in 0..workers {
        let (role, caps) = ROLES[i % ROLES.len()];
        let worker = drover_core::Worker::new(format!("{}-{}", role, i), role)
            .with_capabilities(caps.iter().copied());
        coordinator.register_worker(worker).await?;
    }

    // A mixed backlog: varying priorities, a dependency chain every third
    // task, a docs task every fifth
    let mut previous: Option<TaskId> = None;
    for i in 0..tasks {
        let caps: &[&str] = if i % 5 == 4 { &["docs"] } else { &["rust"] };
        let mut task_config = TaskConfig::new(format!("task-{:02}", i))
            .with_priority((i % 4) as i32 * 10)
            .with_capabilities(caps.iter().copied());
        if i % 3 == 2 {
            if let Some(dep) = previous {
                task_config = task_config.with_hard_deps([dep]);
            }
        }
        previous = Some(coordinator.create_task(task_config).await?);
    }

    // Pump worker outcomes until the backlog settles
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    loop {
        let all_terminal = coordinator
            .tasks()
            .await
            .iter()
            .all(|t| t.status.is_terminal());
        if all_terminal {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            warn!("Simulation deadline reached with work outstanding");
            break;
        }

        tokio::select! {
            Some(event) = outcomes.recv() => {
                if let Err(e) = coordinator.handle_event(event).await {
                    debug!("Late outcome ignored: {}", e);
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }
    }

    sweep.abort();
    narrator.abort();

    // Summary
    let mut by_status = std::collections::BTreeMap::new();
    for task in coordinator.tasks().await {
        *by_status.entry(task.status.to_string()).or_insert(0usize) += 1;
    }
    println!("\nRun summary:");
    for (status, count) in by_status {
        println!("  {:<12} {}", status, count);
    }
    let dead = coordinator.dead_letters().await;
    if !dead.is_empty() {
        println!("  dead letters:");
        for record in dead {
            println!("    {} after {} retries: {}", short(record.task_id), record.retry_count, record.error);
        }
    }

    if let Some(path) = snapshot_path {
        let snapshot = coordinator.snapshot().await;
        fail_open("snapshot_write", || async {
            snapshot.save_to(&path)?;
            info!("Snapshot written to {:?}", path);
            Ok(())
        })
        .await;
    }

    Ok(())
}

fn cmd_inspect(path: PathBuf) -> Result<()> {
    let snapshot = EngineSnapshot::load_from(&path)?;

    println!("Snapshot taken {}", snapshot.taken_at);
    println!("{:<10} {:<10} {:>8} {:>8}  title", "task", "status", "priority", "retries");
    for task in &snapshot.tasks {
        println!(
            "{:<10} {:<10} {:>8} {:>8}  {}",
            short(task.id),
            task.status.to_string(),
            task.base_priority,
            task.retry_count,
            task.title
        );
    }
    println!(
        "\n{} tasks, {} dead letters, {} circuit records",
        snapshot.tasks.len(),
        snapshot.dead_letters.len(),
        snapshot.circuits.len()
    );
    Ok(())
}

fn short(task_id: TaskId) -> String {
    task_id.to_string()[..8].to_string()
}
