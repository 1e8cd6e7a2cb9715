use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{DateTime, FixedOffset};
use clap::{Parser, Subcommand};
use gearshift_broker::{DispatchStatus, JobRegistry, Worker, WorkerInfo};
use gearshift_core::{GearshiftConfig, Priority, Task};
use gearshift_scheduler::{SchedulerDriver, TaskService};
use tokio::sync::watch;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "gearshift",
    version,
    about = "Gearman task dispatcher with a durable scheduler"
)]
struct Cli {
    /// Config file (default: ~/.gearshift/gearshift.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a configured worker until Ctrl-C or its idle timeout
    Run {
        #[arg(long)]
        worker: String,
    },
    /// Promote due scheduled tasks once
    RunScheduled,
    /// Promote due tasks on a timer, using the [scheduler] settings
    SchedulerProcess,
    /// Show configured workers
    Info {
        #[arg(long)]
        worker: Option<String>,
    },
    /// Submit a task now or for later
    Submit(SubmitArgs),
}

#[derive(clap::Args)]
struct SubmitArgs {
    /// Capability (Gearman function name) to run
    capability: String,

    #[arg(long, default_value = "")]
    payload: String,

    #[arg(long, default_value = "default")]
    connection: String,

    #[arg(long, default_value = "normal")]
    priority: Priority,

    /// Do not wait for the result
    #[arg(long)]
    background: bool,

    /// Earliest start, RFC 3339 (e.g. 2026-11-01T08:00:00+02:00)
    #[arg(long)]
    start: Option<DateTime<FixedOffset>>,

    /// Number of runs; requires --interval
    #[arg(long, requires = "interval")]
    repeat: Option<u32>,

    /// ISO-8601 duration between runs (e.g. P1D, PT30M)
    #[arg(long, requires = "repeat")]
    interval: Option<String>,

    #[arg(long)]
    id: Option<String>,

    /// Correlation string stored with the task
    #[arg(long)]
    context: Option<String>,
}

impl SubmitArgs {
    fn into_task(self) -> anyhow::Result<Task> {
        let mut task = Task::new(self.capability);
        task.set_payload(self.payload)
            .set_connection_name(self.connection)
            .set_priority(self.priority)
            .set_background(self.background);
        if let Some(id) = self.id {
            task.set_id(id);
        }
        if let Some(start) = self.start {
            task.set_start(start);
        }
        if let Some(context) = self.context {
            task.set_context(context);
        }
        if let (Some(times), Some(interval)) = (self.repeat, self.interval) {
            task.set_repeat(times, &interval)?;
        }
        Ok(task)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gearshift=info".into()),
        )
        .init();

    let cli = Cli::parse();
    // explicit --config > GEARSHIFT_CONFIG env > ~/.gearshift/gearshift.toml
    let config_path = cli.config.or_else(|| std::env::var("GEARSHIFT_CONFIG").ok());
    let config = GearshiftConfig::load(config_path.as_deref())?;

    match cli.command {
        Command::Run { worker } => run_worker(&config, &worker).await,
        Command::RunScheduled => run_scheduled(config).await,
        Command::SchedulerProcess => scheduler_process(config).await,
        Command::Info { worker } => {
            print!("{}", info_text(&config, worker.as_deref())?);
            Ok(())
        }
        Command::Submit(args) => submit(config, args).await,
    }
}

/// A watch channel that flips to `true` on Ctrl-C.
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            let _ = tx.send(true);
        }
    });
    rx
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}

fn open_service(config: GearshiftConfig) -> anyhow::Result<TaskService> {
    let db_path = config.database.path.clone();
    ensure_parent_dir(&db_path);
    info!(path = %db_path, "opening SQLite database");
    TaskService::from_config(config).with_context(|| format!("opening {db_path}"))
}

async fn run_worker(config: &GearshiftConfig, name: &str) -> anyhow::Result<()> {
    let worker = Worker::from_config(config, name, &JobRegistry::builtin())?;
    let exit = worker.run(shutdown_on_ctrl_c()).await?;
    info!(worker = %name, jobs_run = exit.jobs_run, reason = ?exit.reason, "worker stopped");
    Ok(())
}

async fn run_scheduled(config: GearshiftConfig) -> anyhow::Result<()> {
    let service = open_service(config)?;
    let report = service.promote_due_tasks().await?;

    println!(
        "Promoted {} task(s): {} rescheduled, {} finished, {} to retry",
        report.claimed,
        report.rescheduled.len(),
        report.deleted.len(),
        report.retried.len()
    );
    let failures: Vec<String> = report
        .dispatch
        .failures()
        .map(|(_, err)| err.to_string())
        .chain(
            report
                .rejected
                .iter()
                .map(|(id, err)| format!("task {id}: {err}")),
        )
        .collect();
    if !failures.is_empty() {
        bail!(failures.join("; "));
    }
    Ok(())
}

async fn scheduler_process(config: GearshiftConfig) -> anyhow::Result<()> {
    let scheduler = config.scheduler.clone();
    let service = Arc::new(open_service(config)?);
    let driver = SchedulerDriver::from_config(service, &scheduler);

    let summary = driver.run(shutdown_on_ctrl_c()).await;
    println!(
        "Ran {} iteration(s), {} failed, {} task(s) promoted",
        summary.iterations, summary.failed, summary.promoted
    );
    Ok(())
}

async fn submit(config: GearshiftConfig, args: SubmitArgs) -> anyhow::Result<()> {
    let task = args.into_task()?;
    let service = open_service(config)?;
    let report = service.add(vec![task.clone()]).await?;

    if !report.persisted.is_empty() {
        println!("Task {} scheduled for {}", task.id(), task.start().to_rfc3339());
    }
    for outcome in report.dispatch.outcomes() {
        match &outcome.status {
            DispatchStatus::Queued => {
                println!("Task {} queued as {}", outcome.unique_id, outcome.handle);
            }
            DispatchStatus::Complete(data) => {
                println!("{}", String::from_utf8_lossy(data));
            }
            DispatchStatus::Failed => bail!("Task {} failed", outcome.unique_id),
            DispatchStatus::Exception(message) => {
                bail!("Task {} raised an exception: {message}", outcome.unique_id)
            }
        }
    }
    if let Some((_, err)) = report.dispatch.failures().next() {
        bail!(err.to_string());
    }
    Ok(())
}

fn info_text(config: &GearshiftConfig, only: Option<&str>) -> anyhow::Result<String> {
    let jobs = JobRegistry::builtin();
    let workers = match only {
        Some(name) => vec![Worker::from_config(config, name, &jobs)?],
        None => config
            .workers
            .keys()
            .map(|name| Worker::from_config(config, name, &jobs))
            .collect::<gearshift_core::Result<Vec<_>>>()?,
    };

    if workers.is_empty() {
        return Ok("No workers configured.\n".to_string());
    }
    let mut out = String::new();
    for worker in workers {
        render_worker(&mut out, &worker.info());
    }
    Ok(out)
}

fn render_worker(out: &mut String, info: &WorkerInfo) {
    let _ = writeln!(out, "Worker: {}", info.name);
    if let Some(description) = &info.description {
        let _ = writeln!(out, "  Description: {description}");
    }
    let timeout = info
        .timeout_ms
        .map(|ms| format!("{ms}ms"))
        .unwrap_or_else(|| "none".to_string());
    let _ = writeln!(out, "  Connection: {} (timeout: {timeout})", info.connection);
    let _ = writeln!(out, "  Servers: {}", info.servers);
    let _ = writeln!(out, "  Capabilities:");
    for (name, description) in &info.capabilities {
        if description.is_empty() {
            let _ = writeln!(out, "    - {name}");
        } else {
            let _ = writeln!(out, "    - {name}: {description}");
        }
    }
    out.push('\n');
}
