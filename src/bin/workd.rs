//! workd CLI: run a worker, or inspect and edit the shared queue.

use clap::{Parser, Subcommand, ValueEnum};
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use workd::config::{Config, WorkerKind, schedules::load_schedules};
use workd::db::Db;
use workd::director::WorkerDirector;
use workd::model::{NewWork, ReportFilter, Status, WorkFilter, WorkId};
use workd::plugins::register_builtin;
use workd::queue::{MemoryQueue, WorkQueue};
use workd::telemetry::{SERVICE_NAME, TelemetryConfig, init_telemetry};
use workd::worker::{
    EventListenerOptions, EventListenerWorker, IntervalWorker, IntervalWorkerOptions, Worker,
};

#[derive(Parser)]
#[command(name = "workd", about = "Shared work queue and background job runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    Interval,
    Event,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker until Ctrl-C
    Serve {
        /// TOML file of [[schedule]] declarations
        #[arg(long)]
        schedules: Option<PathBuf>,
        /// Overrides WORKER_KIND
        #[arg(long, value_enum)]
        kind: Option<Kind>,
    },
    /// Work item operations
    Work {
        #[command(subcommand)]
        action: WorkAction,
    },
    /// List registered work types
    Types,
    /// Per-type status counts
    Report {
        #[arg(long = "type")]
        work_type: Option<String>,
    },
}

#[derive(Subcommand)]
enum WorkAction {
    /// Enqueue a work item
    Add {
        work_type: String,
        /// JSON payload
        #[arg(long)]
        input: Option<String>,
        /// Higher runs first
        #[arg(long, default_value_t = 0)]
        priority: i32,
        #[arg(long)]
        retries: Option<u32>,
        /// Not eligible before now + delay
        #[arg(long)]
        delay_ms: Option<u64>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// List work items, newest first
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long = "type")]
        work_type: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show a work item
    Show {
        /// Full id or unique prefix
        id: String,
    },
    /// Soft-delete a work item
    Remove { id: String },
    /// Enqueue a copy of a finished item
    Rerun { id: String },
    /// Count work items
    Count {
        #[arg(long)]
        status: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { schedules, kind } => cmd_serve(schedules, kind).await,
        Command::Types => {
            cmd_types();
            Ok(())
        }
        Command::Report { work_type } => {
            let db = connect().await?;
            cmd_report(&db, work_type).await
        }
        Command::Work { action } => {
            let db = connect().await?;
            match action {
                WorkAction::Add {
                    work_type,
                    input,
                    priority,
                    retries,
                    delay_ms,
                    timeout_ms,
                } => {
                    cmd_work_add(&db, work_type, input, priority, retries, delay_ms, timeout_ms)
                        .await
                }
                WorkAction::List {
                    status,
                    work_type,
                    limit,
                } => cmd_work_list(&db, status, work_type, limit).await,
                WorkAction::Show { id } => cmd_work_show(&db, &id).await,
                WorkAction::Remove { id } => {
                    let id = resolve_id(&db, &id).await?;
                    let work = db.delete_work(id).await?;
                    println!("Deleted: {} ({})", work.id, work.work_type);
                    Ok(())
                }
                WorkAction::Rerun { id } => {
                    let id = resolve_id(&db, &id).await?;
                    let work = db.rerun_work(id).await?;
                    println!("Created: {} (rerun of {id})", work.id);
                    Ok(())
                }
                WorkAction::Count { status } => {
                    let mut filter = WorkFilter::new();
                    if let Some(s) = status {
                        filter = filter.status(parse_status(&s)?);
                    }
                    println!("{}", db.count(&filter).await?);
                    Ok(())
                }
            }
        }
    }
}

/// Administrative commands need the shared store; an in-memory queue would
/// be empty.
async fn connect() -> anyhow::Result<Db> {
    let config = Config::from_env()?;
    let Some(url) = config.database_url else {
        anyhow::bail!("DATABASE_URL is required for this command");
    };
    let db = Db::connect(url.expose_secret()).await?;
    db.migrate().await?;
    Ok(db)
}

fn builtin_director() -> WorkerDirector {
    let mut director = WorkerDirector::new();
    register_builtin(&mut director);
    director
}

async fn cmd_serve(schedules: Option<PathBuf>, kind: Option<Kind>) -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: SERVICE_NAME.to_string(),
        log_level: config.log_level.clone(),
    })?;

    let mut director = builtin_director().with_retry_policy(config.retry_policy);
    if let Some(path) = schedules {
        for schedule in load_schedules(&path)? {
            director.configure_auto_schedule(schedule)?;
        }
    }
    let director = Arc::new(director);

    let mut listener = None;
    let queue: Arc<dyn WorkQueue> = match config.database_url {
        Some(ref url) => {
            let db = Db::connect(url.expose_secret()).await?;
            db.migrate().await?;
            listener = Some(db.listen().await?);
            info!("using postgres work queue");
            Arc::new(db)
        }
        None => {
            info!("DATABASE_URL not set; using in-memory work queue");
            Arc::new(MemoryQueue::new())
        }
    };

    let kind = match kind {
        Some(Kind::Interval) => WorkerKind::Interval,
        Some(Kind::Event) => WorkerKind::Event,
        None => config.worker_kind,
    };
    let worker: Box<dyn Worker> = match kind {
        WorkerKind::Interval => Box::new(IntervalWorker::new(
            director,
            queue,
            IntervalWorkerOptions {
                worker_id: config.worker_id,
                batch_count: config.batch_count,
                schedule: Some(config.worker_schedule),
            },
        )?),
        WorkerKind::Event => Box::new(EventListenerWorker::new(
            director,
            queue,
            EventListenerOptions {
                worker_id: config.worker_id,
                ..EventListenerOptions::default()
            },
        )),
    };

    worker.start().await?;
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    worker.stop().await;
    if let Some(listener) = listener {
        listener.abort();
    }
    Ok(())
}

fn cmd_types() {
    let director = builtin_director();
    for work_type in director.active_plugin_types(None) {
        let external = director
            .adapter(&work_type)
            .is_some_and(|a| a.external());
        println!(
            "{work_type}{}",
            if external { "  (external)" } else { "" }
        );
    }
}

async fn cmd_report(db: &Db, work_type: Option<String>) -> anyhow::Result<()> {
    let filter = ReportFilter {
        types: work_type.map(|t| vec![t]),
        ..ReportFilter::default()
    };
    let reports = db.get_report(&filter).await?;
    if reports.is_empty() {
        println!("No work items found.");
        return Ok(());
    }

    println!(
        "{:<20}  {:>6}  {:>9}  {:>7}  {:>6}  {:>7}  AVG_MS",
        "TYPE", "NEW", "ALLOCATED", "SUCCESS", "FAILED", "DELETED"
    );
    for r in &reports {
        println!(
            "{:<20}  {:>6}  {:>9}  {:>7}  {:>6}  {:>7}  {}",
            r.work_type,
            r.new,
            r.allocated,
            r.success,
            r.failed,
            r.deleted,
            r.avg_duration_ms
                .map(|ms| format!("{ms:.0}"))
                .unwrap_or_else(|| "-".to_string())
        );
    }
    Ok(())
}

async fn cmd_work_add(
    db: &Db,
    work_type: String,
    input: Option<String>,
    priority: i32,
    retries: Option<u32>,
    delay_ms: Option<u64>,
    timeout_ms: Option<u64>,
) -> anyhow::Result<()> {
    let input: serde_json::Value = match input {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };

    let mut new = NewWork::new(work_type).input(input).priority(priority);
    if let Some(n) = retries {
        new = new.retries(n);
    }
    if let Some(ms) = delay_ms {
        let at = i64::try_from(ms)
            .ok()
            .and_then(chrono::Duration::try_milliseconds)
            .and_then(|delay| chrono::Utc::now().checked_add_signed(delay))
            .ok_or_else(|| anyhow::anyhow!("--delay-ms {ms} is out of range"))?;
        new = new.scheduled(at);
    }
    if let Some(ms) = timeout_ms {
        new = new.timeout(Duration::from_millis(ms));
    }

    let work = db.add_work(new).await?;
    println!("Created: {} (scheduled: {})", work.id, work.scheduled);
    Ok(())
}

async fn cmd_work_list(
    db: &Db,
    status: Option<String>,
    work_type: Option<String>,
    limit: usize,
) -> anyhow::Result<()> {
    let mut filter = WorkFilter::new().limit(limit);
    if let Some(s) = status {
        filter = filter.status(parse_status(&s)?);
    }
    if let Some(t) = work_type {
        filter = filter.work_type(t);
    }

    let items = db.find_work_queue(&filter).await?;
    if items.is_empty() {
        println!("No work items found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<16}  {:<9}  {:<4}  {:<7}  {:<16}  CREATED",
        "ID", "TYPE", "STATUS", "PRI", "RETRIES", "SCHEDULED"
    );
    println!("{}", "-".repeat(96));
    for item in &items {
        println!(
            "{:<8}  {:<16}  {:<9}  {:<4}  {:<7}  {:<16}  {}",
            item.id.short(),
            item.work_type,
            item.status,
            item.priority,
            item.retries,
            item.scheduled.format("%Y-%m-%d %H:%M"),
            item.created.format("%Y-%m-%d %H:%M")
        );
    }
    println!("\n{} item(s)", items.len());
    Ok(())
}

async fn cmd_work_show(db: &Db, id: &str) -> anyhow::Result<()> {
    let id = resolve_id(db, id).await?;
    let Some(item) = db.find_work(id).await? else {
        anyhow::bail!("work item {id} not found");
    };

    let or_dash = |v: Option<String>| v.unwrap_or_else(|| "-".to_string());

    println!("ID:          {}", item.id);
    println!("Type:        {}", item.work_type);
    println!("Status:      {}", item.status);
    println!("Priority:    {}", item.priority);
    println!("Scheduled:   {}", item.scheduled);
    println!("Retries:     {}", item.retries);
    println!("Attempts:    {}", item.attempts);
    println!("Worker:      {}", or_dash(item.worker.clone()));
    println!("Schedule ID: {}", or_dash(item.schedule_id.clone()));
    println!("Timeout:     {}", or_dash(item.timeout_ms.map(|ms| format!("{ms}ms"))));
    println!("Input:       {}", serde_json::to_string_pretty(&item.input)?);
    println!("Created:     {}", item.created);
    println!("Updated:     {}", item.updated);
    if let Some(started) = item.started {
        println!("Started:     {started}");
    }
    if let Some(finished) = item.finished {
        println!("Finished:    {finished}");
    }
    if let Some(ms) = item.duration_ms() {
        println!("Duration:    {ms}ms");
    }
    if let Some(original) = item.original_work_id {
        println!("Rerun of:    {original}");
    }
    if let Some(deleted) = item.deleted {
        println!("Deleted:     {deleted}");
    }
    if let Some(ref result) = item.result {
        println!("Result:      {}", serde_json::to_string_pretty(result)?);
    }
    if let Some(ref error) = item.error {
        println!("Error:       {}", serde_json::to_string_pretty(error)?);
    }
    Ok(())
}

fn parse_status(s: &str) -> anyhow::Result<Status> {
    s.parse()
        .map_err(|_| anyhow::anyhow!("invalid status: {s} (expected one of NEW, ALLOCATED, SUCCESS, FAILED, DELETED)"))
}

/// Accept a full id or a prefix unique among the latest items.
async fn resolve_id(db: &Db, id: &str) -> anyhow::Result<WorkId> {
    if id.len() >= 36 {
        return Ok(id.parse()?);
    }
    let items = db.find_work_queue(&WorkFilter::new().limit(500)).await?;
    let matches: Vec<_> = items
        .iter()
        .filter(|item| item.id.to_string().starts_with(id))
        .collect();
    match matches.as_slice() {
        [] => anyhow::bail!("no work item matching prefix '{id}'"),
        [only] => Ok(only.id),
        _ => anyhow::bail!("{} work items match prefix '{id}', be more specific", matches.len()),
    }
}
