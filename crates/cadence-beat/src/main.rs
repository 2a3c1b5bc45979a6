use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use cadence_core::config::{CadenceConfig, LogConfig, QueueBackend};
use cadence_scheduler::{
    compute_next_due, ChannelQueue, JobMessage, JobQueue, Schedule, ScheduleStore, Scheduler,
    SqliteScheduleStore, SystemClock,
};
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing::{info, info_span, warn, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod app;
mod http;
mod redis_queue;

/// Capacity of the in-process queue used by the `log` backend.
const LOG_QUEUE_CAPACITY: usize = 1024;

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CADENCE_GIT_SHA"), ")");

/// Periodic task scheduler: reads schedules from SQLite and hands due jobs
/// to a queue.
#[derive(Parser, Debug)]
#[command(name = "cadence-beat", version = VERSION, about)]
struct Cli {
    /// Config file path (defaults to ~/.cadence/cadence.toml).
    #[arg(short, long, env = "CADENCE_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Run the scheduler (default).
    Run,
    /// Print every stored schedule with its next due time.
    List,
    /// Validate config, database, queue and stored schedules.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Tracing depends on the config, so this warning goes straight to stderr.
    let config = CadenceConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        eprintln!("cadence-beat: config load failed ({e}), using defaults");
        CadenceConfig::default()
    });
    if let Err(e) = config.validate() {
        eprintln!("cadence-beat: [{}] {e}", e.code());
        std::process::exit(2);
    }
    init_tracing(&config.log);

    let span = info_span!(
        "cadence",
        app = %config.app.name,
        env = %config.app.environment
    );
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).instrument(span).await,
        Command::List => list(&config).instrument(span).await,
        Command::Check => check(&config).instrument(span).await,
    }
}

/// `RUST_LOG` wins over `[log] filter`.
fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.filter));
    let registry = tracing_subscriber::registry().with(filter);
    if log.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run(config: CadenceConfig) -> anyhow::Result<()> {
    info!(version = VERSION, "starting cadence-beat");

    let store = Arc::new(open_store(&config)?);
    let queue = build_queue(&config).await?;

    let mut scheduler = Scheduler::new(
        &config.scheduler,
        Arc::clone(&store) as Arc<dyn ScheduleStore>,
        Arc::clone(&queue),
        Arc::new(SystemClock),
    )?;
    scheduler
        .start()
        .await
        .context("initial schedule sync failed")?;

    // Bind before spawning anything so a busy port fails fast.
    let listener = if config.http.enabled {
        let addr: SocketAddr = format!("{}:{}", config.http.bind, config.http.port).parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "http listening");
        Some(listener)
    } else {
        None
    };

    let state = Arc::new(app::AppState {
        snapshots: scheduler.subscribe(),
        stats: scheduler.stats(),
        store,
        queue,
        config,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx).in_current_span());

    match listener {
        Some(listener) => {
            axum::serve(listener, app::build_router(state))
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }
        None => shutdown_signal().await,
    }

    let _ = shutdown_tx.send(true);
    scheduler_task.await.context("scheduler task panicked")?;
    info!("cadence-beat stopped");
    Ok(())
}

async fn list(config: &CadenceConfig) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let defs = store.list_schedules()?;
    if defs.is_empty() {
        println!("no schedules in {}", config.database.path);
        return Ok(());
    }

    let now = chrono::Utc::now();
    println!(
        "{:<24} {:<9} {:<20} {:<8} {:<6} {:<26} TASK",
        "NAME", "KIND", "RULE", "ENABLED", "RUNS", "NEXT DUE"
    );
    for def in defs {
        let next = if !def.enabled {
            "-".to_string()
        } else {
            match compute_next_due(&def, now) {
                Ok(at) => at.to_rfc3339(),
                Err(e) => format!("invalid: {e}"),
            }
        };
        println!(
            "{:<24} {:<9} {:<20} {:<8} {:<6} {:<26} {}",
            def.name,
            def.kind.as_str(),
            def.rule(),
            def.enabled,
            def.total_run_count,
            next,
            def.task
        );
    }
    Ok(())
}

async fn check(config: &CadenceConfig) -> anyhow::Result<()> {
    println!(
        "config: ok (sync every {}s, max sleep {}s, queue {:?})",
        config.scheduler.sync_every_seconds,
        config.scheduler.max_interval_seconds,
        config.queue.backend
    );

    let store = open_store(config)?;
    store.ping().await.context("database ping failed")?;
    println!("database: ok ({})", config.database.path);

    let queue = build_queue(config).await?;
    queue.ping().await.context("queue ping failed")?;
    println!("queue: ok ({})", queue.name());

    let mut invalid = 0;
    for def in store.list_schedules()?.iter().filter(|d| d.enabled) {
        if let Err(e) = Schedule::from_definition(def) {
            println!("schedule {}: {e}", def.name);
            invalid += 1;
        }
    }
    if invalid > 0 {
        anyhow::bail!("{invalid} enabled schedule(s) would be skipped");
    }
    println!("schedules: ok");
    Ok(())
}

fn open_store(config: &CadenceConfig) -> anyhow::Result<SqliteScheduleStore> {
    config.database.ensure_parent_dir()?;
    info!(path = %config.database.path, "opening SQLite database");
    let conn = rusqlite::Connection::open(&config.database.path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
    Ok(SqliteScheduleStore::new(conn)?)
}

async fn build_queue(config: &CadenceConfig) -> anyhow::Result<Arc<dyn JobQueue>> {
    match config.queue.backend {
        QueueBackend::Redis => {
            let q = &config.queue;
            let queue = redis_queue::RedisQueue::connect(&q.redis_url(), &q.redis_key)
                .await
                .with_context(|| {
                    format!("cannot connect to redis at {}:{}", q.redis_host, q.redis_port)
                })?;
            info!(
                host = %q.redis_host,
                port = q.redis_port,
                key = %q.redis_key,
                "redis queue connected"
            );
            Ok(Arc::new(queue))
        }
        QueueBackend::Log => {
            let (queue, rx) = ChannelQueue::new(LOG_QUEUE_CAPACITY);
            tokio::spawn(log_jobs(rx).in_current_span());
            info!("log queue backend: jobs are logged, not executed");
            Ok(Arc::new(queue))
        }
    }
}

/// Consumer for the `log` backend.
async fn log_jobs(mut rx: mpsc::Receiver<JobMessage>) {
    while let Some(job) = rx.recv().await {
        info!(
            schedule = %job.schedule,
            task = %job.task,
            correlation_id = %job.id,
            args = %job.args,
            kwargs = %job.kwargs,
            "job received"
        );
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn config_path_comes_from_flag_or_environment() {
        let cli = Cli::try_parse_from(["cadence-beat", "--config", "/etc/cadence.toml", "list"]).unwrap();
        assert_eq!(cli.config.as_deref(), Some("/etc/cadence.toml"));
        assert!(matches!(cli.command, Some(Command::List)));

        std::env::set_var("CADENCE_CONFIG", "/tmp/from-env.toml");
        let cli = Cli::try_parse_from(["cadence-beat", "check"]).unwrap();
        std::env::remove_var("CADENCE_CONFIG");
        assert_eq!(cli.config.as_deref(), Some("/tmp/from-env.toml"));
        assert!(matches!(cli.command, Some(Command::Check)));
    }
}
