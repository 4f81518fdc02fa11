use std::sync::Arc;

use conveyor::config::Config;
use conveyor::dispatch::{Dispatcher, LogRunner};
use conveyor::events::EventBus;
use conveyor::queue::TaskQueue;
use conveyor::schedule::Scheduler;
use conveyor::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing; CONVEYOR_LOG_DIR switches to daily rolling files
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let _log_guard = match std::env::var("CONVEYOR_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(&dir, "conveyor.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .init();
            None
        }
    };

    let config = Config::from_env().unwrap_or_else(|e| {
        eprintln!("Error: invalid configuration: {e}");
        std::process::exit(1);
    });

    eprintln!("⚙️ Conveyor v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!(
        "   Workers: {} (min {}, max {}, autoscale {})",
        config.dispatcher.default_concurrency,
        config.dispatcher.min_concurrency,
        config.dispatcher.max_concurrency,
        if config.dispatcher.autoscale.enabled {
            "on"
        } else {
            "off"
        },
    );
    eprintln!(
        "   Lease: {}s, max {} attempts",
        config.queue.lease_duration.as_secs(),
        config.queue.max_attempts,
    );
    eprintln!(
        "   Scheduler: tick {}ms",
        config.scheduler.tick_interval.as_millis(),
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );

    let events = EventBus::new();
    let queue = TaskQueue::new(Arc::clone(&db), config.queue.clone(), events);

    // ── Scheduler ────────────────────────────────────────────────────────
    let scheduler = Arc::new(Scheduler::new(
        config.scheduler.clone(),
        Arc::clone(&db),
        queue.clone(),
    ));
    let mut scheduler_handle = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        async move { scheduler.run().await }
    });

    // ── Dispatcher ───────────────────────────────────────────────────────
    // The built-in runner only logs payloads; embedders plug their own
    // TaskRunner through the library API.
    let dispatcher = Arc::new(Dispatcher::new(
        config.dispatcher.clone(),
        queue.clone(),
        Arc::new(LogRunner),
    ));
    eprintln!("   Instance: {}\n", dispatcher.instance_id());

    let mut fatal: Option<Box<dyn std::error::Error>> = None;
    tokio::select! {
        biased;
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Ctrl+C received, shutting down...");
        }
        result = dispatcher.run() => {
            if let Err(e) = result {
                tracing::error!("Dispatcher stopped: {e}");
                fatal = Some(Box::new(e));
            }
        }
        result = &mut scheduler_handle => {
            match result {
                Ok(Err(e)) => {
                    tracing::error!("Scheduler stopped: {e}");
                    fatal = Some(Box::new(e));
                }
                Ok(Ok(())) => {}
                Err(e) => {
                    tracing::error!("Scheduler task failed: {e}");
                }
            }
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────────
    scheduler_handle.abort();
    if let Err(e) = dispatcher.shutdown().await {
        tracing::error!("Shutdown did not complete cleanly: {e}");
        if fatal.is_none() {
            fatal = Some(Box::new(e));
        }
    }

    match fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
