mod handlers;
mod metrics;
mod routes;

use anyhow::{Context, Result};
use autograder_common::Config;
use autograder_engine::{CourseRegistry, GradingEngine, TaskContext, TaskScheduler};
use axum::Router;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<GradingEngine>,
    pub registry: Arc<CourseRegistry>,
    pub scheduler: Arc<TaskScheduler>,
    pub start_time: Arc<Instant>,
}

impl AppState {
    pub fn new(
        engine: Arc<GradingEngine>,
        registry: Arc<CourseRegistry>,
        scheduler: Arc<TaskScheduler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            registry,
            scheduler,
            start_time: Arc::new(Instant::now()),
        })
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

/// Cancelled on SIGTERM or SIGINT.
fn install_shutdown_handler() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    let trigger = token.clone();

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
        }
        trigger.cancel();
    });

    Ok(token)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::load().context("failed to load configuration")?;
    let json_logs = config.log.json
        || std::env::var("AUTOGRADER_LOG_JSON")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
    init_tracing(json_logs);

    info!("Autograder server booting...");

    metrics::init_metrics().context("failed to register metrics")?;

    let engine = Arc::new(GradingEngine::from_config(config.clone()).context("failed to create grading engine")?);
    let reaper = engine
        .locks()
        .start_reaper(config.reap_interval(), config.stale_lock_duration());
    info!(base_dir = %config.base_dir.display(), docker = config.docker.enabled, "Grading engine ready");

    let courses_dir = config.sources_dir();
    std::fs::create_dir_all(&courses_dir)
        .with_context(|| format!("failed to create {}", courses_dir.display()))?;

    let registry = Arc::new(CourseRegistry::new());
    let loaded = registry
        .load_root(&courses_dir)
        .await
        .context("failed to load courses")?;
    info!(courses = loaded, dir = %courses_dir.display(), "Loaded courses");

    let scheduler = Arc::new(TaskScheduler::new(TaskContext {
        base_dir: config.base_dir.clone(),
        store: Arc::clone(engine.store()),
        locks: Arc::clone(engine.locks()),
        min_rest: config.min_task_rest(),
    }));
    for course_id in registry.course_ids().await {
        if let Some(entry) = registry.get(&course_id).await {
            scheduler.schedule_course(entry.course, entry.lms).await;
        }
    }

    let shutdown = install_shutdown_handler()?;
    let state = AppState::new(engine, registry, Arc::clone(&scheduler));
    let app = Router::new().merge(routes::routes()).with_state(state);

    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    info!("HTTP server listening on {}", addr);

    let server_shutdown = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await;

    scheduler.stop_all().await;
    reaper.abort();

    if let Err(e) = served {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Autograder server stopped");
    Ok(())
}
