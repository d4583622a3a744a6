use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn, Level};

use pr_review_server::config::Config;
use pr_review_server::db::Db;
use pr_review_server::executor::ReviewExecutor;
use pr_review_server::github::{GitHubClient, PrSource};
use pr_review_server::notify::Notifier;
use pr_review_server::poller::Poller;
use pr_review_server::prioritization::spawn_prioritizer;
use pr_review_server::{server, AppState, RateLimitCache};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting PR review server");

    let config = Config::from_env()?;
    info!("GitHub username: {}", config.github_username);
    info!("Polling interval: {:?}", config.polling_interval);
    info!("Server port: {}", config.server_port);
    info!("Reviews directory: {:?}", config.reviews_dir);
    info!("Generator path: {}", config.generator_path);

    warn_if_generator_missing(&config.generator_path);

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create data directory")?;
    }
    std::fs::create_dir_all(&config.reviews_dir)
        .context("Failed to create reviews directory")?;

    let db = Arc::new(Db::new(&config.db_path).context("Failed to initialize database")?);
    info!("Database initialized at {:?}", config.db_path);

    let source: Arc<dyn PrSource> = Arc::new(GitHubClient::new(
        config.github_token.clone(),
        config.github_username.clone(),
    ));

    let executor = Arc::new(ReviewExecutor::new(
        config.generator_path.clone(),
        config.reviews_dir.clone(),
        db.clone(),
    ));
    let notifier = Arc::new(Notifier::new(config.enable_voice_notifications));
    let pr_cache = Arc::new(RwLock::new(Vec::new()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let poller = Arc::new(Poller::new(
        config.polling_interval,
        config.reviews_dir.clone(),
        db.clone(),
        source.clone(),
        executor.clone(),
        notifier,
        pr_cache.clone(),
        shutdown_rx.clone(),
    ));

    let state = Arc::new(AppState {
        config: config.clone(),
        db,
        source,
        executor: executor.clone(),
        poller: poller.clone(),
        pr_cache,
        rate_limit_cache: RwLock::new(RateLimitCache::default()),
        priority_result: RwLock::new(None),
        started_at: Instant::now(),
    });

    tokio::spawn(poller.run());
    executor.clone().spawn_watchdog(shutdown_rx.clone());
    spawn_prioritizer(state.clone(), shutdown_rx);

    let app = server::router(state.clone());
    let listener = TcpListener::bind(("0.0.0.0", config.server_port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.server_port))?;
    info!("Server listening on port {}", config.server_port);

    // The shutdown handler cancels background work and terminates live
    // generator tasks before this future resolves; HTTP drains last.
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx, executor))
        .await?;

    info!("Shutdown complete");

    Ok(())
}

/// The generator being absent is warned, not fatal: the server still runs
/// and affected PRs surface as errors on the dashboard.
fn warn_if_generator_missing(generator_path: &str) {
    let path = Path::new(generator_path);
    let found = if path.is_absolute() || generator_path.contains('/') {
        path.exists()
    } else {
        std::env::var_os("PATH")
            .map(|paths| {
                std::env::split_paths(&paths).any(|dir| dir.join(generator_path).exists())
            })
            .unwrap_or(false)
    };

    if !found {
        warn!(
            "Review generator not found at {:?} or in PATH; reviews will fail until it is installed",
            generator_path
        );
    }
}

/// Pause between terminating background work and letting HTTP drain.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>, executor: Arc<ReviewExecutor>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutting down...");

    // Stop the timers and abort in-flight remote calls, then terminate any
    // live generator tasks. HTTP shuts down last, once this future resolves.
    let _ = shutdown_tx.send(true);
    executor.cancel_all();
    tokio::time::sleep(SHUTDOWN_GRACE).await;
}
