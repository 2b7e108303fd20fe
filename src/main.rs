//! Entry point dispatching to the two processes this crate can become: the
//! `supervisor`, which forks and restarts a worker fleet, and a `worker`,
//! which drains the task queue until signalled to stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use avito_fleet::config::AppConfig;
use avito_fleet::store::Store;
use avito_fleet::worker::collaborators::Collaborators;
use avito_fleet::worker::default_collaborators::{
    EmptyCatalogTraversal, NoopCardParser, NoopPageStateDetector, UnsolvableCaptchaSolver,
};
use avito_fleet::worker::Worker;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let subcommand = std::env::args().nth(1);
    let exit_code = match subcommand.as_deref() {
        Some("supervisor") => run_supervisor().await,
        Some("worker") => run_worker().await,
        other => {
            eprintln!(
                "usage: avito-fleet <supervisor|worker>\n  got: {}",
                other.unwrap_or("<nothing>")
            );
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run_supervisor() -> i32 {
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "failed to load configuration");
            return 1;
        }
    };

    let worker_binary = match std::env::current_exe() {
        Ok(path) => path,
        Err(err) => {
            tracing::error!(error = %err, "failed to resolve current executable path");
            return 1;
        }
    };

    match avito_fleet::supervisor::run(config.num_workers, worker_binary).await {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!(error = %err, "supervisor exited fatally");
            1
        }
    }
}

async fn run_worker() -> i32 {
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "failed to load configuration");
            return 1;
        }
    };
    let worker_id = config.worker_id.clone().unwrap_or_else(|| "worker_standalone".to_string());

    let store = match Store::connect(&config.database_url(), config.pool_min_size, config.pool_max_size).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            tracing::error!(worker_id, error = %err, "failed to connect to store");
            return 1;
        }
    };

    let collaborators = Collaborators {
        page_state: Arc::new(NoopPageStateDetector),
        captcha: Arc::new(UnsolvableCaptchaSolver),
        traversal: Arc::new(EmptyCatalogTraversal),
        card_parser: Arc::new(NoopCardParser),
    };

    let stopwords = load_stopwords();
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_notify = Arc::new(Notify::new());
    install_worker_signal_handler(shutdown.clone(), shutdown_notify.clone());

    let worker = Worker::new(worker_id, config, store, collaborators, stopwords, shutdown, shutdown_notify);
    worker.run().await;
    0
}

/// The stop-word list itself is out of scope: a real deployment
/// points `STOPWORDS_PATH` at a newline-delimited file; absent that, the
/// mechanical stage only applies its price-threshold check.
fn load_stopwords() -> Vec<String> {
    let Ok(path) = std::env::var("STOPWORDS_PATH") else {
        return Vec::new();
    };
    match std::fs::read_to_string(&path) {
        Ok(contents) => contents.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect(),
        Err(err) => {
            tracing::warn!(path, error = %err, "failed to read STOPWORDS_PATH, continuing with an empty list");
            Vec::new()
        }
    }
}

#[cfg(unix)]
fn install_worker_signal_handler(shutdown: Arc<AtomicBool>, shutdown_notify: Arc<Notify>) {
    use tokio::signal::unix::{signal, SignalKind};
    tokio::spawn(async move {
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            sigterm.recv().await;
            tracing::info!("worker received SIGTERM, interrupting in-flight task and exiting");
            shutdown.store(true, Ordering::Relaxed);
            shutdown_notify.notify_waiters();
        }
    });
}

#[cfg(not(unix))]
fn install_worker_signal_handler(shutdown: Arc<AtomicBool>, shutdown_notify: Arc<Notify>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.store(true, Ordering::Relaxed);
            shutdown_notify.notify_waiters();
        }
    });
}
