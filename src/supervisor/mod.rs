//! The supervisor: spawns a fixed pool of
//! worker processes, pins each to a distinct display, and restarts any that
//! exit, until a termination signal tells it to wind everything down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{error, info, warn};

const CHILD_POLL_INTERVAL: Duration = Duration::from_secs(1);
const RESPAWN_DELAY: Duration = Duration::from_secs(2);
const SIGTERM_GRACE: Duration = Duration::from_secs(30);
const SIGKILL_GRACE: Duration = Duration::from_secs(5);
const DISPLAY_BASE: u32 = 99;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker {id}: {source}")]
    Spawn { id: u32, source: std::io::Error },
}

struct ManagedChild {
    id: u32,
    child: Child,
    restart_count: u32,
}

/// Drives `num_workers` worker subprocesses to completion, soft-warning if
/// the count looks unreasonably large.
pub async fn run(num_workers: u32, worker_binary: std::path::PathBuf) -> Result<(), SupervisorError> {
    if num_workers > 50 {
        warn!(num_workers, "NUM_WORKERS is unusually large; double-check this is intentional");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    install_signal_handlers(shutdown.clone());

    let mut children = HashMap::new();
    for id in 1..=num_workers {
        let child = spawn_worker(&worker_binary, id)?;
        children.insert(id, ManagedChild { id, child, restart_count: 0 });
    }

    loop {
        if shutdown.load(Ordering::Relaxed) {
            shutdown_all(children).await;
            return Ok(());
        }

        let exited: Vec<u32> = {
            let mut exited = Vec::new();
            for (id, managed) in children.iter_mut() {
                if let Ok(Some(status)) = managed.child.try_wait() {
                    info!(
                        worker_id = id,
                        exit_code = status.code(),
                        restart_count = managed.restart_count,
                        "worker exited"
                    );
                    exited.push(*id);
                }
            }
            exited
        };

        for id in exited {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            let restart_count = children.get(&id).map(|m| m.restart_count).unwrap_or(0);
            sleep(RESPAWN_DELAY).await;
            match spawn_worker(&worker_binary, id) {
                Ok(child) => {
                    children.insert(id, ManagedChild { id, child, restart_count: restart_count + 1 });
                }
                Err(err) => error!(worker_id = id, error = %err, "failed to respawn worker"),
            }
        }

        sleep(CHILD_POLL_INTERVAL).await;
    }
}

fn spawn_worker(worker_binary: &std::path::Path, id: u32) -> Result<Child, SupervisorError> {
    Command::new(worker_binary)
        .arg("worker")
        .env("WORKER_ID", format!("worker_{id}"))
        .env("DISPLAY", format!(":{}", DISPLAY_BASE + id - 1))
        .kill_on_drop(false)
        .spawn()
        .map_err(|source| SupervisorError::Spawn { id, source })
}

#[cfg(unix)]
fn install_signal_handlers(shutdown: Arc<AtomicBool>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        }
        shutdown.store(true, Ordering::Relaxed);
    });
}

#[cfg(not(unix))]
fn install_signal_handlers(shutdown: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c");
            shutdown.store(true, Ordering::Relaxed);
        }
    });
}

/// SIGTERM every live child, wait up to 30 s, escalate to SIGKILL, wait up
/// to 5 s more, and log a zombie warning for anything still alive.
async fn shutdown_all(mut children: HashMap<u32, ManagedChild>) {
    for managed in children.values() {
        if let Some(pid) = managed.child.id() {
            send_sigterm(pid, managed.id);
        }
    }

    if !wait_for_all_exit(&mut children, SIGTERM_GRACE).await {
        warn!("some workers did not exit after SIGTERM, escalating to SIGKILL");
        for managed in children.values_mut() {
            let _ = managed.child.start_kill();
        }
        if !wait_for_all_exit(&mut children, SIGKILL_GRACE).await {
            for managed in children.values() {
                warn!(worker_id = managed.id, "worker still alive after SIGKILL grace period (zombie)");
            }
        }
    }
    info!("supervisor shutdown complete");
}

#[cfg(unix)]
fn send_sigterm(pid: u32, worker_id: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        warn!(worker_id, pid, error = %err, "failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32, _worker_id: u32) {}

async fn wait_for_all_exit(children: &mut HashMap<u32, ManagedChild>, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        children.retain(|_, managed| !matches!(managed.child.try_wait(), Ok(Some(_))));
        if children.is_empty() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        sleep(CHILD_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn managed(id: u32, command: &str, args: &[&str]) -> ManagedChild {
        let child = Command::new(command).args(args).kill_on_drop(true).spawn().expect("spawn test child");
        ManagedChild { id, child, restart_count: 0 }
    }

    #[tokio::test]
    async fn wait_for_all_exit_returns_true_once_children_exit() {
        let mut children = HashMap::new();
        children.insert(1, managed(1, "true", &[]));
        let exited = wait_for_all_exit(&mut children, Duration::from_secs(5)).await;
        assert!(exited);
        assert!(children.is_empty());
    }

    #[tokio::test]
    async fn wait_for_all_exit_times_out_on_a_long_running_child() {
        let mut children = HashMap::new();
        children.insert(1, managed(1, "sleep", &["5"]));
        let exited = wait_for_all_exit(&mut children, Duration::from_millis(200)).await;
        assert!(!exited);
        assert_eq!(children.len(), 1);
    }
}
