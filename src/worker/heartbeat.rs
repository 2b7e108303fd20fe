//! Background heartbeat loop: runs alongside
//! the gather point for one task, cancelled on every task-end path.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::store::Store;

/// Handle to a spawned heartbeat loop. Dropping or calling [`Self::stop`]
/// cancels it; `stop` also waits for the task to actually end.
pub struct Heartbeat {
    handle: JoinHandle<()>,
    stop_signal: Arc<Notify>,
}

impl Heartbeat {
    pub fn spawn(store: Arc<Store>, task_id: i64, interval: Duration) -> Self {
        let stop_signal = Arc::new(Notify::new());
        let stop_signal_task = stop_signal.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = store.heartbeat(task_id).await {
                            warn!(task_id, error = %err, "heartbeat failed");
                        }
                    }
                    _ = stop_signal_task.notified() => return,
                }
            }
        });

        Self { handle, stop_signal }
    }

    pub async fn stop(self) {
        self.stop_signal.notify_one();
        let _ = self.handle.await;
    }
}
