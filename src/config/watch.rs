use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::SnapshotStore;

pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(5);

/// Polls a config file and reloads the store whenever its modification time
/// changes. Stops when shut down or dropped.
#[derive(Debug)]
pub struct ConfigWatcher {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ConfigWatcher {
    pub fn spawn(store: Arc<SnapshotStore>, path: PathBuf, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(watch_loop(store, path, interval, cancel.clone()));
        Self {
            cancel,
            task: Some(task),
        }
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn modified_at(path: &Path) -> Option<SystemTime> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.modified().ok(),
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "config stat failed");
            None
        }
    }
}

async fn watch_loop(
    store: Arc<SnapshotStore>,
    path: PathBuf,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut last = modified_at(&path).await;
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let modified = modified_at(&path).await;
        if modified.is_none() || modified == last {
            continue;
        }
        last = modified;
        // Errors are logged by the store; the previous snapshot stays active.
        let _ = store.reload_from_path(&path).await;
    }
    tracing::debug!(path = %path.display(), "config watcher stopped");
}
