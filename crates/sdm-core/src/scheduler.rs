//! Scheduler: admit pending items under the global concurrency cap.
//!
//! Items are admitted in arrival (FIFO) order; scheduled items are held
//! until their wall-clock target and then join the pending queue. Brains
//! run on blocking threads tracked in a `JoinSet`. When the whole queue has
//! drained, the completion actions fire once.

use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinSet;

use crate::brain;
use crate::config::RuntimeConfig;
use crate::item::{DownloadItem, Status, UrlRefresher};

/// How often the admission loop re-examines scheduled items.
const ADMIT_INTERVAL: Duration = Duration::from_millis(500);

/// Actions to run once the queue drains.
#[derive(Debug, Clone, Default)]
pub struct CompletionActions {
    /// Shell command executed once after all items reach a terminal state.
    pub command: Option<String>,
    /// Power off the machine when everything is done.
    pub shutdown: bool,
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Promote scheduled items whose wall-clock target has arrived.
pub fn promote_due_items(items: &[Arc<DownloadItem>], now: u64) {
    for item in items {
        if item.status() != Status::Scheduled {
            continue;
        }
        let due = item
            .scheduled_at
            .lock()
            .unwrap()
            .map(|at| at <= now)
            .unwrap_or(true);
        if due {
            tracing::info!(uid = %item.uid, "scheduled time reached");
            item.set_status(Status::Pending);
        }
    }
}

/// Run every pending/scheduled item to a terminal state, at most
/// `max_concurrent_downloads` at a time. Returns the number of brains run.
pub async fn run_queue(
    items: &[Arc<DownloadItem>],
    cfg: &RuntimeConfig,
    refresher: Arc<dyn UrlRefresher>,
) -> Result<u32> {
    let cap = cfg.max_concurrent_downloads.max(1);
    let mut running: JoinSet<()> = JoinSet::new();
    let mut admitted: HashSet<String> = HashSet::new();
    let mut run_count = 0u32;

    loop {
        promote_due_items(items, unix_now());

        while running.len() < cap {
            let next = items
                .iter()
                .find(|i| i.status() == Status::Pending && !admitted.contains(&i.uid))
                .cloned();
            let Some(item) = next else {
                break;
            };
            admitted.insert(item.uid.clone());
            run_count += 1;
            let cfg = cfg.clone();
            let refresher = Arc::clone(&refresher);
            running.spawn_blocking(move || brain::run(item, &cfg, refresher));
        }

        if running.is_empty() {
            let waiting = items.iter().any(|i| {
                i.status() == Status::Scheduled
                    || (i.status() == Status::Pending && !admitted.contains(&i.uid))
            });
            if !waiting {
                break;
            }
            tokio::time::sleep(ADMIT_INTERVAL).await;
            continue;
        }

        tokio::select! {
            res = running.join_next() => {
                if let Some(Err(e)) = res {
                    tracing::error!(error = %e, "brain task panicked");
                }
            }
            _ = tokio::time::sleep(ADMIT_INTERVAL) => {}
        }
    }

    Ok(run_count)
}

/// Fire the once-per-drain completion actions.
pub fn run_completion_actions(actions: &CompletionActions) {
    if let Some(command) = actions.command.as_deref() {
        tracing::info!(%command, "running completion command");
        let result = std::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .status();
        match result {
            Ok(status) if !status.success() => {
                tracing::warn!(%command, %status, "completion command failed");
            }
            Err(e) => tracing::warn!(%command, error = %e, "completion command did not run"),
            _ => {}
        }
    }
    if actions.shutdown {
        tracing::warn!("shutdown requested, powering off");
        let _ = std::process::Command::new("systemctl")
            .arg("poweroff")
            .status();
    }
}
