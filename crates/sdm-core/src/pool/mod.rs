//! Worker pool: adaptive concurrency, retries, work stealing, URL refresh.
//!
//! One pool loop runs per downloading item, on its own thread. Workers are
//! plain threads bound to one segment each; they report outcomes over a
//! channel and never read each other's state. All timing decisions (error
//! window, growth, stealing) are made here, in one place.

mod adaptive;
mod steal;

pub use adaptive::{ConnectionController, Verdict};
pub use steal::split_largest;

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::RuntimeConfig;
use crate::error::{classify, DownloadError, ErrorKind, FetchError};
use crate::fetcher::FetchPolicy;
use crate::item::{DownloadItem, Segment, Status, UrlRefresher};
use crate::worker;

/// Tightened floor for the last workers of a run: a stuck connection gives
/// way to a retry instead of blocking completion.
const ENDGAME_FLOOR: u32 = 20 * 1024;
const ENDGAME_WINDOW: Duration = Duration::from_secs(10);

/// Inner poll interval of the pool loop.
const POLL: Duration = Duration::from_millis(1);

/// Per-item pool tuning, copied out of the runtime config.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub max_connections: usize,
    /// Item-wide cap in bytes/sec, divided among live workers. 0 = unlimited.
    pub speed_limit: u64,
    pub segment_size_threshold: u64,
    pub errors_check_interval: Duration,
    pub conn_grow_step: Duration,
    pub max_error_ceiling: u32,
    pub refresh_url_retries: u32,
}

impl PoolOptions {
    pub fn new(cfg: &RuntimeConfig, item: &DownloadItem) -> Self {
        Self {
            max_connections: item.max_connections.max(1),
            speed_limit: cfg.speed_limit,
            segment_size_threshold: cfg.segment_size_threshold,
            errors_check_interval: Duration::from_millis(cfg.errors_check_interval_ms),
            conn_grow_step: Duration::from_millis(cfg.conn_grow_interval_ms),
            max_error_ceiling: cfg.max_error_ceiling,
            refresh_url_retries: item.refresh_url_retries,
        }
    }
}

/// Why the pool loop ended.
#[derive(Debug)]
pub enum PoolExit {
    AllDownloaded,
    /// The item left `downloading` (cancel or external transition).
    StatusChanged,
    Fatal(DownloadError),
}

struct WorkerDone {
    seg: Arc<Segment>,
    result: Result<(), FetchError>,
}

/// Run the pool until every segment is downloaded, the item leaves
/// `downloading`, or a fatal error occurs. Blocking; the brain runs this on
/// a dedicated thread.
pub fn run(
    item: &Arc<DownloadItem>,
    opts: &PoolOptions,
    base_policy: &FetchPolicy,
    refresher: &dyn UrlRefresher,
) -> PoolExit {
    let (tx, rx) = mpsc::channel::<WorkerDone>();

    let mut job_q: VecDeque<Arc<Segment>> = item
        .snapshot_segments()
        .into_iter()
        .filter(|s| !s.is_downloaded())
        .collect();
    let mut retry_q: VecDeque<Arc<Segment>> = VecDeque::new();

    let mut controller = ConnectionController::new(
        opts.max_connections,
        opts.conn_grow_step,
        opts.max_error_ceiling,
        Instant::now(),
    );
    let mut live: usize = 0;
    let mut errors_since_check: u32 = 0;
    let mut last_check = Instant::now();
    let mut refresh_attempts: u32 = 0;
    let mut last_refresh: Option<Instant> = None;

    loop {
        std::thread::sleep(POLL);

        // Collect finished workers.
        while let Ok(done) = rx.try_recv() {
            live = live.saturating_sub(1);
            item.live_connections.store(live, Ordering::Relaxed);
            if let Err(e) = done.result {
                match classify(&e) {
                    ErrorKind::UserCancel => {}
                    ErrorKind::SslVerify => {
                        return PoolExit::Fatal(DownloadError::SslVerify(e.to_string()));
                    }
                    ErrorKind::Filesystem => {
                        return PoolExit::Fatal(DownloadError::Filesystem(e.to_string()));
                    }
                    ErrorKind::StaleUrl => {
                        // Workers that raced against the same expired URL all
                        // report staleness; one refresh covers them all.
                        let fresh = last_refresh
                            .map(|at| at.elapsed() < Duration::from_secs(5))
                            .unwrap_or(false);
                        if fresh {
                            retry_q.push_back(done.seg);
                            continue;
                        }
                        tracing::info!(uid = %item.uid, error = %e, "stale url reported");
                        match refresh_item_url(
                            item,
                            refresher,
                            &mut refresh_attempts,
                            opts.refresh_url_retries,
                            base_policy,
                        ) {
                            Ok(()) => {
                                last_refresh = Some(Instant::now());
                                retry_q.push_back(done.seg);
                            }
                            Err(fatal) => return PoolExit::Fatal(fatal),
                        }
                    }
                    ErrorKind::TransientNetwork => {
                        errors_since_check += 1;
                        tracing::debug!(
                            segment = %done.seg.basename(),
                            error = %e,
                            "segment failed, requeued"
                        );
                        retry_q.push_back(done.seg);
                    }
                }
            }
        }

        let status = item.status();
        if status != Status::Downloading && status != Status::RefreshingUrl {
            return PoolExit::StatusChanged;
        }

        // Error window and connection budget.
        if last_check.elapsed() >= opts.errors_check_interval {
            last_check = Instant::now();
            let verdict =
                controller.on_interval(last_check, errors_since_check, item.downloaded());
            errors_since_check = 0;
            item.errors
                .store(controller.cumulative_errors(), Ordering::Relaxed);
            if verdict == Verdict::Abort {
                return PoolExit::Fatal(DownloadError::FatalNetwork(
                    "too many connection errors without progress".to_string(),
                ));
            }
        }

        // Launch workers up to the current budget.
        while live < controller.allowed() && status == Status::Downloading {
            let next = retry_q
                .pop_front()
                .or_else(|| job_q.pop_front())
                .or_else(|| split_largest(item, opts.segment_size_threshold));
            let Some(seg) = next else {
                break;
            };
            if seg.is_downloaded() || !seg.try_lock() {
                continue;
            }

            let allowed = controller.allowed().max(1);
            let share = if opts.speed_limit > 0 {
                (opts.speed_limit / allowed as u64).max(1)
            } else {
                0
            };
            let mut policy = base_policy.with_speed_cap(share);
            // Endgame: few segments left, don't let one crawling connection
            // hold the finish line.
            if job_q.len() + retry_q.len() <= allowed {
                policy = policy.with_low_speed(ENDGAME_FLOOR, ENDGAME_WINDOW);
            }

            let item2 = Arc::clone(item);
            let tx2 = tx.clone();
            std::thread::spawn(move || {
                let result = worker::run(&item2, &seg, &policy);
                let _ = tx2.send(WorkerDone { seg, result });
            });
            live += 1;
            item.live_connections.store(live, Ordering::Relaxed);
        }

        item.remaining_parts
            .store(live + job_q.len() + retry_q.len(), Ordering::Relaxed);

        // Idle with empty queues: either done, or orphaned locks to clear.
        if live == 0 && job_q.is_empty() && retry_q.is_empty() {
            let leftover: Vec<Arc<Segment>> = item
                .snapshot_segments()
                .into_iter()
                .filter(|s| !s.is_downloaded())
                .collect();
            if leftover.is_empty() {
                item.live_connections.store(0, Ordering::Relaxed);
                item.remaining_parts.store(0, Ordering::Relaxed);
                return PoolExit::AllDownloaded;
            }
            for seg in leftover {
                seg.unlock();
                job_q.push_back(seg);
            }
        }
    }
}

/// Consult the refresh hook after a stale-URL report.
///
/// The item sits in `refreshing_url` for the duration; on success the new
/// addressing is applied and the segment retried, on failure (or once the
/// retry budget is spent) the item is fatal.
fn refresh_item_url(
    item: &Arc<DownloadItem>,
    refresher: &dyn UrlRefresher,
    attempts: &mut u32,
    retries: u32,
    policy: &FetchPolicy,
) -> Result<(), DownloadError> {
    if *attempts >= retries {
        return Err(DownloadError::FatalNetwork(format!(
            "url expired and refresh attempts ({retries}) exhausted"
        )));
    }
    *attempts += 1;
    item.set_status(Status::RefreshingUrl);

    let refreshed = refresher.refresh(&item.url);
    let applied = match refreshed {
        Some(desc) => {
            if let Some(url) = desc.eff_url {
                item.set_eff_url(url);
            }
            if desc.audio_url.is_some() {
                item.set_audio_url(desc.audio_url);
            }
            if item.subtypes().hls {
                // Fragment URLs are baked into the segments; rewrite them
                // from a fresh media playlist.
                if let Err(e) = crate::hls::refresh_fragment_urls(item, policy) {
                    tracing::warn!(uid = %item.uid, error = %e, "fragment url refresh failed");
                }
            }
            true
        }
        None => false,
    };

    if applied {
        item.set_status(Status::Downloading);
        tracing::info!(uid = %item.uid, attempt = *attempts, "url refreshed, resuming");
        Ok(())
    } else {
        Err(DownloadError::FatalNetwork(
            "url expired and the resolver could not refresh it".to_string(),
        ))
    }
}
