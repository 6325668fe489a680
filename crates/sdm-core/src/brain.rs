//! Per-item brain: pre-process, spawn the file manager and worker pool,
//! monitor until a terminal state.
//!
//! One brain runs per admitted item, on a blocking thread owned by the
//! scheduler. It is the only mutator of segment membership; the pool and
//! file manager get the item by `Arc` and touch only segment flags and
//! their own files.

use std::sync::Arc;
use std::time::Instant;

use crate::assembler::{self, AssemblerOptions};
use crate::checksum;
use crate::config::RuntimeConfig;
use crate::error::DownloadError;
use crate::fetcher::{self, FetchPolicy};
use crate::hls;
use crate::item::{progress, DownloadItem, Status, UrlRefresher};
use crate::planner;
use crate::pool::{self, PoolExit, PoolOptions};
use crate::transcoder::Transcoder;

/// Smoothing factor for the displayed rate (simple EMA).
const RATE_ALPHA: f64 = 0.3;

/// Drive one item from `pending` to a terminal state. Blocking.
pub fn run(item: Arc<DownloadItem>, cfg: &RuntimeConfig, refresher: Arc<dyn UrlRefresher>) {
    if !item.set_status(Status::Downloading) {
        tracing::warn!(uid = %item.uid, status = %item.status(), "item not admissible, brain exiting");
        return;
    }
    tracing::info!(uid = %item.uid, name = %item.name, "download starting");

    let policy = FetchPolicy::from_config(cfg);
    if let Err(e) = prepare(&item, cfg, &policy) {
        tracing::error!(uid = %item.uid, error = %e, "pre-process failed");
        item.emit_failure(e.to_string());
        item.set_status(Status::Error);
        return;
    }

    let transcoder = Transcoder::new(&cfg.ffmpeg_path);
    let opts = AssemblerOptions {
        // HLS per-segment files feed the transcoder and must survive until
        // post-processing; ranged segments are kept for cheap re-splicing on
        // resume. Only plain fragment streams drop them as they merge.
        keep_segments: !item.subtypes().fragmented || item.subtypes().hls,
        keep_temp: cfg.keep_temp,
        write_metadata: cfg.write_metadata,
    };

    let fm_handle = {
        let item = Arc::clone(&item);
        let transcoder = transcoder.clone();
        std::thread::spawn(move || assembler::run(&item, &transcoder, &opts))
    };

    let pool_handle = {
        let item = Arc::clone(&item);
        let opts = PoolOptions::new(cfg, &item);
        let policy = policy.clone();
        let refresher = Arc::clone(&refresher);
        std::thread::spawn(move || {
            match pool::run(&item, &opts, &policy, refresher.as_ref()) {
                PoolExit::AllDownloaded => {
                    tracing::debug!(uid = %item.uid, "pool drained, all segments downloaded");
                }
                PoolExit::StatusChanged => {
                    tracing::debug!(uid = %item.uid, "pool stopped on status change");
                }
                PoolExit::Fatal(e) => {
                    tracing::error!(uid = %item.uid, error = %e, "pool failed");
                    item.emit_failure(e.to_string());
                    item.set_status(Status::Error);
                }
            }
        })
    };

    monitor(&item);

    let _ = pool_handle.join();
    let _ = fm_handle.join();

    match item.status() {
        Status::Completed => {
            tracing::info!(uid = %item.uid, target = %item.target_file().display(), "completed");
            if cfg.checksum {
                match checksum::md5_sha256_path(item.target_file()) {
                    Ok((md5, sha256)) => {
                        tracing::info!(uid = %item.uid, %md5, %sha256, "checksums");
                    }
                    Err(e) => tracing::warn!(uid = %item.uid, error = %e, "checksum failed"),
                }
            }
        }
        Status::Cancelled => {
            // Temp folder stays for resume; progress was saved by the file
            // manager on its way out.
            tracing::info!(uid = %item.uid, "cancelled");
        }
        other => {
            tracing::info!(uid = %item.uid, status = %other, "brain quitting");
        }
    }
}

/// Build the segment list (HLS pre-process or range planning), restore
/// prior progress, and pre-create files.
fn prepare(
    item: &Arc<DownloadItem>,
    cfg: &RuntimeConfig,
    policy: &FetchPolicy,
) -> Result<(), DownloadError> {
    if item.subtypes().hls {
        hls::pre_process(item, policy)?;
    } else {
        let (video_size, audio_size) = probe_sizes(item, policy);
        item.replace_segments(planner::build_initial_segments(
            item,
            cfg.segment_size_threshold,
            video_size,
            audio_size,
        ));
    }

    if progress::load_progress(item)
        .map_err(|e| DownloadError::Filesystem(e.to_string()))?
    {
        reset_spliced_state(item);
    } else {
        item.set_downloaded(0);
    }

    assembler::prepare_files(item)?;
    Ok(())
}

/// Resolve sizes and range support before planning.
///
/// A failed probe is not fatal: the item falls back to a single streamed
/// segment and the real GET surfaces any genuine error.
fn probe_sizes(item: &Arc<DownloadItem>, policy: &FetchPolicy) -> (u64, u64) {
    // Fragment streams: sizes come from the manifest (or stay unknown); a
    // probe of the base URL would report the first fragment's length.
    if item.subtypes().fragmented {
        return (0, 0);
    }

    let mut video_size = 0u64;
    let mut audio_size = 0u64;

    match fetcher::probe(&item.eff_url(), &item.http_headers, policy) {
        Ok(head) => {
            *item.resumable.write().unwrap() = head.accept_ranges;
            if let Some(url) = head.effective_url {
                item.set_eff_url(url);
            }
            if let Some(len) = head.content_length {
                video_size = len;
            }
            if !head.accept_ranges {
                tracing::info!(uid = %item.uid, "server does not accept ranges, single connection");
                video_size = 0;
            }
        }
        Err(e) => {
            tracing::warn!(uid = %item.uid, error = %e, "probe failed, assuming unknown size");
        }
    }

    if item.subtypes().dash && !item.subtypes().fragmented {
        if let Some(audio_url) = item.audio_url() {
            match fetcher::probe(&audio_url, &item.http_headers, policy) {
                Ok(head) => {
                    audio_size = head.content_length.unwrap_or(0);
                    if !head.accept_ranges {
                        audio_size = 0;
                    }
                }
                Err(e) => {
                    tracing::warn!(uid = %item.uid, error = %e, "audio probe failed");
                }
            }
        }
    }

    if video_size > 0 {
        item.set_total_size(video_size + audio_size);
    }
    (video_size, audio_size)
}

/// Ranged items re-splice from their kept per-segment files, so spliced
/// state from the previous run is discarded along with the temp file
/// contents. Fragment streams keep appended data and completed flags.
fn reset_spliced_state(item: &DownloadItem) {
    let segments = item.snapshot_segments();
    let ranged_only = segments
        .iter()
        .filter(|s| s.merge)
        .all(|s| s.range().is_some());
    if !ranged_only {
        return;
    }
    for seg in &segments {
        seg.clear_completed();
    }
    for target in [item.temp_file(), item.audio_file()] {
        if target.exists() {
            let _ = std::fs::File::create(target);
        }
    }
}

/// Progress/rate reporting loop; returns when the item reaches a terminal
/// state.
fn monitor(item: &Arc<DownloadItem>) {
    let mut last_bytes = item.downloaded();
    let mut last_instant = Instant::now();
    let mut rate = 0f64;

    loop {
        std::thread::sleep(std::time::Duration::from_millis(500));

        let now = Instant::now();
        let bytes = item.downloaded();
        let dt = now.duration_since(last_instant).as_secs_f64();
        if dt > 0.0 {
            let sample = (bytes.saturating_sub(last_bytes)) as f64 / dt;
            rate = RATE_ALPHA * sample + (1.0 - RATE_ALPHA) * rate;
        }
        last_bytes = bytes;
        last_instant = now;
        item.set_rate(rate as u64);
        item.emit_progress();

        if item.status().is_terminal() {
            return;
        }
    }
}
