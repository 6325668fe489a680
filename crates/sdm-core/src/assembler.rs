//! File manager: splice completed segments into the item temp file, then
//! hand off to post-processing and finalize.
//!
//! Runs on its own thread next to the pool. Each pass snapshots the
//! segment list, splices whatever finished since the last pass, and stops
//! early when an unranged segment is still missing (those must land in
//! order). Ranged segments seek to their absolute offsets, so their
//! completion order doesn't matter.

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::Duration;

use crate::error::DownloadError;
use crate::item::{progress, DownloadItem, Segment, Status};
use crate::postprocess;
use crate::transcoder::Transcoder;

/// Pause between splice passes; batches work without noticeable lag.
const PASS_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct AssemblerOptions {
    /// Keep per-segment files after splicing (HLS needs them for the
    /// transcoder; debug mode keeps everything).
    pub keep_segments: bool,
    pub keep_temp: bool,
    pub write_metadata: bool,
}

/// Pre-create the temp folder, the item temp file(s), and every per-segment
/// file so workers and splicing can open them unconditionally.
pub fn prepare_files(item: &DownloadItem) -> Result<(), DownloadError> {
    let fs_err = |e: std::io::Error| DownloadError::Filesystem(e.to_string());
    std::fs::create_dir_all(item.temp_folder()).map_err(fs_err)?;

    let mut targets = vec![item.temp_file().to_path_buf()];
    for seg in item.snapshot_segments() {
        if !targets.contains(&seg.tempfile) {
            targets.push(seg.tempfile.clone());
        }
        touch(&seg.name).map_err(fs_err)?;
    }
    for target in targets {
        touch(&target).map_err(fs_err)?;
    }
    Ok(())
}

fn touch(path: &std::path::Path) -> std::io::Result<()> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(|_| ())
}

/// Main loop: splice until every segment is completed, then run the
/// post-processing pipeline and finalize. Exits early when the item leaves
/// `downloading`; progress is persisted on every exit path.
pub fn run(item: &Arc<DownloadItem>, transcoder: &Transcoder, opts: &AssemblerOptions) {
    let result = run_inner(item, transcoder, opts);

    if let Err(e) = result {
        tracing::error!(uid = %item.uid, error = %e, "file manager failed");
        item.emit_failure(e.to_string());
        item.set_status(Status::Error);
    }

    if item.temp_folder().is_dir() {
        if let Err(e) = progress::save_progress(item) {
            tracing::warn!(uid = %item.uid, error = %e, "failed to save progress sidecar");
        }
    }
    tracing::debug!(uid = %item.uid, "file manager quitting");
}

fn run_inner(
    item: &Arc<DownloadItem>,
    transcoder: &Transcoder,
    opts: &AssemblerOptions,
) -> Result<(), DownloadError> {
    loop {
        std::thread::sleep(PASS_INTERVAL);

        let mut pending: Vec<Arc<Segment>> = item
            .snapshot_segments()
            .into_iter()
            .filter(|s| !s.is_completed())
            .collect();
        // Ranged segments sort by absolute offset (cheaper writes); unranged
        // ones keep creation order behind them.
        pending.sort_by_key(|s| match s.range() {
            Some((start, _)) => (0u8, start, s.num),
            None => (1u8, 0, s.num),
        });

        if pending.is_empty() {
            postprocess::run(item, transcoder, opts)?;
            return Ok(());
        }

        for seg in &pending {
            if !seg.is_downloaded() {
                if seg.range().is_none() {
                    // Appended data must land in order; wait for this one.
                    break;
                }
                continue;
            }
            if seg.merge {
                splice(seg)?;
            }
            seg.mark_completed();
            tracing::trace!(segment = %seg.basename(), "segment completed");
            if seg.merge && !opts.keep_segments && !opts.keep_temp {
                let _ = std::fs::remove_file(&seg.name);
            }
        }

        // A url refresh parks the item in `refreshing_url` briefly; only a
        // real departure from the download phase stops the splice loop.
        let status = item.status();
        if status != Status::Downloading && status != Status::RefreshingUrl {
            return Ok(());
        }
    }
}

/// Copy one downloaded segment into its item temp file.
///
/// Ranged: seek to the absolute offset and copy exactly the target length;
/// a transfer may have overshot past a steal-truncated range and the excess
/// is ignored. Unranged: plain append.
fn splice(seg: &Segment) -> Result<(), DownloadError> {
    let fs_err =
        |e: std::io::Error| DownloadError::Filesystem(format!("{}: {}", seg.basename(), e));

    let src = std::fs::File::open(&seg.name).map_err(fs_err)?;
    match seg.range() {
        Some((start, _)) => {
            let expected = seg.target_length();
            let mut dst = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&seg.tempfile)
                .map_err(fs_err)?;
            dst.seek(SeekFrom::Start(start)).map_err(fs_err)?;
            let copied = std::io::copy(&mut src.take(expected), &mut dst).map_err(fs_err)?;
            if copied != expected {
                return Err(DownloadError::Filesystem(format!(
                    "{}: spliced {} of {} bytes",
                    seg.basename(),
                    copied,
                    expected
                )));
            }
            dst.flush().map_err(fs_err)?;
            // Dropping the handle here closes the file between segments,
            // which avoids long rename stalls seen on some systems.
        }
        None => {
            let mut src = src;
            let mut dst = std::fs::OpenOptions::new()
                .append(true)
                .open(&seg.tempfile)
                .map_err(fs_err)?;
            std::io::copy(&mut src, &mut dst).map_err(fs_err)?;
        }
    }
    Ok(())
}
