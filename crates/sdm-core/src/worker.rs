//! Worker: binds the fetcher to one segment and reports the outcome.
//!
//! Owns no persistent state; the pool locks a segment, runs a worker on it,
//! and inspects the returned error kind. Resume is implicit: the per-segment
//! file is opened in append mode and the requested range starts past
//! whatever is already on disk.

use std::sync::Arc;

use crate::error::FetchError;
use crate::fetcher::{fetch, FetchPolicy, FetchRequest, FetchSink};
use crate::item::{DownloadItem, MediaType, Segment};

/// Picks the URL for a segment: fragments and keys carry their own; ranged
/// segments follow the item's current effective (or audio) URL so an
/// item-level refresh applies to every remaining segment.
pub fn segment_url(item: &DownloadItem, seg: &Segment) -> String {
    let own = seg.url();
    if !own.is_empty() {
        return own;
    }
    if seg.media_type == MediaType::Audio {
        if let Some(url) = item.audio_url() {
            return url;
        }
    }
    item.eff_url()
}

/// Effective inclusive range for this attempt, shifted past bytes already on
/// disk. Returns `Ok(None)` when the segment turns out to be complete.
fn effective_range(seg: &Segment) -> Option<Option<(u64, u64)>> {
    match seg.range() {
        Some((start, end)) => {
            let resume = seg.on_disk_size();
            let length = end - start + 1;
            if resume >= length {
                return None;
            }
            Some(Some((start + resume, end)))
        }
        None => Some(None),
    }
}

/// Download one segment. The caller must hold the segment lock; it is
/// released here on every path.
///
/// On success the segment is marked `downloaded`. Errors are returned for
/// the pool to classify; the segment stays un-downloaded and unlocked so it
/// can be requeued.
pub fn run(
    item: &DownloadItem,
    seg: &Arc<Segment>,
    policy: &FetchPolicy,
) -> Result<(), FetchError> {
    let result = run_inner(item, seg, policy);
    seg.unlock();
    result
}

fn run_inner(
    item: &DownloadItem,
    seg: &Arc<Segment>,
    policy: &FetchPolicy,
) -> Result<(), FetchError> {
    let range = match effective_range(seg) {
        Some(r) => r,
        None => {
            // Already fully on disk (previous run or overshoot).
            seg.mark_downloaded();
            return Ok(());
        }
    };

    // A half-fetched fragment can't be range-resumed reliably; start it over.
    if range.is_none() && !seg.is_downloaded() && seg.on_disk_size() > 0 {
        std::fs::File::create(&seg.name)
            .map_err(|e| FetchError::Filesystem(format!("{}: {}", seg.name.display(), e)))?;
    }

    let url = segment_url(item, seg);
    let request = FetchRequest {
        url: &url,
        range,
        headers: &item.http_headers,
    };

    let outcome = fetch(
        &request,
        FetchSink::Append(&seg.name),
        policy,
        &|| item.cancel_requested(),
        &|n| item.add_downloaded(n),
    )?;

    match seg.range() {
        Some(_) => {
            // Trust the requested range, not the response Content-Length;
            // some servers omit it for ranged replies.
            if seg.on_disk_size() < seg.target_length() {
                return Err(FetchError::Network(format!(
                    "short transfer for {}: {} of {} bytes",
                    seg.basename(),
                    seg.on_disk_size(),
                    seg.target_length()
                )));
            }
        }
        None => {
            // Unknown-size segment: a 2xx completion defines its size.
            if seg.target_length() == 0 {
                seg.set_fragment_size(outcome.bytes_written);
            }
        }
    }

    seg.mark_downloaded();
    tracing::trace!(segment = %seg.basename(), bytes = outcome.bytes_written, "segment done");
    Ok(())
}
