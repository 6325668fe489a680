//! Progress sidecar: resume state persisted inside the item temp folder.
//!
//! A small JSON document enumerating segments by index with their ranges
//! and completion flags. On load every claim is reconciled against the
//! actual per-segment file sizes; anything that doesn't line up resets the
//! segment so its bytes are fetched again.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{DownloadItem, MediaType, Segment};

const SIDECAR_NAME: &str = "progress.json";

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    total_size: u64,
    downloaded: u64,
    segments: Vec<SegmentRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SegmentRecord {
    num: usize,
    /// Per-segment file name, relative to the temp folder.
    file: String,
    #[serde(default)]
    url: String,
    range: Option<(u64, u64)>,
    #[serde(default)]
    size: u64,
    media_type: MediaType,
    merge: bool,
    #[serde(default)]
    key_file: Option<String>,
    downloaded: bool,
    completed: bool,
}

pub fn sidecar_path(temp_folder: &Path) -> PathBuf {
    temp_folder.join(SIDECAR_NAME)
}

/// Serialize the item's current segment state into the temp folder.
/// Written via temp file + rename so a crash never leaves a torn sidecar.
pub fn save_progress(item: &DownloadItem) -> Result<()> {
    let temp_folder = item.temp_folder();
    if !temp_folder.is_dir() {
        return Ok(());
    }

    let segments = item.snapshot_segments();
    let records: Vec<SegmentRecord> = segments
        .iter()
        .map(|seg| SegmentRecord {
            num: seg.num,
            file: seg.basename(),
            url: seg.url(),
            range: seg.range(),
            size: seg.target_length(),
            media_type: seg.media_type,
            merge: seg.merge,
            key_file: seg
                .key_path
                .as_ref()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned()),
            downloaded: seg.is_downloaded(),
            completed: seg.is_completed(),
        })
        .collect();

    let sidecar = Sidecar {
        total_size: item.total_size(),
        downloaded: item.downloaded(),
        segments: records,
    };

    let path = sidecar_path(temp_folder);
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(&sidecar)?;
    std::fs::write(&tmp, data).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, &path).with_context(|| format!("rename to {}", path.display()))?;
    Ok(())
}

/// Restore segment state from the sidecar, if one exists and matches.
///
/// Rebuilds the item's segment list (including any split segments created
/// by work stealing in the previous run) and reconciles each record's
/// `downloaded` flag against the on-disk file size. Returns true when a
/// sidecar was applied.
pub fn load_progress(item: &DownloadItem) -> Result<bool> {
    let temp_folder = item.temp_folder();
    let path = sidecar_path(temp_folder);
    if !path.is_file() {
        return Ok(false);
    }

    let data = std::fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    let sidecar: Sidecar = match serde_json::from_slice(&data) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(uid = %item.uid, error = %e, "corrupt progress sidecar ignored");
            return Ok(false);
        }
    };

    // A changed total size means the remote resource changed; stale progress
    // must not be trusted.
    if sidecar.total_size != item.total_size() {
        tracing::info!(
            uid = %item.uid,
            saved = sidecar.total_size,
            current = item.total_size(),
            "sidecar size mismatch, starting fresh"
        );
        return Ok(false);
    }

    let current = item.snapshot_segments();
    let restored: Vec<Arc<Segment>> = sidecar
        .segments
        .iter()
        .map(|rec| rebuild_segment(item, &current, rec))
        .collect();

    item.replace_segments(restored);
    item.set_downloaded(item.aggregate_progress());
    tracing::info!(
        uid = %item.uid,
        segments = sidecar.segments.len(),
        downloaded = item.downloaded(),
        "restored progress from sidecar"
    );
    Ok(true)
}

fn rebuild_segment(
    item: &DownloadItem,
    current: &[Arc<Segment>],
    rec: &SegmentRecord,
) -> Arc<Segment> {
    // Prefer the freshly built segment with the same index (it carries live
    // URLs and key paths); fall back to reconstructing from the record, which
    // covers split segments the initial plan doesn't know about.
    let seg = current
        .iter()
        .find(|s| s.num == rec.num)
        .cloned()
        .unwrap_or_else(|| {
            let name = item.temp_folder().join(&rec.file);
            let seg = if let Some((start, end)) = rec.range {
                Segment::ranged(rec.num, name, item.temp_file().to_path_buf(), start, end)
            } else {
                Segment::whole(
                    rec.num,
                    name,
                    rec.url.clone(),
                    item.temp_file().to_path_buf(),
                    rec.media_type,
                    rec.merge,
                )
            };
            Arc::new(seg)
        });

    // The plan may carry a wider range than the sidecar when the previous
    // run split this segment; the sidecar is authoritative.
    if rec.range.is_some() && seg.range() != rec.range {
        seg.set_range(rec.range);
    }
    if rec.range.is_none() && rec.size > 0 {
        seg.set_fragment_size(rec.size);
    }

    seg.reset();
    if rec.completed {
        // Already spliced into the temp file; the per-segment file may be gone.
        seg.mark_downloaded();
        seg.mark_completed();
        return seg;
    }

    let target = seg.target_length();
    let on_disk = seg.on_disk_size();
    if rec.downloaded {
        let verified = if target > 0 {
            on_disk >= target
        } else {
            on_disk > 0
        };
        if verified {
            seg.mark_downloaded();
        } else {
            tracing::debug!(
                segment = %seg.basename(),
                expected = target,
                on_disk,
                "sidecar claimed downloaded but file is short; refetching"
            );
        }
    } else if target > 0 && on_disk > target {
        // Longer than expected (e.g. plan changed): start this one over.
        let _ = std::fs::remove_file(&seg.name);
    }
    seg
}
