//! Work stealing: split the largest in-flight segment so an idle worker
//! can take its tail.
//!
//! The split truncates the victim's range at the midpoint of its remaining
//! bytes and appends a new segment for the rest. The victim's transfer may
//! overshoot the truncated range; the file manager splices exactly the
//! target length, so overshoot is harmless. Byte offsets keep the final
//! file independent of which worker finishes first.

use std::sync::Arc;

use crate::item::{segment_file, DownloadItem, Segment};

/// Split the live segment with the most remaining bytes, if any has more
/// than `threshold` left. Returns the new tail segment, already appended to
/// the item's list; the caller enqueues it.
pub fn split_largest(item: &DownloadItem, threshold: u64) -> Option<Arc<Segment>> {
    let candidates = item.snapshot_segments();
    let victim = candidates
        .iter()
        .filter(|s| !s.is_downloaded() && s.range().is_some() && s.remaining() > threshold)
        .max_by_key(|s| s.remaining())?;

    let (start, end) = victim.range()?;
    let remaining = victim.remaining();
    let mid = start + remaining / 2;
    if mid >= end || mid < start {
        return None;
    }

    let old_end = victim.truncate_end(mid)?;
    debug_assert_eq!(old_end, end);

    let num = item.segment_count();
    let mut tail = Segment::ranged(
        num,
        segment_file(item.temp_folder(), num),
        victim.tempfile.clone(),
        mid + 1,
        end,
    );
    tail.media_type = victim.media_type;
    let tail = Arc::new(tail);
    item.push_segment(Arc::clone(&tail));

    tracing::debug!(
        victim = %victim.basename(),
        tail = %tail.basename(),
        range = ?tail.range(),
        "split segment for idle worker"
    );
    Some(tail)
}
