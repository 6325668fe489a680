//! Initial segment plan for an item.
//!
//! Three shapes: a single segment for unknown or small sizes, a size-
//! weighted split for large files, and one segment per fragment for
//! manifest streams. HLS items are planned by the HLS pre-processor
//! instead.

use std::sync::Arc;

use crate::item::{segment_file, DownloadItem, FragmentRef, MediaType, Segment};

/// Size-weighted split: four small leading segments so playback-while-
/// downloading can start early, and a 50% tail for sustained throughput.
const PROPORTIONS: [u64; 5] = [5, 10, 15, 20, 50];

/// Files smaller than `threshold * SINGLE_SEGMENT_FACTOR` get one segment.
const SINGLE_SEGMENT_FACTOR: u64 = 20;

/// Plan inclusive byte ranges for `size` bytes.
///
/// Returns one range for small sizes, otherwise the weighted split. The
/// result is contiguous, non-overlapping, and covers `[0, size-1]`.
pub fn plan_ranges(size: u64, threshold: u64) -> Vec<(u64, u64)> {
    if size == 0 {
        return Vec::new();
    }
    if size < threshold.saturating_mul(SINGLE_SEGMENT_FACTOR) {
        return vec![(0, size - 1)];
    }

    let mut out = Vec::with_capacity(PROPORTIONS.len());
    let mut offset = 0u64;
    for (i, pct) in PROPORTIONS.iter().enumerate() {
        let len = if i == PROPORTIONS.len() - 1 {
            // The tail absorbs all rounding remainder.
            size - offset
        } else {
            (size * pct) / 100
        };
        if len == 0 {
            continue;
        }
        out.push((offset, offset + len - 1));
        offset += len;
    }
    out
}

/// Build the initial segment list for a non-HLS item.
///
/// `video_size` is the best-known size of the main stream (0 = unknown);
/// `audio_size` is only meaningful for DASH items with a separate audio URL.
pub fn build_initial_segments(
    item: &DownloadItem,
    threshold: u64,
    video_size: u64,
    audio_size: u64,
) -> Vec<Arc<Segment>> {
    let temp_folder = item.temp_folder();
    let mut segments: Vec<Arc<Segment>> = Vec::new();

    if item.subtypes().fragmented && !item.fragments.is_empty() {
        push_fragments(
            &mut segments,
            &item.fragments,
            item,
            MediaType::Video,
            false,
        );
        push_fragments(
            &mut segments,
            &item.audio_fragments,
            item,
            MediaType::Audio,
            true,
        );
        return segments;
    }

    // Main stream.
    if video_size == 0 {
        // Unknown size: single streamed GET, appended as it arrives.
        segments.push(Arc::new(Segment::whole(
            0,
            segment_file(temp_folder, 0),
            String::new(),
            item.temp_file().to_path_buf(),
            MediaType::General,
            true,
        )));
    } else {
        for (start, end) in plan_ranges(video_size, threshold) {
            let num = segments.len();
            segments.push(Arc::new(Segment::ranged(
                num,
                segment_file(temp_folder, num),
                item.temp_file().to_path_buf(),
                start,
                end,
            )));
        }
    }

    // Separate DASH audio stream, written to its own temp file.
    if item.subtypes().dash && item.audio_url().is_some() {
        if audio_size == 0 {
            let num = segments.len();
            let seg = Segment::whole(
                num,
                segment_file(temp_folder, num),
                String::new(),
                item.audio_file().to_path_buf(),
                MediaType::Audio,
                true,
            );
            segments.push(Arc::new(seg));
        } else {
            for (start, end) in plan_ranges(audio_size, threshold) {
                let num = segments.len();
                let mut seg = Segment::ranged(
                    num,
                    segment_file(temp_folder, num),
                    item.audio_file().to_path_buf(),
                    start,
                    end,
                );
                seg.media_type = MediaType::Audio;
                segments.push(Arc::new(seg));
            }
        }
    }

    segments
}

fn push_fragments(
    segments: &mut Vec<Arc<Segment>>,
    fragments: &[FragmentRef],
    item: &DownloadItem,
    media_type: MediaType,
    audio: bool,
) {
    let tempfile = if audio {
        item.audio_file()
    } else {
        item.temp_file()
    };
    for frag in fragments {
        let num = segments.len();
        let seg = Segment::whole(
            num,
            segment_file(item.temp_folder(), num),
            frag.url.clone(),
            tempfile.to_path_buf(),
            media_type,
            true,
        );
        if frag.size > 0 {
            seg.set_fragment_size(frag.size);
        }
        segments.push(Arc::new(seg));
    }
}
