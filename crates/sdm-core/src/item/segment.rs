//! Segment: one unit of concurrent fetch work.
//!
//! Either a byte range of a single file or an entire fragment. Lifecycle
//! flags are atomics so workers, the pool, and the file manager can observe
//! them without a coarse lock; the range is behind a small mutex because
//! work stealing truncates it mid-flight.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// What a segment's bytes are, decides naming and post-processing routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    General,
    Video,
    Audio,
    /// An HLS AES-128 key file; fetched before the media segments using it.
    Key,
}

/// One unit of work for the pool.
///
/// Flag invariants: `completed` implies `downloaded`; `locked` is held by at
/// most one worker at a time.
#[derive(Debug)]
pub struct Segment {
    /// Absolute path of the per-segment temp file.
    pub name: PathBuf,
    /// Creation index; also the merge order for unranged segments.
    pub num: usize,
    /// Segment-specific URL (fragments/keys). Ranged segments use the item's
    /// effective URL instead and leave this empty. Mutable because an
    /// item-level refresh may rewrite fragment URLs in place.
    url: Mutex<String>,
    /// Item temp file this segment is spliced into.
    pub tempfile: PathBuf,
    pub media_type: MediaType,
    /// False when assembly is delegated to the transcoder (encrypted HLS).
    pub merge: bool,
    /// Local key file this media segment is encrypted with, if any.
    pub key_path: Option<PathBuf>,

    /// Inclusive byte range; `None` for whole-file or fragment segments.
    range: Mutex<Option<(u64, u64)>>,
    /// Expected size for unranged segments when known; 0 = unknown.
    fragment_size: AtomicU64,
    downloaded: AtomicBool,
    completed: AtomicBool,
    locked: AtomicBool,
}

impl Segment {
    /// Ranged segment over the item's effective URL.
    pub fn ranged(num: usize, name: PathBuf, tempfile: PathBuf, start: u64, end: u64) -> Self {
        Self {
            name,
            num,
            url: Mutex::new(String::new()),
            tempfile,
            media_type: MediaType::General,
            merge: true,
            key_path: None,
            range: Mutex::new(Some((start, end))),
            fragment_size: AtomicU64::new(0),
            downloaded: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            locked: AtomicBool::new(false),
        }
    }

    /// Whole-file or fragment segment with its own URL.
    pub fn whole(
        num: usize,
        name: PathBuf,
        url: String,
        tempfile: PathBuf,
        media_type: MediaType,
        merge: bool,
    ) -> Self {
        Self {
            name,
            num,
            url: Mutex::new(url),
            tempfile,
            media_type,
            merge,
            key_path: None,
            range: Mutex::new(None),
            fragment_size: AtomicU64::new(0),
            downloaded: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            locked: AtomicBool::new(false),
        }
    }

    /// Segment-specific URL; empty for ranged segments.
    pub fn url(&self) -> String {
        self.url.lock().unwrap().clone()
    }

    /// Rewrite the URL after an item-level refresh.
    pub fn set_url(&self, url: String) {
        *self.url.lock().unwrap() = url;
    }

    pub fn range(&self) -> Option<(u64, u64)> {
        *self.range.lock().unwrap()
    }

    /// Replace the range. Used when restoring from a progress sidecar.
    pub fn set_range(&self, range: Option<(u64, u64)>) {
        *self.range.lock().unwrap() = range;
    }

    /// Truncate this segment's range to `[start, new_end]` for work stealing.
    /// Returns the old end so the caller can build the tail segment.
    pub fn truncate_end(&self, new_end: u64) -> Option<u64> {
        let mut guard = self.range.lock().unwrap();
        let (start, end) = (*guard)?;
        if new_end >= end || new_end < start {
            return None;
        }
        *guard = Some((start, new_end));
        Some(end)
    }

    pub fn set_fragment_size(&self, size: u64) {
        self.fragment_size.store(size, Ordering::Relaxed);
    }

    /// Expected byte count: range length when ranged, known fragment size
    /// otherwise (0 = unknown until the server finishes sending).
    pub fn target_length(&self) -> u64 {
        match self.range() {
            Some((start, end)) => end - start + 1,
            None => self.fragment_size.load(Ordering::Relaxed),
        }
    }

    /// Current length of the per-segment temp file.
    pub fn on_disk_size(&self) -> u64 {
        std::fs::metadata(&self.name).map(|m| m.len()).unwrap_or(0)
    }

    /// Bytes still expected. An in-flight transfer may overshoot after a
    /// steal truncates the range; clamp at zero.
    pub fn remaining(&self) -> u64 {
        self.target_length().saturating_sub(self.on_disk_size())
    }

    pub fn is_downloaded(&self) -> bool {
        self.downloaded.load(Ordering::Acquire)
    }

    pub fn mark_downloaded(&self) {
        self.downloaded.store(true, Ordering::Release);
    }

    /// Forget previous progress (sidecar mismatch or truncated file).
    pub fn reset(&self) {
        self.downloaded.store(false, Ordering::Release);
        self.completed.store(false, Ordering::Release);
        self.locked.store(false, Ordering::Release);
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn mark_completed(&self) {
        debug_assert!(self.is_downloaded());
        self.completed.store(true, Ordering::Release);
    }

    /// Undo the spliced flag only; used when the temp file is rebuilt on
    /// resume and kept per-segment files are re-spliced.
    pub fn clear_completed(&self) {
        self.completed.store(false, Ordering::Release);
    }

    /// Acquire the worker lock. Returns false if another worker holds it.
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// File name without the folder, for logs.
    pub fn basename(&self) -> String {
        self.name
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Per-segment temp file path for a plain ranged/whole download.
pub fn segment_file(temp_folder: &Path, num: usize) -> PathBuf {
    temp_folder.join(num.to_string())
}
