//! Download item: the aggregate of segments plus metadata for one job.
//!
//! The item owns its temp folder and segment list. Exactly one brain thread
//! mutates segment membership; workers touch only their assigned segment's
//! flags; views hold observer references and never mutate.

mod descriptor;
pub mod progress;
mod segment;
mod status;

pub use descriptor::{FragmentRef, NoRefresh, StreamDescriptor, SubtitleSource, UrlRefresher};
pub use segment::{segment_file, MediaType, Segment};
pub use status::Status;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex, RwLock};

use crate::config::RuntimeConfig;
use crate::events::ItemEvent;
use crate::naming;

/// What kind of payload this item is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    #[default]
    General,
    Video,
    Audio,
    Subtitle,
    Key,
}

/// Protocol traits of the selected stream. Set by the resolver and extended
/// during pre-processing (e.g. `encrypted` once a key line is seen).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtypes {
    /// Separate video and audio streams that need a merge step.
    #[serde(default)]
    pub dash: bool,
    /// m3u8 manifest-driven stream.
    #[serde(default)]
    pub hls: bool,
    /// Fragment list instead of a single resource.
    #[serde(default)]
    pub fragmented: bool,
    /// At least one media segment is AES-128 encrypted.
    #[serde(default)]
    pub encrypted: bool,
}

/// One logical download job.
pub struct DownloadItem {
    /// Stable id derived from (folder, name).
    pub uid: String,
    /// Primary URL as given by the user.
    pub url: String,
    eff_url: RwLock<String>,
    pub manifest_url: Option<String>,
    playlist_url: RwLock<Option<String>>,
    audio_url: RwLock<Option<String>>,
    pub format_id: Option<String>,
    pub audio_format_id: Option<String>,
    /// Request-local headers; never applied to other items.
    pub http_headers: HashMap<String, String>,

    pub folder: PathBuf,
    /// Final file name including extension.
    pub name: String,
    pub kind: ItemKind,
    subtypes: RwLock<Subtypes>,

    temp_folder: PathBuf,
    temp_file: PathBuf,
    audio_file: PathBuf,
    target_file: PathBuf,

    total_size: AtomicU64,
    downloaded: AtomicU64,
    rate: AtomicU64,
    status: Mutex<Status>,
    segments: RwLock<Vec<Arc<Segment>>>,

    pub live_connections: AtomicUsize,
    pub remaining_parts: AtomicUsize,
    pub errors: AtomicU32,

    // Policy, copied from config at creation so later config edits don't
    // affect in-flight items.
    pub resumable: RwLock<bool>,
    pub max_connections: usize,
    pub refresh_url_retries: u32,
    pub on_completion_command: Option<String>,
    pub shutdown_pc: bool,
    /// Fire time as unix seconds for scheduled items.
    pub scheduled_at: Mutex<Option<u64>>,

    pub metadata_content: Option<String>,
    /// Subtitles offered by the resolver and/or the master manifest.
    pub available_subtitles: HashMap<String, Vec<SubtitleSource>>,
    pub selected_subtitles: RwLock<HashMap<String, SubtitleSource>>,
    /// Fragment lists carried from the descriptor for fragmented streams.
    pub fragments: Vec<FragmentRef>,
    pub audio_fragments: Vec<FragmentRef>,

    events: Mutex<Option<SyncSender<ItemEvent>>>,
}

impl DownloadItem {
    /// Build an item from a resolver descriptor and a target location.
    pub fn from_descriptor(
        desc: &StreamDescriptor,
        folder: &Path,
        name: String,
        cfg: &RuntimeConfig,
    ) -> Self {
        let uid = naming::uid_for(folder, &name);
        let temp_folder = naming::temp_folder_for(folder, &name);
        let temp_file = temp_folder.join(&name);
        let (stem, ext) = naming::split_name_ext(&name);
        let audio_file = temp_folder.join(format!("audio_{stem}{ext}"));
        let target_file = folder.join(&name);

        DownloadItem {
            uid,
            url: desc.url.clone(),
            eff_url: RwLock::new(desc.eff_url.clone().unwrap_or_else(|| desc.url.clone())),
            manifest_url: desc.manifest_url.clone(),
            playlist_url: RwLock::new(None),
            audio_url: RwLock::new(desc.audio_url.clone()),
            format_id: desc.format_id.clone(),
            audio_format_id: desc.audio_format_id.clone(),
            http_headers: desc.http_headers.clone(),
            folder: folder.to_path_buf(),
            name,
            kind: desc.kind,
            subtypes: RwLock::new(desc.subtypes),
            temp_folder,
            temp_file,
            audio_file,
            target_file,
            total_size: AtomicU64::new(desc.total_size.unwrap_or(0)),
            downloaded: AtomicU64::new(0),
            rate: AtomicU64::new(0),
            status: Mutex::new(Status::Pending),
            segments: RwLock::new(Vec::new()),
            live_connections: AtomicUsize::new(0),
            remaining_parts: AtomicUsize::new(0),
            errors: AtomicU32::new(0),
            resumable: RwLock::new(false),
            max_connections: cfg.max_connections.max(1),
            refresh_url_retries: cfg.refresh_url_retries,
            on_completion_command: None,
            shutdown_pc: false,
            scheduled_at: Mutex::new(None),
            metadata_content: desc.metadata.clone(),
            available_subtitles: desc.subtitles.clone(),
            selected_subtitles: RwLock::new(HashMap::new()),
            fragments: desc.fragments.clone(),
            audio_fragments: desc.audio_fragments.clone(),
            events: Mutex::new(None),
        }
    }

    // --- paths -----------------------------------------------------------

    pub fn temp_folder(&self) -> &Path {
        &self.temp_folder
    }

    pub fn temp_file(&self) -> &Path {
        &self.temp_file
    }

    /// DASH audio temp file.
    pub fn audio_file(&self) -> &Path {
        &self.audio_file
    }

    pub fn target_file(&self) -> &Path {
        &self.target_file
    }

    // --- addressing ------------------------------------------------------

    pub fn eff_url(&self) -> String {
        self.eff_url.read().unwrap().clone()
    }

    pub fn set_eff_url(&self, url: String) {
        *self.eff_url.write().unwrap() = url;
    }

    pub fn playlist_url(&self) -> Option<String> {
        self.playlist_url.read().unwrap().clone()
    }

    pub fn set_playlist_url(&self, url: Option<String>) {
        *self.playlist_url.write().unwrap() = url;
    }

    pub fn audio_url(&self) -> Option<String> {
        self.audio_url.read().unwrap().clone()
    }

    pub fn set_audio_url(&self, url: Option<String>) {
        *self.audio_url.write().unwrap() = url;
    }

    pub fn subtypes(&self) -> Subtypes {
        *self.subtypes.read().unwrap()
    }

    pub fn mark_encrypted(&self) {
        self.subtypes.write().unwrap().encrypted = true;
    }

    pub fn mark_fragmented(&self) {
        self.subtypes.write().unwrap().fragmented = true;
    }

    // --- sizing & progress ----------------------------------------------

    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Relaxed)
    }

    pub fn set_total_size(&self, size: u64) {
        self.total_size.store(size, Ordering::Relaxed);
    }

    /// Bytes received this run, clamped to the total when it is known (a
    /// transfer can overshoot a range that work stealing truncated).
    pub fn downloaded(&self) -> u64 {
        let raw = self.downloaded.load(Ordering::Relaxed);
        let total = self.total_size();
        if total > 0 {
            raw.min(total)
        } else {
            raw
        }
    }

    pub fn set_downloaded(&self, bytes: u64) {
        self.downloaded.store(bytes, Ordering::Relaxed);
    }

    /// Worker progress callback target; monotonic within one run.
    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn rate(&self) -> u64 {
        self.rate.load(Ordering::Relaxed)
    }

    pub fn set_rate(&self, bytes_per_sec: u64) {
        self.rate.store(bytes_per_sec, Ordering::Relaxed);
    }

    pub fn progress_percent(&self) -> u32 {
        let total = self.total_size();
        if total == 0 {
            return 0;
        }
        (self.downloaded().saturating_mul(100) / total).min(100) as u32
    }

    /// Sum of per-segment on-disk bytes, clipped to each target length.
    pub fn aggregate_progress(&self) -> u64 {
        self.snapshot_segments()
            .iter()
            .map(|s| {
                let target = s.target_length();
                let on_disk = s.on_disk_size();
                if target > 0 {
                    on_disk.min(target)
                } else {
                    on_disk
                }
            })
            .sum()
    }

    // --- status ----------------------------------------------------------

    pub fn status(&self) -> Status {
        *self.status.lock().unwrap()
    }

    /// Attempt a transition. Illegal transitions are ignored and return
    /// false; cancelling an already-cancelled item is a quiet no-op.
    pub fn set_status(&self, to: Status) -> bool {
        let changed = {
            let mut guard = self.status.lock().unwrap();
            if !guard.can_transition(to) {
                return false;
            }
            *guard = to;
            true
        };
        if changed {
            tracing::debug!(uid = %self.uid, status = %to, "status change");
            self.emit(ItemEvent::StatusChanged {
                uid: self.uid.clone(),
                status: to,
            });
        }
        changed
    }

    /// Restore a persisted status without transition validation. Only the
    /// registry uses this when rebuilding items at startup.
    pub fn force_status(&self, status: Status) {
        *self.status.lock().unwrap() = status;
    }

    /// Cooperative cancel signal checked by workers and the file manager.
    pub fn cancel_requested(&self) -> bool {
        self.status() != Status::Downloading && self.status() != Status::RefreshingUrl
    }

    // --- segments --------------------------------------------------------

    /// Append a segment. Only the brain (or the pool it owns) calls this.
    pub fn push_segment(&self, seg: Arc<Segment>) {
        self.segments.write().unwrap().push(seg);
    }

    pub fn replace_segments(&self, segs: Vec<Arc<Segment>>) {
        *self.segments.write().unwrap() = segs;
    }

    /// Cheap copy of the current list; readers work on snapshots.
    pub fn snapshot_segments(&self) -> Vec<Arc<Segment>> {
        self.segments.read().unwrap().clone()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.read().unwrap().len()
    }

    // --- events ----------------------------------------------------------

    pub fn attach_events(&self, tx: SyncSender<ItemEvent>) {
        *self.events.lock().unwrap() = Some(tx);
    }

    pub(crate) fn emit(&self, event: ItemEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            // Bounded channel; a saturated observer loses events rather than
            // stalling the engine.
            let _ = tx.try_send(event);
        }
    }

    pub fn emit_progress(&self) {
        let total = self.total_size();
        let rate = self.rate();
        let downloaded = self.downloaded();
        let eta_secs = if rate > 0 && total > downloaded {
            Some((total - downloaded) / rate)
        } else {
            None
        };
        self.emit(ItemEvent::Progress {
            uid: self.uid.clone(),
            downloaded,
            total_size: total,
            rate,
            eta_secs,
        });
    }

    pub fn emit_failure(&self, message: impl Into<String>) {
        self.emit(ItemEvent::Failed {
            uid: self.uid.clone(),
            message: message.into(),
        });
    }

    // --- temp file lifecycle ---------------------------------------------

    /// Remove the temp folder with per-segment files, manifests, and the
    /// progress sidecar. Skipped in debug-retain mode.
    pub fn delete_tempfiles(&self, keep_temp: bool) {
        if keep_temp {
            tracing::debug!(uid = %self.uid, "keeping temp folder (debug)");
            return;
        }
        if self.temp_folder.is_dir() {
            if let Err(e) = std::fs::remove_dir_all(&self.temp_folder) {
                tracing::warn!(uid = %self.uid, error = %e, "failed to remove temp folder");
            }
        }
    }
}

impl std::fmt::Debug for DownloadItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadItem")
            .field("uid", &self.uid)
            .field("name", &self.name)
            .field("status", &self.status())
            .field("total_size", &self.total_size())
            .field("segments", &self.segment_count())
            .finish()
    }
}
