//! Controller: item registry, view commands, observer fan-out.
//!
//! Owns the in-memory item list (arrival order) and the persisted
//! registry. View layers call command methods and register observers;
//! they never mutate items directly. Events emitted by items land on a
//! bounded channel drained by a notifier thread, so a slow observer can
//! drop events but can never stall a download.

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex, RwLock};

use crate::config::RuntimeConfig;
use crate::events::{ItemEvent, ProgressSink};
use crate::item::{DownloadItem, ItemKind, Status, StreamDescriptor, Subtypes, UrlRefresher};
use crate::naming;
use crate::registry::{ItemRecord, Registry};
use crate::scheduler::{self, CompletionActions};

/// Observer channel depth; overflow drops events rather than blocking.
const EVENT_QUEUE_DEPTH: usize = 256;

pub struct Controller {
    cfg: RuntimeConfig,
    registry: Registry,
    refresher: Arc<dyn UrlRefresher>,
    items: RwLock<Vec<Arc<DownloadItem>>>,
    observers: Arc<RwLock<Vec<Box<dyn ProgressSink>>>>,
    events_tx: SyncSender<ItemEvent>,
    completion_command: Mutex<Option<String>>,
    shutdown_on_complete: AtomicBool,
    spawned_subtitles: Mutex<HashSet<String>>,
}

impl Controller {
    pub fn new(cfg: RuntimeConfig, registry: Registry, refresher: Arc<dyn UrlRefresher>) -> Self {
        let observers: Arc<RwLock<Vec<Box<dyn ProgressSink>>>> = Arc::new(RwLock::new(Vec::new()));
        let (events_tx, events_rx) = sync_channel::<ItemEvent>(EVENT_QUEUE_DEPTH);

        // Notifier: the only thread that talks to observers. Exits when the
        // controller (last sender) is dropped.
        let sinks = Arc::clone(&observers);
        std::thread::spawn(move || {
            while let Ok(event) = events_rx.recv() {
                for sink in sinks.read().unwrap().iter() {
                    sink.notify(&event);
                }
            }
        });

        Self {
            cfg,
            registry,
            refresher,
            items: RwLock::new(Vec::new()),
            observers,
            events_tx,
            completion_command: Mutex::new(None),
            shutdown_on_complete: AtomicBool::new(false),
            spawned_subtitles: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.cfg
    }

    pub fn add_observer(&self, sink: Box<dyn ProgressSink>) {
        self.observers.write().unwrap().push(sink);
    }

    // --- item commands ---------------------------------------------------

    /// Register a new item. Re-adding the same target path returns the
    /// existing item, re-queued if it had failed or been cancelled, so its
    /// temp folder is resumed rather than duplicated.
    pub fn add(
        &self,
        desc: StreamDescriptor,
        folder: &Path,
        name: Option<String>,
    ) -> Result<Arc<DownloadItem>> {
        let name = match name {
            Some(n) => naming::sanitize_filename(&n),
            None => {
                let url = desc.eff_url.as_deref().unwrap_or(&desc.url);
                naming::derive_filename(url, None)
            }
        };
        anyhow::ensure!(!name.is_empty(), "could not derive a file name");

        let uid = naming::uid_for(folder, &name);
        if let Some(existing) = self.get(&uid) {
            if matches!(existing.status(), Status::Cancelled | Status::Error) {
                existing.set_status(Status::Pending);
            }
            tracing::info!(uid = %uid, "item already known, resuming");
            return Ok(existing);
        }

        let item = Arc::new(DownloadItem::from_descriptor(&desc, folder, name, &self.cfg));
        item.attach_events(self.events_tx.clone());
        tracing::info!(uid = %item.uid, name = %item.name, "item added");
        self.items.write().unwrap().push(Arc::clone(&item));
        Ok(item)
    }

    pub fn get(&self, uid: &str) -> Option<Arc<DownloadItem>> {
        self.items
            .read()
            .unwrap()
            .iter()
            .find(|i| i.uid == uid)
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<DownloadItem>> {
        self.items.read().unwrap().clone()
    }

    /// Hold an item until the given unix time.
    pub fn schedule(&self, uid: &str, at_unix: u64) -> bool {
        let Some(item) = self.get(uid) else {
            return false;
        };
        *item.scheduled_at.lock().unwrap() = Some(at_unix);
        item.set_status(Status::Scheduled)
    }

    /// Cooperative stop; progress is persisted and the temp folder kept.
    pub fn pause(&self, uid: &str) -> bool {
        self.get(uid).map(|i| i.set_status(Status::Cancelled)).unwrap_or(false)
    }

    /// Re-queue a cancelled or failed item.
    pub fn resume(&self, uid: &str) -> bool {
        self.get(uid).map(|i| i.set_status(Status::Pending)).unwrap_or(false)
    }

    pub fn stop_all(&self) {
        for item in self.list() {
            item.set_status(Status::Cancelled);
        }
    }

    pub fn resume_all(&self) {
        for item in self.list() {
            item.set_status(Status::Pending);
        }
    }

    /// Remove an item from the registry; optionally delete its files.
    pub fn delete(&self, uid: &str, delete_files: bool) -> bool {
        let Some(item) = self.get(uid) else {
            return false;
        };
        item.set_status(Status::Cancelled);
        self.items.write().unwrap().retain(|i| i.uid != uid);
        item.delete_tempfiles(false);
        if delete_files && item.target_file().is_file() {
            let _ = std::fs::remove_file(item.target_file());
        }
        tracing::info!(uid = %uid, "item deleted");
        true
    }

    /// Pick subtitle languages for an item from what its resolver offered.
    pub fn select_subtitles(&self, uid: &str, languages: &[String]) -> usize {
        let Some(item) = self.get(uid) else {
            return 0;
        };
        let mut selected = item.selected_subtitles.write().unwrap();
        let mut count = 0;
        for lang in languages {
            if let Some(source) = item.available_subtitles.get(lang).and_then(|v| v.first()) {
                selected.insert(lang.clone(), source.clone());
                count += 1;
            }
        }
        count
    }

    pub fn set_completion_command(&self, command: Option<String>) {
        *self.completion_command.lock().unwrap() = command;
    }

    pub fn set_shutdown_on_complete(&self, enabled: bool) {
        self.shutdown_on_complete.store(enabled, Ordering::Relaxed);
    }

    // --- persistence -----------------------------------------------------

    /// Load the persisted registry into memory. Items that were mid-flight
    /// when the process died come back as `pending`.
    pub async fn restore(&self) -> Result<usize> {
        let records = self.registry.load().await.context("load item registry")?;
        let mut items = self.items.write().unwrap();
        let mut restored = 0;
        for record in records.into_values() {
            if items.iter().any(|i| i.uid == record.uid) {
                continue;
            }
            let item = record.to_item(&self.cfg);
            item.attach_events(self.events_tx.clone());
            items.push(item);
            restored += 1;
        }
        Ok(restored)
    }

    pub async fn save(&self) -> Result<()> {
        let records: HashMap<String, ItemRecord> = self
            .list()
            .iter()
            .map(|i| (i.uid.clone(), ItemRecord::from_item(i)))
            .collect();
        self.registry.save(&records).await.context("save item registry")
    }

    // --- the run loop ----------------------------------------------------

    /// Run the queue to completion: admit items under the global cap, then
    /// spawn subtitle items for finished downloads and drain those too.
    /// Fires completion actions once everything is terminal.
    pub async fn run(&self) -> Result<u32> {
        let mut total = 0u32;
        loop {
            let items = self.list();
            total += scheduler::run_queue(&items, &self.cfg, Arc::clone(&self.refresher)).await?;
            if self.spawn_subtitle_items() == 0 {
                break;
            }
        }

        // Per-item policy can also request completion actions.
        let items = self.list();
        let item_command = items
            .iter()
            .find_map(|i| i.on_completion_command.clone());
        let actions = CompletionActions {
            command: self
                .completion_command
                .lock()
                .unwrap()
                .clone()
                .or(item_command),
            shutdown: self.shutdown_on_complete.load(Ordering::Relaxed)
                || items.iter().any(|i| i.shutdown_pc),
        };
        self.save().await?;
        scheduler::run_completion_actions(&actions);
        Ok(total)
    }

    /// Completed items with selected subtitles spawn one subtitle item per
    /// language. A `vtt` source selected as a subtitle becomes an `srt`
    /// target; the post-processing remux handles the coercion.
    fn spawn_subtitle_items(&self) -> usize {
        let mut created = 0;
        for item in self.list() {
            if item.kind == ItemKind::Subtitle || item.status() != Status::Completed {
                continue;
            }
            let selected = item.selected_subtitles.read().unwrap().clone();
            for (lang, source) in selected {
                let key = format!("{}:{}", item.uid, lang);
                if !self.spawned_subtitles.lock().unwrap().insert(key) {
                    continue;
                }
                let ext = if source.ext == "vtt" {
                    "srt"
                } else {
                    source.ext.as_str()
                };
                let (stem, _) = naming::split_name_ext(&item.name);
                let name = format!("{stem}_{lang}.{ext}");
                let desc = StreamDescriptor {
                    url: source.url.clone(),
                    kind: ItemKind::Subtitle,
                    subtypes: Subtypes {
                        hls: source.url.contains(".m3u8"),
                        ..Default::default()
                    },
                    http_headers: item.http_headers.clone(),
                    ..Default::default()
                };
                match self.add(desc, &item.folder, Some(name)) {
                    Ok(_) => created += 1,
                    Err(e) => {
                        tracing::warn!(uid = %item.uid, %lang, error = %e, "subtitle item failed")
                    }
                }
            }
        }
        created
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{NoRefresh, SubtitleSource};

    fn controller(dir: &Path) -> Controller {
        Controller::new(
            RuntimeConfig::default(),
            Registry::open_at(dir.join("items.json")),
            Arc::new(NoRefresh),
        )
    }

    fn desc(url: &str) -> StreamDescriptor {
        StreamDescriptor {
            url: url.to_string(),
            total_size: Some(100),
            ..Default::default()
        }
    }

    #[test]
    fn add_derives_name_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path());
        let a = c
            .add(desc("https://example.com/movie.mp4"), dir.path(), None)
            .unwrap();
        assert_eq!(a.name, "movie.mp4");

        let b = c
            .add(desc("https://example.com/movie.mp4"), dir.path(), None)
            .unwrap();
        assert_eq!(a.uid, b.uid);
        assert_eq!(c.list().len(), 1);
    }

    #[test]
    fn readding_failed_item_requeues_it() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path());
        let a = c
            .add(desc("https://example.com/movie.mp4"), dir.path(), None)
            .unwrap();
        a.set_status(Status::Downloading);
        a.set_status(Status::Error);

        let b = c
            .add(desc("https://example.com/movie.mp4"), dir.path(), None)
            .unwrap();
        assert_eq!(b.status(), Status::Pending);
    }

    #[test]
    fn pause_resume_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path());
        let a = c
            .add(desc("https://example.com/f.bin"), dir.path(), None)
            .unwrap();
        let uid = a.uid.clone();
        a.set_status(Status::Downloading);
        assert!(c.pause(&uid));
        assert_eq!(a.status(), Status::Cancelled);
        assert!(c.resume(&uid));
        assert_eq!(a.status(), Status::Pending);
    }

    #[tokio::test]
    async fn save_restore_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path());
        c.add(desc("https://example.com/a.bin"), dir.path(), None)
            .unwrap();
        c.add(desc("https://example.com/b.bin"), dir.path(), None)
            .unwrap();
        c.save().await.unwrap();

        let c2 = controller(dir.path());
        assert_eq!(c2.restore().await.unwrap(), 2);
        assert_eq!(c2.list().len(), 2);
        // restore is idempotent
        assert_eq!(c2.restore().await.unwrap(), 0);
    }

    #[test]
    fn subtitle_selection_and_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path());
        let mut d = desc("https://example.com/show.mp4");
        d.subtitles.insert(
            "en".to_string(),
            vec![SubtitleSource {
                url: "https://example.com/subs/en.vtt".into(),
                ext: "vtt".into(),
            }],
        );
        let item = c.add(d, dir.path(), None).unwrap();
        assert_eq!(c.select_subtitles(&item.uid, &["en".to_string()]), 1);

        item.force_status(Status::Completed);
        assert_eq!(c.spawn_subtitle_items(), 1);
        let subs: Vec<_> = c
            .list()
            .into_iter()
            .filter(|i| i.kind == ItemKind::Subtitle)
            .collect();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].name, "show_en.srt");
        // No duplicates on a second pass.
        assert_eq!(c.spawn_subtitle_items(), 0);
    }
}
