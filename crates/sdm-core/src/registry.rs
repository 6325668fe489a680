//! Persistent item registry: a JSON map `uid -> item record` under the XDG
//! state dir.
//!
//! Each record carries enough to rebuild its item from scratch (descriptor
//! fields, target path, selection); segment-level progress lives in the
//! per-item sidecar, not here. Writes go through a temp file + rename so a
//! crash never leaves a torn registry.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{self, RuntimeConfig};
use crate::item::{
    DownloadItem, FragmentRef, ItemKind, Status, StreamDescriptor, SubtitleSource, Subtypes,
};

const REGISTRY_NAME: &str = "items.json";

/// Everything persisted for one item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRecord {
    pub uid: String,
    pub url: String,
    pub eff_url: String,
    #[serde(default)]
    pub manifest_url: Option<String>,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub format_id: Option<String>,
    #[serde(default)]
    pub audio_format_id: Option<String>,
    pub folder: PathBuf,
    pub name: String,
    pub kind: ItemKind,
    pub subtypes: Subtypes,
    pub total_size: u64,
    pub downloaded: u64,
    pub status: Status,
    #[serde(default)]
    pub http_headers: HashMap<String, String>,
    #[serde(default)]
    pub available_subtitles: HashMap<String, Vec<SubtitleSource>>,
    #[serde(default)]
    pub selected_subtitles: HashMap<String, SubtitleSource>,
    #[serde(default)]
    pub scheduled_at: Option<u64>,
    #[serde(default)]
    pub fragments: Vec<FragmentRef>,
    #[serde(default)]
    pub audio_fragments: Vec<FragmentRef>,
    #[serde(default)]
    pub metadata: Option<String>,
}

impl ItemRecord {
    pub fn from_item(item: &DownloadItem) -> Self {
        Self {
            uid: item.uid.clone(),
            url: item.url.clone(),
            eff_url: item.eff_url(),
            manifest_url: item.manifest_url.clone(),
            audio_url: item.audio_url(),
            format_id: item.format_id.clone(),
            audio_format_id: item.audio_format_id.clone(),
            folder: item.folder.clone(),
            name: item.name.clone(),
            kind: item.kind,
            subtypes: item.subtypes(),
            total_size: item.total_size(),
            downloaded: item.downloaded(),
            status: item.status(),
            http_headers: item.http_headers.clone(),
            available_subtitles: item.available_subtitles.clone(),
            selected_subtitles: item.selected_subtitles.read().unwrap().clone(),
            scheduled_at: *item.scheduled_at.lock().unwrap(),
            fragments: item.fragments.clone(),
            audio_fragments: item.audio_fragments.clone(),
            metadata: item.metadata_content.clone(),
        }
    }

    /// Status to resume with: an item that was mid-flight when the process
    /// died goes back to the queue.
    pub fn recovered_status(&self) -> Status {
        if self.status.is_active() {
            Status::Pending
        } else {
            self.status
        }
    }

    /// Rebuild a live item from this record.
    pub fn to_item(&self, cfg: &RuntimeConfig) -> Arc<DownloadItem> {
        let desc = StreamDescriptor {
            url: self.url.clone(),
            eff_url: Some(self.eff_url.clone()),
            manifest_url: self.manifest_url.clone(),
            audio_url: self.audio_url.clone(),
            format_id: self.format_id.clone(),
            audio_format_id: self.audio_format_id.clone(),
            kind: self.kind,
            subtypes: self.subtypes,
            total_size: Some(self.total_size),
            http_headers: self.http_headers.clone(),
            fragments: self.fragments.clone(),
            audio_fragments: self.audio_fragments.clone(),
            subtitles: self.available_subtitles.clone(),
            metadata: self.metadata.clone(),
        };
        let item = Arc::new(DownloadItem::from_descriptor(
            &desc,
            &self.folder,
            self.name.clone(),
            cfg,
        ));
        item.set_downloaded(self.downloaded);
        item.force_status(self.recovered_status());
        *item.scheduled_at.lock().unwrap() = self.scheduled_at;
        *item.selected_subtitles.write().unwrap() = self.selected_subtitles.clone();
        item
    }
}

/// Handle to the on-disk registry file.
#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    /// Registry under the XDG state dir (`~/.local/state/sdm/items.json`).
    pub fn open_default() -> Result<Self> {
        let dir = config::state_dir()?;
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create state dir {}", dir.display()))?;
        Ok(Self {
            path: dir.join(REGISTRY_NAME),
        })
    }

    /// Registry at an explicit path (tests, portable setups).
    pub fn open_at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn load(&self) -> Result<HashMap<String, ItemRecord>> {
        if !self.path.is_file() {
            return Ok(HashMap::new());
        }
        let data = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("read {}", self.path.display()))?;
        let map = serde_json::from_slice(&data)
            .with_context(|| format!("parse {}", self.path.display()))?;
        Ok(map)
    }

    pub async fn save(&self, records: &HashMap<String, ItemRecord>) -> Result<()> {
        let data = serde_json::to_vec_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("rename to {}", self.path.display()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(uid: &str, status: Status) -> ItemRecord {
        ItemRecord {
            uid: uid.to_string(),
            url: "https://example.com/f.bin".into(),
            eff_url: "https://cdn.example.com/f.bin".into(),
            manifest_url: None,
            audio_url: None,
            format_id: None,
            audio_format_id: None,
            folder: PathBuf::from("/dl"),
            name: "f.bin".into(),
            kind: ItemKind::General,
            subtypes: Subtypes::default(),
            total_size: 1000,
            downloaded: 400,
            status,
            http_headers: HashMap::new(),
            available_subtitles: HashMap::new(),
            selected_subtitles: HashMap::new(),
            scheduled_at: None,
            fragments: Vec::new(),
            audio_fragments: Vec::new(),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open_at(dir.path().join("items.json"));

        let mut map = HashMap::new();
        map.insert("abc".to_string(), record("abc", Status::Pending));
        map.insert("def".to_string(), record("def", Status::Completed));
        registry.save(&map).await.unwrap();

        let loaded = registry.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["abc"].status, Status::Pending);
        assert_eq!(loaded["def"].total_size, 1000);
    }

    #[tokio::test]
    async fn missing_registry_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open_at(dir.path().join("items.json"));
        assert!(registry.load().await.unwrap().is_empty());
    }

    #[test]
    fn active_statuses_recover_to_pending() {
        assert_eq!(
            record("a", Status::Downloading).recovered_status(),
            Status::Pending
        );
        assert_eq!(
            record("a", Status::Processing).recovered_status(),
            Status::Pending
        );
        assert_eq!(
            record("a", Status::Completed).recovered_status(),
            Status::Completed
        );
        assert_eq!(
            record("a", Status::Cancelled).recovered_status(),
            Status::Cancelled
        );
    }

    #[test]
    fn record_to_item_restores_state() {
        let cfg = RuntimeConfig::default();
        let rec = record("x", Status::Downloading);
        let item = rec.to_item(&cfg);
        assert_eq!(item.status(), Status::Pending, "mid-flight items re-queue");
        assert_eq!(item.downloaded(), 400);
        assert_eq!(item.total_size(), 1000);
        assert_eq!(item.eff_url(), "https://cdn.example.com/f.bin");
    }
}
