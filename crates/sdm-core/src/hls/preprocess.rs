//! HLS pre-processing: manifests in, segment list + local manifests out.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use url::Url;

use crate::error::DownloadError;
use crate::fetcher::{fetch, FetchPolicy, FetchRequest, FetchSink};
use crate::item::{DownloadItem, MediaType, Segment};

use super::playlist;
use super::{
    LOCAL_AUDIO_MANIFEST, LOCAL_VIDEO_MANIFEST, MASTER_MANIFEST, REMOTE_AUDIO_MANIFEST,
    REMOTE_VIDEO_MANIFEST,
};

/// Which stream of the item a media playlist belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Video,
    Audio,
}

impl StreamKind {
    fn prefix(self) -> &'static str {
        match self {
            StreamKind::Video => "video",
            StreamKind::Audio => "audio",
        }
    }

    fn manifests(self) -> (&'static str, &'static str) {
        match self {
            StreamKind::Video => (REMOTE_VIDEO_MANIFEST, LOCAL_VIDEO_MANIFEST),
            StreamKind::Audio => (REMOTE_AUDIO_MANIFEST, LOCAL_AUDIO_MANIFEST),
        }
    }

    fn media_type(self) -> MediaType {
        match self {
            StreamKind::Video => MediaType::Video,
            StreamKind::Audio => MediaType::Audio,
        }
    }
}

/// Run the whole pre-process for an HLS item.
///
/// On success the item's segment list is populated (no segments exist on
/// failure), the temp folder holds the remote and local manifests, and the
/// item is flagged `fragmented` (and `encrypted` when a key was seen).
pub fn pre_process(item: &Arc<DownloadItem>, policy: &FetchPolicy) -> Result<(), DownloadError> {
    tracing::info!(uid = %item.uid, "hls pre-process start");
    std::fs::create_dir_all(item.temp_folder())
        .map_err(|e| DownloadError::Filesystem(format!("create temp folder: {e}")))?;

    if let Some(manifest_url) = item.manifest_url.clone() {
        resolve_from_master(item, &manifest_url, policy)?;
    }

    let video_url = item.eff_url();
    let video_doc = download_manifest(&video_url, item, policy)?;
    let video_pl = prepare_media_playlist(&video_doc, &video_url)?;
    item.set_playlist_url(Some(video_url.clone()));

    let audio = if item.subtypes().dash {
        let audio_url = item.audio_url().ok_or_else(|| {
            DownloadError::ManifestInvalid("dash-over-hls item without an audio url".to_string())
        })?;
        let audio_doc = download_manifest(&audio_url, item, policy)?;
        Some((prepare_media_playlist(&audio_doc, &audio_url)?, audio_url))
    } else {
        None
    };

    if playlist::is_encrypted(&video_pl)
        || audio.as_ref().is_some_and(|(pl, _)| playlist::is_encrypted(pl))
    {
        item.mark_encrypted();
    }
    item.mark_fragmented();

    let mut segments: Vec<Arc<Segment>> = Vec::new();
    build_stream(item, &video_pl, StreamKind::Video, &mut segments)?;
    if let Some((audio_pl, _)) = &audio {
        build_stream(item, audio_pl, StreamKind::Audio, &mut segments)?;
    }
    item.replace_segments(segments);

    tracing::info!(
        uid = %item.uid,
        segments = item.segment_count(),
        encrypted = item.subtypes().encrypted,
        "hls pre-process done"
    );
    Ok(())
}

/// Re-download the master manifest and update the item's media URIs; some
/// servers rotate signed media URLs between visits.
fn resolve_from_master(
    item: &Arc<DownloadItem>,
    manifest_url: &str,
    policy: &FetchPolicy,
) -> Result<(), DownloadError> {
    let doc = download_manifest(manifest_url, item, policy)?;
    let path = item.temp_folder().join(MASTER_MANIFEST);
    std::fs::write(&path, &doc)
        .map_err(|e| DownloadError::Filesystem(format!("save master manifest: {e}")))?;

    // A media playlist served where a master was expected needs no
    // re-resolution; the effective URL already points at the right stream.
    if doc.contains("#EXT-X-TARGETDURATION") {
        return Ok(());
    }

    let base = parse_base(manifest_url)?;
    let master = match playlist::parse(&doc)? {
        m3u8_rs::Playlist::MasterPlaylist(m) => m,
        m3u8_rs::Playlist::MediaPlaylist(_) => return Ok(()),
    };

    if let Some(format_id) = item.format_id.as_deref() {
        if let Some(uri) = playlist::variant_uri_for_format(&master, &base, format_id) {
            tracing::debug!(uid = %item.uid, %uri, "video uri refreshed from master");
            item.set_eff_url(uri);
        }
    }
    if let Some(audio_format_id) = item.audio_format_id.as_deref() {
        if let Some(uri) = playlist::audio_uri_for_format(&master, &base, audio_format_id) {
            tracing::debug!(uid = %item.uid, %uri, "audio uri refreshed from master");
            item.set_audio_url(Some(uri));
        }
    }

    // The master may advertise subtitles the resolver didn't know about;
    // adopt them for languages the user already selected.
    let advertised = playlist::subtitle_alternatives(&master, &base);
    if !advertised.is_empty() {
        let mut selected = item.selected_subtitles.write().unwrap();
        for (lang, sources) in advertised {
            if let (Some(slot), Some(first)) = (selected.get_mut(&lang), sources.first()) {
                *slot = first.clone();
            }
        }
    }
    Ok(())
}

fn prepare_media_playlist(
    doc: &str,
    url: &str,
) -> Result<m3u8_rs::MediaPlaylist, DownloadError> {
    let base = parse_base(url)?;
    let mut pl = playlist::parse_media(doc)?;
    playlist::absolutize(&mut pl, &base);
    playlist::ensure_supported(&pl)?;
    if pl.segments.is_empty() {
        return Err(DownloadError::ManifestInvalid(
            "media playlist has no segments".to_string(),
        ));
    }
    Ok(pl)
}

/// Create key and media segments for one stream and write its two manifests.
fn build_stream(
    item: &Arc<DownloadItem>,
    pl: &m3u8_rs::MediaPlaylist,
    kind: StreamKind,
    segments: &mut Vec<Arc<Segment>>,
) -> Result<(), DownloadError> {
    let temp_folder = item.temp_folder();
    let prefix = kind.prefix();
    let stream_tempfile = match kind {
        StreamKind::Video => item.temp_file().to_path_buf(),
        StreamKind::Audio => item.audio_file().to_path_buf(),
    };

    // Keys first: a media segment must never be scheduled before the key
    // that decrypts it.
    let mut key_paths: HashMap<String, PathBuf> = HashMap::new();
    for (k, uri) in playlist::key_uris(pl).into_iter().enumerate() {
        let path = temp_folder.join(format!("{prefix}_key_{}.key", k + 1));
        let num = segments.len();
        segments.push(Arc::new(Segment::whole(
            num,
            path.clone(),
            uri.clone(),
            stream_tempfile.clone(),
            MediaType::Key,
            false,
        )));
        key_paths.insert(uri, path);
    }

    let mut seg_paths: Vec<PathBuf> = Vec::with_capacity(pl.segments.len());
    for (i, media_seg) in pl.segments.iter().enumerate() {
        let path = temp_folder.join(format!("{prefix}_seg_{}.ts", i + 1));
        let num = segments.len();
        let mut seg = Segment::whole(
            num,
            path.clone(),
            media_seg.uri.clone(),
            stream_tempfile.clone(),
            kind.media_type(),
            // Assembly is the transcoder's job; the file manager only tracks
            // completion for these.
            false,
        );
        seg.key_path = media_seg
            .key
            .as_ref()
            .and_then(|k| k.uri.as_ref())
            .and_then(|uri| key_paths.get(uri).cloned());
        segments.push(Arc::new(seg));
        seg_paths.push(path);
    }

    let (remote_name, local_name) = kind.manifests();
    let remote_text = playlist::write_playlist(pl);
    std::fs::write(temp_folder.join(remote_name), remote_text)
        .map_err(|e| DownloadError::Filesystem(format!("save {remote_name}: {e}")))?;

    let local = playlist::localize(pl, &seg_paths, &key_paths);
    std::fs::write(temp_folder.join(local_name), playlist::write_playlist(&local))
        .map_err(|e| DownloadError::Filesystem(format!("save {local_name}: {e}")))?;

    Ok(())
}

/// After an item-level URL refresh, re-download the media playlists and
/// rewrite the fragment URLs baked into existing segments, matched by
/// position.
pub fn refresh_fragment_urls(
    item: &Arc<DownloadItem>,
    policy: &FetchPolicy,
) -> Result<(), DownloadError> {
    let video_url = item.playlist_url().unwrap_or_else(|| item.eff_url());
    refresh_stream(item, &video_url, MediaType::Video, policy)?;
    if item.subtypes().dash {
        if let Some(audio_url) = item.audio_url() {
            refresh_stream(item, &audio_url, MediaType::Audio, policy)?;
        }
    }
    Ok(())
}

fn refresh_stream(
    item: &Arc<DownloadItem>,
    url: &str,
    media_type: MediaType,
    policy: &FetchPolicy,
) -> Result<(), DownloadError> {
    let doc = download_manifest(url, item, policy)?;
    let pl = prepare_media_playlist(&doc, url)?;

    let mut stream_segments: Vec<Arc<Segment>> = item
        .snapshot_segments()
        .into_iter()
        .filter(|s| s.media_type == media_type && s.range().is_none())
        .collect();
    stream_segments.sort_by_key(|s| s.num);

    if stream_segments.len() != pl.segments.len() {
        return Err(DownloadError::ManifestInvalid(format!(
            "refreshed playlist has {} segments, item has {}",
            pl.segments.len(),
            stream_segments.len()
        )));
    }
    for (seg, fresh) in stream_segments.iter().zip(pl.segments.iter()) {
        seg.set_url(fresh.uri.clone());
    }
    tracing::info!(uid = %item.uid, count = stream_segments.len(), "fragment urls refreshed");
    Ok(())
}

fn download_manifest(
    url: &str,
    item: &DownloadItem,
    policy: &FetchPolicy,
) -> Result<String, DownloadError> {
    let mut buf: Vec<u8> = Vec::new();
    let request = FetchRequest {
        url,
        range: None,
        headers: &item.http_headers,
    };
    fetch(
        &request,
        FetchSink::Buffer(&mut buf),
        policy,
        &|| item.cancel_requested(),
        &|_| {},
    )
    .map_err(|e| DownloadError::FatalNetwork(format!("manifest download failed: {e}")))?;

    let text = String::from_utf8_lossy(&buf).into_owned();
    if !text.contains("#EXT") {
        return Err(DownloadError::ManifestInvalid(
            "server did not return an m3u8 document".to_string(),
        ));
    }
    Ok(text)
}

fn parse_base(url: &str) -> Result<Url, DownloadError> {
    Url::parse(url).map_err(|e| DownloadError::ManifestInvalid(format!("bad playlist url: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::item::{StreamDescriptor, Subtypes};

    const MEDIA: &str = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:10\n\
#EXT-X-MEDIA-SEQUENCE:0\n\
#EXT-X-KEY:METHOD=AES-128,URI=\"https://cdn.example.com/k/1.key\"\n\
#EXTINF:9.0,\n\
https://cdn.example.com/s/0.ts\n\
#EXTINF:9.0,\n\
https://cdn.example.com/s/1.ts\n\
#EXT-X-ENDLIST\n";

    fn hls_item() -> (tempfile::TempDir, Arc<DownloadItem>) {
        let dir = tempfile::tempdir().unwrap();
        let desc = StreamDescriptor {
            url: "https://example.com/watch".into(),
            eff_url: Some("https://cdn.example.com/v.m3u8".into()),
            subtypes: Subtypes {
                hls: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let item = Arc::new(DownloadItem::from_descriptor(
            &desc,
            dir.path(),
            "v.mp4".into(),
            &RuntimeConfig::default(),
        ));
        std::fs::create_dir_all(item.temp_folder()).unwrap();
        (dir, item)
    }

    #[test]
    fn build_stream_orders_keys_before_media() {
        let (_dir, item) = hls_item();
        let pl = playlist::parse_media(MEDIA).unwrap();
        let mut segments = Vec::new();
        build_stream(&item, &pl, StreamKind::Video, &mut segments).unwrap();

        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].media_type, MediaType::Key);
        assert_eq!(segments[0].url(), "https://cdn.example.com/k/1.key");
        assert_eq!(segments[1].media_type, MediaType::Video);
        assert!(!segments[1].merge);
        assert_eq!(
            segments[1].key_path.as_deref(),
            Some(item.temp_folder().join("video_key_1.key").as_path())
        );
        assert_eq!(
            segments[1].name,
            item.temp_folder().join("video_seg_1.ts")
        );

        // Both manifests landed on disk; the local one has as many entries
        // as the remote and points at temp files.
        let remote =
            std::fs::read_to_string(item.temp_folder().join(REMOTE_VIDEO_MANIFEST)).unwrap();
        let local =
            std::fs::read_to_string(item.temp_folder().join(LOCAL_VIDEO_MANIFEST)).unwrap();
        assert_eq!(
            remote.matches("#EXTINF").count(),
            local.matches("#EXTINF").count()
        );
        assert!(local.contains("video_seg_1.ts"));
        assert!(local.contains("video_key_1.key"));
        assert!(remote.contains("https://cdn.example.com/s/0.ts"));
    }

    #[test]
    fn refresh_rewrites_fragment_urls_by_position() {
        let (_dir, item) = hls_item();
        let pl = playlist::parse_media(MEDIA).unwrap();
        let mut segments = Vec::new();
        build_stream(&item, &pl, StreamKind::Video, &mut segments).unwrap();
        item.replace_segments(segments);

        let refreshed_doc = MEDIA.replace("cdn.example.com/s/", "cdn2.example.com/s/");
        let fresh = playlist::parse_media(&refreshed_doc).unwrap();
        let stream: Vec<Arc<Segment>> = item
            .snapshot_segments()
            .into_iter()
            .filter(|s| s.media_type == MediaType::Video)
            .collect();
        for (seg, new_seg) in stream.iter().zip(fresh.segments.iter()) {
            seg.set_url(new_seg.uri.clone());
        }
        assert_eq!(
            item.snapshot_segments()[1].url(),
            "https://cdn2.example.com/s/0.ts"
        );
    }
}
