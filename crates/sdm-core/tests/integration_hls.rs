//! HLS pre-processing and the full manifest-driven pipeline with a
//! stand-in transcoder.

mod common;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use sdm_core::config::RuntimeConfig;
use sdm_core::controller::Controller;
use sdm_core::error::DownloadError;
use sdm_core::fetcher::FetchPolicy;
use sdm_core::hls;
use sdm_core::item::{DownloadItem, MediaType, NoRefresh, Status, StreamDescriptor, Subtypes};
use sdm_core::registry::Registry;

use common::test_server::{self, ServerOptions};

fn media_playlist(segments: &[&str], key_uri: Option<&str>) -> String {
    let mut doc = String::from(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-PLAYLIST-TYPE:VOD\n#EXT-X-TARGETDURATION:10\n#EXT-X-MEDIA-SEQUENCE:0\n",
    );
    if let Some(uri) = key_uri {
        doc.push_str(&format!("#EXT-X-KEY:METHOD=AES-128,URI=\"{uri}\"\n"));
    }
    for seg in segments {
        doc.push_str("#EXTINF:9.0,\n");
        doc.push_str(seg);
        doc.push('\n');
    }
    doc.push_str("#EXT-X-ENDLIST\n");
    doc
}

fn hls_item(dir: &Path, url: &str, cfg: &RuntimeConfig) -> Arc<DownloadItem> {
    let desc = StreamDescriptor {
        url: url.to_string(),
        subtypes: Subtypes {
            hls: true,
            ..Default::default()
        },
        ..Default::default()
    };
    Arc::new(DownloadItem::from_descriptor(
        &desc,
        dir,
        "clip.ts".to_string(),
        cfg,
    ))
}

#[test]
fn pre_process_builds_segments_keys_and_manifests() {
    let key_body = vec![7u8; 16];
    let routes = HashMap::from([
        (
            "/v.m3u8".to_string(),
            media_playlist(&["seg0.ts", "seg1.ts", "seg2.ts"], Some("k.key")).into_bytes(),
        ),
        ("/seg0.ts".to_string(), b"AAAA".to_vec()),
        ("/seg1.ts".to_string(), b"BBBB".to_vec()),
        ("/seg2.ts".to_string(), b"CCCC".to_vec()),
        ("/k.key".to_string(), key_body),
    ]);
    let server = test_server::serve_routes(routes, ServerOptions::default());

    let dir = tempfile::tempdir().unwrap();
    let cfg = RuntimeConfig::default();
    let item = hls_item(dir.path(), &server.url("/v.m3u8"), &cfg);
    item.set_eff_url(server.url("/v.m3u8"));

    hls::pre_process(&item, &FetchPolicy::from_config(&cfg)).unwrap();

    let segments = item.snapshot_segments();
    assert_eq!(segments.len(), 4, "one key + three media segments");
    assert_eq!(segments[0].media_type, MediaType::Key);
    assert!(
        segments[1..].iter().all(|s| s.media_type == MediaType::Video),
        "media segments follow their key"
    );
    assert!(segments.iter().all(|s| !s.merge));
    assert!(item.subtypes().encrypted);
    assert!(item.subtypes().fragmented);

    // Local manifest parses with the same entry count and points at local
    // temp paths for both segments and the key.
    let remote =
        std::fs::read_to_string(item.temp_folder().join(hls::REMOTE_VIDEO_MANIFEST)).unwrap();
    let local =
        std::fs::read_to_string(item.temp_folder().join(hls::LOCAL_VIDEO_MANIFEST)).unwrap();
    assert_eq!(
        remote.matches("#EXTINF").count(),
        local.matches("#EXTINF").count()
    );
    let local_pl = hls::playlist::parse_media(&local).unwrap();
    for (i, seg) in local_pl.segments.iter().enumerate() {
        let expected = item.temp_folder().join(format!("video_seg_{}.ts", i + 1));
        assert_eq!(Path::new(&seg.uri), expected);
        assert!(
            item.snapshot_segments()
                .iter()
                .any(|s| s.name == Path::new(&seg.uri)),
            "local manifest uri is an expected per-segment temp path"
        );
    }
    assert!(local.contains("video_key_1.key"));
    assert!(remote.contains(&server.url("/k.key")));
}

#[test]
fn sample_aes_manifest_is_rejected_before_any_segment_exists() {
    let doc = media_playlist(&["seg0.ts"], Some("k.key"))
        .replace("METHOD=AES-128", "METHOD=SAMPLE-AES");
    let routes = HashMap::from([("/v.m3u8".to_string(), doc.into_bytes())]);
    let server = test_server::serve_routes(routes, ServerOptions::default());

    let dir = tempfile::tempdir().unwrap();
    let cfg = RuntimeConfig::default();
    let item = hls_item(dir.path(), &server.url("/v.m3u8"), &cfg);
    item.set_eff_url(server.url("/v.m3u8"));

    let err = hls::pre_process(&item, &FetchPolicy::from_config(&cfg)).unwrap_err();
    assert!(matches!(err, DownloadError::UnsupportedProtocol(_)));
    assert_eq!(item.segment_count(), 0, "no segments on rejection");
}

#[cfg(unix)]
#[tokio::test]
async fn hls_item_downloads_and_assembles_via_transcoder() {
    let parts: [&[u8]; 3] = [b"first-part|", b"second-part|", b"third-part"];
    let routes = HashMap::from([
        (
            "/v.m3u8".to_string(),
            media_playlist(&["seg0.ts", "seg1.ts", "seg2.ts"], None).into_bytes(),
        ),
        ("/seg0.ts".to_string(), parts[0].to_vec()),
        ("/seg1.ts".to_string(), parts[1].to_vec()),
        ("/seg2.ts".to_string(), parts[2].to_vec()),
    ]);
    let server = test_server::serve_routes(routes, ServerOptions::default());

    let dir = tempfile::tempdir().unwrap();
    let mut cfg = RuntimeConfig::default();
    cfg.ffmpeg_path = common::fake_ffmpeg(dir.path());

    let c = Controller::new(
        cfg,
        Registry::open_at(dir.path().join("items.json")),
        Arc::new(NoRefresh),
    );
    let desc = StreamDescriptor {
        url: server.url("/v.m3u8"),
        subtypes: Subtypes {
            hls: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let item = c.add(desc, dir.path(), Some("clip.ts".into())).unwrap();
    c.run().await.unwrap();

    assert_eq!(item.status(), Status::Completed);
    let expected: Vec<u8> = parts.concat();
    assert_eq!(std::fs::read(item.target_file()).unwrap(), expected);
}
