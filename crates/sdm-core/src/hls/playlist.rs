//! Pure m3u8 helpers: parse, URI resolution, support checks, and local
//! manifest production.
//!
//! Nothing here does I/O; documents come in as text and go out as text,
//! which keeps the interesting transformations property-testable. Parsing
//! and re-emission are delegated to `m3u8_rs`; this layer owns the URI
//! rewrites (absolute resolution, `skd://` fixup, localization).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use m3u8_rs::{AlternativeMediaType, KeyMethod, MasterPlaylist, MediaPlaylist, Playlist};
use url::Url;

use crate::error::DownloadError;
use crate::item::SubtitleSource;

/// Parse any m3u8 document.
pub fn parse(text: &str) -> Result<Playlist, DownloadError> {
    m3u8_rs::parse_playlist_res(text.as_bytes())
        .map_err(|_| DownloadError::ManifestInvalid("unparseable m3u8 document".to_string()))
}

/// Parse a document that must be a media playlist.
pub fn parse_media(text: &str) -> Result<MediaPlaylist, DownloadError> {
    match parse(text)? {
        Playlist::MediaPlaylist(pl) => Ok(pl),
        Playlist::MasterPlaylist(_) => Err(DownloadError::ManifestInvalid(
            "expected a media playlist, got a master playlist".to_string(),
        )),
    }
}

/// FairPlay-style key URIs use an `skd://` scheme; the key body itself is
/// served over https.
pub fn rewrite_skd(uri: &str) -> String {
    match uri.strip_prefix("skd://") {
        Some(rest) => format!("https://{rest}"),
        None => uri.to_string(),
    }
}

/// Resolve a possibly-relative manifest URI against its playlist URL.
pub fn resolve_uri(base: &Url, uri: &str) -> String {
    let uri = rewrite_skd(uri);
    match base.join(&uri) {
        Ok(joined) => joined.to_string(),
        Err(_) => uri,
    }
}

/// Rewrite every segment and key URI in place to an absolute URL.
pub fn absolutize(pl: &mut MediaPlaylist, base: &Url) {
    for seg in &mut pl.segments {
        seg.uri = resolve_uri(base, &seg.uri);
        if let Some(key) = seg.key.as_mut() {
            if let Some(uri) = key.uri.as_ref() {
                key.uri = Some(resolve_uri(base, uri));
            }
        }
    }
}

/// Reject encryption methods the transcoder cannot handle. Only plain
/// AES-128 with a downloadable key (or no encryption) is supported;
/// SAMPLE-AES usually means DRM.
pub fn ensure_supported(pl: &MediaPlaylist) -> Result<(), DownloadError> {
    for seg in &pl.segments {
        if let Some(key) = seg.key.as_ref() {
            match &key.method {
                KeyMethod::None | KeyMethod::AES128 => {}
                KeyMethod::SampleAES => {
                    return Err(DownloadError::UnsupportedProtocol(
                        "SAMPLE-AES encryption is not supported (possible DRM)".to_string(),
                    ));
                }
                KeyMethod::Other(name) => {
                    return Err(DownloadError::UnsupportedProtocol(format!(
                        "unsupported encryption method {name}"
                    )));
                }
            }
            if key.method == KeyMethod::AES128 && key.uri.as_deref().unwrap_or("").is_empty() {
                return Err(DownloadError::ManifestInvalid(
                    "AES-128 key without a URI".to_string(),
                ));
            }
        }
    }
    Ok(())
}

/// True if any segment carries a real key.
pub fn is_encrypted(pl: &MediaPlaylist) -> bool {
    pl.segments.iter().any(|seg| {
        seg.key
            .as_ref()
            .map(|k| k.method != KeyMethod::None)
            .unwrap_or(false)
    })
}

/// Unique key URIs in order of first appearance.
pub fn key_uris(pl: &MediaPlaylist) -> Vec<String> {
    let mut seen = Vec::new();
    for seg in &pl.segments {
        if let Some(uri) = seg.key.as_ref().and_then(|k| k.uri.as_deref()) {
            if !seen.iter().any(|s| s == uri) {
                seen.push(uri.to_string());
            }
        }
    }
    seen
}

/// Sum of segment durations in seconds.
pub fn total_duration(pl: &MediaPlaylist) -> f32 {
    pl.segments.iter().map(|s| s.duration).sum()
}

/// Serialize a media playlist back to text.
pub fn write_playlist(pl: &MediaPlaylist) -> String {
    let mut buf: Vec<u8> = Vec::new();
    // Writing to a Vec cannot fail.
    let _ = pl.write_to(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

/// Produce the local manifest the transcoder consumes: segment URIs become
/// per-segment temp file paths, key URIs become local key file paths.
///
/// `segment_paths` is parallel to `pl.segments`; `key_paths` maps absolute
/// key URIs to their local files.
pub fn localize(
    pl: &MediaPlaylist,
    segment_paths: &[PathBuf],
    key_paths: &HashMap<String, PathBuf>,
) -> MediaPlaylist {
    let mut local = pl.clone();
    for (i, seg) in local.segments.iter_mut().enumerate() {
        if let Some(path) = segment_paths.get(i) {
            seg.uri = path_to_uri(path);
        }
        if let Some(key) = seg.key.as_mut() {
            if let Some(remote) = key.uri.clone() {
                if let Some(local_key) = key_paths.get(&remote) {
                    key.uri = Some(path_to_uri(local_key));
                }
            }
        }
    }
    local
}

fn path_to_uri(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Pick the variant URI matching a resolver format id.
///
/// Resolver format ids for HLS follow the `hls-<bandwidth/1000>` shape;
/// bare numeric ids are accepted too. Returns the resolved URI or `None`
/// when nothing matches.
pub fn variant_uri_for_format(
    master: &MasterPlaylist,
    base: &Url,
    format_id: &str,
) -> Option<String> {
    let token = format_id.strip_prefix("hls-").unwrap_or(format_id);
    let wanted: u64 = token
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .and_then(|t| t.parse().ok())?;
    master
        .variants
        .iter()
        .find(|v| !v.is_i_frame && v.bandwidth / 1000 == wanted)
        .map(|v| resolve_uri(base, &v.uri))
}

/// Pick the audio rendition URI for a resolver audio format id, matching on
/// the rendition's GROUP-ID.
pub fn audio_uri_for_format(
    master: &MasterPlaylist,
    base: &Url,
    audio_format_id: &str,
) -> Option<String> {
    master
        .alternatives
        .iter()
        .filter(|alt| alt.media_type == AlternativeMediaType::Audio)
        .find(|alt| {
            audio_format_id == alt.group_id || audio_format_id.contains(alt.group_id.as_str())
        })
        .and_then(|alt| alt.uri.as_ref())
        .map(|uri| resolve_uri(base, uri))
}

/// Subtitle renditions advertised by the master manifest, keyed by language.
pub fn subtitle_alternatives(
    master: &MasterPlaylist,
    base: &Url,
) -> HashMap<String, Vec<SubtitleSource>> {
    let mut out: HashMap<String, Vec<SubtitleSource>> = HashMap::new();
    for (i, alt) in master
        .alternatives
        .iter()
        .filter(|alt| alt.media_type == AlternativeMediaType::Subtitles)
        .enumerate()
    {
        let Some(uri) = alt.uri.as_ref() else {
            continue;
        };
        let language = alt
            .language
            .clone()
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| {
                if alt.name.is_empty() {
                    format!("sub{i}")
                } else {
                    alt.name.clone()
                }
            });
        out.entry(language).or_default().push(SubtitleSource {
            url: resolve_uri(base, uri),
            ext: "vtt".to_string(),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEDIA: &str = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-PLAYLIST-TYPE:VOD\n\
#EXT-X-TARGETDURATION:10\n\
#EXT-X-MEDIA-SEQUENCE:0\n\
#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\",IV=0x0123456789abcdef0123456789abcdef\n\
#EXTINF:9.009,\n\
seg0.ts\n\
#EXTINF:8.5,\n\
seg1.ts\n\
#EXT-X-ENDLIST\n";

    const MASTER: &str = "#EXTM3U\n\
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud160\",LANGUAGE=\"en\",NAME=\"English\",URI=\"audio/en.m3u8\"\n\
#EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID=\"subs\",LANGUAGE=\"es\",NAME=\"Spanish\",URI=\"subs/es.m3u8\"\n\
#EXT-X-STREAM-INF:BANDWIDTH=1509000,RESOLUTION=1280x720,AUDIO=\"aud160\"\n\
video/720p.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=733000,RESOLUTION=640x360,AUDIO=\"aud160\"\n\
video/360p.m3u8\n";

    fn base() -> Url {
        Url::parse("https://cdn.example.com/stream/playlist.m3u8").unwrap()
    }

    #[test]
    fn parse_media_counts_segments() {
        let pl = parse_media(MEDIA).unwrap();
        assert_eq!(pl.segments.len(), 2);
        assert_eq!(pl.media_sequence, 0);
        assert!(pl.end_list);
        assert!((total_duration(&pl) - 17.509).abs() < 0.01);
    }

    #[test]
    fn master_is_rejected_as_media() {
        assert!(matches!(
            parse_media(MASTER),
            Err(DownloadError::ManifestInvalid(_))
        ));
    }

    #[test]
    fn skd_uris_are_rewritten() {
        assert_eq!(
            rewrite_skd("skd://keys.example.com/k1"),
            "https://keys.example.com/k1"
        );
        assert_eq!(rewrite_skd("https://a/b"), "https://a/b");
    }

    #[test]
    fn absolutize_resolves_relative_uris() {
        let mut pl = parse_media(MEDIA).unwrap();
        absolutize(&mut pl, &base());
        assert_eq!(pl.segments[0].uri, "https://cdn.example.com/stream/seg0.ts");
        assert_eq!(
            pl.segments[0].key.as_ref().unwrap().uri.as_deref(),
            Some("https://cdn.example.com/stream/key.bin")
        );
    }

    #[test]
    fn sample_aes_is_rejected() {
        let doc = MEDIA.replace("METHOD=AES-128", "METHOD=SAMPLE-AES");
        let pl = parse_media(&doc).unwrap();
        assert!(matches!(
            ensure_supported(&pl),
            Err(DownloadError::UnsupportedProtocol(_))
        ));
    }

    #[test]
    fn aes128_with_key_is_supported_and_encrypted() {
        let pl = parse_media(MEDIA).unwrap();
        ensure_supported(&pl).unwrap();
        assert!(is_encrypted(&pl));
        assert_eq!(key_uris(&pl), vec!["key.bin".to_string()]);
    }

    #[test]
    fn plain_playlist_is_not_encrypted() {
        let doc: String = MEDIA
            .lines()
            .filter(|l| !l.starts_with("#EXT-X-KEY"))
            .collect::<Vec<_>>()
            .join("\n");
        let pl = parse_media(&doc).unwrap();
        assert!(!is_encrypted(&pl));
        ensure_supported(&pl).unwrap();
    }

    #[test]
    fn localize_rewrites_segments_and_keys() {
        let mut pl = parse_media(MEDIA).unwrap();
        absolutize(&mut pl, &base());
        let seg_paths = vec![
            PathBuf::from("/tmp/.x_tmp/video_seg_1.ts"),
            PathBuf::from("/tmp/.x_tmp/video_seg_2.ts"),
        ];
        let mut keys = HashMap::new();
        keys.insert(
            "https://cdn.example.com/stream/key.bin".to_string(),
            PathBuf::from("/tmp/.x_tmp/key_1.key"),
        );
        let local = localize(&pl, &seg_paths, &keys);
        assert_eq!(local.segments[0].uri, "/tmp/.x_tmp/video_seg_1.ts");
        assert_eq!(local.segments[1].uri, "/tmp/.x_tmp/video_seg_2.ts");
        assert_eq!(
            local.segments[0].key.as_ref().unwrap().uri.as_deref(),
            Some("/tmp/.x_tmp/key_1.key")
        );

        // The re-emitted local manifest keeps the entry count and method.
        let text = write_playlist(&local);
        assert_eq!(text.matches("#EXTINF").count(), 2);
        assert!(text.contains("METHOD=AES-128"));
        assert!(text.contains("/tmp/.x_tmp/key_1.key"));
    }

    #[test]
    fn local_and_remote_manifests_parse_identically() {
        let mut pl = parse_media(MEDIA).unwrap();
        absolutize(&mut pl, &base());
        let seg_paths = vec![PathBuf::from("/t/a.ts"), PathBuf::from("/t/b.ts")];
        let local = localize(&pl, &seg_paths, &HashMap::new());
        let reparsed = parse_media(&write_playlist(&local)).unwrap();
        assert_eq!(reparsed.segments.len(), pl.segments.len());
    }

    #[test]
    fn variant_lookup_by_format_id() {
        let Playlist::MasterPlaylist(master) = parse(MASTER).unwrap() else {
            panic!("expected master");
        };
        assert_eq!(
            variant_uri_for_format(&master, &base(), "hls-1509").as_deref(),
            Some("https://cdn.example.com/stream/video/720p.m3u8")
        );
        assert_eq!(
            variant_uri_for_format(&master, &base(), "733").as_deref(),
            Some("https://cdn.example.com/stream/video/360p.m3u8")
        );
        assert!(variant_uri_for_format(&master, &base(), "hls-9999").is_none());
    }

    #[test]
    fn audio_lookup_by_group_id() {
        let Playlist::MasterPlaylist(master) = parse(MASTER).unwrap() else {
            panic!("expected master");
        };
        assert_eq!(
            audio_uri_for_format(&master, &base(), "hls-aud160-en").as_deref(),
            Some("https://cdn.example.com/stream/audio/en.m3u8")
        );
        assert!(audio_uri_for_format(&master, &base(), "other").is_none());
    }

    #[test]
    fn subtitles_from_master() {
        let Playlist::MasterPlaylist(master) = parse(MASTER).unwrap() else {
            panic!("expected master");
        };
        let subs = subtitle_alternatives(&master, &base());
        assert_eq!(subs.len(), 1);
        let es = &subs["es"];
        assert_eq!(es[0].url, "https://cdn.example.com/stream/subs/es.m3u8");
        assert_eq!(es[0].ext, "vtt");
    }
}
