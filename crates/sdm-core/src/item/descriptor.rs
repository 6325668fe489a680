//! Stream descriptor: what the URL-resolution adapter hands the core.
//!
//! The core does no site-specific extraction; an external resolver yields
//! direct URLs, fragment lists, protocol hints, and headers, and the core
//! downloads exactly what it is told.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{ItemKind, Subtypes};

/// One subtitle source offered for a language.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubtitleSource {
    pub url: String,
    /// Source extension as advertised (`vtt`, `srt`, ...).
    pub ext: String,
}

/// An independently addressable media unit from a manifest (DASH segment).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentRef {
    pub url: String,
    /// Known size in bytes, 0 when the manifest does not say.
    #[serde(default)]
    pub size: u64,
}

/// Everything the core needs to download one logical item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamDescriptor {
    /// Primary URL as the user provided it.
    pub url: String,
    /// Resolved direct media URL, when the resolver already has one.
    #[serde(default)]
    pub eff_url: Option<String>,
    /// HLS master manifest URL.
    #[serde(default)]
    pub manifest_url: Option<String>,
    /// Separate audio stream URL (DASH).
    #[serde(default)]
    pub audio_url: Option<String>,
    /// Resolver's format identifier for the selected video stream.
    #[serde(default)]
    pub format_id: Option<String>,
    #[serde(default)]
    pub audio_format_id: Option<String>,
    #[serde(default)]
    pub kind: ItemKind,
    #[serde(default)]
    pub subtypes: Subtypes,
    /// Best-known total size; 0/None for manifest streams.
    #[serde(default)]
    pub total_size: Option<u64>,
    /// Request-local HTTP headers (not applied globally).
    #[serde(default)]
    pub http_headers: HashMap<String, String>,
    /// Fragment list for fragmented non-HLS streams.
    #[serde(default)]
    pub fragments: Vec<FragmentRef>,
    /// Audio-stream fragments for fragmented DASH.
    #[serde(default)]
    pub audio_fragments: Vec<FragmentRef>,
    /// Subtitles by language, as offered by the resolver.
    #[serde(default)]
    pub subtitles: HashMap<String, Vec<SubtitleSource>>,
    /// FFmpeg metadata text (`;FFMETADATA1` format) to embed on completion.
    #[serde(default)]
    pub metadata: Option<String>,
}

/// Item-level URL refresh hook for expired signed links.
///
/// Invoked when workers report an expired link; returns a fresh descriptor
/// for the same selection, or `None` when the source cannot be re-resolved.
pub trait UrlRefresher: Send + Sync {
    fn refresh(&self, original_url: &str) -> Option<StreamDescriptor>;
}

/// Refresher that always declines; the default when no adapter is wired in.
pub struct NoRefresh;

impl UrlRefresher for NoRefresh {
    fn refresh(&self, _original_url: &str) -> Option<StreamDescriptor> {
        None
    }
}
