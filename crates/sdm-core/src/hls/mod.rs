//! HLS pre- and post-processing.
//!
//! Pre-processing downloads the master/media manifests, rejects protocols
//! the transcoder can't handle, populates the item's segment list (keys
//! before the media segments that need them), and writes the remote and
//! local manifests to the temp folder. Post-processing hands the local
//! manifests to the transcoder for assembly.

pub mod playlist;
mod postprocess;
mod preprocess;

pub use postprocess::post_process;
pub use preprocess::{pre_process, refresh_fragment_urls};

/// On-disk manifest names inside the item temp folder.
pub const MASTER_MANIFEST: &str = "master.m3u8";
pub const REMOTE_VIDEO_MANIFEST: &str = "remote_video.m3u8";
pub const LOCAL_VIDEO_MANIFEST: &str = "local_video.m3u8";
pub const REMOTE_AUDIO_MANIFEST: &str = "remote_audio.m3u8";
pub const LOCAL_AUDIO_MANIFEST: &str = "local_audio.m3u8";
