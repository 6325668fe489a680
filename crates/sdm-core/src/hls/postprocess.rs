//! HLS post-processing: hand the local manifests to the transcoder.

use crate::error::DownloadError;
use crate::item::DownloadItem;
use crate::transcoder::Transcoder;

use super::{LOCAL_AUDIO_MANIFEST, LOCAL_VIDEO_MANIFEST};

/// Assemble the downloaded segments into the item's temp file(s).
///
/// The local manifest references per-segment temp files and local key
/// files, so the transcoder performs decryption and concatenation in one
/// pass. DASH-over-HLS items get a second pass for the audio stream; the
/// regular DASH merge step then muxes the two temp files.
pub fn post_process(item: &DownloadItem, transcoder: &Transcoder) -> Result<(), DownloadError> {
    let local_video = item.temp_folder().join(LOCAL_VIDEO_MANIFEST);
    if !local_video.is_file() {
        return Err(DownloadError::ManifestInvalid(format!(
            "missing local manifest {}",
            local_video.display()
        )));
    }
    tracing::info!(uid = %item.uid, "assembling hls video stream");
    transcoder.assemble_hls(&local_video, item.temp_file())?;

    if item.subtypes().dash {
        let local_audio = item.temp_folder().join(LOCAL_AUDIO_MANIFEST);
        if !local_audio.is_file() {
            return Err(DownloadError::ManifestInvalid(format!(
                "missing local manifest {}",
                local_audio.display()
            )));
        }
        tracing::info!(uid = %item.uid, "assembling hls audio stream");
        transcoder.assemble_hls(&local_audio, item.audio_file())?;
    }
    Ok(())
}
