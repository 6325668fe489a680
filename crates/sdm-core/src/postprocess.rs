//! Post-processing pipeline: everything between "all segments spliced" and
//! "final file in place".
//!
//! Order matters: HLS assembly produces the temp media file(s), the DASH
//! merge muxes video+audio, audio items get converted, then the result is
//! renamed into place and metadata is embedded into the finished file.

use std::sync::Arc;

use crate::assembler::AssemblerOptions;
use crate::error::DownloadError;
use crate::hls;
use crate::item::{DownloadItem, ItemKind, Status};
use crate::metadata;
use crate::transcoder::Transcoder;

pub fn run(
    item: &Arc<DownloadItem>,
    transcoder: &Transcoder,
    opts: &AssemblerOptions,
) -> Result<(), DownloadError> {
    item.set_status(Status::Processing);
    let subtypes = item.subtypes();

    if subtypes.hls {
        hls::post_process(item, transcoder)?;
    }

    if subtypes.dash {
        tracing::info!(uid = %item.uid, "merging video and audio");
        transcoder.merge_video_audio(item.temp_file(), item.audio_file(), item.target_file())?;
    }

    if item.kind == ItemKind::Audio {
        tracing::info!(uid = %item.uid, "converting audio container");
        transcoder.convert_audio(item.temp_file(), item.target_file())?;
    }

    // A vtt source fetched for an srt selection gets remuxed; the output
    // extension tells the transcoder the format.
    if item.kind == ItemKind::Subtitle && !subtypes.hls && item.name.ends_with(".srt") {
        transcoder.convert_subtitle(item.temp_file(), item.target_file())?;
    }

    finalize(item)?;

    if opts.write_metadata {
        if let Some(content) = item.metadata_content.as_deref() {
            embed_metadata(item, transcoder, content);
        }
    }

    item.delete_tempfiles(opts.keep_temp);
    item.set_status(Status::Completed);
    Ok(())
}

/// Move the finished file into place. Steps that already wrote the target
/// (DASH merge, audio convert, subtitle remux) need no rename; otherwise
/// the temp file is renamed, with a copy+unlink fallback for cross-device
/// folders.
fn finalize(item: &DownloadItem) -> Result<(), DownloadError> {
    let target = item.target_file();
    if target.is_file() {
        return Ok(());
    }
    let temp = item.temp_file();
    if let Err(rename_err) = std::fs::rename(temp, target) {
        tracing::debug!(
            error = %rename_err,
            "rename failed, falling back to copy"
        );
        std::fs::copy(temp, target)
            .map_err(|e| DownloadError::Filesystem(format!("copy to target: {e}")))?;
        std::fs::remove_file(temp)
            .map_err(|e| DownloadError::Filesystem(format!("remove temp after copy: {e}")))?;
    }
    Ok(())
}

/// Best-effort metadata embedding: a failure here is logged, not fatal —
/// the media file itself is complete.
fn embed_metadata(item: &DownloadItem, transcoder: &Transcoder, content: &str) {
    tracing::info!(uid = %item.uid, "embedding metadata");
    let sidecar = match metadata::write_sidecar(item.target_file(), content) {
        Ok(path) => path,
        Err(e) => {
            tracing::warn!(uid = %item.uid, error = %e, "failed to write metadata sidecar");
            return;
        }
    };
    if let Err(e) = transcoder.write_metadata(item.target_file(), &sidecar) {
        tracing::warn!(uid = %item.uid, error = %e, "metadata embedding failed");
    }
    let _ = std::fs::remove_file(&sidecar);
}
