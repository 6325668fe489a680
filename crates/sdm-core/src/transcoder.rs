//! External transcoder (ffmpeg) invocation.
//!
//! Every media post-processing step goes through here: HLS assembly from a
//! local manifest, DASH video+audio merge, audio container conversion,
//! subtitle remux, and metadata embedding. Each step tries stream copy
//! first and falls back to a re-encode; a failure of both is fatal and
//! carries the stderr tail for the observer.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::DownloadError;

/// Keep this much of stderr for error reports.
const STDERR_TAIL: usize = 2000;

/// Handle to the external transcoder binary.
#[derive(Debug, Clone)]
pub struct Transcoder {
    ffmpeg: PathBuf,
}

impl Transcoder {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }

    /// True if the binary exists and runs.
    pub fn available(&self) -> bool {
        Command::new(&self.ffmpeg)
            .arg("-version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn run(&self, args: &[&str]) -> Result<(), String> {
        tracing::debug!(ffmpeg = %self.ffmpeg.display(), ?args, "running transcoder");
        let output = Command::new(&self.ffmpeg)
            .args(args)
            .output()
            .map_err(|e| format!("failed to launch {}: {}", self.ffmpeg.display(), e))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail_start = stderr.len().saturating_sub(STDERR_TAIL);
        let mut cut = tail_start;
        while cut < stderr.len() && !stderr.is_char_boundary(cut) {
            cut += 1;
        }
        Err(stderr[cut..].to_string())
    }

    /// Try `args_copy` (stream copy) first, then `args_fallback` (re-encode).
    fn run_with_fallback(
        &self,
        args_copy: &[&str],
        args_fallback: &[&str],
    ) -> Result<(), DownloadError> {
        match self.run(args_copy) {
            Ok(()) => Ok(()),
            Err(first) => {
                tracing::info!("stream copy failed, retrying with re-encode");
                self.run(args_fallback).map_err(|second| {
                    DownloadError::TranscoderFailure(format!(
                        "stream copy: {first}; re-encode: {second}"
                    ))
                })
            }
        }
    }

    /// Assemble an HLS stream from a local manifest into one media file.
    /// The manifest references per-segment temp files and local key files.
    pub fn assemble_hls(&self, local_manifest: &Path, output: &Path) -> Result<(), DownloadError> {
        let manifest = path_str(local_manifest)?;
        let out = path_str(output)?;
        let base = [
            "-y",
            "-loglevel",
            "error",
            "-protocol_whitelist",
            "file,http,https,tcp,tls,crypto",
            "-allowed_extensions",
            "ALL",
            "-i",
            manifest.as_str(),
        ];
        let mut copy: Vec<&str> = base.to_vec();
        copy.extend(["-c", "copy", out.as_str()]);
        let mut fallback: Vec<&str> = base.to_vec();
        fallback.push(out.as_str());
        self.run_with_fallback(&copy, &fallback)
    }

    /// Mux separate DASH video and audio temp files into the output.
    pub fn merge_video_audio(
        &self,
        video: &Path,
        audio: &Path,
        output: &Path,
    ) -> Result<(), DownloadError> {
        let v = path_str(video)?;
        let a = path_str(audio)?;
        let out = path_str(output)?;
        let copy = [
            "-y", "-loglevel", "error", "-i", v.as_str(), "-i", a.as_str(), "-c", "copy",
            out.as_str(),
        ];
        let fallback = [
            "-y", "-loglevel", "error", "-i", v.as_str(), "-i", a.as_str(), out.as_str(),
        ];
        self.run_with_fallback(&copy, &fallback)
    }

    /// Convert an audio file to the container implied by the output name.
    pub fn convert_audio(&self, input: &Path, output: &Path) -> Result<(), DownloadError> {
        let inp = path_str(input)?;
        let out = path_str(output)?;
        let copy = [
            "-y", "-loglevel", "error", "-i", inp.as_str(), "-acodec", "copy", out.as_str(),
        ];
        let fallback = ["-y", "-loglevel", "error", "-i", inp.as_str(), out.as_str()];
        self.run_with_fallback(&copy, &fallback)
    }

    /// Remux a subtitle file (vtt -> srt); the output extension picks the format.
    pub fn convert_subtitle(&self, input: &Path, output: &Path) -> Result<(), DownloadError> {
        let inp = path_str(input)?;
        let out = path_str(output)?;
        self.run(&["-y", "-loglevel", "error", "-i", inp.as_str(), out.as_str()])
            .map_err(DownloadError::TranscoderFailure)
    }

    /// Embed an ffmetadata sidecar into `target`, replacing it in place.
    /// Streams are copied, so this is fast even for large files.
    pub fn write_metadata(&self, target: &Path, sidecar: &Path) -> Result<(), DownloadError> {
        let staged = staged_output_path(target);
        let t = path_str(target)?;
        let s = path_str(sidecar)?;
        let out = path_str(&staged)?;
        self.run(&[
            "-y",
            "-loglevel",
            "error",
            "-i",
            t.as_str(),
            "-i",
            s.as_str(),
            "-map_metadata",
            "1",
            "-codec",
            "copy",
            out.as_str(),
        ])
        .map_err(DownloadError::TranscoderFailure)?;

        std::fs::rename(&staged, target)
            .map_err(|e| DownloadError::Filesystem(format!("replace {}: {}", t, e)))?;
        Ok(())
    }
}

/// `movie.mp4` -> `movie_2.mp4`, same folder so the final rename stays atomic.
fn staged_output_path(target: &Path) -> PathBuf {
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "out".to_string());
    let ext = target
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    target.with_file_name(format!("{stem}_2{ext}"))
}

fn path_str(p: &Path) -> Result<String, DownloadError> {
    Ok(p.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_path_keeps_folder_and_extension() {
        assert_eq!(
            staged_output_path(Path::new("/dl/movie.mp4")),
            PathBuf::from("/dl/movie_2.mp4")
        );
        assert_eq!(
            staged_output_path(Path::new("/dl/noext")),
            PathBuf::from("/dl/noext_2")
        );
    }

    #[test]
    fn missing_binary_reports_failure() {
        let t = Transcoder::new("/nonexistent/ffmpeg-binary");
        assert!(!t.available());
        let err = t
            .convert_subtitle(Path::new("/tmp/a.vtt"), Path::new("/tmp/a.srt"))
            .unwrap_err();
        assert!(matches!(err, DownloadError::TranscoderFailure(_)));
    }
}
