//! Logging setup: size-rotated file under the state dir, stderr fallback.
//!
//! Download runs are long and chatty (per-segment traces, pool decisions),
//! so the log file is rotated once per init when the previous run left it
//! oversized. Formatting happens on the subscriber side; hot-path call
//! sites only pay for event dispatch.

use anyhow::Result;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,sdm_core=debug,sdm_cli=debug";

const LOG_NAME: &str = "sdm.log";

/// Rotate when the previous run left more than this behind.
const MAX_LOG_BYTES: u64 = 8 * 1024 * 1024;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Keep exactly one previous generation: an oversized `sdm.log` becomes
/// `sdm.log.old`, replacing any earlier one.
fn rotate_if_oversized(path: &Path, max_bytes: u64) -> io::Result<()> {
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(_) => return Ok(()),
    };
    if len < max_bytes {
        return Ok(());
    }
    let mut rotated = path.as_os_str().to_owned();
    rotated.push(".old");
    fs::rename(path, PathBuf::from(rotated))
}

/// Initialize logging to `~/.local/state/sdm/sdm.log`, rotating the
/// previous run's log out of the way first. Returns Err when the state dir
/// is unwritable so the caller can fall back to [`init_logging_stderr`].
pub fn init_logging() -> Result<()> {
    let log_dir = crate::config::state_dir()?;
    fs::create_dir_all(&log_dir)?;
    let log_path = log_dir.join(LOG_NAME);
    rotate_if_oversized(&log_path, MAX_LOG_BYTES)?;

    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(Arc::new(file))
        .with_ansi(false)
        .init();

    tracing::info!(path = %log_path.display(), "logging started");
    Ok(())
}

/// Stderr-only logging for when no state dir is available.
pub fn init_logging_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_log_is_left_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join(LOG_NAME);
        fs::write(&log, b"a few lines").unwrap();
        rotate_if_oversized(&log, 1024).unwrap();
        assert!(log.exists());
        assert!(!dir.path().join("sdm.log.old").exists());
    }

    #[test]
    fn oversized_log_rotates_to_old() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join(LOG_NAME);
        fs::write(&log, vec![b'x'; 2048]).unwrap();
        rotate_if_oversized(&log, 1024).unwrap();
        assert!(!log.exists());
        let old = dir.path().join("sdm.log.old");
        assert_eq!(fs::metadata(&old).unwrap().len(), 2048);

        // A second rotation replaces the previous generation.
        fs::write(&log, vec![b'y'; 4096]).unwrap();
        rotate_if_oversized(&log, 1024).unwrap();
        assert_eq!(fs::metadata(&old).unwrap().len(), 4096);
    }

    #[test]
    fn missing_log_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        rotate_if_oversized(&dir.path().join(LOG_NAME), 1024).unwrap();
    }
}
