//! Post-completion checksum report (MD5 + SHA-256).
//!
//! Digests are computed on demand after an item finishes, never inline with
//! the transfer path.

use anyhow::{Context, Result};
use md5::Md5;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

const BUF_SIZE: usize = 64 * 1024;

/// Compute MD5 and SHA-256 of a file in one pass, returned as lowercase hex.
pub fn md5_sha256_path(path: &Path) -> Result<(String, String)> {
    let mut f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut md5 = Md5::new();
    let mut sha256 = Sha256::new();
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = f
            .read(&mut buf)
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        md5.update(&buf[..n]);
        sha256.update(&buf[..n]);
    }
    Ok((hex::encode(md5.finalize()), hex::encode(sha256.finalize())))
}

/// Compute SHA-256 only (used by external verification flows).
pub fn sha256_path(path: &Path) -> Result<String> {
    let mut f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = f
            .read(&mut buf)
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
