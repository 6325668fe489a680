//! Error kinds and classification for retry / throttling decisions.
//!
//! Workers never propagate errors across thread boundaries as panics; a
//! failed transfer is returned as a value, classified here, and fed into
//! the pool's error window.

use std::fmt;

use thiserror::Error;

/// Error from a single HTTP transfer (one segment fetch or probe).
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connect failure, DNS failure, reset, or read/write error.
    #[error("network error: {0}")]
    Network(String),
    /// Observed speed stayed below the configured floor for the whole window.
    #[error("transfer aborted: speed below floor")]
    LowSpeedAbort,
    /// Non-2xx HTTP status.
    #[error("HTTP {0}")]
    Http(u32),
    /// TLS certificate verification failed. Not retried.
    #[error("TLS verification failed: {0}")]
    Tls(String),
    /// Cooperative cancel observed in the progress callback.
    #[error("cancelled")]
    Cancelled,
    /// Local write to the segment file failed.
    #[error("filesystem error: {0}")]
    Filesystem(String),
}

/// Fatal, item-level failure. Anything here transitions the item to `Error`.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Error ceiling reached without throughput, or URL refresh exhausted.
    #[error("fatal network failure: {0}")]
    FatalNetwork(String),
    #[error("TLS verification failed: {0}")]
    SslVerify(String),
    #[error("filesystem failure: {0}")]
    Filesystem(String),
    #[error("invalid manifest: {0}")]
    ManifestInvalid(String),
    /// e.g. SAMPLE-AES encryption. Detected at pre-process, before any segment exists.
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    /// Both stream-copy and re-encode attempts failed; carries the stderr tail.
    #[error("transcoder failed: {0}")]
    TranscoderFailure(String),
}

/// Classification of a segment failure, drives worker/pool behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry within the pool; counts toward the error window.
    TransientNetwork,
    /// 403/410: the signed URL likely expired; request an item-level refresh.
    StaleUrl,
    /// TLS failure: fatal for the item, never retried.
    SslVerify,
    /// User cancel: not an error, stop quietly.
    UserCancel,
    /// Local I/O failure: fatal for the item.
    Filesystem,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::TransientNetwork => "transient network error",
            ErrorKind::StaleUrl => "stale url",
            ErrorKind::SslVerify => "ssl verification failure",
            ErrorKind::UserCancel => "user cancel",
            ErrorKind::Filesystem => "filesystem failure",
        };
        f.write_str(s)
    }
}

/// Classify an HTTP status code for worker decisions.
pub fn classify_http_status(code: u32) -> ErrorKind {
    match code {
        403 | 410 => ErrorKind::StaleUrl,
        _ => ErrorKind::TransientNetwork,
    }
}

/// Classify a fetch error into a pool-level kind.
pub fn classify(e: &FetchError) -> ErrorKind {
    match e {
        FetchError::Network(_) | FetchError::LowSpeedAbort => ErrorKind::TransientNetwork,
        FetchError::Http(code) => classify_http_status(*code),
        FetchError::Tls(_) => ErrorKind::SslVerify,
        FetchError::Cancelled => ErrorKind::UserCancel,
        FetchError::Filesystem(_) => ErrorKind::Filesystem,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_403_and_410_are_stale() {
        assert_eq!(classify_http_status(403), ErrorKind::StaleUrl);
        assert_eq!(classify_http_status(410), ErrorKind::StaleUrl);
    }

    #[test]
    fn http_5xx_and_other_4xx_are_transient() {
        assert_eq!(classify_http_status(500), ErrorKind::TransientNetwork);
        assert_eq!(classify_http_status(503), ErrorKind::TransientNetwork);
        assert_eq!(classify_http_status(404), ErrorKind::TransientNetwork);
        assert_eq!(classify_http_status(429), ErrorKind::TransientNetwork);
    }

    #[test]
    fn tls_and_cancel_classification() {
        assert_eq!(
            classify(&FetchError::Tls("self signed".into())),
            ErrorKind::SslVerify
        );
        assert_eq!(classify(&FetchError::Cancelled), ErrorKind::UserCancel);
        assert_eq!(
            classify(&FetchError::LowSpeedAbort),
            ErrorKind::TransientNetwork
        );
    }
}
