//! One HTTP GET streamed to a sink, with cancel and per-chunk progress.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::FetchError;

use super::{FetchPolicy, MAX_REDIRECTS};

/// One transfer: URL, optional inclusive byte range, and request headers.
pub struct FetchRequest<'a> {
    pub url: &'a str,
    /// Inclusive byte range `[start, end]`; `None` requests the whole resource.
    pub range: Option<(u64, u64)>,
    pub headers: &'a HashMap<String, String>,
}

/// Where the body goes: appended to a file, or collected in memory.
pub enum FetchSink<'a> {
    /// Open in append mode; resumed segments continue at the current length.
    Append(&'a Path),
    Buffer(&'a mut Vec<u8>),
}

/// Result of a completed transfer.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// Final HTTP status code after redirects.
    pub status: u32,
    /// Effective URL after redirects, when it differs from the request URL.
    pub effective_url: Option<String>,
    pub bytes_written: u64,
}

/// Performs one GET and streams the body into `sink`.
///
/// `on_bytes` is invoked with each chunk's length as it lands on disk;
/// `cancel` is polled from curl's progress callback, and a `true` return
/// aborts the transfer with [`FetchError::Cancelled`]. Blocking; run on a
/// worker thread.
pub fn fetch(
    req: &FetchRequest<'_>,
    sink: FetchSink<'_>,
    policy: &FetchPolicy,
    cancel: &dyn Fn() -> bool,
    on_bytes: &(dyn Fn(u64) + Sync),
) -> Result<FetchOutcome, FetchError> {
    let mut easy = curl::easy::Easy::new();
    configure(&mut easy, req.url, policy)?;

    if let Some((start, end)) = req.range {
        easy.range(&format!("{}-{}", start, end)).map_err(curl_err)?;
        // Byte ranges must line up with stored offsets, so no transfer coding.
        easy.accept_encoding("identity").map_err(curl_err)?;
    } else {
        // Empty string lets libcurl advertise and decode everything it supports.
        easy.accept_encoding("").map_err(curl_err)?;
    }

    if !req.headers.is_empty() {
        let mut list = curl::easy::List::new();
        for (k, v) in req.headers {
            list.append(&format!("{}: {}", k.trim(), v.trim()))
                .map_err(curl_err)?;
        }
        easy.http_headers(list).map_err(curl_err)?;
    }

    let bytes_written = Arc::new(AtomicU64::new(0));
    let write_failed = Arc::new(AtomicBool::new(false));

    enum Target<'a> {
        File(std::fs::File),
        Buffer(&'a mut Vec<u8>),
    }
    let mut target = match sink {
        FetchSink::Append(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| FetchError::Filesystem(format!("{}: {}", path.display(), e)))?;
            Target::File(file)
        }
        FetchSink::Buffer(buf) => Target::Buffer(buf),
    };

    easy.progress(true).map_err(curl_err)?;

    {
        let counter = Arc::clone(&bytes_written);
        let failed = Arc::clone(&write_failed);
        let mut transfer = easy.transfer();
        transfer
            .write_function(move |data| {
                let res = match &mut target {
                    Target::File(f) => f.write_all(data),
                    Target::Buffer(b) => {
                        b.extend_from_slice(data);
                        Ok(())
                    }
                };
                match res {
                    Ok(()) => {
                        counter.fetch_add(data.len() as u64, Ordering::Relaxed);
                        on_bytes(data.len() as u64);
                        Ok(data.len())
                    }
                    Err(_) => {
                        failed.store(true, Ordering::Relaxed);
                        // Returning a short count makes curl abort with a write error.
                        Ok(0)
                    }
                }
            })
            .map_err(curl_err)?;
        transfer
            .progress_function(|_, _, _, _| !cancel())
            .map_err(curl_err)?;

        if let Err(e) = transfer.perform() {
            let received = bytes_written.load(Ordering::Relaxed);
            return Err(map_perform_error(
                &e,
                cancel(),
                write_failed.load(Ordering::Relaxed),
                received,
            ));
        }
    }

    let status = easy.response_code().map_err(curl_err)?;
    if !(200..300).contains(&status) {
        return Err(FetchError::Http(status));
    }

    let effective_url = easy
        .effective_url()
        .ok()
        .flatten()
        .filter(|u| *u != req.url)
        .map(str::to_string);

    Ok(FetchOutcome {
        status,
        effective_url,
        bytes_written: bytes_written.load(Ordering::Relaxed),
    })
}

pub(super) fn configure(
    easy: &mut curl::easy::Easy,
    url: &str,
    policy: &FetchPolicy,
) -> Result<(), FetchError> {
    easy.url(url).map_err(curl_err)?;
    easy.follow_location(true).map_err(curl_err)?;
    easy.max_redirections(MAX_REDIRECTS).map_err(curl_err)?;
    easy.useragent(&policy.user_agent).map_err(curl_err)?;
    easy.connect_timeout(policy.connect_timeout).map_err(curl_err)?;
    // The low-speed pair replaces a hard wall-clock timeout: a healthy slow
    // link survives, a stalled one is cut after the window.
    easy.low_speed_limit(policy.low_speed_floor).map_err(curl_err)?;
    easy.low_speed_time(policy.low_speed_window).map_err(curl_err)?;
    if policy.speed_cap > 0 {
        easy.max_recv_speed(policy.speed_cap).map_err(curl_err)?;
    }
    if let Some(ref referer) = policy.referer {
        easy.referer(referer).map_err(curl_err)?;
    }
    if let Some(ref proxy) = policy.proxy {
        easy.proxy(proxy).map_err(curl_err)?;
    }
    if let Some(ref cookie_file) = policy.cookie_file {
        easy.cookie_file(cookie_file).map_err(curl_err)?;
    }
    if let Some(ref credentials) = policy.credentials {
        if let Some((user, password)) = credentials.split_once(':') {
            easy.username(user).map_err(curl_err)?;
            easy.password(password).map_err(curl_err)?;
        }
    }
    if !policy.verify_ssl {
        easy.ssl_verify_peer(false).map_err(curl_err)?;
        easy.ssl_verify_host(false).map_err(curl_err)?;
    }
    Ok(())
}

pub(super) fn curl_err(e: curl::Error) -> FetchError {
    if e.is_ssl_certproblem() || e.is_peer_failed_verification() || e.is_ssl_cacert() {
        FetchError::Tls(e.to_string())
    } else {
        FetchError::Network(e.to_string())
    }
}

fn map_perform_error(
    e: &curl::Error,
    cancelled: bool,
    write_failed: bool,
    bytes_received: u64,
) -> FetchError {
    if e.is_aborted_by_callback() {
        if write_failed {
            return FetchError::Filesystem("segment write failed".to_string());
        }
        if cancelled {
            return FetchError::Cancelled;
        }
    }
    if e.is_write_error() && write_failed {
        return FetchError::Filesystem("segment write failed".to_string());
    }
    if e.is_ssl_certproblem() || e.is_peer_failed_verification() || e.is_ssl_cacert() {
        return FetchError::Tls(e.to_string());
    }
    if e.is_operation_timedout() {
        // With no total timeout set, a timeout here is either the connect
        // phase (nothing received) or the low-speed detector firing.
        if bytes_received > 0 {
            return FetchError::LowSpeedAbort;
        }
        return FetchError::Network(format!("connect timeout: {}", e));
    }
    FetchError::Network(e.to_string())
}
