//! Header-only probe: a GET whose body is aborted after response headers.
//!
//! Recovers `Content-Length`, `Accept-Ranges`, the status code, and the
//! effective URL for range planning. A GET is used instead of HEAD because
//! some media CDNs block HEAD or answer it with bogus sizes.

use std::collections::HashMap;
use std::str;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::FetchError;

use super::transfer::{configure, curl_err};
use super::FetchPolicy;

/// Parsed response metadata needed for pre-planning.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    /// Final status code after redirects.
    pub status: u32,
    /// Total size in bytes, if `Content-Length` was present.
    pub content_length: Option<u64>,
    /// True if the server sent `Accept-Ranges: bytes`.
    pub accept_ranges: bool,
    /// `Content-Disposition` value if present (filename hint).
    pub content_disposition: Option<String>,
    /// Effective URL after redirects, when it differs from the request URL.
    pub effective_url: Option<String>,
}

/// Probes `url` and returns parsed header metadata.
///
/// Blocking; call from a worker thread or `spawn_blocking`.
pub fn probe(
    url: &str,
    headers: &HashMap<String, String>,
    policy: &FetchPolicy,
) -> Result<ProbeResult, FetchError> {
    let collected: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let body_seen = Arc::new(AtomicBool::new(false));

    let mut easy = curl::easy::Easy::new();
    configure(&mut easy, url, policy)?;

    if !headers.is_empty() {
        let mut list = curl::easy::List::new();
        for (k, v) in headers {
            list.append(&format!("{}: {}", k.trim(), v.trim()))
                .map_err(curl_err)?;
        }
        easy.http_headers(list).map_err(curl_err)?;
    }

    {
        let collected = Arc::clone(&collected);
        let body_seen = Arc::clone(&body_seen);
        let mut transfer = easy.transfer();
        transfer
            .header_function(move |data| {
                if let Ok(s) = str::from_utf8(data) {
                    let line = s.trim_end();
                    let mut lines = collected.lock().unwrap();
                    // A new status line means a redirect hop; drop the old headers.
                    if line.starts_with("HTTP/") {
                        lines.clear();
                    }
                    lines.push(line.to_string());
                }
                true
            })
            .map_err(curl_err)?;
        let body_seen_writer = Arc::clone(&body_seen);
        transfer
            .write_function(move |_data| {
                // Headers are complete once the first body byte arrives.
                body_seen_writer.store(true, Ordering::Relaxed);
                Ok(0)
            })
            .map_err(curl_err)?;

        if let Err(e) = transfer.perform() {
            // The deliberate body abort surfaces as a write error; anything
            // else is a genuine failure.
            let aborted_on_body = body_seen.load(Ordering::Relaxed)
                && (e.is_write_error() || e.is_aborted_by_callback());
            if !aborted_on_body {
                return Err(curl_err(e));
            }
        }
    }

    let status = easy.response_code().map_err(curl_err)?;
    if status == 0 || status >= 400 {
        return Err(FetchError::Http(status));
    }

    let effective_url = easy
        .effective_url()
        .ok()
        .flatten()
        .filter(|u| *u != url)
        .map(str::to_string);

    let lines = collected.lock().unwrap();
    let mut result = parse_headers(&lines);
    result.status = status;
    result.effective_url = effective_url;
    Ok(result)
}

/// Parse collected header lines into a [`ProbeResult`] (status/url left empty).
fn parse_headers(lines: &[String]) -> ProbeResult {
    let mut content_length = None;
    let mut accept_ranges = false;
    let mut content_disposition = None;

    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse::<u64>().ok();
        } else if name.eq_ignore_ascii_case("accept-ranges") {
            accept_ranges = value.eq_ignore_ascii_case("bytes");
        } else if name.eq_ignore_ascii_case("content-disposition") {
            content_disposition = Some(value.to_string());
        }
    }

    ProbeResult {
        status: 0,
        content_length,
        accept_ranges,
        content_disposition,
        effective_url: None,
    }
}
