//! Single-transfer HTTP fetcher built on libcurl.
//!
//! One call performs one GET (ranged or whole) and streams the body to a
//! sink without buffering the response. Redirects, proxy, TLS policy,
//! per-transfer speed cap, and the low-speed abort all live here; retry
//! and concurrency are the pool's business.

mod probe;
mod transfer;

pub use probe::{probe, ProbeResult};
pub use transfer::{fetch, FetchOutcome, FetchRequest, FetchSink};

use crate::config::RuntimeConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Maximum redirects followed per transfer.
pub(crate) const MAX_REDIRECTS: u32 = 10;

/// Connection policy shared by every transfer of an item.
///
/// Built once from [`RuntimeConfig`]; the per-worker speed cap and the
/// end-of-run low-speed tightening are applied per request on top of it.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub user_agent: String,
    pub referer: Option<String>,
    /// Proxy URL; the scheme selects the type (http, socks5, socks5h, ...).
    pub proxy: Option<String>,
    pub cookie_file: Option<PathBuf>,
    /// Basic auth as `user:password`.
    pub credentials: Option<String>,
    pub verify_ssl: bool,
    pub connect_timeout: Duration,
    /// Abort when speed stays below this many bytes/sec...
    pub low_speed_floor: u32,
    /// ...for this long.
    pub low_speed_window: Duration,
    /// Per-transfer receive cap in bytes/sec, 0 = unlimited.
    pub speed_cap: u64,
}

impl FetchPolicy {
    pub fn from_config(cfg: &RuntimeConfig) -> Self {
        Self {
            user_agent: cfg.user_agent.clone(),
            referer: cfg.referer.clone(),
            proxy: cfg.proxy.clone(),
            cookie_file: cfg.cookie_file.clone(),
            credentials: cfg.credentials.clone(),
            verify_ssl: cfg.verify_ssl,
            connect_timeout: Duration::from_secs(cfg.connect_timeout_secs),
            low_speed_floor: cfg.low_speed_floor,
            low_speed_window: Duration::from_secs(cfg.low_speed_window_secs),
            speed_cap: 0,
        }
    }

    /// Same policy with a different speed cap (per-worker share).
    pub fn with_speed_cap(&self, cap: u64) -> Self {
        let mut p = self.clone();
        p.speed_cap = cap;
        p
    }

    /// Same policy with a tightened low-speed floor (end-of-run workers).
    pub fn with_low_speed(&self, floor: u32, window: Duration) -> Self {
        let mut p = self.clone();
        p.low_speed_floor = floor;
        p.low_speed_window = window;
        p
    }
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}
