//! Immutable runtime configuration, loaded once and passed into the Controller.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Runtime configuration loaded from `~/.config/sdm/config.toml`.
///
/// The engine never mutates this after construction; per-item overrides
/// (e.g. `max_connections`) are copied onto the item when it is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum items in the `downloading` state at once.
    pub max_concurrent_downloads: usize,
    /// Hard upper bound on concurrent connections per item.
    pub max_connections: usize,
    /// Total download speed cap per item in bytes/sec, 0 = unlimited.
    pub speed_limit: u64,
    /// Minimum leftover bytes for a live segment to be eligible for splitting.
    /// Also sets the single-segment cutoff: files below 20x this get one segment.
    pub segment_size_threshold: u64,
    /// Abort on TLS certificate verification failure when true.
    pub verify_ssl: bool,
    /// Proxy URL, scheme selects the type (http, https, socks4, socks4a, socks5, socks5h).
    pub proxy: Option<String>,
    /// Netscape-format cookie file handed to the HTTP client.
    pub cookie_file: Option<PathBuf>,
    /// Basic auth credentials as `user:password`.
    pub credentials: Option<String>,
    pub user_agent: String,
    pub referer: Option<String>,
    /// Path to the external transcoder binary.
    pub ffmpeg_path: PathBuf,
    /// Retain temp folders after completion (debugging).
    pub keep_temp: bool,
    /// Log MD5/SHA-256 of the final file after completion.
    pub checksum: bool,
    /// Embed extractor metadata into the finished file when available.
    pub write_metadata: bool,
    /// How many times a stale URL may be refreshed before the item errors out.
    pub refresh_url_retries: u32,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Abort a transfer when speed stays below this many bytes/sec...
    pub low_speed_floor: u32,
    /// ...for this many seconds.
    pub low_speed_window_secs: u64,
    /// How often the pool inspects the error window, in milliseconds.
    pub errors_check_interval_ms: u64,
    /// Base wait before growing the connection budget, in milliseconds.
    pub conn_grow_interval_ms: u64,
    /// Abort the item after this many errors with no intervening throughput.
    pub max_error_ceiling: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            max_connections: 10,
            speed_limit: 0,
            segment_size_threshold: 1024 * 1024,
            verify_ssl: true,
            proxy: None,
            cookie_file: None,
            credentials: None,
            user_agent: concat!("SDM/", env!("CARGO_PKG_VERSION")).to_string(),
            referer: None,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            keep_temp: false,
            checksum: false,
            write_metadata: true,
            refresh_url_retries: 1,
            connect_timeout_secs: 10,
            low_speed_floor: 1024,
            low_speed_window_secs: 10,
            errors_check_interval_ms: 200,
            conn_grow_interval_ms: 500,
            max_error_ceiling: 100,
        }
    }
}

impl RuntimeConfig {
    /// Clamp hand-edited values the engine cannot operate with. A zero in
    /// any of these would stall the pool (no connections, no check ticks)
    /// or divide a speed share by zero, so they snap back to the default
    /// instead of failing the whole load.
    pub fn normalized(mut self) -> Self {
        let defaults = RuntimeConfig::default();
        if self.max_concurrent_downloads == 0 {
            self.max_concurrent_downloads = defaults.max_concurrent_downloads;
        }
        if self.max_connections == 0 {
            self.max_connections = defaults.max_connections;
        }
        if self.segment_size_threshold == 0 {
            self.segment_size_threshold = defaults.segment_size_threshold;
        }
        if self.errors_check_interval_ms == 0 {
            self.errors_check_interval_ms = defaults.errors_check_interval_ms;
        }
        if self.conn_grow_interval_ms == 0 {
            self.conn_grow_interval_ms = defaults.conn_grow_interval_ms;
        }
        if self.low_speed_window_secs == 0 {
            self.low_speed_window_secs = defaults.low_speed_window_secs;
        }
        if self.connect_timeout_secs == 0 {
            self.connect_timeout_secs = defaults.connect_timeout_secs;
        }
        self
    }
}

pub fn config_path() -> Result<PathBuf> {
    Ok(xdg::BaseDirectories::with_prefix("sdm")?.place_config_file("config.toml")?)
}

/// Directory for persisted state (item registry, logs).
pub fn state_dir() -> Result<PathBuf> {
    Ok(xdg::BaseDirectories::with_prefix("sdm")?.get_state_home())
}

/// Read the user config, seeding the file with defaults on first run.
///
/// A file that exists but cannot be read or parsed is left untouched and
/// the run continues on defaults; a typo in one key must not brick every
/// `sdm` invocation until someone fixes the TOML by hand. Loaded values
/// pass through [`RuntimeConfig::normalized`].
pub fn load_or_init() -> Result<RuntimeConfig> {
    let path = config_path()?;
    if !path.exists() {
        let cfg = RuntimeConfig::default();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml::to_string_pretty(&cfg)?)?;
        tracing::info!(path = %path.display(), "seeded initial config");
        return Ok(cfg);
    }

    let cfg = match fs::read_to_string(&path) {
        Ok(data) => match toml::from_str::<RuntimeConfig>(&data) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "config does not parse, running on defaults");
                RuntimeConfig::default()
            }
        },
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "config unreadable, running on defaults");
            RuntimeConfig::default()
        }
    };
    Ok(cfg.normalized())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.max_concurrent_downloads, 3);
        assert_eq!(cfg.max_connections, 10);
        assert_eq!(cfg.segment_size_threshold, 1024 * 1024);
        assert!(cfg.verify_ssl);
        assert_eq!(cfg.low_speed_floor, 1024);
        assert_eq!(cfg.low_speed_window_secs, 10);
        assert_eq!(cfg.errors_check_interval_ms, 200);
        assert_eq!(cfg.max_error_ceiling, 100);
    }

    #[test]
    fn config_toml_roundtrip() {
        let cfg = RuntimeConfig::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: RuntimeConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.max_connections, cfg.max_connections);
        assert_eq!(parsed.speed_limit, cfg.speed_limit);
        assert_eq!(parsed.ffmpeg_path, cfg.ffmpeg_path);
    }

    #[test]
    fn config_toml_partial_file_uses_defaults() {
        let toml = r#"
            max_connections = 4
            speed_limit = 500000
        "#;
        let cfg: RuntimeConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.max_connections, 4);
        assert_eq!(cfg.speed_limit, 500_000);
        // untouched fields fall back to defaults
        assert_eq!(cfg.max_concurrent_downloads, 3);
        assert!(cfg.verify_ssl);
    }

    #[test]
    fn normalized_snaps_unusable_zeros_to_defaults() {
        let toml = r#"
            max_connections = 0
            max_concurrent_downloads = 0
            errors_check_interval_ms = 0
            low_speed_window_secs = 0
        "#;
        let cfg: RuntimeConfig = toml::from_str(toml).unwrap();
        let cfg = cfg.normalized();
        assert_eq!(cfg.max_connections, 10);
        assert_eq!(cfg.max_concurrent_downloads, 3);
        assert_eq!(cfg.errors_check_interval_ms, 200);
        assert_eq!(cfg.low_speed_window_secs, 10);
    }

    #[test]
    fn normalized_keeps_valid_values() {
        let mut cfg = RuntimeConfig::default();
        cfg.max_connections = 2;
        cfg.speed_limit = 0; // 0 is meaningful here: unlimited
        let cfg = cfg.normalized();
        assert_eq!(cfg.max_connections, 2);
        assert_eq!(cfg.speed_limit, 0);
    }
}
