//! Terminal observer: renders item events as single status lines.

use sdm_core::events::{ItemEvent, ProgressSink};

/// Prints one line per event; progress lines are throttled by the core's
/// emission cadence, not here.
pub struct StdoutView;

impl ProgressSink for StdoutView {
    fn notify(&self, event: &ItemEvent) {
        match event {
            ItemEvent::StatusChanged { uid, status } => {
                println!("[{}] {}", short(uid), status);
            }
            ItemEvent::Progress {
                uid,
                downloaded,
                total_size,
                rate,
                eta_secs,
            } => {
                let pct = if *total_size > 0 {
                    format!("{:3}%", (downloaded * 100 / total_size).min(100))
                } else {
                    "  ?%".to_string()
                };
                let eta = eta_secs
                    .map(|s| format!("{}m{:02}s", s / 60, s % 60))
                    .unwrap_or_else(|| "--".to_string());
                println!(
                    "[{}] {} {} / {} ({}/s, eta {})",
                    short(uid),
                    pct,
                    human(*downloaded),
                    human(*total_size),
                    human(*rate),
                    eta
                );
            }
            ItemEvent::Failed { uid, message } => {
                eprintln!("[{}] failed: {}", short(uid), message);
            }
        }
    }
}

fn short(uid: &str) -> &str {
    &uid[..uid.len().min(8)]
}

/// Compact byte formatting for status lines.
pub fn human(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
