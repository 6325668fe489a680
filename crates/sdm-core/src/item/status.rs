//! Item lifecycle states and the legal transitions between them.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a download item.
///
/// Only the item's brain performs transitions; views observe. `Cancelled`
/// is reachable from anywhere and idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting for a scheduler slot.
    Pending,
    /// Held until a wall-clock target, then promoted to `Pending`.
    Scheduled,
    Downloading,
    /// Segments complete; post-processing (mux/convert/metadata) running.
    Processing,
    /// A worker saw a stale-URL signal; the refresh hook is being consulted.
    RefreshingUrl,
    Completed,
    Cancelled,
    Error,
}

impl Status {
    /// True for states an item never leaves on its own.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Cancelled | Status::Error)
    }

    /// True while the item owns live workers or the file manager.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Status::Downloading | Status::Processing | Status::RefreshingUrl
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Scheduled => "scheduled",
            Status::Downloading => "downloading",
            Status::Processing => "processing",
            Status::RefreshingUrl => "refreshing_url",
            Status::Completed => "completed",
            Status::Cancelled => "cancelled",
            Status::Error => "error",
        }
    }

    /// Whether moving `self -> to` is a legal transition.
    ///
    /// `Cancelled` and `Error` are reachable from any non-terminal state;
    /// a user may re-queue a cancelled or failed item back to `Pending`.
    pub fn can_transition(self, to: Status) -> bool {
        if self == to {
            return false;
        }
        match (self, to) {
            (from, Status::Cancelled) => !from.is_terminal(),
            (from, Status::Error) => !from.is_terminal(),
            (Status::Pending, Status::Downloading) => true,
            (Status::Pending, Status::Scheduled) => true,
            (Status::Scheduled, Status::Pending) => true,
            (Status::Downloading, Status::RefreshingUrl) => true,
            (Status::RefreshingUrl, Status::Downloading) => true,
            (Status::Downloading, Status::Processing) => true,
            (Status::Processing, Status::Completed) => true,
            (Status::Cancelled | Status::Error, Status::Pending) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
