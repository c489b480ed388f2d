//! Status codes and the status snapshot shared by processes, workflow runs,
//! collections and service entries.
//!
//! Codes are serialized as integers and are stable across the system; the
//! HTTP layer and the on-disk snapshots both rely on the numeric values.

use serde::{Deserialize, Serialize};

/// Stable status codes of the state machine.
#[repr(i16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i16", try_from = "i16")]
pub enum StatusCode {
    /// Admitted, waiting for capacity or for upstream steps.
    Pending = 100,
    /// Partially complete. Carries a percentage.
    InProgress = 110,
    /// Terminal success. Used as "available" for collections and services.
    Done = 200,
    /// Workflow step that was never enqueued because an upstream step failed.
    Skipped = 210,
    /// Soft-deleted. Excluded from discovery, kept for history.
    Tombstoned = 410,
    /// Terminal, cancelled on request.
    Cancelled = 499,
    /// Terminal failure. Carries a diagnostic reference.
    Error = 500,
}

impl StatusCode {
    pub const ALL: [StatusCode; 7] = [
        Self::Pending,
        Self::InProgress,
        Self::Done,
        Self::Skipped,
        Self::Tombstoned,
        Self::Cancelled,
        Self::Error,
    ];

    pub fn code(self) -> i16 {
        self as i16
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Done | Self::Skipped | Self::Tombstoned | Self::Cancelled | Self::Error
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Done => "DONE",
            Self::Skipped => "SKIPPED",
            Self::Tombstoned => "TOMBSTONED",
            Self::Cancelled => "CANCELLED",
            Self::Error => "ERROR",
        }
    }
}

impl From<StatusCode> for i16 {
    fn from(value: StatusCode) -> Self {
        value as i16
    }
}

impl TryFrom<i16> for StatusCode {
    type Error = String;

    fn try_from(value: i16) -> Result<Self, String> {
        Self::ALL
            .into_iter()
            .find(|code| code.code() == value)
            .ok_or_else(|| format!("unknown status code {value}"))
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.label(), self.code())
    }
}

/// A status snapshot: `{statusCode, statusMessage, percentage}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    pub status_code: StatusCode,
    pub status_message: String,
    pub percentage: u8,
}

impl StatusRecord {
    pub fn new(status_code: StatusCode, status_message: impl Into<String>, percentage: u8) -> Self {
        Self {
            status_code,
            status_message: status_message.into(),
            percentage: percentage.min(100),
        }
    }

    pub fn pending(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Pending, message, 0)
    }

    pub fn in_progress(message: impl Into<String>, percentage: u8) -> Self {
        Self::new(StatusCode::InProgress, message, percentage)
    }

    pub fn done(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Done, message, 100)
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Skipped, message, 0)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Cancelled, message, 0)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Error, message, 0)
    }

    pub fn tombstoned() -> Self {
        Self::new(StatusCode::Tombstoned, "deleted", 0)
    }

    pub fn is_terminal(&self) -> bool {
        self.status_code.is_terminal()
    }

    /// Terminal success: a collection or service that can be used.
    pub fn is_available(&self) -> bool {
        self.status_code == StatusCode::Done
    }

    pub fn is_tombstoned(&self) -> bool {
        self.status_code == StatusCode::Tombstoned
    }
}

/// Integer percentage of `done` out of `total`, rounded down.
///
/// An empty total counts as complete.
pub fn percentage(done: u32, total: u32) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (u64::from(done.min(total)) * 100) / u64::from(total);
    pct as u8
}
