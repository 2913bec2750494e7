//! Tracker files: small line-oriented records that let an interrupted
//! transfer pick up where it stopped after a process restart.

mod key;
mod record;
mod store;

pub use key::{MAX_TRACKER_FILE_NAME_LENGTH, TrackerKey, TrackerKind};
pub use record::{ParallelUploadState, TrackedComponent, TrackerRecord};
pub use store::{TrackerStore, default_tracker_dir};

/// Errors produced by the tracker crate.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed {kind} tracker record: {reason}")]
    Malformed { kind: TrackerKind, reason: String },

    #[error("invalid tracker field: {0}")]
    InvalidField(String),
}
