//! Error types for transfers.

use std::path::PathBuf;

use stowage_hashing::{DigestAlgorithm, HashError};
use stowage_store::{StoreError, is_transient_io};
use stowage_tracker::TrackerError;

use crate::config::ConfigError;

/// How a caller should react to a [`TransferError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient; retried in-process and only surfaced once retries run out.
    Retryable,
    /// The store refused the request; retrying will not help.
    PermanentRequest,
    /// The data can't be trusted; the untrustworthy artifact was removed.
    Integrity,
    /// Some components failed; a re-run resumes from what succeeded.
    PartialBatch,
    /// The destination already exists and overwriting was not allowed.
    Skipped,
    Cancelled,
    /// Local problem: filesystem, configuration, unsupported request.
    Local,
}

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("object store: {0}")]
    Store(#[from] StoreError),

    #[error("{algorithm} digest mismatch for {object}: local {local}, remote {remote}")]
    HashMismatch {
        object: String,
        algorithm: DigestAlgorithm,
        local: String,
        remote: String,
    },

    #[error("no digest available to validate {0}")]
    NoDigest(String),

    #[error("partial download {path:?} is {local_size} bytes, larger than the {expected}-byte source")]
    CorruptPartial {
        path: PathBuf,
        local_size: u64,
        expected: u64,
    },

    #[error("{failed} of {total} components failed to upload ({first}); run again to resume")]
    PartialBatch {
        failed: usize,
        total: usize,
        first: String,
    },

    #[error("gave up after {attempts} attempts without progress: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<TransferError>,
    },

    #[error("tracker: {0}")]
    Tracker(#[from] TrackerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("cancelled")]
    Cancelled,

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl From<HashError> for TransferError {
    fn from(e: HashError) -> Self {
        match e {
            HashError::Io(e) => Self::Io(e),
            HashError::Mismatch {
                object,
                algorithm,
                local,
                remote,
            } => Self::HashMismatch {
                object,
                algorithm,
                local,
                remote,
            },
            HashError::NoCommonDigest(object) => Self::NoDigest(object),
        }
    }
}

impl TransferError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Store(e) if e.is_retryable() => ErrorClass::Retryable,
            Self::Store(_) => ErrorClass::PermanentRequest,
            Self::HashMismatch { .. } | Self::NoDigest(_) | Self::CorruptPartial { .. } => {
                ErrorClass::Integrity
            }
            Self::PartialBatch { .. } => ErrorClass::PartialBatch,
            Self::RetriesExhausted { last, .. } => match last.class() {
                ErrorClass::Retryable => ErrorClass::PermanentRequest,
                other => other,
            },
            Self::AlreadyExists(_) => ErrorClass::Skipped,
            Self::Cancelled => ErrorClass::Cancelled,
            Self::Tracker(_) | Self::Io(_) | Self::Config(_) | Self::Unsupported(_) => {
                ErrorClass::Local
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// Wraps a failed read from a store media stream, which unlike a local
    /// file error may be retried.
    pub(crate) fn media(e: std::io::Error) -> Self {
        if is_transient_io(e.kind()) {
            Self::Store(StoreError::Io(e))
        } else {
            Self::Io(e)
        }
    }
}
