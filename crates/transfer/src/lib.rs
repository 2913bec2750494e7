//! Resumable, verified and parallel object transfers.
//!
//! [`CopyPlanner`] is the entry point: it routes a copy to a simple or
//! resumable upload, a resumable download, a server-side copy, a
//! daisy-chained stream between providers, or a parallel composite upload.
//! Progress that must survive a crash is written to a
//! [`TrackerStore`](stowage_tracker::TrackerStore), so running the same copy
//! again picks up where the last one stopped.

mod config;
mod context;
mod daisy_chain;
mod download;
mod error;
mod file_part;
mod parallel;
mod planner;
mod progress;
mod resumable;
mod retry;
mod state;
mod upload;

#[cfg(test)]
mod testutil;

pub use config::{CHUNK_GRANULARITY, ConfigError, TransferConfig};
pub use context::TransferContext;
pub use daisy_chain::DaisyChainStream;
pub use download::{DownloadOutcome, DownloadStrategy};
pub use error::{ErrorClass, TransferError};
pub use file_part::FilePart;
pub use parallel::{Partition, ParallelUploadOrchestrator, component_object_name, partition};
pub use planner::{CopyOptions, CopyPlanner, CopyResult};
pub use progress::{ProgressCallback, ProgressTracker, SpeedCalculator};
pub use resumable::ResumableTransfer;
pub use retry::{RetryPolicy, RetryState};
pub use state::{TransferPhase, TransferProgress, TransferState};

/// Size of one daisy-chain chunk and the largest read a consumer of a
/// [`DaisyChainStream`] may request.
pub const TRANSFER_BUFFER_SIZE: usize = 8 * 1024;
