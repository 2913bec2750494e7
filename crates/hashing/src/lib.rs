//! Content digests for transfers.
//!
//! Digests are computed incrementally while bytes flow, can be seeded by
//! re-reading an already transferred prefix, and are compared against the
//! values an object store reports once a transfer completes.

mod algorithm;
mod digest_set;
mod reader;
mod verify;

pub use algorithm::{DigestAlgorithm, Digester};
pub use digest_set::{DigestSet, digest_file, digest_range};
pub use reader::HashingReader;
pub use verify::{HashCheck, Verification, digests_match, select_algorithms, verify};

/// Read size used when catching digests up from a local file.
pub const HASH_BUFFER_SIZE: usize = 8 * 1024;

/// Catch-up hashing at or above this many bytes is logged, since it can
/// stall a transfer for a noticeable time.
pub const MIN_SIZE_COMPUTE_LOGGING: u64 = 100 * 1024 * 1024;

/// Errors produced by the hashing crate.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{algorithm} digest mismatch for {object}: local {local}, remote {remote}")]
    Mismatch {
        object: String,
        algorithm: DigestAlgorithm,
        local: String,
        remote: String,
    },

    #[error("no digest available to validate {0}")]
    NoCommonDigest(String),
}
