//! Single-object transfers that survive transient failures and restarts.
//!
//! Uploads live in [`upload`](crate::upload) and downloads in
//! [`download`](crate::download); both drive the same retry loop and record
//! their progress in the tracker store.

use std::io::{self, Read};
use std::sync::Arc;

use stowage_hashing::{DigestAlgorithm, HashCheck};
use stowage_store::ObjectStoreClient;

use crate::context::TransferContext;
use crate::state::TransferState;
use crate::TRANSFER_BUFFER_SIZE;

/// Drives one upload or download of one object to completion.
pub struct ResumableTransfer<'a> {
    pub(crate) ctx: &'a TransferContext,
    pub(crate) client: &'a dyn ObjectStoreClient,
}

impl<'a> ResumableTransfer<'a> {
    pub fn new(ctx: &'a TransferContext, client: &'a dyn ObjectStoreClient) -> Self {
        Self { ctx, client }
    }

    /// Creates the state for a transfer and starts reporting it.
    pub(crate) fn register(&self, name: &str, size: u64) -> Arc<TransferState> {
        let state = Arc::new(TransferState::new(name, size));
        self.ctx.progress.track(Arc::clone(&state));
        state
    }

    pub(crate) fn report(&self, state: &TransferState) {
        self.ctx.progress.report(&state.name());
    }

    /// Final report, then stops tracking.
    pub(crate) fn finish(&self, state: &TransferState) {
        let name = state.name();
        self.ctx.progress.report(&name);
        self.ctx.progress.untrack(&name);
    }

    /// Algorithms computed while uploading; what the store reports back is
    /// unknown until the upload completes.
    pub(crate) fn upload_algorithms(&self) -> Vec<DigestAlgorithm> {
        match self.ctx.config.hash_check {
            HashCheck::Never => Vec::new(),
            _ => vec![DigestAlgorithm::Md5, DigestAlgorithm::Crc32],
        }
    }
}

/// Fills `buf` from `reader`, asking for at most one transfer buffer per
/// read. Returns fewer bytes than `buf.len()` only at end of stream.
pub(crate) fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let end = (filled + TRANSFER_BUFFER_SIZE).min(buf.len());
        match reader.read(&mut buf[filled..end]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
