use std::collections::BTreeMap;
use std::io::{self, Read, Seek, SeekFrom};

use stowage_hashing::{DigestSet, HashingReader, verify};
use stowage_store::{ObjectDescriptor, ResumableStatus, ResumeHandle, StoreError, UploadRequest};
use stowage_tracker::{TrackerKey, TrackerRecord};
use tracing::{debug, info, warn};

use crate::TransferError;
use crate::resumable::{ResumableTransfer, read_full};
use crate::retry;
use crate::state::TransferState;

/// Per-upload mutable state carried across attempts.
struct UploadRun<'r, R> {
    request: &'r UploadRequest,
    key: &'r TrackerKey,
    size: u64,
    reader: HashingReader<R>,
    handle: Option<ResumeHandle>,
    needs_query: bool,
    committed: u64,
    buf: Vec<u8>,
}

impl ResumableTransfer<'_> {
    /// Uploads `size` bytes from `source` through a resumable session.
    ///
    /// A session recorded under `key` is resumed at the offset the server
    /// reports. A new session's handle is written to the tracker before
    /// any byte is sent, and the committed offset after every chunk. The
    /// record is deleted on success and kept on failure.
    pub fn upload<R: Read + Seek>(
        &self,
        request: &UploadRequest,
        source: R,
        size: u64,
        key: &TrackerKey,
    ) -> Result<ObjectDescriptor, TransferError> {
        let name = request.object.url();
        let state = self.register(&name, size);
        let result = self.run_upload(request, source, size, key, &state);
        match &result {
            Ok(_) => state.complete(),
            Err(e) => state.abort(&e.to_string()),
        }
        self.finish(&state);
        result
    }

    fn run_upload<R: Read + Seek>(
        &self,
        request: &UploadRequest,
        source: R,
        size: u64,
        key: &TrackerKey,
        state: &TransferState,
    ) -> Result<ObjectDescriptor, TransferError> {
        let name = request.object.url();
        let handle = self.load_upload_handle(key)?;
        let mut run = UploadRun {
            request,
            key,
            size,
            reader: HashingReader::new(source, DigestSet::new(&self.upload_algorithms())),
            needs_query: handle.is_some(),
            handle,
            committed: 0,
            buf: vec![0u8; self.ctx.config.resumable_chunk_size],
        };

        let mut retries = self.ctx.retry_policy().start();
        let descriptor = loop {
            self.ctx.check_cancelled()?;
            state.begin_attempt();
            match self.upload_attempt(&mut run, state) {
                Ok(descriptor) => break descriptor,
                Err(e) => {
                    let msg = e.to_string();
                    let delay = retries.on_failure(e, run.committed, &name)?;
                    state.pause(&msg);
                    retry::sleep(&self.ctx.cancel, delay)?;
                    run.needs_query = run.handle.is_some();
                }
            }
        };

        self.ctx.tracker.delete(key)?;
        self.verify_upload(&descriptor, &run.reader.finalize())?;
        info!(object = %name, bytes = size, "upload complete");
        Ok(descriptor)
    }

    fn load_upload_handle(&self, key: &TrackerKey) -> Result<Option<ResumeHandle>, TransferError> {
        let Some(record) = self.ctx.tracker.load(key)? else {
            return Ok(None);
        };
        let TrackerRecord::UploadResume { handle, offset } = record else {
            return Ok(None);
        };
        match ResumeHandle::decode(&handle) {
            Ok(handle) => {
                info!(?handle, offset, "found upload session to resume");
                Ok(Some(handle))
            }
            Err(e) => {
                warn!(error = %e, "discarding unusable upload session");
                self.ctx.tracker.delete(key)?;
                Ok(None)
            }
        }
    }

    fn upload_attempt<R: Read + Seek>(
        &self,
        run: &mut UploadRun<'_, R>,
        state: &TransferState,
    ) -> Result<ObjectDescriptor, TransferError> {
        let mut fresh_session = false;
        let handle = loop {
            let handle = match run.handle.clone() {
                Some(handle) => handle,
                None => {
                    let handle = self
                        .client
                        .start_resumable_upload(run.request, Some(run.size))?;
                    self.ctx.tracker.save(
                        run.key,
                        &TrackerRecord::UploadResume {
                            handle: handle.encode(),
                            offset: 0,
                        },
                    )?;
                    debug!(object = %run.request.object, ?handle, "started upload session");
                    run.handle = Some(handle.clone());
                    run.committed = 0;
                    run.needs_query = false;
                    fresh_session = true;
                    handle
                }
            };
            if !run.needs_query {
                break handle;
            }
            match self.client.query_resumable_upload(&handle) {
                Ok(ResumableStatus::Complete(descriptor)) => {
                    // The server finished before we heard back; catch the
                    // digests up so the result can still be verified.
                    run.reader.seek(SeekFrom::Start(run.size))?;
                    return Ok(descriptor);
                }
                Ok(ResumableStatus::Incomplete { persisted }) => {
                    if persisted > run.size {
                        return Err(StoreError::BadRequest(format!(
                            "server holds {persisted} bytes of a {}-byte upload",
                            run.size
                        ))
                        .into());
                    }
                    if persisted > 0 {
                        info!(object = %run.request.object, offset = persisted, "resuming upload");
                    }
                    run.committed = persisted;
                    run.needs_query = false;
                    break handle;
                }
                Err(StoreError::NotFound(_) | StoreError::InvalidHandle(_)) => {
                    self.restart_session(run)?;
                }
                Err(e) => return Err(e.into()),
            }
        };

        run.reader.seek(SeekFrom::Start(run.committed))?;
        state.set_transferred(run.committed);

        loop {
            self.ctx.check_cancelled()?;
            let n = read_full(&mut run.reader, &mut run.buf)?;
            if n == 0 && run.committed < run.size {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "source ended after {} of {} bytes",
                        run.committed, run.size
                    ),
                )
                .into());
            }
            let status = match self.client.upload_resumable_chunk(
                &handle,
                run.committed,
                &run.buf[..n],
                Some(run.size),
            ) {
                Ok(status) => status,
                Err(StoreError::NotFound(_)) if !fresh_session => {
                    self.restart_session(run)?;
                    return self.upload_attempt(run, state);
                }
                Err(e) => return Err(e.into()),
            };
            match status {
                ResumableStatus::Complete(descriptor) => return Ok(descriptor),
                ResumableStatus::Incomplete { persisted } => {
                    let sent_to = run.committed + n as u64;
                    run.committed = persisted;
                    self.ctx.tracker.save(
                        run.key,
                        &TrackerRecord::UploadResume {
                            handle: handle.encode(),
                            offset: persisted,
                        },
                    )?;
                    state.set_transferred(persisted);
                    self.report(state);
                    if persisted != sent_to {
                        debug!(persisted, sent_to, "server kept part of a chunk");
                        run.reader.seek(SeekFrom::Start(persisted))?;
                    }
                    if n == 0 {
                        return Err(StoreError::BadRequest(format!(
                            "store did not finalize upload at {persisted} bytes"
                        ))
                        .into());
                    }
                }
            }
        }
    }

    /// Drops an expired session so the next pass opens a new one.
    fn restart_session<R: Read + Seek>(&self, run: &mut UploadRun<'_, R>) -> Result<(), TransferError> {
        warn!(object = %run.request.object, "upload session expired; starting over");
        run.handle = None;
        run.needs_query = false;
        run.committed = 0;
        self.ctx.tracker.delete(run.key)?;
        Ok(())
    }

    /// Uploads a seekable source in a single request, retrying from the
    /// start on transient failures.
    pub fn upload_simple<R: Read + Seek>(
        &self,
        request: &UploadRequest,
        source: R,
        size: u64,
    ) -> Result<ObjectDescriptor, TransferError> {
        let name = request.object.url();
        let state = self.register(&name, size);
        let mut reader = HashingReader::new(source, DigestSet::new(&self.upload_algorithms()));
        let mut retries = self.ctx.retry_policy().start();

        let result = loop {
            if let Err(e) = self.ctx.check_cancelled() {
                break Err(e);
            }
            state.begin_attempt();
            let attempt = reader
                .seek(SeekFrom::Start(0))
                .map_err(TransferError::from)
                .and_then(|_| {
                    self.client
                        .upload_simple(request, &mut reader, Some(size))
                        .map_err(TransferError::from)
                });
            match attempt {
                Ok(descriptor) => break Ok(descriptor),
                Err(e) => {
                    let msg = e.to_string();
                    match retries.on_failure(e, 0, &name) {
                        Ok(delay) => {
                            state.pause(&msg);
                            if let Err(e) = retry::sleep(&self.ctx.cancel, delay) {
                                break Err(e);
                            }
                        }
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        let result = result.and_then(|descriptor| {
            self.verify_upload(&descriptor, &reader.finalize())?;
            Ok(descriptor)
        });
        match &result {
            Ok(_) => state.complete(),
            Err(e) => state.abort(&e.to_string()),
        }
        self.finish(&state);
        result
    }

    /// Uploads a non-seekable stream in one attempt.
    pub fn upload_stream(
        &self,
        request: &UploadRequest,
        source: &mut dyn Read,
    ) -> Result<ObjectDescriptor, TransferError> {
        let name = request.object.url();
        let state = self.register(&name, 0);
        state.begin_attempt();
        let mut tee = Tee {
            inner: source,
            digests: DigestSet::new(&self.upload_algorithms()),
        };
        let result = self
            .client
            .upload_simple(request, &mut tee, None)
            .map_err(TransferError::from)
            .and_then(|descriptor| {
                self.verify_upload(&descriptor, &tee.digests.finalize())?;
                Ok(descriptor)
            });
        match &result {
            Ok(_) => state.complete(),
            Err(e) => state.abort(&e.to_string()),
        }
        self.finish(&state);
        result
    }

    /// Compares what was sent with what the store reports. An object that
    /// fails the check is deleted.
    pub(crate) fn verify_upload(
        &self,
        descriptor: &ObjectDescriptor,
        local: &BTreeMap<String, String>,
    ) -> Result<(), TransferError> {
        let name = descriptor.object.url();
        if let Err(e) = verify(&name, local, &descriptor.digests, self.ctx.config.hash_check) {
            warn!(object = %name, error = %e, "uploaded object failed verification; deleting it");
            let mut object = descriptor.object.clone();
            object.generation = descriptor.generation.clone();
            if let Err(del) = self.client.delete_object(&object) {
                warn!(object = %name, error = %del, "could not delete corrupt upload");
            }
            return Err(e.into());
        }
        Ok(())
    }
}

/// Digests bytes as they pass through to the store.
struct Tee<'a> {
    inner: &'a mut dyn Read,
    digests: DigestSet,
}

impl Read for Tee<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digests.update(&buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Arc;
    use std::time::Duration;

    use stowage_store::memory::{Fault, FaultError, FaultOp, MemoryStore};
    use stowage_store::ObjectStoreClient;
    use stowage_tracker::TrackerKind;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::testutil::{cancel_after, context, patient, pattern};

    const CHUNK: usize = 256 * 1024;

    fn setup(tmp: &tempfile::TempDir) -> (Arc<MemoryStore>, crate::TransferContext) {
        let store = Arc::new(MemoryStore::new("mem"));
        let ctx = context(tmp, Arc::clone(&store) as Arc<dyn ObjectStoreClient>, |c| {
            c.resumable_chunk_size = CHUNK;
        });
        (store, ctx)
    }

    fn key(obj: &str) -> TrackerKey {
        TrackerKey::new(TrackerKind::Upload, obj, "test-source")
    }

    #[test]
    fn uploads_in_chunks_and_clears_tracker() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, ctx) = setup(&tmp);
        let data = pattern(3 * CHUNK + 17);
        let obj = store.object("b", "big");
        let k = key("mem://b/big");

        let xfer = ResumableTransfer::new(&ctx, store.as_ref());
        let desc = xfer
            .upload(
                &UploadRequest::new(obj.clone()),
                Cursor::new(data.clone()),
                data.len() as u64,
                &k,
            )
            .unwrap();

        assert_eq!(desc.size, data.len() as u64);
        assert_eq!(store.object_data(&obj).unwrap(), data);
        assert_eq!(store.stats().chunks, 4);
        assert!(ctx.tracker.load(&k).unwrap().is_none());
    }

    #[test]
    fn interrupted_upload_resumes_at_committed_offset() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, ctx) = setup(&tmp);
        let data = pattern(5 * CHUNK + 100);
        let obj = store.object("b", "resume");
        let k = key("mem://b/resume");

        // Permanent failure once two chunks are in: simulates a killed process.
        store.inject(
            Fault::new(FaultOp::Chunk, "resume")
                .error(FaultError::AccessDenied)
                .after_bytes(2 * CHUNK as u64)
                .times(1),
        );
        let xfer = ResumableTransfer::new(&ctx, store.as_ref());
        let err = xfer
            .upload(
                &UploadRequest::new(obj.clone()),
                Cursor::new(data.clone()),
                data.len() as u64,
                &k,
            )
            .unwrap_err();
        assert!(matches!(err, TransferError::Store(StoreError::AccessDenied(_))));
        assert_eq!(
            ctx.tracker.load(&k).unwrap().map(|r| match r {
                TrackerRecord::UploadResume { offset, .. } => offset,
                _ => u64::MAX,
            }),
            Some(2 * CHUNK as u64)
        );

        let desc = xfer
            .upload(
                &UploadRequest::new(obj.clone()),
                Cursor::new(data.clone()),
                data.len() as u64,
                &k,
            )
            .unwrap();
        assert_eq!(store.object_data(&obj).unwrap(), data);
        assert_eq!(store.stats().resumable_starts, 1);
        assert_eq!(store.stats().bytes_received, data.len() as u64);
        assert!(desc.digests.contains_key("md5"));
        assert!(ctx.tracker.load(&k).unwrap().is_none());
    }

    #[test]
    fn resume_is_correct_at_many_interruption_points() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, ctx) = setup(&tmp);
        let data = pattern(4 * CHUNK + 3);
        for (i, cut) in [0u64, 1, 2, 3, 4].into_iter().enumerate() {
            let name = format!("cut{i}");
            let obj = store.object("b", &name);
            let k = key(&obj.url());
            store.inject(
                Fault::new(FaultOp::Chunk, name.as_str())
                    .error(FaultError::AccessDenied)
                    .after_bytes(cut * CHUNK as u64)
                    .times(1),
            );
            let xfer = ResumableTransfer::new(&ctx, store.as_ref());
            let req = UploadRequest::new(obj.clone());
            assert!(xfer
                .upload(&req, Cursor::new(data.clone()), data.len() as u64, &k)
                .is_err());
            xfer.upload(&req, Cursor::new(data.clone()), data.len() as u64, &k)
                .unwrap();
            assert_eq!(store.object_data(&obj).unwrap(), data, "cut at chunk {cut}");
        }
    }

    #[test]
    fn transient_chunk_failures_are_retried() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, ctx) = setup(&tmp);
        let data = pattern(2 * CHUNK);
        let obj = store.object("b", "flaky");
        store.inject(
            Fault::new(FaultOp::Chunk, "flaky")
                .error(FaultError::ConnectionReset)
                .after_bytes(CHUNK as u64)
                .times(2),
        );
        let xfer = ResumableTransfer::new(&ctx, store.as_ref());
        xfer.upload(
            &UploadRequest::new(obj.clone()),
            Cursor::new(data.clone()),
            data.len() as u64,
            &key("mem://b/flaky"),
        )
        .unwrap();
        assert_eq!(store.object_data(&obj).unwrap(), data);
        assert_eq!(store.stats().resumable_starts, 1);
    }

    #[test]
    fn persistent_transient_failure_exhausts_retries() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, ctx) = setup(&tmp);
        let data = pattern(CHUNK);
        store.inject(Fault::new(FaultOp::Chunk, "stuck").error(FaultError::Service(503)));
        let k = key("mem://b/stuck");
        let xfer = ResumableTransfer::new(&ctx, store.as_ref());
        let err = xfer
            .upload(
                &UploadRequest::new(store.object("b", "stuck")),
                Cursor::new(data.clone()),
                data.len() as u64,
                &k,
            )
            .unwrap_err();
        assert!(matches!(err, TransferError::RetriesExhausted { .. }));
        // Kept for a later run.
        assert!(ctx.tracker.load(&k).unwrap().is_some());
    }

    #[test]
    fn expired_session_starts_over() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, ctx) = setup(&tmp);
        let data = pattern(CHUNK + 5);
        let k = key("mem://b/expired");
        ctx.tracker
            .save(
                &k,
                &TrackerRecord::UploadResume {
                    handle: "uri:mem://upload/gone".into(),
                    offset: 100,
                },
            )
            .unwrap();
        let obj = store.object("b", "expired");
        let xfer = ResumableTransfer::new(&ctx, store.as_ref());
        xfer.upload(
            &UploadRequest::new(obj.clone()),
            Cursor::new(data.clone()),
            data.len() as u64,
            &k,
        )
        .unwrap();
        assert_eq!(store.object_data(&obj).unwrap(), data);
    }

    #[test]
    fn empty_upload_completes() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, ctx) = setup(&tmp);
        let obj = store.object("b", "empty");
        let xfer = ResumableTransfer::new(&ctx, store.as_ref());
        let desc = xfer
            .upload(
                &UploadRequest::new(obj.clone()),
                Cursor::new(Vec::new()),
                0,
                &key("mem://b/empty"),
            )
            .unwrap();
        assert_eq!(desc.size, 0);
        assert_eq!(store.object_data(&obj).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn simple_upload_retries_from_start() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, ctx) = setup(&tmp);
        store.inject(
            Fault::new(FaultOp::SimpleUpload, "small")
                .error(FaultError::Service(500))
                .times(1),
        );
        let obj = store.object("b", "small");
        let xfer = ResumableTransfer::new(&ctx, store.as_ref());
        xfer.upload_simple(&UploadRequest::new(obj.clone()), Cursor::new(b"tiny".to_vec()), 4)
            .unwrap();
        assert_eq!(store.object_data(&obj).unwrap(), b"tiny");
        assert_eq!(store.upload_attempts("small"), 2);
    }

    #[test]
    fn stream_upload_is_single_attempt() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, ctx) = setup(&tmp);
        store.inject(
            Fault::new(FaultOp::SimpleUpload, "stream")
                .error(FaultError::Service(500))
                .times(1),
        );
        let xfer = ResumableTransfer::new(&ctx, store.as_ref());
        let mut src = &b"from a pipe"[..];
        let req = UploadRequest::new(store.object("b", "stream"));
        assert!(xfer.upload_stream(&req, &mut src).is_err());
        assert_eq!(store.upload_attempts("stream"), 1);
    }

    #[test]
    fn upload_corrupted_by_store_is_deleted() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, ctx) = setup(&tmp);
        store.corrupt_writes("garbled");
        let xfer = ResumableTransfer::new(&ctx, store.as_ref());

        let simple = store.object("b", "garbled-simple");
        let err = xfer
            .upload_simple(&UploadRequest::new(simple.clone()), Cursor::new(b"tiny".to_vec()), 4)
            .unwrap_err();
        assert!(matches!(err, TransferError::HashMismatch { .. }));
        assert!(store.object_data(&simple).is_none());

        let data = pattern(2 * CHUNK + 9);
        let chunked = store.object("b", "garbled-chunked");
        let err = xfer
            .upload(
                &UploadRequest::new(chunked.clone()),
                Cursor::new(data.clone()),
                data.len() as u64,
                &key("mem://b/garbled-chunked"),
            )
            .unwrap_err();
        assert!(matches!(err, TransferError::HashMismatch { .. }));
        assert!(store.object_data(&chunked).is_none());
        assert!(store.keys("b").is_empty());
    }

    #[test]
    fn cancelled_upload_keeps_session_for_resume() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new("mem"));
        let mut ctx = context(&tmp, Arc::clone(&store) as Arc<dyn ObjectStoreClient>, |c| {
            c.resumable_chunk_size = CHUNK;
            patient(c);
        });
        let data = pattern(3 * CHUNK);
        let obj = store.object("b", "halted");
        let k = key("mem://b/halted");
        let req = UploadRequest::new(obj.clone());

        // The second chunk keeps failing until the upload is cancelled
        // during a retry wait.
        store.inject(Fault::new(FaultOp::Chunk, "halted").after_bytes(CHUNK as u64));
        let canceller = cancel_after(&ctx, Duration::from_millis(100));
        let err = ResumableTransfer::new(&ctx, store.as_ref())
            .upload(&req, Cursor::new(data.clone()), data.len() as u64, &k)
            .unwrap_err();
        canceller.join().unwrap();
        assert!(matches!(err, TransferError::Cancelled));
        assert!(store.object_data(&obj).is_none());
        assert!(matches!(
            ctx.tracker.load(&k).unwrap(),
            Some(TrackerRecord::UploadResume { offset, .. }) if offset == CHUNK as u64
        ));

        store.clear_faults();
        ctx.cancel = CancellationToken::new();
        ResumableTransfer::new(&ctx, store.as_ref())
            .upload(&req, Cursor::new(data.clone()), data.len() as u64, &k)
            .unwrap();
        assert_eq!(store.object_data(&obj).unwrap(), data);
        assert_eq!(store.stats().resumable_starts, 1);
        assert_eq!(store.stats().bytes_received, data.len() as u64);
    }
}
