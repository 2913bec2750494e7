use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use stowage_hashing::{DigestAlgorithm, DigestSet, digest_file, verify};
use stowage_store::{ObjectDescriptor, StoreError};
use stowage_tracker::{TrackerKey, TrackerRecord};
use tracing::{debug, info, warn};

use crate::resumable::ResumableTransfer;
use crate::state::TransferState;
use crate::{TRANSFER_BUFFER_SIZE, TransferError, retry};

/// How a download treats an existing partial file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadStrategy {
    /// Write from scratch; the tracker is never touched.
    OneShot,
    /// Resume a partial file recorded under the key when the source is
    /// unchanged.
    Resumable(TrackerKey),
}

/// What a finished download did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Bytes fetched from the store by this call.
    pub bytes_transferred: u64,
    /// Offset the transfer resumed from (0 for a fresh download).
    pub resumed_from: u64,
    /// Encoded digests of the whole local file.
    pub digests: std::collections::BTreeMap<String, String>,
}

struct DownloadRun<'p> {
    path: &'p Path,
    file: File,
    regular: bool,
    offset: u64,
    digests: DigestSet,
    stale: bool,
}

impl ResumableTransfer<'_> {
    /// Downloads `descriptor` into `path`, computing `algorithms` on the way
    /// and verifying them against the store's digests at the end.
    pub fn download(
        &self,
        descriptor: &ObjectDescriptor,
        path: &Path,
        strategy: DownloadStrategy,
        algorithms: &[DigestAlgorithm],
    ) -> Result<DownloadOutcome, TransferError> {
        let name = descriptor.object.url();
        let state = self.register(&name, descriptor.size);
        let result = self.run_download(descriptor, path, strategy, algorithms, &state);
        match &result {
            Ok(_) => state.complete(),
            Err(e) => state.abort(&e.to_string()),
        }
        self.finish(&state);
        result
    }

    fn run_download(
        &self,
        descriptor: &ObjectDescriptor,
        path: &Path,
        strategy: DownloadStrategy,
        algorithms: &[DigestAlgorithm],
        state: &TransferState,
    ) -> Result<DownloadOutcome, TransferError> {
        let key = match strategy {
            DownloadStrategy::Resumable(key) if descriptor.etag.is_some() => Some(key),
            DownloadStrategy::Resumable(_) => {
                debug!(object = %descriptor.object, "no etag; downloading in one shot");
                None
            }
            DownloadStrategy::OneShot => None,
        };

        let mut run = match &key {
            Some(key) => self.prepare_resumable(descriptor, path, key, algorithms)?,
            None => {
                let file = File::create(path)?;
                let regular = file.metadata()?.is_file();
                DownloadRun {
                    path,
                    file,
                    regular,
                    offset: 0,
                    digests: DigestSet::new(algorithms),
                    stale: false,
                }
            }
        };
        let resumed_from = run.offset;
        let name = descriptor.object.url();

        let mut retries = self.ctx.retry_policy().start();
        while run.offset < descriptor.size {
            self.ctx.check_cancelled()?;
            state.begin_attempt();
            state.set_transferred(run.offset);
            match self.fetch(descriptor, &mut run, state) {
                Ok(()) => {}
                Err(e) => {
                    let msg = e.to_string();
                    let delay = retries.on_failure(e, run.offset, &name)?;
                    state.pause(&msg);
                    retry::sleep(&self.ctx.cancel, delay)?;
                    realign(&mut run)?;
                }
            }
        }

        if run.regular {
            run.file.sync_all()?;
        }
        drop(run.file);

        let local = if run.stale {
            info!(path = %path.display(), "recomputing digests from the completed file");
            digest_file(path, algorithms)?
        } else {
            run.digests.finalize()
        };

        if let Err(e) = verify(&name, &local, &descriptor.digests, self.ctx.config.hash_check) {
            warn!(path = %path.display(), error = %e, "downloaded file failed verification; deleting it");
            if run.regular {
                if let Err(rm) = fs::remove_file(path) {
                    warn!(path = %path.display(), error = %rm, "could not delete corrupt download");
                }
            }
            if let Some(key) = &key {
                self.ctx.tracker.delete(key)?;
            }
            return Err(e.into());
        }

        if let Some(key) = &key {
            self.ctx.tracker.delete(key)?;
        }
        info!(object = %name, path = %path.display(), bytes = descriptor.size, "download complete");
        Ok(DownloadOutcome {
            bytes_transferred: descriptor.size - resumed_from,
            resumed_from,
            digests: local,
        })
    }

    /// Opens `path` for a resumable download, reusing the partial file when
    /// the tracker says it came from the same object version.
    fn prepare_resumable<'p>(
        &self,
        descriptor: &ObjectDescriptor,
        path: &'p Path,
        key: &TrackerKey,
        algorithms: &[DigestAlgorithm],
    ) -> Result<DownloadRun<'p>, TransferError> {
        let tracked_etag = match self.ctx.tracker.load(key)? {
            Some(TrackerRecord::DownloadResume { etag }) => Some(etag),
            _ => None,
        };
        let same_source = tracked_etag.is_some() && tracked_etag == descriptor.etag;

        if same_source && path.is_file() {
            let mut file = OpenOptions::new().read(true).write(true).open(path)?;
            let local_size = file.metadata()?.len();
            if local_size > descriptor.size {
                warn!(
                    path = %path.display(),
                    local_size,
                    expected = descriptor.size,
                    "partial download is larger than its source; deleting it"
                );
                drop(file);
                self.ctx.tracker.delete(key)?;
                fs::remove_file(path)?;
                return Err(TransferError::CorruptPartial {
                    path: path.to_path_buf(),
                    local_size,
                    expected: descriptor.size,
                });
            }

            let mut digests = DigestSet::new(algorithms);
            if local_size > 0 {
                info!(path = %path.display(), offset = local_size, "resuming download");
                file.seek(SeekFrom::Start(0))?;
                let read = digests.catch_up(&mut file, local_size)?;
                if read != local_size {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("partial file shrank while reading it ({read} of {local_size} bytes)"),
                    )
                    .into());
                }
            }
            file.seek(SeekFrom::Start(local_size))?;
            return Ok(DownloadRun {
                path,
                file,
                regular: true,
                offset: local_size,
                digests,
                stale: false,
            });
        }

        let file = File::create(path)?;
        if let Some(etag) = &descriptor.etag {
            self.ctx.tracker.save(
                key,
                &TrackerRecord::DownloadResume { etag: etag.clone() },
            )?;
        }
        Ok(DownloadRun {
            path,
            regular: file.metadata()?.is_file(),
            file,
            offset: 0,
            digests: DigestSet::new(algorithms),
            stale: false,
        })
    }

    /// One attempt: stream from the current offset to the end.
    fn fetch(
        &self,
        descriptor: &ObjectDescriptor,
        run: &mut DownloadRun<'_>,
        state: &TransferState,
    ) -> Result<(), TransferError> {
        let mut media = self.client.get_object_media(
            &descriptor.object,
            run.offset,
            None,
            descriptor.resume_handle.as_ref(),
        )?;
        let mut buf = vec![0u8; TRANSFER_BUFFER_SIZE];
        while run.offset < descriptor.size {
            self.ctx.check_cancelled()?;
            let n = match media.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransferError::media(e)),
            };
            if run.offset + n as u64 > descriptor.size {
                return Err(StoreError::BadRequest(format!(
                    "{} returned more than its {} bytes",
                    descriptor.object, descriptor.size
                ))
                .into());
            }
            run.file.write_all(&buf[..n])?;
            run.digests.update(&buf[..n]);
            run.offset += n as u64;
            state.set_transferred(run.offset);
            self.report(state);
        }
        if run.offset < descriptor.size {
            return Err(TransferError::media(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "stream for {} ended at {} of {} bytes",
                    descriptor.object, run.offset, descriptor.size
                ),
            )));
        }
        Ok(())
    }
}

/// Brings the write position back in line with the bytes accounted for
/// after a failed attempt. A file whose length no longer matches keeps the
/// download correct but forces a full recompute of the digests.
fn realign(run: &mut DownloadRun<'_>) -> Result<(), TransferError> {
    if !run.regular {
        return Ok(());
    }
    let len = fs::metadata(run.path)?.len();
    if len != run.offset {
        warn!(
            path = %run.path.display(),
            len,
            expected = run.offset,
            "local file diverged from the download; digests will be recomputed"
        );
        run.stale = true;
        run.file.set_len(run.offset)?;
    }
    run.file.seek(SeekFrom::Start(run.offset))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use stowage_hashing::{DigestAlgorithm, HashCheck};
    use stowage_store::ObjectStoreClient;
    use stowage_store::memory::{Fault, FaultError, FaultOp, MemoryStore};
    use stowage_tracker::TrackerKind;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::testutil::{cancel_after, context, patient, pattern};

    const ALGS: [DigestAlgorithm; 2] = [DigestAlgorithm::Md5, DigestAlgorithm::Crc32];

    fn setup(tmp: &tempfile::TempDir) -> (Arc<MemoryStore>, crate::TransferContext) {
        let store = Arc::new(MemoryStore::new("mem"));
        let ctx = context(tmp, Arc::clone(&store) as Arc<dyn ObjectStoreClient>, |_| {});
        (store, ctx)
    }

    fn resumable(path: &Path) -> DownloadStrategy {
        DownloadStrategy::Resumable(TrackerKey::new(
            TrackerKind::Download,
            &path.display().to_string(),
            "mem://b/src",
        ))
    }

    #[test]
    fn one_shot_download_verifies() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, ctx) = setup(&tmp);
        let data = pattern(100_000);
        let desc = store.put_object(&store.object("b", "src"), data.clone());
        let path = tmp.path().join("out");

        let xfer = ResumableTransfer::new(&ctx, store.as_ref());
        let outcome = xfer
            .download(&desc, &path, DownloadStrategy::OneShot, &ALGS)
            .unwrap();
        assert_eq!(fs::read(&path).unwrap(), data);
        assert_eq!(outcome.bytes_transferred, data.len() as u64);
        assert_eq!(outcome.digests["md5"], desc.digests["md5"]);
        assert!(fs::read_dir(tmp.path().join("trackers")).unwrap().next().is_none());
    }

    #[test]
    fn resumes_from_partial_file() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, ctx) = setup(&tmp);
        let data = pattern(300_000);
        let desc = store.put_object(&store.object("b", "src"), data.clone());
        let path = tmp.path().join("out");
        let strategy = resumable(&path);
        let DownloadStrategy::Resumable(key) = &strategy else {
            unreachable!()
        };

        // An earlier run got this far before dying.
        fs::write(&path, &data[..120_000]).unwrap();
        ctx.tracker
            .save(
                key,
                &TrackerRecord::DownloadResume {
                    etag: desc.etag.clone().unwrap(),
                },
            )
            .unwrap();

        let xfer = ResumableTransfer::new(&ctx, store.as_ref());
        let outcome = xfer.download(&desc, &path, strategy.clone(), &ALGS).unwrap();
        assert_eq!(outcome.resumed_from, 120_000);
        assert_eq!(outcome.bytes_transferred, 180_000);
        assert_eq!(fs::read(&path).unwrap(), data);
        assert!(ctx.tracker.load(key).unwrap().is_none());
    }

    #[test]
    fn changed_source_starts_over() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, ctx) = setup(&tmp);
        let data = pattern(50_000);
        let desc = store.put_object(&store.object("b", "src"), data.clone());
        let path = tmp.path().join("out");
        let strategy = resumable(&path);
        let DownloadStrategy::Resumable(key) = &strategy else {
            unreachable!()
        };
        fs::write(&path, b"stale bytes from another version").unwrap();
        ctx.tracker
            .save(key, &TrackerRecord::DownloadResume { etag: "old".into() })
            .unwrap();

        let xfer = ResumableTransfer::new(&ctx, store.as_ref());
        let outcome = xfer.download(&desc, &path, strategy.clone(), &ALGS).unwrap();
        assert_eq!(outcome.resumed_from, 0);
        assert_eq!(fs::read(&path).unwrap(), data);
    }

    #[test]
    fn partial_larger_than_source_is_deleted() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, ctx) = setup(&tmp);
        let desc = store.put_object(&store.object("b", "src"), pattern(1000));
        let path = tmp.path().join("out");
        let strategy = resumable(&path);
        let DownloadStrategy::Resumable(key) = &strategy else {
            unreachable!()
        };
        fs::write(&path, pattern(2000)).unwrap();
        ctx.tracker
            .save(
                key,
                &TrackerRecord::DownloadResume {
                    etag: desc.etag.clone().unwrap(),
                },
            )
            .unwrap();

        let xfer = ResumableTransfer::new(&ctx, store.as_ref());
        let err = xfer
            .download(&desc, &path, strategy.clone(), &ALGS)
            .unwrap_err();
        assert!(matches!(err, TransferError::CorruptPartial { local_size: 2000, .. }));
        assert!(!path.exists());
        assert!(ctx.tracker.load(key).unwrap().is_none());
    }

    #[test]
    fn complete_partial_skips_transfer() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, ctx) = setup(&tmp);
        let data = pattern(4000);
        let desc = store.put_object(&store.object("b", "src"), data.clone());
        let path = tmp.path().join("out");
        let strategy = resumable(&path);
        let DownloadStrategy::Resumable(key) = &strategy else {
            unreachable!()
        };
        fs::write(&path, &data).unwrap();
        ctx.tracker
            .save(
                key,
                &TrackerRecord::DownloadResume {
                    etag: desc.etag.clone().unwrap(),
                },
            )
            .unwrap();
        let reads_before = store.stats().media_reads;

        let xfer = ResumableTransfer::new(&ctx, store.as_ref());
        let outcome = xfer.download(&desc, &path, strategy.clone(), &ALGS).unwrap();
        assert_eq!(outcome.bytes_transferred, 0);
        assert_eq!(store.stats().media_reads, reads_before);
    }

    #[test]
    fn broken_stream_is_retried_from_offset() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, ctx) = setup(&tmp);
        let data = pattern(200_000);
        let desc = store.put_object(&store.object("b", "src"), data.clone());
        store.inject(
            Fault::new(FaultOp::Media, "src")
                .error(FaultError::ConnectionReset)
                .after_bytes(70_000)
                .times(1),
        );
        let path = tmp.path().join("out");
        let xfer = ResumableTransfer::new(&ctx, store.as_ref());
        xfer.download(&desc, &path, resumable(&path), &ALGS).unwrap();
        assert_eq!(fs::read(&path).unwrap(), data);
        assert_eq!(store.stats().media_reads, 2);
    }

    #[test]
    fn permanent_failure_keeps_tracker_and_partial() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, ctx) = setup(&tmp);
        let data = pattern(100_000);
        let desc = store.put_object(&store.object("b", "src"), data.clone());
        store.inject(Fault::new(FaultOp::Media, "src").after_bytes(40_000));
        let path = tmp.path().join("out");
        let strategy = resumable(&path);
        let DownloadStrategy::Resumable(key) = &strategy else {
            unreachable!()
        };

        let xfer = ResumableTransfer::new(&ctx, store.as_ref());
        let err = xfer
            .download(&desc, &path, strategy.clone(), &ALGS)
            .unwrap_err();
        assert!(matches!(err, TransferError::RetriesExhausted { .. }));
        assert!(ctx.tracker.load(key).unwrap().is_some());
        assert_eq!(fs::metadata(&path).unwrap().len(), 40_000);

        store.clear_faults();
        let outcome = xfer.download(&desc, &path, strategy.clone(), &ALGS).unwrap();
        assert_eq!(outcome.resumed_from, 40_000);
        assert_eq!(fs::read(&path).unwrap(), data);
    }

    #[test]
    fn corrupt_content_deletes_file() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, ctx) = setup(&tmp);
        let obj = store.object("b", "src");
        let desc = store.put_object(&obj, pattern(10_000));
        store.corrupt_object(&obj, 5_000);
        let path = tmp.path().join("out");

        let xfer = ResumableTransfer::new(&ctx, store.as_ref());
        let err = xfer
            .download(&desc, &path, resumable(&path), &ALGS)
            .unwrap_err();
        assert!(matches!(err, TransferError::HashMismatch { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn required_check_fails_without_digests() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new("mem"));
        let ctx = context(&tmp, Arc::clone(&store) as Arc<dyn ObjectStoreClient>, |c| {
            c.hash_check = HashCheck::Required;
        });
        let mut desc = store.put_object(&store.object("b", "src"), pattern(10));
        desc.digests.clear();
        let path = tmp.path().join("out");
        let xfer = ResumableTransfer::new(&ctx, store.as_ref());
        let err = xfer
            .download(&desc, &path, DownloadStrategy::OneShot, &ALGS)
            .unwrap_err();
        assert!(matches!(err, TransferError::NoDigest(_)));
        assert!(!path.exists());
    }

    #[test]
    fn realign_truncates_diverged_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f");
        fs::write(&path, pattern(100)).unwrap();
        let mut run = DownloadRun {
            path: &path,
            file: OpenOptions::new().read(true).write(true).open(&path).unwrap(),
            regular: true,
            offset: 60,
            digests: DigestSet::new(&ALGS),
            stale: false,
        };
        realign(&mut run).unwrap();
        assert!(run.stale);
        assert_eq!(fs::metadata(&path).unwrap().len(), 60);
    }

    #[test]
    fn cancelled_download_keeps_partial_for_resume() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new("mem"));
        let mut ctx = context(&tmp, Arc::clone(&store) as Arc<dyn ObjectStoreClient>, patient);
        let data = pattern(200_000);
        let desc = store.put_object(&store.object("b", "src"), data.clone());
        let path = tmp.path().join("out");
        let strategy = resumable(&path);
        let DownloadStrategy::Resumable(key) = strategy.clone() else {
            unreachable!()
        };

        // Every read from 64 KiB on fails until the token fires.
        store.inject(Fault::new(FaultOp::Media, "src").after_bytes(65_536));
        let canceller = cancel_after(&ctx, Duration::from_millis(100));
        let err = ResumableTransfer::new(&ctx, store.as_ref())
            .download(&desc, &path, strategy.clone(), &ALGS)
            .unwrap_err();
        canceller.join().unwrap();
        assert!(matches!(err, TransferError::Cancelled));
        assert_eq!(fs::metadata(&path).unwrap().len(), 65_536);
        assert!(matches!(
            ctx.tracker.load(&key).unwrap(),
            Some(TrackerRecord::DownloadResume { .. })
        ));

        store.clear_faults();
        ctx.cancel = CancellationToken::new();
        let outcome = ResumableTransfer::new(&ctx, store.as_ref())
            .download(&desc, &path, strategy, &ALGS)
            .unwrap();
        assert_eq!(outcome.resumed_from, 65_536);
        assert_eq!(fs::read(&path).unwrap(), data);
        assert!(ctx.tracker.load(&key).unwrap().is_none());
    }
}
