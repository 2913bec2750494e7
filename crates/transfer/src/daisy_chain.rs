//! Streams one object into an upload of another without touching disk.
//!
//! A producer thread downloads the source into a bounded queue of
//! [`TRANSFER_BUFFER_SIZE`] chunks; the consumer is an upload reading the
//! stream through [`Read`] and [`Seek`]. Chunks start at multiples of the
//! chunk size from the offset the producer was started at, so a consumer
//! reading whole chunks never has to split one.
//!
//! Memory stays bounded by the configured capacity, which includes the last
//! chunk handed out (kept so a one-chunk rewind needs no new download).

use std::collections::VecDeque;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use stowage_store::{ObjectDescriptor, ObjectRef, ObjectStoreClient, ResumeHandle, StoreError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ConfigError;
use crate::context::TransferContext;
use crate::retry::{self, RetryPolicy};
use crate::{TRANSFER_BUFFER_SIZE, TransferError};

enum Item {
    Data(Vec<u8>),
    Failed(io::Error),
}

impl Item {
    fn len(&self) -> usize {
        match self {
            Self::Data(chunk) => chunk.len(),
            Self::Failed(_) => 0,
        }
    }
}

struct Queue {
    chunks: VecDeque<Item>,
    /// Bytes queued plus the retained last chunk.
    buffered: usize,
    capacity: usize,
    /// Bumped whenever the stream restarts; producers of older epochs exit.
    epoch: u64,
    closed: bool,
    /// The current producer has delivered everything it will.
    done: bool,
    peak: usize,
    position: u64,
    last_position: u64,
    last_chunk: Option<Vec<u8>>,
}

struct Shared {
    queue: Mutex<Queue>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl Shared {
    fn is_current(&self, epoch: u64) -> bool {
        let q = self.queue.lock().unwrap();
        !q.closed && q.epoch == epoch
    }

    /// Blocks until `item` fits. Returns false once the producer is stale.
    fn push(&self, epoch: u64, item: Item) -> bool {
        let len = item.len();
        let mut q = self.queue.lock().unwrap();
        loop {
            if q.closed || q.epoch != epoch {
                return false;
            }
            if q.buffered + len <= q.capacity {
                break;
            }
            q = self.not_full.wait(q).unwrap();
        }
        q.buffered += len;
        q.peak = q.peak.max(q.buffered);
        q.chunks.push_back(item);
        self.not_empty.notify_one();
        true
    }

    fn finish(&self, epoch: u64, failure: Option<io::Error>) {
        let mut q = self.queue.lock().unwrap();
        if q.closed || q.epoch != epoch {
            return;
        }
        if let Some(e) = failure {
            q.chunks.push_back(Item::Failed(e));
        }
        q.done = true;
        self.not_empty.notify_all();
    }
}

/// What a producer downloads from.
#[derive(Clone)]
struct Source {
    client: Arc<dyn ObjectStoreClient>,
    object: ObjectRef,
    handle: Option<ResumeHandle>,
    size: u64,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl Source {
    fn produce(&self, shared: &Shared, start: u64, epoch: u64) {
        let what = self.object.url();
        let mut retries = self.policy.start();
        // Bytes fetched so far, including those waiting in `pending`.
        let mut offset = start;
        let mut pending = Vec::with_capacity(TRANSFER_BUFFER_SIZE);
        loop {
            if offset >= self.size {
                shared.finish(epoch, None);
                return;
            }
            if !shared.is_current(epoch) {
                return;
            }
            match self.pump(shared, epoch, &mut offset, &mut pending) {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    let waited = retries
                        .on_failure(e, offset, &what)
                        .and_then(|delay| retry::sleep(&self.cancel, delay));
                    if let Err(e) = waited {
                        warn!(object = %what, error = %e, "daisy chain source failed");
                        shared.finish(epoch, Some(into_io(e)));
                        return;
                    }
                }
            }
        }
    }

    /// Streams from `offset` until the end or a failure. Partial chunks
    /// survive a failure in `pending` so chunk boundaries stay aligned.
    fn pump(
        &self,
        shared: &Shared,
        epoch: u64,
        offset: &mut u64,
        pending: &mut Vec<u8>,
    ) -> Result<bool, TransferError> {
        let mut media =
            self.client
                .get_object_media(&self.object, *offset, None, self.handle.as_ref())?;
        while *offset < self.size {
            let filled = pending.len();
            let want = (TRANSFER_BUFFER_SIZE - filled).min((self.size - *offset) as usize);
            pending.resize(filled + want, 0);
            let n = match media.read(&mut pending[filled..]) {
                Ok(n) => n,
                Err(e) => {
                    pending.truncate(filled);
                    if e.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(TransferError::media(e));
                }
            };
            pending.truncate(filled + n);
            if n == 0 {
                return Err(TransferError::media(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{} ended at {} of {} bytes", self.object, offset, self.size),
                )));
            }
            *offset += n as u64;
            if pending.len() == TRANSFER_BUFFER_SIZE || *offset == self.size {
                let chunk = std::mem::replace(pending, Vec::with_capacity(TRANSFER_BUFFER_SIZE));
                if !shared.push(epoch, Item::Data(chunk)) {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

fn into_io(e: TransferError) -> io::Error {
    match e {
        TransferError::Store(StoreError::Io(e)) | TransferError::Io(e) => e,
        other => io::Error::other(other),
    }
}

fn fatal(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.into())
}

/// Readable, seekable view of a remote object backed by a background
/// download.
pub struct DaisyChainStream {
    shared: Arc<Shared>,
    source: Source,
    producers: Vec<JoinHandle<()>>,
}

impl DaisyChainStream {
    /// Opens `source` with the configured buffer capacity.
    pub fn open(
        ctx: &TransferContext,
        client: Arc<dyn ObjectStoreClient>,
        source: &ObjectDescriptor,
    ) -> Result<Self, TransferError> {
        Self::open_with_capacity(ctx, client, source, ctx.config.daisy_chain_buffer_size)
    }

    pub fn open_with_capacity(
        ctx: &TransferContext,
        client: Arc<dyn ObjectStoreClient>,
        source: &ObjectDescriptor,
        capacity: usize,
    ) -> Result<Self, TransferError> {
        if capacity < 2 * TRANSFER_BUFFER_SIZE {
            return Err(ConfigError::Invalid {
                field: "daisy_chain_buffer_size",
                reason: format!("{capacity} cannot hold two {TRANSFER_BUFFER_SIZE}-byte chunks"),
            }
            .into());
        }
        let mut object = source.object.clone();
        object.generation = source.generation.clone();
        let mut stream = Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue {
                    chunks: VecDeque::new(),
                    buffered: 0,
                    capacity,
                    epoch: 0,
                    closed: false,
                    done: false,
                    peak: 0,
                    position: 0,
                    last_position: 0,
                    last_chunk: None,
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
            }),
            source: Source {
                client,
                object,
                handle: source.resume_handle.clone(),
                size: source.size,
                policy: ctx.retry_policy(),
                cancel: ctx.cancel.clone(),
            },
            producers: Vec::new(),
        };
        debug!(object = %source.object, size = source.size, capacity, "opening daisy chain");
        stream.spawn(0, 0)?;
        Ok(stream)
    }

    fn spawn(&mut self, start: u64, epoch: u64) -> io::Result<()> {
        let source = self.source.clone();
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("daisy-chain".into())
            .spawn(move || source.produce(&shared, start, epoch))?;
        self.producers.retain(|h| !h.is_finished());
        self.producers.push(handle);
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.source.size
    }

    pub fn tell(&self) -> u64 {
        self.shared.queue.lock().unwrap().position
    }

    /// Most bytes held at once so far.
    pub fn peak_buffered(&self) -> usize {
        self.shared.queue.lock().unwrap().peak
    }

    /// Stops the producer and waits for it to exit.
    pub fn close(&mut self) {
        {
            let mut q = self.shared.queue.lock().unwrap();
            q.closed = true;
            q.chunks.clear();
            q.last_chunk = None;
            q.buffered = 0;
        }
        self.shared.not_full.notify_all();
        self.shared.not_empty.notify_all();
        for handle in self.producers.drain(..) {
            if handle.join().is_err() {
                warn!(object = %self.source.object, "daisy chain producer panicked");
            }
        }
    }

    /// Drops everything buffered and starts a new epoch at `position`.
    fn reset(q: &mut Queue, position: u64) -> u64 {
        q.epoch += 1;
        q.chunks.clear();
        q.last_chunk = None;
        q.buffered = 0;
        q.position = position;
        q.last_position = position;
        q.epoch
    }
}

impl Read for DaisyChainStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.len() > TRANSFER_BUFFER_SIZE {
            return Err(fatal(format!(
                "read of {} bytes exceeds the {TRANSFER_BUFFER_SIZE}-byte chunk size",
                buf.len()
            )));
        }
        let size = self.source.size;
        let mut q = self.shared.queue.lock().unwrap();
        if q.position >= size {
            return Ok(0);
        }
        let item = loop {
            if let Some(item) = q.chunks.pop_front() {
                break item;
            }
            if q.closed {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "daisy chain closed"));
            }
            if q.done {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("source ended at {} of {size} bytes", q.position),
                ));
            }
            q = self.shared.not_empty.wait(q).unwrap();
        };
        let chunk = match item {
            Item::Data(chunk) => chunk,
            Item::Failed(e) => return Err(e),
        };
        if chunk.len() > buf.len() {
            let len = chunk.len();
            q.chunks.push_front(Item::Data(chunk));
            return Err(fatal(format!(
                "read of {} bytes cannot take a {len}-byte chunk",
                buf.len()
            )));
        }
        let n = chunk.len();
        buf[..n].copy_from_slice(&chunk);
        if let Some(old) = q.last_chunk.take() {
            q.buffered -= old.len();
        }
        q.last_position = q.position;
        q.position += n as u64;
        q.last_chunk = Some(chunk);
        self.shared.not_full.notify_one();
        Ok(n)
    }
}

impl Seek for DaisyChainStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let size = self.source.size;
        let mut q = self.shared.queue.lock().unwrap();
        match pos {
            SeekFrom::Current(0) => Ok(q.position),
            SeekFrom::Start(offset) if offset == q.position => Ok(offset),
            SeekFrom::Start(offset) if offset == q.last_position && q.last_chunk.is_some() => {
                if let Some(chunk) = q.last_chunk.take() {
                    q.chunks.push_front(Item::Data(chunk));
                }
                q.position = offset;
                Ok(offset)
            }
            SeekFrom::Start(offset) if offset <= size => {
                let epoch = Self::reset(&mut q, offset);
                q.done = false;
                drop(q);
                self.shared.not_full.notify_all();
                debug!(object = %self.source.object, offset, "restarting daisy chain");
                self.spawn(offset, epoch)?;
                Ok(offset)
            }
            SeekFrom::Start(offset) => Err(fatal(format!(
                "seek to {offset} past the end of a {size}-byte object"
            ))),
            SeekFrom::End(0) => {
                Self::reset(&mut q, size);
                q.done = true;
                drop(q);
                self.shared.not_full.notify_all();
                Ok(size)
            }
            other => Err(fatal(format!("unsupported seek {other:?} on a daisy chain"))),
        }
    }
}

impl Drop for DaisyChainStream {
    fn drop(&mut self) {
        self.close();
    }
}
