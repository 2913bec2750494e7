//! In-process object store.
//!
//! Implements the whole client capability (generations, preconditions,
//! resumable sessions, compose, server-side copy, declared-digest checks)
//! and can inject faults, which makes it the backend the transfer engine is
//! tested against.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read};
use std::sync::{Arc, Mutex};

use md5::{Digest, Md5};
use stowage_hashing::{DigestAlgorithm, DigestSet, digests_match};
use tracing::debug;

use crate::{
    ObjectDescriptor, ObjectRef, ObjectStoreClient, Precondition, ResumableStatus, ResumeHandle,
    StoreError, UploadRequest, validate_object_name,
};

/// Algorithms recorded for objects uploaded directly.
const UPLOAD_DIGESTS: [DigestAlgorithm; 2] = [DigestAlgorithm::Md5, DigestAlgorithm::Crc32];

/// Composite objects only carry a cyclic digest, as real stores do.
const COMPOSE_DIGESTS: [DigestAlgorithm; 1] = [DigestAlgorithm::Crc32];

/// Call counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub metadata_reads: usize,
    pub media_reads: usize,
    pub simple_uploads: usize,
    pub resumable_starts: usize,
    pub chunks: usize,
    /// Bytes accepted by uploads, after dropping already persisted overlap.
    pub bytes_received: u64,
    pub composes: usize,
    pub deletes: usize,
    pub copies: usize,
}

/// Operation a [`Fault`] applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOp {
    Metadata,
    /// Media reads fail mid-stream once they reach `after_bytes`.
    Media,
    SimpleUpload,
    StartResumable,
    /// Chunk uploads fail when their offset is at or past `after_bytes`.
    Chunk,
    Compose,
    Delete,
}

/// Error an injected fault raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    Service(u16),
    AccessDenied,
    ConnectionReset,
}

impl FaultError {
    fn to_error(self, key: &str) -> StoreError {
        match self {
            Self::Service(status) => StoreError::Service {
                status,
                message: format!("injected failure for {key}"),
            },
            Self::AccessDenied => StoreError::AccessDenied(format!("injected failure for {key}")),
            Self::ConnectionReset => StoreError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                format!("injected reset for {key}"),
            )),
        }
    }

    fn to_io(self, key: &str) -> io::Error {
        match self.to_error(key) {
            StoreError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::ConnectionReset, other.to_string()),
        }
    }
}

/// A failure injected into calls whose object key contains `fragment`.
#[derive(Debug, Clone)]
pub struct Fault {
    op: FaultOp,
    fragment: String,
    error: FaultError,
    remaining: Option<usize>,
    after_bytes: u64,
}

impl Fault {
    pub fn new(op: FaultOp, fragment: impl Into<String>) -> Self {
        Self {
            op,
            fragment: fragment.into(),
            error: FaultError::Service(503),
            remaining: None,
            after_bytes: 0,
        }
    }

    pub fn error(mut self, error: FaultError) -> Self {
        self.error = error;
        self
    }

    /// Fire at most `n` times (default: every time).
    pub fn times(mut self, n: usize) -> Self {
        self.remaining = Some(n);
        self
    }

    pub fn after_bytes(mut self, n: u64) -> Self {
        self.after_bytes = n;
        self
    }
}

struct StoredObject {
    data: Arc<Vec<u8>>,
    generation: u64,
    content_type: Option<String>,
    digests: BTreeMap<String, String>,
    etag: String,
    acl: Option<String>,
}

struct Session {
    request: UploadRequest,
    data: Vec<u8>,
    completed: Option<ObjectDescriptor>,
}

#[derive(Default)]
struct Inner {
    objects: HashMap<(String, String), StoredObject>,
    sessions: HashMap<String, Session>,
    next_generation: u64,
    stats: Stats,
    upload_attempts: HashMap<String, usize>,
    faults: Vec<Fault>,
    /// Key fragments whose writes are damaged before they are stored.
    corrupt_writes: Vec<String>,
}

impl Inner {
    fn take_fault(&mut self, op: FaultOp, key: &str, offset: u64) -> Option<StoreError> {
        let fault = self.faults.iter_mut().find(|f| {
            f.op == op
                && key.contains(&f.fragment)
                && offset >= f.after_bytes
                && f.remaining != Some(0)
        })?;
        if let Some(n) = fault.remaining.as_mut() {
            *n -= 1;
        }
        Some(fault.error.to_error(key))
    }

    fn take_media_fault(&mut self, key: &str, start: u64, end: u64) -> Option<(u64, FaultError)> {
        let fault = self.faults.iter_mut().find(|f| {
            f.op == FaultOp::Media
                && key.contains(&f.fragment)
                && f.after_bytes >= start
                && f.after_bytes < end
                && f.remaining != Some(0)
        })?;
        if let Some(n) = fault.remaining.as_mut() {
            *n -= 1;
        }
        Some((fault.after_bytes, fault.error))
    }

    fn current(&self, object: &ObjectRef) -> Option<&StoredObject> {
        self.objects
            .get(&(object.container.clone(), object.key.clone()))
    }

    fn lookup(&self, object: &ObjectRef) -> Result<&StoredObject, StoreError> {
        let stored = self
            .current(object)
            .ok_or_else(|| StoreError::NotFound(object.to_string()))?;
        if let Some(generation) = &object.generation {
            if *generation != stored.generation.to_string() {
                return Err(StoreError::NotFound(object.to_string()));
            }
        }
        Ok(stored)
    }

    fn check_precondition(&self, request: &UploadRequest) -> Result<(), StoreError> {
        let existing = self.current(&request.object).map(|o| o.generation);
        match (&request.precondition, existing) {
            (Some(Precondition::DoesNotExist), Some(_)) => Err(StoreError::PreconditionFailed(
                format!("{} already exists", request.object.url()),
            )),
            (Some(Precondition::GenerationMatch(want)), current) => {
                let current = current.map_or_else(|| "0".to_string(), |g| g.to_string());
                if *want == current {
                    Ok(())
                } else {
                    Err(StoreError::PreconditionFailed(format!(
                        "{} is at generation {current}, not {want}",
                        request.object.url()
                    )))
                }
            }
            _ => Ok(()),
        }
    }

    fn store(
        &mut self,
        request: &UploadRequest,
        mut data: Vec<u8>,
        algorithms: &[DigestAlgorithm],
    ) -> Result<ObjectDescriptor, StoreError> {
        self.check_precondition(request)?;
        let key = &request.object.key;
        if self.corrupt_writes.iter().any(|f| key.contains(f.as_str())) {
            if let Some(byte) = data.first_mut() {
                *byte ^= 0xFF;
                debug!(object = %request.object.url(), "damaged write");
            }
        }
        let mut digests = DigestSet::new(algorithms);
        digests.update(&data);
        let digests = digests.finalize();

        for (name, declared) in &request.declared_digests {
            let Some(alg) = DigestAlgorithm::from_name(name) else {
                continue;
            };
            let mut actual = DigestSet::new(&[alg]);
            actual.update(&data);
            let actual = actual.finalize().remove(alg.name()).unwrap_or_default();
            if !digests_match(&actual, declared) {
                return Err(StoreError::BadRequest(format!(
                    "declared {alg} {declared} does not match received content ({actual}) for {}",
                    request.object.url()
                )));
            }
        }

        self.next_generation += 1;
        let stored = StoredObject {
            etag: hex::encode(Md5::digest(&data)),
            data: Arc::new(data),
            generation: self.next_generation,
            content_type: request.content_type.clone(),
            digests,
            acl: request.acl.clone(),
        };
        let descriptor = describe(&request.object, &stored);
        self.objects.insert(
            (request.object.container.clone(), request.object.key.clone()),
            stored,
        );
        debug!(object = %request.object.url(), generation = self.next_generation, "stored object");
        Ok(descriptor)
    }
}

fn describe(object: &ObjectRef, stored: &StoredObject) -> ObjectDescriptor {
    let generation = stored.generation.to_string();
    ObjectDescriptor {
        object: ObjectRef::new(&object.provider, &object.container, &object.key),
        size: stored.data.len() as u64,
        content_type: stored.content_type.clone(),
        etag: Some(stored.etag.clone()),
        digests: stored.digests.clone(),
        resume_handle: Some(ResumeHandle::Opaque {
            provider: object.provider.clone(),
            payload: generation.clone().into_bytes(),
        }),
        generation: Some(generation),
        acl: stored.acl.clone(),
    }
}

/// Object store held entirely in memory.
pub struct MemoryStore {
    provider: String,
    compose: bool,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Creates an empty store serving `provider://` objects, with compose
    /// support enabled.
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            compose: true,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn without_compose(mut self) -> Self {
        self.compose = false;
        self
    }

    pub fn object(&self, container: &str, key: &str) -> ObjectRef {
        ObjectRef::new(&self.provider, container, key)
    }

    /// Stores an object directly, bypassing counters and faults.
    pub fn put_object(&self, object: &ObjectRef, data: Vec<u8>) -> ObjectDescriptor {
        let mut inner = self.inner.lock().unwrap();
        let request = UploadRequest::new(object.clone());
        let corrupt = std::mem::take(&mut inner.corrupt_writes);
        let stored = inner.store(&request, data, &UPLOAD_DIGESTS);
        inner.corrupt_writes = corrupt;
        match stored {
            Ok(descriptor) => descriptor,
            Err(e) => unreachable!("unconditional store failed: {e}"),
        }
    }

    pub fn object_data(&self, object: &ObjectRef) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner.current(object).map(|o| o.data.as_ref().clone())
    }

    /// Keys in `container`, sorted.
    pub fn keys(&self, container: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut keys: Vec<String> = inner
            .objects
            .keys()
            .filter(|(c, _)| c == container)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Flips a stored byte without touching the recorded digests.
    pub fn corrupt_object(&self, object: &ObjectRef, offset: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(stored) = inner
            .objects
            .get_mut(&(object.container.clone(), object.key.clone()))
        {
            let data = Arc::make_mut(&mut stored.data);
            if let Some(byte) = data.get_mut(offset) {
                *byte ^= 0xFF;
            }
        }
    }

    /// Damages the content of later writes (uploads, compose, copy) to keys
    /// containing `fragment`. The recorded digests describe the damaged
    /// bytes, as when data is corrupted in transit.
    pub fn corrupt_writes(&self, fragment: impl Into<String>) {
        self.inner.lock().unwrap().corrupt_writes.push(fragment.into());
    }

    pub fn inject(&self, fault: Fault) {
        self.inner.lock().unwrap().faults.push(fault);
    }

    /// Removes injected faults and write corruption.
    pub fn clear_faults(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.faults.clear();
        inner.corrupt_writes.clear();
    }

    pub fn stats(&self) -> Stats {
        self.inner.lock().unwrap().stats.clone()
    }

    /// Simple uploads plus resumable sessions started for `key`.
    pub fn upload_attempts(&self, key: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.upload_attempts.get(key).copied().unwrap_or(0)
    }

    /// Upload attempts summed over keys containing `fragment`.
    pub fn upload_attempts_matching(&self, fragment: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .upload_attempts
            .iter()
            .filter(|(k, _)| k.contains(fragment))
            .map(|(_, n)| n)
            .sum()
    }

    fn check_provider(&self, object: &ObjectRef) -> Result<(), StoreError> {
        if object.provider != self.provider {
            return Err(StoreError::BadRequest(format!(
                "{object} is not a {} object",
                self.provider
            )));
        }
        validate_object_name(&object.key)
    }

    fn session_id(handle: &ResumeHandle) -> Result<&str, StoreError> {
        match handle {
            ResumeHandle::SessionUri(uri) => Ok(uri),
            ResumeHandle::Opaque { .. } => Err(StoreError::InvalidHandle(format!("{handle:?}"))),
        }
    }
}

impl ObjectStoreClient for MemoryStore {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn supports_compose(&self) -> bool {
        self.compose
    }

    fn get_object_metadata(&self, object: &ObjectRef) -> Result<ObjectDescriptor, StoreError> {
        self.check_provider(object)?;
        let mut inner = self.inner.lock().unwrap();
        inner.stats.metadata_reads += 1;
        if let Some(err) = inner.take_fault(FaultOp::Metadata, &object.key, 0) {
            return Err(err);
        }
        let stored = inner.lookup(object)?;
        Ok(describe(object, stored))
    }

    fn get_object_media(
        &self,
        object: &ObjectRef,
        start: u64,
        end: Option<u64>,
        handle: Option<&ResumeHandle>,
    ) -> Result<Box<dyn Read + Send>, StoreError> {
        self.check_provider(object)?;
        let mut inner = self.inner.lock().unwrap();
        inner.stats.media_reads += 1;
        let stored = inner.lookup(object)?;
        if let Some(handle) = handle {
            let expected = ResumeHandle::Opaque {
                provider: self.provider.clone(),
                payload: stored.generation.to_string().into_bytes(),
            };
            if *handle != expected {
                return Err(StoreError::PreconditionFailed(format!(
                    "{object} changed since it was described"
                )));
            }
        }
        let data = Arc::clone(&stored.data);
        let len = data.len() as u64;
        let end = end.unwrap_or(len).min(len);
        if start > end {
            return Err(StoreError::BadRequest(format!(
                "range {start}-{end} outside {object} of {len} bytes"
            )));
        }
        let fail_at = inner.take_media_fault(&object.key, start, end);
        Ok(Box::new(MediaReader {
            key: object.key.clone(),
            data,
            pos: start,
            end,
            fail_at,
        }))
    }

    fn upload_simple(
        &self,
        request: &UploadRequest,
        source: &mut dyn Read,
        size: Option<u64>,
    ) -> Result<ObjectDescriptor, StoreError> {
        self.check_provider(&request.object)?;
        {
            let mut inner = self.inner.lock().unwrap();
            inner.stats.simple_uploads += 1;
            *inner
                .upload_attempts
                .entry(request.object.key.clone())
                .or_default() += 1;
            if let Some(err) = inner.take_fault(FaultOp::SimpleUpload, &request.object.key, 0) {
                return Err(err);
            }
        }
        let mut data = Vec::new();
        source.read_to_end(&mut data)?;
        if let Some(size) = size {
            if size != data.len() as u64 {
                return Err(StoreError::BadRequest(format!(
                    "declared {size} bytes, received {}",
                    data.len()
                )));
            }
        }
        let mut inner = self.inner.lock().unwrap();
        inner.stats.bytes_received += data.len() as u64;
        inner.store(request, data, &UPLOAD_DIGESTS)
    }

    fn start_resumable_upload(
        &self,
        request: &UploadRequest,
        _size: Option<u64>,
    ) -> Result<ResumeHandle, StoreError> {
        self.check_provider(&request.object)?;
        let mut inner = self.inner.lock().unwrap();
        inner.stats.resumable_starts += 1;
        *inner
            .upload_attempts
            .entry(request.object.key.clone())
            .or_default() += 1;
        if let Some(err) = inner.take_fault(FaultOp::StartResumable, &request.object.key, 0) {
            return Err(err);
        }
        inner.check_precondition(request)?;
        let uri = format!("{}://upload/{}", self.provider, uuid::Uuid::new_v4());
        inner.sessions.insert(
            uri.clone(),
            Session {
                request: request.clone(),
                data: Vec::new(),
                completed: None,
            },
        );
        debug!(object = %request.object.url(), session = %uri, "opened resumable session");
        Ok(ResumeHandle::SessionUri(uri))
    }

    fn query_resumable_upload(&self, handle: &ResumeHandle) -> Result<ResumableStatus, StoreError> {
        let id = Self::session_id(handle)?;
        let inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .get(id)
            .ok_or_else(|| StoreError::NotFound(format!("upload session {id}")))?;
        Ok(match &session.completed {
            Some(descriptor) => ResumableStatus::Complete(descriptor.clone()),
            None => ResumableStatus::Incomplete {
                persisted: session.data.len() as u64,
            },
        })
    }

    fn upload_resumable_chunk(
        &self,
        handle: &ResumeHandle,
        offset: u64,
        data: &[u8],
        total: Option<u64>,
    ) -> Result<ResumableStatus, StoreError> {
        let id = Self::session_id(handle)?.to_string();
        let mut inner = self.inner.lock().unwrap();
        inner.stats.chunks += 1;

        let session = inner
            .sessions
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(format!("upload session {id}")))?;
        if let Some(descriptor) = &session.completed {
            return Ok(ResumableStatus::Complete(descriptor.clone()));
        }
        let key = session.request.object.key.clone();
        if let Some(err) = inner.take_fault(FaultOp::Chunk, &key, offset) {
            return Err(err);
        }

        let Some(session) = inner.sessions.get_mut(&id) else {
            return Err(StoreError::NotFound(format!("upload session {id}")));
        };
        let persisted = session.data.len() as u64;
        if offset > persisted {
            return Err(StoreError::BadRequest(format!(
                "chunk at {offset} leaves a gap after {persisted} persisted bytes"
            )));
        }
        let skip = ((persisted - offset) as usize).min(data.len());
        let fresh = &data[skip..];
        if let Some(total) = total {
            if persisted + fresh.len() as u64 > total {
                return Err(StoreError::BadRequest(format!(
                    "upload exceeds declared size {total}"
                )));
            }
        }
        session.data.extend_from_slice(fresh);
        let persisted = session.data.len() as u64;
        inner.stats.bytes_received += fresh.len() as u64;

        if total != Some(persisted) {
            return Ok(ResumableStatus::Incomplete { persisted });
        }

        let Some(session) = inner.sessions.get_mut(&id) else {
            return Err(StoreError::NotFound(format!("upload session {id}")));
        };
        let request = session.request.clone();
        let data = std::mem::take(&mut session.data);
        let descriptor = inner.store(&request, data, &UPLOAD_DIGESTS)?;
        if let Some(session) = inner.sessions.get_mut(&id) {
            session.completed = Some(descriptor.clone());
        }
        Ok(ResumableStatus::Complete(descriptor))
    }

    fn compose_objects(
        &self,
        sources: &[ObjectRef],
        destination: &UploadRequest,
    ) -> Result<ObjectDescriptor, StoreError> {
        self.check_provider(&destination.object)?;
        if !self.compose {
            return Err(StoreError::BadRequest("compose is not supported".into()));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.stats.composes += 1;
        if let Some(err) = inner.take_fault(FaultOp::Compose, &destination.object.key, 0) {
            return Err(err);
        }
        if sources.is_empty() {
            return Err(StoreError::BadRequest("compose needs at least one source".into()));
        }
        let mut data = Vec::new();
        for source in sources {
            if source.container != destination.object.container {
                return Err(StoreError::BadRequest(format!(
                    "{source} is not in container {}",
                    destination.object.container
                )));
            }
            data.extend_from_slice(&inner.lookup(source)?.data);
        }
        let mut request = destination.clone();
        request.declared_digests.clear();
        inner.store(&request, data, &COMPOSE_DIGESTS)
    }

    fn delete_object(&self, object: &ObjectRef) -> Result<(), StoreError> {
        self.check_provider(object)?;
        let mut inner = self.inner.lock().unwrap();
        inner.stats.deletes += 1;
        if let Some(err) = inner.take_fault(FaultOp::Delete, &object.key, 0) {
            return Err(err);
        }
        inner.lookup(object)?;
        inner
            .objects
            .remove(&(object.container.clone(), object.key.clone()));
        debug!(object = %object, "deleted object");
        Ok(())
    }

    fn copy_object(
        &self,
        source: &ObjectRef,
        destination: &UploadRequest,
    ) -> Result<ObjectDescriptor, StoreError> {
        self.check_provider(source)?;
        self.check_provider(&destination.object)?;
        let mut inner = self.inner.lock().unwrap();
        inner.stats.copies += 1;
        let stored = inner.lookup(source)?;
        let data = stored.data.as_ref().clone();
        let mut request = destination.clone();
        if request.content_type.is_none() {
            request.content_type = stored.content_type.clone();
        }
        inner.store(&request, data, &UPLOAD_DIGESTS)
    }
}

/// Media stream over a shared snapshot of an object's bytes.
struct MediaReader {
    key: String,
    data: Arc<Vec<u8>>,
    pos: u64,
    end: u64,
    fail_at: Option<(u64, FaultError)>,
}

impl Read for MediaReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut limit = self.end;
        if let Some((fail_at, error)) = self.fail_at {
            if self.pos >= fail_at {
                self.fail_at = None;
                self.end = self.pos;
                return Err(error.to_io(&self.key));
            }
            limit = limit.min(fail_at);
        }
        let n = ((limit - self.pos) as usize).min(buf.len());
        let start = self.pos as usize;
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new("mem")
    }

    #[test]
    fn simple_upload_and_read_back() {
        let s = store();
        let obj = s.object("b", "k");
        let desc = s
            .upload_simple(&UploadRequest::new(obj.clone()), &mut &b"hello"[..], Some(5))
            .unwrap();
        assert_eq!(desc.size, 5);
        assert!(desc.digests.contains_key("md5"));
        assert!(desc.digests.contains_key("crc32"));

        let mut out = String::new();
        s.get_object_media(&obj, 1, Some(4), None)
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "ell");
        assert_eq!(s.upload_attempts("k"), 1);
    }

    #[test]
    fn does_not_exist_precondition() {
        let s = store();
        let obj = s.object("b", "k");
        s.put_object(&obj, b"v1".to_vec());
        let mut req = UploadRequest::new(obj);
        req.precondition = Some(Precondition::DoesNotExist);
        let err = s.upload_simple(&req, &mut &b"v2"[..], None).unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed(_)));
    }

    #[test]
    fn declared_digest_mismatch_rejected() {
        let s = store();
        let mut req = UploadRequest::new(s.object("b", "k"));
        req.declared_digests
            .insert("md5".into(), "AAAAAAAAAAAAAAAAAAAAAA==".into());
        let err = s.upload_simple(&req, &mut &b"data"[..], None).unwrap_err();
        assert!(matches!(err, StoreError::BadRequest(_)));
        assert!(s.keys("b").is_empty());
    }

    #[test]
    fn corrupted_writes_describe_stored_bytes() {
        let s = store();
        let clean = s
            .upload_simple(&UploadRequest::new(s.object("b", "clean")), &mut &b"data"[..], None)
            .unwrap();
        s.corrupt_writes("bad");
        let obj = s.object("b", "bad");
        let desc = s
            .upload_simple(&UploadRequest::new(obj.clone()), &mut &b"data"[..], None)
            .unwrap();
        assert_eq!(s.object_data(&obj).unwrap(), [b'd' ^ 0xFF, b'a', b't', b'a']);
        assert_ne!(desc.digests["md5"], clean.digests["md5"]);

        s.clear_faults();
        let desc = s
            .upload_simple(&UploadRequest::new(obj.clone()), &mut &b"data"[..], None)
            .unwrap();
        assert_eq!(desc.digests["md5"], clean.digests["md5"]);
    }

    #[test]
    fn resumable_session_skips_overlap() {
        let s = store();
        let obj = s.object("b", "k");
        let h = s
            .start_resumable_upload(&UploadRequest::new(obj.clone()), Some(6))
            .unwrap();
        assert_eq!(
            s.upload_resumable_chunk(&h, 0, b"abcd", Some(6)).unwrap(),
            ResumableStatus::Incomplete { persisted: 4 }
        );
        // Resend overlapping bytes.
        let status = s.upload_resumable_chunk(&h, 2, b"cdef", Some(6)).unwrap();
        assert!(matches!(status, ResumableStatus::Complete(_)));
        assert_eq!(s.object_data(&obj).unwrap(), b"abcdef");
        assert_eq!(s.stats().bytes_received, 6);
        assert!(matches!(
            s.query_resumable_upload(&h).unwrap(),
            ResumableStatus::Complete(_)
        ));
    }

    #[test]
    fn resumable_gap_is_bad_request() {
        let s = store();
        let h = s
            .start_resumable_upload(&UploadRequest::new(s.object("b", "k")), None)
            .unwrap();
        let err = s.upload_resumable_chunk(&h, 3, b"x", None).unwrap_err();
        assert!(matches!(err, StoreError::BadRequest(_)));
    }

    #[test]
    fn unknown_session_is_not_found() {
        let s = store();
        let h = ResumeHandle::SessionUri("mem://upload/none".into());
        assert!(matches!(
            s.query_resumable_upload(&h),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn compose_concatenates_in_order() {
        let s = store();
        let a = s.object("b", "a");
        let c = s.object("b", "c");
        s.put_object(&a, b"one-".to_vec());
        s.put_object(&c, b"two".to_vec());
        let desc = s
            .compose_objects(&[a, c], &UploadRequest::new(s.object("b", "out")))
            .unwrap();
        assert_eq!(s.object_data(&desc.object).unwrap(), b"one-two");
        assert!(!desc.digests.contains_key("md5"));
        assert!(desc.digests.contains_key("crc32"));
    }

    #[test]
    fn media_fault_breaks_stream_once() {
        let s = store();
        let obj = s.object("b", "k");
        s.put_object(&obj, vec![7u8; 100]);
        s.inject(
            Fault::new(FaultOp::Media, "k")
                .error(FaultError::ConnectionReset)
                .after_bytes(40)
                .times(1),
        );
        let mut r = s.get_object_media(&obj, 0, None, None).unwrap();
        let mut buf = Vec::new();
        let err = r.read_to_end(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(buf.len(), 40);

        let mut r = s.get_object_media(&obj, 40, None, None).unwrap();
        let mut rest = Vec::new();
        r.read_to_end(&mut rest).unwrap();
        assert_eq!(rest.len(), 60);
    }

    #[test]
    fn stale_handle_rejected() {
        let s = store();
        let obj = s.object("b", "k");
        let desc = s.put_object(&obj, b"v1".to_vec());
        s.put_object(&obj, b"v2".to_vec());
        let result = s.get_object_media(&obj, 0, None, desc.resume_handle.as_ref());
        assert!(matches!(result, Err(StoreError::PreconditionFailed(_))));
    }

    #[test]
    fn copy_and_delete() {
        let s = store();
        let src = s.object("b", "src");
        s.put_object(&src, b"payload".to_vec());
        let dst = s.object("b", "dst");
        s.copy_object(&src, &UploadRequest::new(dst.clone())).unwrap();
        assert_eq!(s.object_data(&dst).unwrap(), b"payload");
        s.delete_object(&src).unwrap();
        assert!(matches!(s.delete_object(&src), Err(StoreError::NotFound(_))));
        assert_eq!(s.keys("b"), vec!["dst".to_string()]);
    }

    #[test]
    fn wrong_provider_rejected() {
        let s = store();
        let other = ObjectRef::new("gs", "b", "k");
        assert!(matches!(
            s.get_object_metadata(&other),
            Err(StoreError::BadRequest(_))
        ));
    }
}
