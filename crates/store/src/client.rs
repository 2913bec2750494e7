//! The capability every provider backend implements.

use std::io::Read;

use crate::{ObjectDescriptor, ObjectRef, ResumableStatus, ResumeHandle, StoreError, UploadRequest};

/// Abstract connection to an object store.
///
/// Backends implement this on top of their wire protocol. Keeping the
/// transfer engine behind a trait leaves it protocol-agnostic and testable
/// against [`MemoryStore`](crate::memory::MemoryStore).
///
/// Calls block; the engine gets its concurrency from worker threads.
pub trait ObjectStoreClient: Send + Sync {
    /// URL scheme of the objects this client serves.
    fn provider(&self) -> &str;

    /// Whether [`compose_objects`](Self::compose_objects) is available.
    fn supports_compose(&self) -> bool {
        false
    }

    fn get_object_metadata(&self, object: &ObjectRef) -> Result<ObjectDescriptor, StoreError>;

    /// Streams bytes `[start, end)` of an object (`end = None` means to the
    /// end). `handle` comes from an earlier descriptor and lets the backend
    /// skip a metadata round trip.
    fn get_object_media(
        &self,
        object: &ObjectRef,
        start: u64,
        end: Option<u64>,
        handle: Option<&ResumeHandle>,
    ) -> Result<Box<dyn Read + Send>, StoreError>;

    /// Uploads an object in one request.
    fn upload_simple(
        &self,
        request: &UploadRequest,
        source: &mut dyn Read,
        size: Option<u64>,
    ) -> Result<ObjectDescriptor, StoreError>;

    /// Opens a resumable upload session.
    fn start_resumable_upload(
        &self,
        request: &UploadRequest,
        size: Option<u64>,
    ) -> Result<ResumeHandle, StoreError>;

    /// Asks the server how much of a session it durably holds.
    fn query_resumable_upload(&self, handle: &ResumeHandle) -> Result<ResumableStatus, StoreError>;

    /// Sends `data` at `offset`. The session completes once the persisted
    /// bytes reach `total`; pass `None` while the size is still unknown.
    fn upload_resumable_chunk(
        &self,
        handle: &ResumeHandle,
        offset: u64,
        data: &[u8],
        total: Option<u64>,
    ) -> Result<ResumableStatus, StoreError>;

    /// Concatenates `sources`, in order, into the request's object.
    fn compose_objects(
        &self,
        sources: &[ObjectRef],
        destination: &UploadRequest,
    ) -> Result<ObjectDescriptor, StoreError>;

    fn delete_object(&self, object: &ObjectRef) -> Result<(), StoreError>;

    /// Server-side copy between objects of this provider.
    fn copy_object(
        &self,
        source: &ObjectRef,
        destination: &UploadRequest,
    ) -> Result<ObjectDescriptor, StoreError>;
}
