//! Parallel composite uploads.
//!
//! A large file is split into component ranges that upload concurrently as
//! temporary objects next to the destination, then composed into it. Every
//! finished component is appended to a tracker record, so an interrupted
//! upload re-sends only what is missing.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::thread;

use md5::{Digest, Md5};
use rand::Rng;
use stowage_hashing::{DigestAlgorithm, HashCheck, digest_file, digest_range, digests_match, verify};
use stowage_store::{
    ObjectDescriptor, ObjectRef, ObjectStoreClient, StoreError, TransferTarget, UploadRequest,
};
use stowage_tracker::{ParallelUploadState, TrackedComponent, TrackerKey, TrackerKind, TrackerRecord};
use tracing::{debug, info, warn};

use crate::TransferError;
use crate::context::TransferContext;
use crate::file_part::FilePart;
use crate::resumable::ResumableTransfer;

/// Mixed into component names so they don't collide with user objects.
const NAME_SALT: &str = "stowage/parallel-composite/v1";

/// Directory, under the random salt, that holds component objects.
const COMPONENT_DIR: &str = "stowage/tmp/parallel_composite_uploads";

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// One component's byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub index: usize,
    pub start: u64,
    pub length: u64,
}

/// Splits `size` bytes into between 2 and `max_arity` components of about
/// `target` bytes. The last component takes the remainder; empty trailing
/// components are dropped.
pub fn partition(size: u64, target: u64, max_arity: usize) -> Vec<Partition> {
    let count = size
        .div_ceil(target.max(1))
        .clamp(2, max_arity.max(2) as u64);
    let component = size.div_ceil(count);
    let mut parts = Vec::new();
    let mut start = 0;
    for index in 0..count as usize {
        if start >= size {
            break;
        }
        let length = if index + 1 == count as usize {
            size - start
        } else {
            component.min(size - start)
        };
        parts.push(Partition {
            index,
            start,
            length,
        });
        start += length;
    }
    parts
}

/// Name of component `index` of the upload of `source_identity`.
///
/// The hash covers the salt, the source and the index. The index is also
/// kept as a `_<index>` suffix so tracked names map back to their range.
pub fn component_object_name(salt: &str, source_identity: &str, index: usize) -> String {
    let mut hasher = Md5::new();
    hasher.update(NAME_SALT.as_bytes());
    hasher.update(salt.as_bytes());
    hasher.update(b"\n");
    hasher.update(source_identity.as_bytes());
    hasher.update(b"\n");
    hasher.update(index.to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{salt}/{COMPONENT_DIR}/{digest}_{index}")
}

fn new_salt() -> String {
    rand::thread_rng().gen_range(1..10_000_000_000u64).to_string()
}

/// Uploads files as parallel components composed into one object.
pub struct ParallelUploadOrchestrator<'a> {
    ctx: &'a TransferContext,
    client: &'a dyn ObjectStoreClient,
}

impl<'a> ParallelUploadOrchestrator<'a> {
    pub fn new(ctx: &'a TransferContext, client: &'a dyn ObjectStoreClient) -> Self {
        Self { ctx, client }
    }

    /// Uploads `size` bytes of `path` to `request.object`.
    ///
    /// Fails with [`TransferError::PartialBatch`] when some components
    /// could not be uploaded; the tracker record and the uploaded
    /// components are kept so the next call only uploads the rest.
    pub fn upload(
        &self,
        path: &Path,
        size: u64,
        request: &UploadRequest,
    ) -> Result<ObjectDescriptor, TransferError> {
        if !self.client.supports_compose() {
            return Err(TransferError::Unsupported(format!(
                "{}:// does not support compose",
                self.client.provider()
            )));
        }
        let config = &self.ctx.config;
        let parts = partition(
            size,
            config.parallel_composite_component_size,
            config.max_compose_arity,
        );
        let identity = TransferTarget::file(path).identity();
        let key = TrackerKey::new(TrackerKind::ParallelUpload, &request.object.url(), &identity);

        let state = match self.ctx.tracker.load(&key)? {
            Some(TrackerRecord::ParallelUpload(state)) if !state.salt.is_empty() => state,
            _ => ParallelUploadState {
                salt: new_salt(),
                components: Vec::new(),
            },
        };
        let names: Vec<String> = parts
            .iter()
            .map(|p| component_object_name(&state.salt, &identity, p.index))
            .collect();

        let (reused, stale) = self.classify(path, &parts, &names, request, &state.components)?;
        self.ctx.tracker.save(
            &key,
            &TrackerRecord::ParallelUpload(ParallelUploadState {
                salt: state.salt.clone(),
                components: reused.iter().flatten().cloned().collect(),
            }),
        )?;

        let pending: Vec<usize> = (0..parts.len()).filter(|&i| reused[i].is_none()).collect();
        info!(
            object = %request.object,
            components = parts.len(),
            reused = parts.len() - pending.len(),
            "starting parallel composite upload"
        );
        let (uploaded, failures) = self.upload_components(path, &parts, &names, &pending, &key, &identity, request);

        if !failures.is_empty() {
            if self.ctx.cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let (index, first) = &failures[0];
            warn!(
                object = %request.object,
                failed = failures.len(),
                "parallel upload incomplete; tracker kept for resume"
            );
            return Err(TransferError::PartialBatch {
                failed: failures.len(),
                total: parts.len(),
                first: format!("component {index}: {first}"),
            });
        }

        let mut components: Vec<Option<TrackedComponent>> = reused;
        for (index, component) in uploaded {
            components[index] = Some(component);
        }
        let sources: Vec<ObjectRef> = components
            .iter()
            .flatten()
            .map(|c| self.component_ref(request, c))
            .collect();
        if sources.len() != parts.len() {
            return Err(TransferError::PartialBatch {
                failed: parts.len() - sources.len(),
                total: parts.len(),
                first: "components missing after upload".into(),
            });
        }

        // Components and tracker stay in place until a compose succeeds.
        let descriptor = self
            .ctx
            .retry_policy()
            .run(&self.ctx.cancel, &request.object.url(), || {
                self.client
                    .compose_objects(&sources, request)
                    .map_err(TransferError::from)
            })
            .inspect_err(|e| {
                warn!(object = %request.object, error = %e, "compose failed; components kept for resume");
            })?;
        let verified = self.verify_composite(path, &descriptor);

        self.cleanup(sources.iter().chain(stale.iter()));
        self.ctx.tracker.delete(&key)?;
        verified?;
        info!(object = %request.object, bytes = size, "parallel composite upload complete");
        Ok(descriptor)
    }

    /// Splits tracked components into reusable ones, by index, and remote
    /// objects that must be deleted.
    fn classify(
        &self,
        path: &Path,
        parts: &[Partition],
        names: &[String],
        request: &UploadRequest,
        tracked: &[TrackedComponent],
    ) -> Result<(Vec<Option<TrackedComponent>>, Vec<ObjectRef>), TransferError> {
        let mut reused: Vec<Option<TrackedComponent>> = vec![None; parts.len()];
        let mut stale = Vec::new();
        for component in tracked {
            let object = self.component_ref(request, component);
            let planned = component
                .index()
                .filter(|&i| i < parts.len() && names[i] == component.object_name);
            let Some(index) = planned else {
                debug!(component = %object, "component no longer planned");
                stale.push(object);
                continue;
            };
            if reused[index].is_some() {
                if component.generation.is_some() {
                    stale.push(object);
                }
                continue;
            }
            if self.component_matches(path, &parts[index], &object)? {
                debug!(component = %object, "reusing uploaded component");
                reused[index] = Some(component.clone());
            } else if component.generation.is_some() {
                debug!(component = %object, "component changed; replacing it");
                stale.push(object);
            }
        }
        Ok((reused, stale))
    }

    /// Whether the remote component holds exactly the local range.
    fn component_matches(
        &self,
        path: &Path,
        part: &Partition,
        object: &ObjectRef,
    ) -> Result<bool, TransferError> {
        let descriptor = match self.client.get_object_metadata(object) {
            Ok(descriptor) => descriptor,
            Err(StoreError::NotFound(_)) => return Ok(false),
            Err(e) if e.is_retryable() => {
                warn!(component = %object, error = %e, "could not check component; uploading it again");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        if descriptor.size != part.length {
            return Ok(false);
        }
        let Some(alg) = [DigestAlgorithm::Md5, DigestAlgorithm::Crc32]
            .into_iter()
            .find(|alg| descriptor.digests.contains_key(alg.name()))
        else {
            return Ok(false);
        };
        let local = digest_range(path, part.start, part.length, &[alg])?;
        Ok(match (local.get(alg.name()), descriptor.digests.get(alg.name())) {
            (Some(local), Some(remote)) => digests_match(local, remote),
            _ => false,
        })
    }

    fn component_ref(&self, request: &UploadRequest, component: &TrackedComponent) -> ObjectRef {
        let mut object = request.object.sibling(component.object_name.clone());
        object.generation = component.generation.clone();
        object
    }

    /// Uploads `pending` components on a bounded set of worker threads.
    #[allow(clippy::too_many_arguments)]
    fn upload_components(
        &self,
        path: &Path,
        parts: &[Partition],
        names: &[String],
        pending: &[usize],
        key: &TrackerKey,
        identity: &str,
        request: &UploadRequest,
    ) -> (Vec<(usize, TrackedComponent)>, Vec<(usize, TransferError)>) {
        let queue = Mutex::new(pending.iter().copied().collect::<VecDeque<_>>());
        let uploaded = Mutex::new(Vec::new());
        let failures = Mutex::new(Vec::new());
        let workers = self.ctx.config.worker_count.min(pending.len());

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let Some(index) = queue.lock().unwrap().pop_front() else {
                            break;
                        };
                        if self.ctx.cancel.is_cancelled() {
                            failures.lock().unwrap().push((index, TransferError::Cancelled));
                            continue;
                        }
                        let object = request.object.sibling(names[index].clone());
                        let result = self
                            .upload_component(path, &parts[index], &object, identity, request)
                            .and_then(|descriptor| {
                                let component = TrackedComponent {
                                    object_name: names[index].clone(),
                                    generation: descriptor.generation,
                                };
                                self.ctx.tracker.append_component(key, &component)?;
                                Ok(component)
                            });
                        match result {
                            Ok(component) => uploaded.lock().unwrap().push((index, component)),
                            Err(e) => {
                                warn!(component = %object, error = %e, "component upload failed");
                                failures.lock().unwrap().push((index, e));
                            }
                        }
                    }
                });
            }
        });

        let mut failures = failures.into_inner().unwrap();
        failures.sort_by_key(|(index, _)| *index);
        (uploaded.into_inner().unwrap(), failures)
    }

    fn upload_component(
        &self,
        path: &Path,
        part: &Partition,
        object: &ObjectRef,
        identity: &str,
        request: &UploadRequest,
    ) -> Result<ObjectDescriptor, TransferError> {
        let mut component = UploadRequest::new(object.clone());
        component.content_type = Some(
            request
                .content_type
                .clone()
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
        );
        if self.ctx.config.hash_check != HashCheck::Never {
            component.declared_digests =
                digest_range(path, part.start, part.length, &[DigestAlgorithm::Md5])?;
        }

        let source = FilePart::open(path, part.start, part.length)?;
        let xfer = ResumableTransfer::new(self.ctx, self.client);
        if part.length >= self.ctx.config.resumable_threshold {
            let key = TrackerKey::new(
                TrackerKind::Upload,
                &object.url(),
                &format!("{identity}@{}+{}", part.start, part.length),
            );
            xfer.upload(&component, source, part.length, &key)
        } else {
            xfer.upload_simple(&component, source, part.length)
        }
    }

    /// Compose only reports a cyclic digest, so the check runs against the
    /// whole local file.
    fn verify_composite(&self, path: &Path, descriptor: &ObjectDescriptor) -> Result<(), TransferError> {
        let policy = self.ctx.config.hash_check;
        if policy == HashCheck::Never {
            return Ok(());
        }
        let local = digest_file(path, &[DigestAlgorithm::Crc32])?;
        let name = descriptor.object.url();
        if let Err(e) = verify(&name, &local, &descriptor.digests, policy) {
            warn!(object = %name, error = %e, "composed object failed verification; deleting it");
            let object = descriptor.object.clone();
            if let Err(del) = self.client.delete_object(&object) {
                warn!(object = %name, error = %del, "could not delete corrupt composite");
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn cleanup<'o>(&self, objects: impl Iterator<Item = &'o ObjectRef>) {
        for object in objects {
            match self.client.delete_object(object) {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(e) => warn!(object = %object, error = %e, "could not delete component"),
            }
        }
    }
}
