//! Picks a transfer strategy for a (source, destination) pair and runs it.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use stowage_hashing::select_algorithms;
use stowage_store::{
    ObjectDescriptor, ObjectRef, ObjectStoreClient, Precondition, StoreError, TransferTarget,
    UploadRequest,
};
use stowage_tracker::{TrackerKey, TrackerKind};
use tracing::{debug, info};

use crate::context::TransferContext;
use crate::daisy_chain::DaisyChainStream;
use crate::download::DownloadStrategy;
use crate::parallel::ParallelUploadOrchestrator;
use crate::resumable::ResumableTransfer;
use crate::TransferError;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Per-copy switches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyOptions {
    /// Skip destinations that already exist.
    pub no_clobber: bool,
    /// Carry the source object's ACL to the destination object.
    pub preserve_acl: bool,
    /// Copy between objects of one provider through this process instead
    /// of a server-side copy.
    pub daisy_chain: bool,
    pub content_type: Option<String>,
    /// Overrides the configured parallel composite threshold.
    pub parallel_composite_threshold: Option<u64>,
    /// Overrides the configured resumable threshold.
    pub resumable_threshold: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyResult {
    pub source: TransferTarget,
    /// What was written. Objects carry the generation the store assigned.
    pub destination: TransferTarget,
    /// Bytes moved by this call; resumed transfers count only the rest.
    pub bytes_transferred: u64,
    pub elapsed: Duration,
}

/// Routes copies to the upload, download, daisy-chain or parallel paths.
pub struct CopyPlanner<'a> {
    ctx: &'a TransferContext,
}

impl<'a> CopyPlanner<'a> {
    pub fn new(ctx: &'a TransferContext) -> Self {
        Self { ctx }
    }

    pub fn copy(
        &self,
        source: &TransferTarget,
        destination: &TransferTarget,
        options: &CopyOptions,
    ) -> Result<CopyResult, TransferError> {
        let started = Instant::now();
        info!(%source, %destination, "copying");
        let (bytes, written) = match (source, destination) {
            (TransferTarget::File(src), TransferTarget::File(dst)) => {
                (self.copy_local(src, dst, options)?, destination.clone())
            }
            (TransferTarget::File(src), TransferTarget::Object(dst)) => {
                let descriptor = self.upload_file(src, dst, options)?;
                (descriptor.size, written_object(&descriptor))
            }
            (TransferTarget::Object(src), TransferTarget::File(dst)) => {
                (self.download_object(src, dst, options)?, destination.clone())
            }
            (TransferTarget::Object(src), TransferTarget::Object(dst)) => {
                let descriptor = self.copy_between_objects(src, dst, options)?;
                (descriptor.size, written_object(&descriptor))
            }
        };
        info!(destination = %written, bytes, "copied");
        Ok(CopyResult {
            source: source.clone(),
            destination: written,
            bytes_transferred: bytes,
            elapsed: started.elapsed(),
        })
    }

    /// Uploads a non-seekable stream in one attempt.
    pub fn copy_stream(
        &self,
        source: &mut dyn Read,
        destination: &ObjectRef,
        options: &CopyOptions,
    ) -> Result<CopyResult, TransferError> {
        let started = Instant::now();
        let client = self.ctx.client(&destination.provider)?;
        let request = self.upload_request(client.as_ref(), destination, options, None)?;
        let descriptor =
            ResumableTransfer::new(self.ctx, client.as_ref()).upload_stream(&request, source)?;
        Ok(CopyResult {
            source: TransferTarget::file("-"),
            destination: written_object(&descriptor),
            bytes_transferred: descriptor.size,
            elapsed: started.elapsed(),
        })
    }

    fn copy_local(&self, src: &Path, dst: &Path, options: &CopyOptions) -> Result<u64, TransferError> {
        let size = fs::metadata(src)?.len();
        prepare_local_destination(dst, size, options)?;
        Ok(fs::copy(src, dst)?)
    }

    fn upload_file(
        &self,
        src: &Path,
        dst: &ObjectRef,
        options: &CopyOptions,
    ) -> Result<ObjectDescriptor, TransferError> {
        let meta = fs::metadata(src)?;
        if meta.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is a directory", src.display()),
            )
            .into());
        }
        let size = meta.len();
        let client = self.ctx.client(&dst.provider)?;
        let request = self.upload_request(client.as_ref(), dst, options, None)?;
        let config = &self.ctx.config;

        if client.supports_compose()
            && config.wants_parallel_upload(size, options.parallel_composite_threshold)
        {
            debug!(object = %dst, size, "using parallel composite upload");
            return ParallelUploadOrchestrator::new(self.ctx, client.as_ref())
                .upload(src, size, &request);
        }

        let xfer = ResumableTransfer::new(self.ctx, client.as_ref());
        let file = File::open(src)?;
        if size >= options.resumable_threshold.unwrap_or(config.resumable_threshold) {
            let key = TrackerKey::new(
                TrackerKind::Upload,
                &dst.url(),
                &TransferTarget::file(src).identity(),
            );
            xfer.upload(&request, file, size, &key)
        } else {
            xfer.upload_simple(&request, file, size)
        }
    }

    fn download_object(&self, src: &ObjectRef, dst: &Path, options: &CopyOptions) -> Result<u64, TransferError> {
        let client = self.ctx.client(&src.provider)?;
        let descriptor = self.describe(client.as_ref(), src)?;
        prepare_local_destination(dst, descriptor.size, options)?;

        let threshold = options
            .resumable_threshold
            .unwrap_or(self.ctx.config.resumable_threshold);
        let strategy = if descriptor.size >= threshold && !is_char_device(dst) {
            DownloadStrategy::Resumable(TrackerKey::new(
                TrackerKind::Download,
                &TransferTarget::file(dst).identity(),
                &src.url(),
            ))
        } else {
            DownloadStrategy::OneShot
        };
        let algorithms = select_algorithms(&descriptor.digests, self.ctx.config.hash_check);
        let outcome = ResumableTransfer::new(self.ctx, client.as_ref())
            .download(&descriptor, dst, strategy, &algorithms)?;
        Ok(outcome.bytes_transferred)
    }

    fn copy_between_objects(
        &self,
        src: &ObjectRef,
        dst: &ObjectRef,
        options: &CopyOptions,
    ) -> Result<ObjectDescriptor, TransferError> {
        let src_client = self.ctx.client(&src.provider)?;
        let dst_client = self.ctx.client(&dst.provider)?;
        let same_provider = src.provider == dst.provider;
        if options.preserve_acl && !same_provider {
            return Err(TransferError::Unsupported(format!(
                "cannot preserve ACLs from {}:// to {}://",
                src.provider, dst.provider
            )));
        }
        let descriptor = self.describe(src_client.as_ref(), src)?;
        let request =
            self.upload_request(dst_client.as_ref(), dst, options, Some(&descriptor))?;

        let mut pinned = descriptor.object.clone();
        pinned.generation = descriptor.generation.clone();

        if same_provider && !options.daisy_chain {
            debug!(source = %pinned, destination = %dst, "copying in the store");
            let policy = self.ctx.retry_policy();
            return policy.run(&self.ctx.cancel, &dst.url(), || {
                dst_client
                    .copy_object(&pinned, &request)
                    .map_err(TransferError::from)
            });
        }

        debug!(source = %pinned, destination = %dst, "daisy chaining");
        let stream = DaisyChainStream::open(self.ctx, Arc::clone(&src_client), &descriptor)?;
        let key = TrackerKey::new(TrackerKind::Upload, &dst.url(), &pinned.to_string());
        ResumableTransfer::new(self.ctx, dst_client.as_ref()).upload(
            &request,
            stream,
            descriptor.size,
            &key,
        )
    }

    fn describe(&self, client: &dyn ObjectStoreClient, object: &ObjectRef) -> Result<ObjectDescriptor, TransferError> {
        self.ctx.retry_policy().run(&self.ctx.cancel, &object.url(), || {
            client.get_object_metadata(object).map_err(TransferError::from)
        })
    }

    /// Builds the destination request, enforcing no-clobber up front and
    /// again at write time through a precondition.
    fn upload_request(
        &self,
        client: &dyn ObjectStoreClient,
        dst: &ObjectRef,
        options: &CopyOptions,
        source: Option<&ObjectDescriptor>,
    ) -> Result<UploadRequest, TransferError> {
        let mut request = UploadRequest::new(dst.clone());
        request.content_type = Some(
            options
                .content_type
                .clone()
                .or_else(|| source.and_then(|s| s.content_type.clone()))
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
        );
        if options.preserve_acl {
            request.acl = source.and_then(|s| s.acl.clone());
        }
        if options.no_clobber {
            match client.get_object_metadata(dst) {
                Ok(_) => {
                    info!(object = %dst, "skipping existing object");
                    return Err(TransferError::AlreadyExists(dst.url()));
                }
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            request.precondition = Some(Precondition::DoesNotExist);
        }
        Ok(request)
    }
}

/// The object a write produced, pinned to its generation.
fn written_object(descriptor: &ObjectDescriptor) -> TransferTarget {
    let mut object = descriptor.object.clone();
    object.generation = descriptor.generation.clone();
    TransferTarget::Object(object)
}

/// Rejects directory/file conflicts and existing files under no-clobber,
/// then creates missing parent directories.
fn prepare_local_destination(dst: &Path, size: u64, options: &CopyOptions) -> Result<(), TransferError> {
    if dst.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} is a directory", dst.display()),
        )
        .into());
    }
    if let Some(file) = dst.ancestors().skip(1).find(|a| a.is_file()) {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!(
                "cannot create {}: {} is a file",
                dst.display(),
                file.display()
            ),
        )
        .into());
    }
    if options.no_clobber {
        if let Ok(meta) = fs::metadata(dst) {
            if meta.len() == size {
                info!(path = %dst.display(), "skipping existing file");
                return Err(TransferError::AlreadyExists(dst.display().to_string()));
            }
        }
    }
    if let Some(parent) = dst.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

#[cfg(unix)]
fn is_char_device(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    fs::metadata(path).is_ok_and(|m| m.file_type().is_char_device())
}

#[cfg(not(unix))]
fn is_char_device(_path: &Path) -> bool {
    false
}
