//! The object store capability the transfer engine is written against.
//!
//! Wire protocols live behind [`ObjectStoreClient`]; [`memory::MemoryStore`]
//! is a complete in-process implementation.

mod client;
mod error;
mod handle;
pub mod memory;
mod types;
mod validation;

pub use client::ObjectStoreClient;
pub use error::{StoreError, is_transient_io};
pub use handle::ResumeHandle;
pub use types::{
    ObjectDescriptor, ObjectRef, Precondition, ResumableStatus, TransferTarget, UploadRequest,
};
pub use validation::validate_object_name;
