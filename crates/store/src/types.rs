use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::{ResumeHandle, StoreError, validate_object_name};

/// A remote object: provider scheme, container, key and optional generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub provider: String,
    pub container: String,
    pub key: String,
    pub generation: Option<String>,
}

impl ObjectRef {
    pub fn new(
        provider: impl Into<String>,
        container: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            container: container.into(),
            key: key.into(),
            generation: None,
        }
    }

    pub fn with_generation(mut self, generation: impl Into<String>) -> Self {
        self.generation = Some(generation.into());
        self
    }

    /// Same container and provider, different key, no generation.
    pub fn sibling(&self, key: impl Into<String>) -> Self {
        Self::new(self.provider.clone(), self.container.clone(), key)
    }

    /// `provider://container/key`, without the generation.
    pub fn url(&self) -> String {
        format!("{}://{}/{}", self.provider, self.container, self.key)
    }

    /// Parses `provider://container/key[#generation]`.
    pub fn parse(url: &str) -> Result<Self, StoreError> {
        let (provider, rest) = url
            .split_once("://")
            .ok_or_else(|| StoreError::BadRequest(format!("not an object URL: {url}")))?;
        if provider.is_empty() || !provider.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(StoreError::BadRequest(format!("bad provider in {url}")));
        }
        let (container, key) = rest
            .split_once('/')
            .ok_or_else(|| StoreError::BadRequest(format!("missing object key in {url}")))?;
        if container.is_empty() {
            return Err(StoreError::BadRequest(format!("missing container in {url}")));
        }
        let (key, generation) = match key.rsplit_once('#') {
            Some((key, generation)) if !generation.is_empty() => (key, Some(generation)),
            _ => (key, None),
        };
        validate_object_name(key)?;
        let mut object = Self::new(provider, container, key);
        object.generation = generation.map(str::to_string);
        Ok(object)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.provider, self.container, self.key)?;
        if let Some(generation) = &self.generation {
            write!(f, "#{generation}")?;
        }
        Ok(())
    }
}

/// Source or destination of a copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferTarget {
    File(PathBuf),
    Object(ObjectRef),
}

impl TransferTarget {
    /// Anything with a `scheme://` prefix other than `file://` is remote.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        if let Some(path) = s.strip_prefix("file://") {
            return Ok(Self::File(PathBuf::from(path)));
        }
        if s.contains("://") {
            return ObjectRef::parse(s).map(Self::Object);
        }
        Ok(Self::File(PathBuf::from(s)))
    }

    pub fn file(path: impl AsRef<Path>) -> Self {
        Self::File(path.as_ref().to_path_buf())
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Object(_))
    }

    /// Stable string identifying the target, used to key tracker records.
    pub fn identity(&self) -> String {
        match self {
            Self::File(path) => {
                // A destination may not exist yet; resolve its directory
                // so the identity is the same before and after creation.
                let resolved = std::fs::canonicalize(path)
                    .or_else(|e| match (path.parent(), path.file_name()) {
                        (Some(parent), Some(name)) => {
                            let parent = if parent.as_os_str().is_empty() {
                                Path::new(".")
                            } else {
                                parent
                            };
                            std::fs::canonicalize(parent).map(|p| p.join(name))
                        }
                        _ => Err(e),
                    })
                    .unwrap_or_else(|_| path.clone());
                format!("file://{}", resolved.display())
            }
            Self::Object(object) => object.to_string(),
        }
    }
}

impl fmt::Display for TransferTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "file://{}", path.display()),
            Self::Object(object) => object.fmt(f),
        }
    }
}

/// Metadata snapshot of a remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDescriptor {
    pub object: ObjectRef,
    pub size: u64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    /// Base64 digests keyed by algorithm name.
    pub digests: BTreeMap<String, String>,
    pub generation: Option<String>,
    pub resume_handle: Option<ResumeHandle>,
    /// Provider ACL blob, only meaningful to the same provider.
    pub acl: Option<String>,
}

/// Write condition evaluated by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    DoesNotExist,
    GenerationMatch(String),
}

/// Everything a store needs to create an object, apart from the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub object: ObjectRef,
    pub content_type: Option<String>,
    /// Digests of the full content; a store rejects an upload whose bytes
    /// don't match.
    pub declared_digests: BTreeMap<String, String>,
    pub precondition: Option<Precondition>,
    pub acl: Option<String>,
}

impl UploadRequest {
    pub fn new(object: ObjectRef) -> Self {
        Self {
            object,
            content_type: None,
            declared_digests: BTreeMap::new(),
            precondition: None,
            acl: None,
        }
    }
}

/// Server-side state of a resumable upload session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumableStatus {
    /// The server durably holds bytes `[0, persisted)`.
    Incomplete { persisted: u64 },
    Complete(ObjectDescriptor),
}
