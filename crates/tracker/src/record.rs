use crate::{TrackerError, TrackerKind};

/// Persisted recovery state for one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerRecord {
    /// An encoded resume handle and the byte offset the server committed.
    UploadResume { handle: String, offset: u64 },
    /// The etag of the object being downloaded.
    DownloadResume { etag: String },
    ParallelUpload(ParallelUploadState),
}

/// Salt plus every component already durably uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParallelUploadState {
    pub salt: String,
    pub components: Vec<TrackedComponent>,
}

/// A component object recorded after its upload finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedComponent {
    pub object_name: String,
    pub generation: Option<String>,
}

impl TrackedComponent {
    /// Component index, taken from the `_<index>` suffix every component
    /// name carries.
    pub fn index(&self) -> Option<usize> {
        let (_, suffix) = self.object_name.rsplit_once('_')?;
        suffix.parse().ok()
    }

    pub(crate) fn encode(&self) -> String {
        format!(
            "{}\n{}\n",
            self.object_name,
            self.generation.as_deref().unwrap_or("")
        )
    }
}

impl TrackerRecord {
    pub fn kind(&self) -> TrackerKind {
        match self {
            Self::UploadResume { .. } => TrackerKind::Upload,
            Self::DownloadResume { .. } => TrackerKind::Download,
            Self::ParallelUpload(_) => TrackerKind::ParallelUpload,
        }
    }

    /// Renders the record as newline-terminated lines.
    pub fn encode(&self) -> Result<String, TrackerError> {
        match self {
            Self::UploadResume { handle, offset } => {
                check_field(handle)?;
                Ok(format!("{handle}\n{offset}\n"))
            }
            Self::DownloadResume { etag } => {
                check_field(etag)?;
                Ok(format!("{etag}\n"))
            }
            Self::ParallelUpload(state) => {
                check_field(&state.salt)?;
                let mut out = format!("{}\n", state.salt);
                for component in &state.components {
                    check_field(&component.object_name)?;
                    if let Some(generation) = &component.generation {
                        check_field(generation)?;
                    }
                    out.push_str(&component.encode());
                }
                Ok(out)
            }
        }
    }

    /// Parses a record of the given kind.
    ///
    /// A parallel-upload record may end with a half-written component entry
    /// when the process died mid-append; that entry is ignored.
    pub fn decode(kind: TrackerKind, text: &str) -> Result<Self, TrackerError> {
        let mut lines = text.lines();
        let malformed = |reason: &str| TrackerError::Malformed {
            kind,
            reason: reason.to_string(),
        };
        let first = lines
            .next()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| malformed("missing first line"))?;

        match kind {
            TrackerKind::Upload => {
                let offset = match lines.next().map(str::trim) {
                    None | Some("") => 0,
                    Some(raw) => raw.parse().map_err(|_| malformed("bad offset"))?,
                };
                Ok(Self::UploadResume {
                    handle: first.to_string(),
                    offset,
                })
            }
            TrackerKind::Download => Ok(Self::DownloadResume {
                etag: first.to_string(),
            }),
            TrackerKind::ParallelUpload => {
                let mut components = Vec::new();
                while let Some(name) = lines.next() {
                    let Some(generation) = lines.next() else {
                        break;
                    };
                    if name.is_empty() {
                        return Err(malformed("empty component name"));
                    }
                    components.push(TrackedComponent {
                        object_name: name.to_string(),
                        generation: (!generation.is_empty()).then(|| generation.to_string()),
                    });
                }
                Ok(Self::ParallelUpload(ParallelUploadState {
                    salt: first.to_string(),
                    components,
                }))
            }
        }
    }
}

fn check_field(value: &str) -> Result<(), TrackerError> {
    if value.contains('\n') || value.contains('\r') {
        return Err(TrackerError::InvalidField(value.escape_debug().to_string()));
    }
    Ok(())
}
