use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::{TrackedComponent, TrackerError, TrackerKey, TrackerKind, TrackerRecord};

/// Directory of tracker files, one per in-flight transfer.
///
/// Writes go through a store-wide lock so concurrent component uploads can
/// append to the same parallel-upload record.
pub struct TrackerStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl TrackerStore {
    /// Opens (creating if needed) a tracker directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, TrackerError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, key: &TrackerKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    /// Reads the record for `key`.
    ///
    /// A missing file is `None`. So is an unreadable one: a damaged record
    /// only costs a restart from scratch.
    pub fn load(&self, key: &TrackerKey) -> Result<Option<TrackerRecord>, TrackerError> {
        let path = self.path(key);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                warn!(path = %path.display(), "tracker file is not text; ignoring it");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        match TrackerRecord::decode(key.kind(), &text) {
            Ok(record) => {
                debug!(path = %path.display(), kind = %key.kind(), "loaded tracker record");
                Ok(Some(record))
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable tracker file");
                Ok(None)
            }
        }
    }

    /// Replaces the record for `key`.
    pub fn save(&self, key: &TrackerKey, record: &TrackerRecord) -> Result<(), TrackerError> {
        if record.kind() != key.kind() {
            return Err(TrackerError::Malformed {
                kind: key.kind(),
                reason: format!("cannot store a {} record", record.kind()),
            });
        }
        let text = record.encode()?;
        let _guard = self.lock.lock().unwrap();
        let path = self.path(key);
        let tmp = path.with_extension("tmp");
        {
            let mut file = open_private(&tmp, false)?;
            file.write_all(text.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), kind = %key.kind(), "saved tracker record");
        Ok(())
    }

    /// Appends one finished component to a parallel-upload record.
    pub fn append_component(
        &self,
        key: &TrackerKey,
        component: &TrackedComponent,
    ) -> Result<(), TrackerError> {
        if key.kind() != TrackerKind::ParallelUpload {
            return Err(TrackerError::Malformed {
                kind: key.kind(),
                reason: "components only belong in parallel upload records".into(),
            });
        }
        if component.object_name.contains('\n')
            || component.generation.as_deref().is_some_and(|g| g.contains('\n'))
        {
            return Err(TrackerError::InvalidField(component.object_name.clone()));
        }
        let _guard = self.lock.lock().unwrap();
        let path = self.path(key);
        let mut file = open_private(&path, true)?;
        file.write_all(component.encode().as_bytes())?;
        file.sync_data()?;
        debug!(path = %path.display(), component = %component.object_name, "tracked component");
        Ok(())
    }

    /// Removes the record for `key`; a missing record is not an error.
    pub fn delete(&self, key: &TrackerKey) -> Result<(), TrackerError> {
        let _guard = self.lock.lock().unwrap();
        let path = self.path(key);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "deleted tracker file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn open_private(path: &Path, append: bool) -> std::io::Result<std::fs::File> {
    let mut options = OpenOptions::new();
    if append {
        options.append(true);
    } else {
        options.write(true).create(true).truncate(true);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

/// Default location for tracker files.
pub fn default_tracker_dir() -> Option<PathBuf> {
    state_dir().map(|d| d.join("stowage").join("tracker-files"))
}

fn state_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_STATE_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".local").join("state"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("LOCALAPPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".local").join("state"))
    }
}
