use std::fmt;

use sha2::{Digest, Sha256};

/// File names stay well under common filesystem limits.
pub const MAX_TRACKER_FILE_NAME_LENGTH: usize = 100;

/// Hex characters of the identity hash kept in the file name.
const HASH_CHARS: usize = 40;

/// Trailing characters of the readable identity kept for humans.
const TAIL_CHARS: usize = 16;

/// What a tracker file records progress for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackerKind {
    Upload,
    Download,
    ParallelUpload,
}

impl TrackerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
            Self::ParallelUpload => "parallel_upload",
        }
    }
}

impl fmt::Display for TrackerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of one transfer's tracker file.
///
/// The same (kind, destination, source) always maps to the same file name,
/// so a re-run of an interrupted transfer finds its own record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackerKey {
    kind: TrackerKind,
    file_name: String,
}

impl TrackerKey {
    pub fn new(kind: TrackerKind, destination: &str, source: &str) -> Self {
        let identity = format!("{}\n{}\n{}", kind.as_str(), destination, source);
        let hash = hex::encode(Sha256::digest(identity.as_bytes()));

        let readable: String = destination
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let tail_start = readable.len().saturating_sub(TAIL_CHARS);
        let tail = &readable[tail_start..];

        let file_name = format!(
            "{}_TRACKER_{}.{}",
            kind.as_str(),
            &hash[..HASH_CHARS],
            tail
        );
        debug_assert!(file_name.len() < MAX_TRACKER_FILE_NAME_LENGTH);
        Self { kind, file_name }
    }

    pub fn kind(&self) -> TrackerKind {
        self.kind
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }
}
