use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD};

use crate::StoreError;

/// Provider state that lets an interrupted transfer continue.
///
/// Encodes to a single line so it fits in a tracker file.
#[derive(Clone, PartialEq, Eq)]
pub enum ResumeHandle {
    /// A session URI the provider assigned to a resumable upload.
    SessionUri(String),
    /// Provider-specific bytes the core never interprets.
    Opaque { provider: String, payload: Vec<u8> },
}

impl ResumeHandle {
    pub fn encode(&self) -> String {
        match self {
            Self::SessionUri(uri) => format!("uri:{uri}"),
            Self::Opaque { provider, payload } => {
                format!("opaque:{provider}:{}", STANDARD.encode(payload))
            }
        }
    }

    pub fn decode(line: &str) -> Result<Self, StoreError> {
        let line = line.trim();
        if let Some(uri) = line.strip_prefix("uri:") {
            if uri.is_empty() || uri.contains(char::is_whitespace) {
                return Err(StoreError::InvalidHandle(line.to_string()));
            }
            return Ok(Self::SessionUri(uri.to_string()));
        }
        if let Some(rest) = line.strip_prefix("opaque:") {
            let (provider, payload) = rest
                .split_once(':')
                .ok_or_else(|| StoreError::InvalidHandle(line.to_string()))?;
            if provider.is_empty() {
                return Err(StoreError::InvalidHandle(line.to_string()));
            }
            let payload = STANDARD
                .decode(payload)
                .map_err(|e| StoreError::InvalidHandle(format!("{line}: {e}")))?;
            return Ok(Self::Opaque {
                provider: provider.to_string(),
                payload,
            });
        }
        Err(StoreError::InvalidHandle(line.to_string()))
    }
}

impl fmt::Debug for ResumeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionUri(uri) => f.debug_tuple("SessionUri").field(uri).finish(),
            Self::Opaque { provider, payload } => f
                .debug_struct("Opaque")
                .field("provider", provider)
                .field("len", &payload.len())
                .finish(),
        }
    }
}
