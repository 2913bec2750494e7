use crate::StoreError;

/// Longest key accepted, in bytes.
const MAX_OBJECT_NAME_LENGTH: usize = 1024;

/// Validates an object key.
///
/// Rejects:
/// - Empty keys
/// - Keys longer than 1024 bytes
/// - Carriage returns and line feeds (tracker files are line-oriented)
/// - Other control characters
pub fn validate_object_name(key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::BadRequest("empty object name".into()));
    }

    if key.len() > MAX_OBJECT_NAME_LENGTH {
        return Err(StoreError::BadRequest(format!(
            "object name longer than {MAX_OBJECT_NAME_LENGTH} bytes"
        )));
    }

    if key.contains(['\r', '\n']) {
        return Err(StoreError::BadRequest(format!(
            "newline not allowed in object name: {}",
            key.escape_debug()
        )));
    }

    if key.chars().any(char::is_control) {
        return Err(StoreError::BadRequest(format!(
            "control character not allowed in object name: {}",
            key.escape_debug()
        )));
    }

    Ok(())
}
