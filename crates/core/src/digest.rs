//! Content checksums.

use std::path::Path;

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of `bytes`.
pub fn content_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Digest of the file at `path`; `None` if it does not exist or is a
/// directory.
pub fn file_digest(path: &Path) -> std::io::Result<Option<String>> {
    if !path.is_file() {
        return Ok(None);
    }
    let bytes = std::fs::read(path)?;
    Ok(Some(content_digest(&bytes)))
}
