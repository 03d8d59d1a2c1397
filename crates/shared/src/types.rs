//! Small value types and helpers shared across the platform.

use crate::error::ValidationError;

/// Length of a hex-encoded torrent infohash (SHA-1, 20 bytes)
pub const INFOHASH_HEX_LEN: usize = 40;

/// Length of a hex-encoded event id or x-only public key (32 bytes)
pub const HASH_HEX_LEN: usize = 64;

/// Current unix time in seconds
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Check that a string is lowercase hex of the given length
pub fn is_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

/// Validate and normalize a torrent infohash.
///
/// Accepts mixed case, returns lowercase hex.
pub fn normalize_infohash(s: &str) -> Result<String, ValidationError> {
    let normalized = s.trim().to_ascii_lowercase();
    if !is_hex(&normalized, INFOHASH_HEX_LEN) {
        return Err(ValidationError::InvalidInfoHash);
    }
    Ok(normalized)
}

/// Validate a hex-encoded 32-byte identifier (event id or public key)
pub fn validate_hash_hex(s: &str) -> Result<(), ValidationError> {
    if s.len() != HASH_HEX_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ValidationError::InvalidFormat(format!(
            "expected {} hex characters",
            HASH_HEX_LEN
        )));
    }
    Ok(())
}
