//! Key validation shared by the facade and tests.

use crate::error::{McError, McResult};

/// Maximum key length in bytes accepted by memcached.
pub const MAX_KEY_LEN: usize = 250;

/// Checks that `key` can travel on either wire protocol.
///
/// A key must be 1..=250 bytes and every byte must be above the ASCII space
/// and no greater than 0x7F, which rules out control characters, the space
/// itself and non-ASCII bytes. The empty key is rejected too, which is stricter
/// than the wire rule: memcached has no way to address it.
///
/// # Examples
/// ```rust
/// use shardmc_common::{validate_key, McError};
///
/// assert!(validate_key("user:42").is_ok());
/// assert!(matches!(validate_key("has space"), Err(McError::InvalidKey)));
/// assert!(matches!(validate_key(""), Err(McError::InvalidKey)));
/// ```
pub fn validate_key(key: &str) -> McResult<()> {
    let bytes = key.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_KEY_LEN {
        return Err(McError::InvalidKey);
    }
    if bytes.iter().any(|&b| b <= b' ' || b > 0x7f) {
        return Err(McError::InvalidKey);
    }
    Ok(())
}
