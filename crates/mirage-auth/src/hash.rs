//! Password hashing.

use sha2::{Digest, Sha224};

/// SHA-224 digest as a lowercase hex string, exactly 56 characters.
///
/// This is the only hash the wire protocol ever carries; passwords are
/// hashed once at configuration load and never kept in memory as plaintext
/// afterwards.
#[inline]
pub fn sha224_hex(input: &str) -> String {
    let mut hasher = Sha224::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
