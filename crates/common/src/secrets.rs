//! Constant-time comparison for opaque shared secrets.

use sha2::{Digest, Sha256};

/// Constant-time string comparison (prevents timing attacks).
///
/// Both inputs are hashed to fixed-length digests before the comparison, so
/// a length mismatch burns the same work as an equal-length mismatch.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let da = Sha256::digest(a.as_bytes());
    let db = Sha256::digest(b.as_bytes());
    let diff = da
        .iter()
        .zip(db.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}
