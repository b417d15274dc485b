//! Hashing utilities for dynconf
//!
//! - BLAKE3 for change-result integrity hashes
//! - BLAKE3 chaining for change log frames

use blake3::Hasher;
use serde::Serialize;

/// Length of a raw BLAKE3 digest
pub const HASH_LEN: usize = 32;

/// Compute BLAKE3 hash of data, return hex string
pub fn blake3_hash(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    format!("{}", hash)
}

/// Hash the canonical JSON form of a value.
///
/// Topology types only use ordered maps, so the JSON form is stable.
pub fn hash_json<T: Serialize>(value: &T) -> crate::Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(blake3_hash(&bytes))
}

/// Hash of a change log frame, chained on the previous frame hash
pub fn chain_hash(prev: &[u8; HASH_LEN], sequence: u64, payload: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Hasher::new();
    hasher.update(prev);
    hasher.update(&sequence.to_le_bytes());
    hasher.update(payload);
    *hasher.finalize().as_bytes()
}
