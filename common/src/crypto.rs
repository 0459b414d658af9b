//! Common cryptography helper functions

use crate::hash::Hash256;
use blake2::{digest::consts::U32, Blake2b, Digest};

/// Get a Blake2b-256 hash over a sequence of byte slices
pub fn blake2b_256<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Hash256 {
    let mut hasher = Blake2b::<U32>::new();
    for part in parts {
        hasher.update(part);
    }
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    Hash256::new(digest)
}
