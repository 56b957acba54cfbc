//! Integrity: SHA-256 digest over a file's data vector, for checking a reassembled copy
//! against its origin.

use sha2::{Digest, Sha256};

/// Hash a data vector (little-endian u32 elements). Returns 32-byte digest.
pub fn digest(data: &[u32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for v in data {
        hasher.update(v.to_le_bytes());
    }
    hasher.finalize().into()
}

/// Verify a data vector against an expected digest.
pub fn verify(data: &[u32], expected: &[u8; 32]) -> bool {
    digest(data) == *expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_verify_roundtrip() {
        let data: Vec<u32> = (0..100).collect();
        let d = digest(&data);
        assert!(verify(&data, &d));
    }

    #[test]
    fn verify_rejects_reordered() {
        let data: Vec<u32> = (0..100).collect();
        let d = digest(&data);
        let mut swapped = data.clone();
        swapped.swap(10, 20);
        assert!(!verify(&swapped, &d));
    }

    #[test]
    fn digest_depends_on_length() {
        assert_ne!(digest(&[0, 0]), digest(&[0, 0, 0]));
    }
}
