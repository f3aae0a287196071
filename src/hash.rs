use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Computes the SHA-256 hash of a byte slice.
pub fn sha256(data: &[u8]) -> [u8; 0x20] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes the SHA-256 hash of two concatenated byte slices.
pub fn sha256_2(a: &[u8], b: &[u8]) -> [u8; 0x20] {
    let mut hasher = Sha256::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

/// Computes the SHA-1 hash of a byte slice.
pub fn sha1(data: &[u8]) -> [u8; 0x14] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}
