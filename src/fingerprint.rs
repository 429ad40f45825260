//! Content fingerprints for page sharing (§3.4, §4.2). The spec explicitly
//! treats the hash function as a Non-goal ("the hash function used for
//! page fingerprints" is out of scope, §1) — we pick a concrete one so the
//! crate compiles and is testable, using `sha2` (already part of the wider
//! teacher workspace's dependency stack, e.g. `services/status/Cargo.toml`
//! and the vendored `services/aes`/`engine-sha512` crates), truncated to
//! 128 bits since a fingerprint is only ever used as a hash-map key backed
//! up by the mandatory byte-for-byte verification in `PShare::add_if_shared`.

use sha2::{Digest, Sha256};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    pub fn of_page(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut key = [0u8; 16];
        key.copy_from_slice(&digest[..16]);
        Fingerprint(key)
    }

    /// The all-zero page's fingerprint, used to special-case the dummy
    /// zero page during checkpoint (§4.1 "A zero-key COW read during
    /// checkpoint returns the dummy page instead of copying").
    pub fn zero_page(page_size: usize) -> Self { Fingerprint::of_page(&vec![0u8; page_size]) }

    pub fn is_zero_key(self, page_size: usize) -> bool { self == Fingerprint::zero_page(page_size) }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{}", hex::encode(self.0)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_content_has_identical_fingerprint() {
        let a = vec![0xABu8; 4096];
        let b = vec![0xABu8; 4096];
        assert_eq!(Fingerprint::of_page(&a), Fingerprint::of_page(&b));
    }

    #[test]
    fn differing_content_has_differing_fingerprint() {
        let mut a = vec![0u8; 4096];
        let b = vec![0u8; 4096];
        a[0] = 1;
        assert_ne!(Fingerprint::of_page(&a), Fingerprint::of_page(&b));
    }

    #[test]
    fn zero_page_is_recognized() {
        let z = vec![0u8; 4096];
        assert!(Fingerprint::of_page(&z).is_zero_key(4096));
    }
}
