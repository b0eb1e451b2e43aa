use serde::{Deserialize, Serialize};
use sha1::{Digest as _, Sha1};

/// 160-bit protocol hash.
///
/// The accumulative log hash combines entry digests with XOR, so the digest
/// of a log prefix is order-insensitive per entry yet pins the exact entry
/// set; together with the sorted-order invariant it pins the exact prefix.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Digest(pub [u32; 5]);

impl Digest {
    pub const ZERO: Digest = Digest([0; 5]);

    /// Digest of a request's position in the canonical order.
    pub fn of_request(deadline: u64, req_key: u64) -> Self {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&deadline.to_le_bytes());
        buf[8..].copy_from_slice(&req_key.to_le_bytes());
        Self::of_bytes(&buf)
    }

    /// Digest of an arbitrary content blob.
    pub fn of_bytes(content: &[u8]) -> Self {
        let out = Sha1::digest(content);
        let mut item = [0u32; 5];
        for (word, chunk) in item.iter_mut().zip(out.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Digest(item)
    }

    /// Digest of a crash-vector's counters.
    pub fn of_counts(counts: &[u32]) -> Self {
        let mut buf = Vec::with_capacity(counts.len() * 4);
        for c in counts {
            buf.extend_from_slice(&c.to_le_bytes());
        }
        Self::of_bytes(&buf)
    }

    /// Fold another digest into this one.
    pub fn xor(&mut self, other: &Digest) {
        for (word, o) in self.0.iter_mut().zip(other.0.iter()) {
            *word ^= o;
        }
    }

    /// The combination of this digest with `other`.
    pub fn combined(mut self, other: &Digest) -> Digest {
        self.xor(other);
        self
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 5]
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for word in self.0 {
            write!(f, "{}", hex::encode(word.to_le_bytes()))?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_is_self_inverse() {
        let a = Digest::of_request(100, 1);
        let b = Digest::of_request(100, 2);

        let combined = a.combined(&b);
        assert_ne!(combined, a);
        assert_eq!(combined.combined(&b), a);
        assert_eq!(combined.combined(&a), b);
    }

    #[test]
    fn request_digest_is_stable() {
        assert_eq!(Digest::of_request(7, 9), Digest::of_request(7, 9));
        assert_ne!(Digest::of_request(7, 9), Digest::of_request(9, 7));
    }

    #[test]
    fn zero_is_identity() {
        let a = Digest::of_request(42, 42);
        assert_eq!(a.combined(&Digest::ZERO), a);
        assert!(Digest::ZERO.is_zero());
        assert!(!a.is_zero());
    }

    #[test]
    fn display_is_forty_hex_chars() {
        let s = Digest::of_bytes(b"nezha").to_string();
        assert_eq!(s.len(), 40);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
