//! Integrity digest over the cleartext leaves.
//!
//! Both walks feed every cleartext leaf byte, in traversal order, to one
//! SHA-512 accumulator. Keys are covered by the per-leaf AAD instead, so the
//! digest depends on values and their order only. The finalized uppercase
//! hex is sealed like a `str` leaf with the modification timestamp as AAD,
//! which is what makes the stored digest trustworthy.

use sha2::{Digest, Sha512};

pub struct IntegrityMac {
    digest: Sha512,
}

impl IntegrityMac {
    pub fn new() -> Self {
        IntegrityMac { digest: Sha512::new() }
    }

    pub fn absorb(&mut self, cleartext: &[u8]) {
        self.digest.update(cleartext);
    }

    /// Uppercase hexadecimal form of the digest.
    pub fn finalize(self) -> String {
        hex::encode_upper(self.digest.finalize())
    }
}

impl Default for IntegrityMac {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_digest_matches_sha512_of_nothing() {
        assert_eq!(
            IntegrityMac::new().finalize(),
            "CF83E1357EEFB8BDF1542850D66D8007D620E4050B5715DC83F4A921D36CE9CE\
             47D0D13C5D85F2B0FF8318D2877EEC2F63B931BD47417A81A538327AF927DA3E"
        );
    }

    #[test]
    fn absorption_order_matters() {
        let mut a = IntegrityMac::new();
        a.absorb(b"one");
        a.absorb(b"two");
        let mut b = IntegrityMac::new();
        b.absorb(b"two");
        b.absorb(b"one");
        assert_ne!(a.finalize(), b.finalize());
    }
}
