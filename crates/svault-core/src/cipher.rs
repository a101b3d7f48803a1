//! AES-256-GCM for a single leaf.
//!
//! Documents carry 32-byte IVs, not the customary 12. GCM derives its
//! pre-counter block through GHASH for any non-96-bit IV, so the full IV
//! must reach the cipher bit-exact; truncating would decrypt nothing.

use aead::consts::U32;
use aead::{Aead, KeyInit, Payload};
use aes_gcm::{aes::Aes256, AesGcm, Nonce};

use crate::error::{Error, Result};

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 32;
pub const TAG_SIZE: usize = 16;

type Aes256Gcm32 = AesGcm<Aes256, U32>;

/// Encrypt one leaf. Returns the ciphertext and the 16-byte GCM tag
/// separately, as the envelope stores them in distinct fields.
pub fn encrypt(key: &[u8; KEY_SIZE], iv: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    if iv.len() != IV_SIZE {
        return Err(Error::MalformedEnvelope(format!(
            "initialization vector must be {IV_SIZE} bytes, got {}",
            iv.len()
        )));
    }
    let cipher = Aes256Gcm32::new_from_slice(key).expect("key is 32 bytes");
    let mut sealed = cipher
        .encrypt(Nonce::from_slice(iv), Payload { msg: plaintext, aad })
        .map_err(|_| Error::auth_failed())?;
    let tag = sealed.split_off(sealed.len() - TAG_SIZE);
    Ok((sealed, tag))
}

/// Decrypt and verify one leaf. Any tag mismatch (wrong key, wrong IV,
/// tampered data or AAD) is an authentication failure.
pub fn decrypt(key: &[u8; KEY_SIZE], iv: &[u8], tag: &[u8], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if iv.len() != IV_SIZE {
        return Err(Error::MalformedEnvelope(format!(
            "initialization vector must be {IV_SIZE} bytes, got {}",
            iv.len()
        )));
    }
    if tag.len() != TAG_SIZE {
        return Err(Error::MalformedEnvelope(format!(
            "authentication tag must be {TAG_SIZE} bytes, got {}",
            tag.len()
        )));
    }
    let cipher = Aes256Gcm32::new_from_slice(key).expect("key is 32 bytes");
    let mut sealed = Vec::with_capacity(ciphertext.len() + tag.len());
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(tag);
    cipher
        .decrypt(Nonce::from_slice(iv), Payload { msg: &sealed, aad })
        .map_err(|_| Error::auth_failed())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_SIZE] = [0x42; KEY_SIZE];
    const IV: [u8; IV_SIZE] = [0x24; IV_SIZE];

    #[test]
    fn round_trip_with_aad() {
        let (ct, tag) = encrypt(&KEY, &IV, b"outer:inner:", b"secret").unwrap();
        assert_eq!(tag.len(), TAG_SIZE);
        let pt = decrypt(&KEY, &IV, &tag, b"outer:inner:", &ct).unwrap();
        assert_eq!(pt, b"secret");
    }

    #[test]
    fn aad_mismatch_fails_authentication() {
        let (ct, tag) = encrypt(&KEY, &IV, b"a:", b"secret").unwrap();
        let res = decrypt(&KEY, &IV, &tag, b"b:", &ct);
        assert!(matches!(res, Err(Error::AuthenticationFailed { .. })));
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let (mut ct, tag) = encrypt(&KEY, &IV, b"", b"secret").unwrap();
        ct[0] ^= 0x80;
        let res = decrypt(&KEY, &IV, &tag, b"", &ct);
        assert!(matches!(res, Err(Error::AuthenticationFailed { .. })));
    }

    #[test]
    fn truncated_iv_is_rejected_not_truncated() {
        let res = encrypt(&KEY, &IV[..12], b"", b"secret");
        assert!(matches!(res, Err(Error::MalformedEnvelope(_))));
    }
}
