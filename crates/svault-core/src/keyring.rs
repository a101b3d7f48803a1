//! Data-key lifecycle and master-key dispatch.
//!
//! One 256-bit data key encrypts every leaf of one document. It only ever
//! exists in memory; what the document stores is one wrapped copy per
//! master-key recipient. The ring owns the in-memory key for the session
//! and delegates wrapping to whichever provider recognizes each entry.

use std::fmt;

use log::{info, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, Secret};

use crate::error::{Error, Result};
use crate::meta::{Metadata, Recipient};

/// The document's symmetric data key. Zeroized on drop; never serialized.
pub struct DataKey(Secret<[u8; 32]>);

impl DataKey {
    /// 32 bytes of OS randomness.
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        DataKey(Secret::new(key))
    }

    /// Wrap provider output into a key, enforcing the size invariant.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 32 {
            return Err(Error::ProviderError(format!(
                "unwrapped data key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(bytes);
        Ok(DataKey(Secret::new(key)))
    }

    pub fn expose(&self) -> &[u8; 32] {
        self.0.expose_secret()
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataKey([REDACTED])")
    }
}

/// A master-key backend: wraps the data key for one recipient entry and
/// unwraps it back. Implementations are independently fallible; the ring
/// skips a failing recipient and only gives up when all of them fail.
pub trait KeyWrapProvider {
    fn name(&self) -> &'static str;

    /// Fast shape test: does this provider handle the entry?
    fn recognizes(&self, entry: &Recipient) -> bool;

    /// Produce the recipient-specific wrapped form of the data key, in the
    /// textual encoding the document stores.
    fn wrap(&self, entry: &Recipient, key: &DataKey) -> Result<String>;

    fn unwrap(&self, entry: &Recipient, enc: &str) -> Result<DataKey>;
}

pub struct KeyRing {
    providers: Vec<Box<dyn KeyWrapProvider>>,
}

impl KeyRing {
    pub fn new() -> Self {
        KeyRing { providers: Vec::new() }
    }

    /// A ring with the built-in KMS and PGP providers.
    pub fn with_default_providers() -> Result<Self> {
        let mut ring = KeyRing::new();
        ring.register(Box::new(crate::kms::KmsKeyWrap::new()?));
        ring.register(Box::new(crate::pgp::PgpKeyWrap::new()));
        Ok(ring)
    }

    pub fn register(&mut self, provider: Box<dyn KeyWrapProvider>) {
        self.providers.push(provider);
    }

    fn provider_for(&self, entry: &Recipient) -> Option<&dyn KeyWrapProvider> {
        self.providers
            .iter()
            .map(Box::as_ref)
            .find(|p| p.recognizes(entry))
    }

    /// Fresh 256-bit data key.
    pub fn generate(&self) -> DataKey {
        DataKey::generate()
    }

    /// Recover the data key from the first recipient that unwraps
    /// successfully, in document order. Failures along the way are logged
    /// and skipped; they only become fatal when nothing is left.
    pub fn unwrap_key(&self, meta: &Metadata) -> Result<DataKey> {
        let mut failures = 0usize;
        for entry in &meta.recipients {
            if entry.enc().is_empty() || entry.id().is_empty() {
                continue;
            }
            let Some(provider) = self.provider_for(entry) else {
                warn!("no provider recognizes recipient '{}', skipping", entry.id());
                failures += 1;
                continue;
            };
            match provider.unwrap(entry, entry.enc()) {
                Ok(key) => {
                    if failures > 0 {
                        warn!(
                            "recovered the data key from '{}' after {failures} failed recipient(s)",
                            entry.id()
                        );
                    }
                    return Ok(key);
                }
                Err(e) => {
                    warn!("skipping {} recipient '{}': {e}", provider.name(), entry.id());
                    failures += 1;
                }
            }
        }
        Err(Error::NoUsableRecipient("unwrap"))
    }

    /// Wrap the data key for every recipient that does not hold a copy yet.
    /// A failed entry keeps its place in the list with an empty `enc`.
    /// Fatal only if afterwards no recipient at all holds a wrapped key.
    pub fn wrap_key(&self, key: &DataKey, meta: &mut Metadata, now: &str) -> Result<()> {
        for entry in &mut meta.recipients {
            if !entry.enc().is_empty() {
                continue;
            }
            if entry.id().is_empty() {
                warn!("recipient with an empty key identifier, skipping entry");
                continue;
            }
            let Some(provider) = self.provider_for(&*entry) else {
                warn!("no provider recognizes recipient '{}', skipping", entry.id());
                continue;
            };
            match provider.wrap(&*entry, key) {
                Ok(wrapped) => {
                    info!("updating {} entry '{}'", provider.name(), entry.id());
                    entry.set_enc(wrapped, now);
                }
                Err(e) => {
                    warn!(
                        "failed to wrap data key for {} entry '{}': {e}, skipping it",
                        provider.name(),
                        entry.id()
                    );
                }
            }
        }
        if !meta.has_usable_recipient() {
            return Err(Error::NoUsableRecipient("wrap"));
        }
        Ok(())
    }

    /// Retire the current data key: generate a fresh one, drop every wrapped
    /// copy, and wrap anew for the full recipient list.
    pub fn rotate(&self, meta: &mut Metadata, now: &str) -> Result<DataKey> {
        let key = DataKey::generate();
        for entry in &mut meta.recipients {
            entry.clear_enc();
        }
        self.wrap_key(&key, meta, now)?;
        Ok(key)
    }
}

impl Default for KeyRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose, Engine as _};

    /// Test double: "wraps" by base64-ing the key, only for PGP-shaped
    /// entries whose fingerprint it was built with.
    struct StubWrap {
        fp: &'static str,
        fail: bool,
    }

    impl KeyWrapProvider for StubWrap {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn recognizes(&self, entry: &Recipient) -> bool {
            matches!(entry, Recipient::Pgp { fp, .. } if fp == self.fp)
        }

        fn wrap(&self, _entry: &Recipient, key: &DataKey) -> Result<String> {
            if self.fail {
                return Err(Error::ProviderError("stub wrap refused".into()));
            }
            Ok(general_purpose::STANDARD.encode(key.expose()))
        }

        fn unwrap(&self, _entry: &Recipient, enc: &str) -> Result<DataKey> {
            if self.fail {
                return Err(Error::ProviderError("stub unwrap refused".into()));
            }
            let raw = general_purpose::STANDARD
                .decode(enc)
                .map_err(|e| Error::ProviderError(e.to_string()))?;
            DataKey::from_bytes(&raw)
        }
    }

    fn meta_with(fps: &[&'static str]) -> Metadata {
        let mut meta = Metadata::new();
        for fp in fps {
            meta.recipients.push(Recipient::pgp(*fp));
        }
        meta
    }

    #[test]
    fn wrap_then_unwrap_recovers_the_key() {
        let mut ring = KeyRing::new();
        ring.register(Box::new(StubWrap { fp: "AAAA", fail: false }));
        let mut meta = meta_with(&["AAAA"]);

        let key = ring.generate();
        ring.wrap_key(&key, &mut meta, "2026-08-01T00:00:00Z").unwrap();
        assert!(meta.has_usable_recipient());
        assert_eq!(
            meta.recipients[0],
            Recipient::Pgp {
                fp: "AAAA".into(),
                enc: general_purpose::STANDARD.encode(key.expose()),
                created_at: "2026-08-01T00:00:00Z".into(),
            }
        );

        let back = ring.unwrap_key(&meta).unwrap();
        assert_eq!(back.expose(), key.expose());
    }

    #[test]
    fn unwrap_falls_back_to_the_next_recipient() {
        let mut ring = KeyRing::new();
        ring.register(Box::new(StubWrap { fp: "DEAD", fail: true }));
        ring.register(Box::new(StubWrap { fp: "BEEF", fail: false }));
        let mut meta = meta_with(&["DEAD", "BEEF"]);

        let key = ring.generate();
        // first entry fails to wrap but the operation still succeeds
        ring.wrap_key(&key, &mut meta, "now").unwrap();
        assert_eq!(meta.recipients[0].enc(), "");
        assert!(!meta.recipients[1].enc().is_empty());

        let back = ring.unwrap_key(&meta).unwrap();
        assert_eq!(back.expose(), key.expose());
    }

    #[test]
    fn all_recipients_failing_is_fatal() {
        let mut ring = KeyRing::new();
        ring.register(Box::new(StubWrap { fp: "DEAD", fail: true }));
        let mut meta = meta_with(&["DEAD"]);

        let key = ring.generate();
        assert!(matches!(
            ring.wrap_key(&key, &mut meta, "now"),
            Err(Error::NoUsableRecipient("wrap"))
        ));
        assert!(matches!(
            ring.unwrap_key(&meta_with(&[])),
            Err(Error::NoUsableRecipient("unwrap"))
        ));
    }

    #[test]
    fn rotate_replaces_the_key_and_every_wrapped_copy() {
        let mut ring = KeyRing::new();
        ring.register(Box::new(StubWrap { fp: "AAAA", fail: false }));
        let mut meta = meta_with(&["AAAA"]);

        let key = ring.generate();
        ring.wrap_key(&key, &mut meta, "t0").unwrap();
        let before = meta.recipients[0].enc().to_owned();

        let rotated = ring.rotate(&mut meta, "t1").unwrap();
        assert_ne!(rotated.expose(), key.expose());
        assert_ne!(meta.recipients[0].enc(), before);
    }
}
