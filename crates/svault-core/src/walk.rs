//! The tree-walking encryption engine.
//!
//! One walker drives both directions. Traversal is deterministic: mapping
//! entries in document order, list elements by index. Each mapping key
//! extends the AAD inherited from its parent; list indices contribute no
//! bytes and pass the parent AAD through, so sibling list elements share it.
//! The root-level `sops` branch is metadata and is never walked; a `sops`
//! key anywhere else is ordinary data.
//!
//! Only the root invocation touches the integrity digest: on encrypt it
//! seals the finalized digest under the modification timestamp, on decrypt
//! it verifies the stored seal after the walk.

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::cipher;
use crate::error::{Error, Result};
use crate::keyring::DataKey;
use crate::mac::IntegrityMac;
use crate::meta::METADATA_KEY;
use crate::stash::{StashEntry, StashKey, StashNode};
use crate::tree::{Leaf, Mapping, Node, Value};
use crate::value::{self, Envelope};

pub struct TreeWalker<'k> {
    key: &'k DataKey,
    version: f64,
}

impl<'k> TreeWalker<'k> {
    /// `version` is the document's format version; it selects the AAD
    /// derivation and envelope grammar used to *read* leaves. Writing always
    /// uses the current scheme.
    pub fn new(key: &'k DataKey, version: f64) -> Self {
        TreeWalker { key, version }
    }

    /// Encrypt every non-metadata leaf in place and return the sealed
    /// integrity MAC, authenticated by `lastmodified`.
    ///
    /// Leaves whose cleartext matches the stash keep their stashed IV, so a
    /// no-op edit re-encrypts to byte-identical envelopes.
    pub fn encrypt(&self, root: &mut Node, stash: Option<&StashNode>, lastmodified: &str) -> Result<String> {
        let map = root
            .as_map_mut()
            .ok_or_else(|| Error::Syntax("document root must be a mapping".into()))?;
        let mut digest = IntegrityMac::new();
        let mut path = Vec::new();
        self.encrypt_branch(map, b"", stash, &mut digest, true, &mut path)?;

        let (envelope, _) = self.seal_value(
            &Value::Str(digest.finalize()),
            lastmodified.as_bytes(),
            None,
        )?;
        Ok(envelope)
    }

    /// Decrypt every non-metadata leaf in place, seeding the stash, then
    /// verify the stored MAC against the recomputed digest.
    pub fn decrypt(
        &self,
        root: &mut Node,
        mut stash: Option<&mut StashNode>,
        mac: Option<&str>,
        lastmodified: Option<&str>,
        ignore_mac: bool,
    ) -> Result<()> {
        let map = root
            .as_map_mut()
            .ok_or_else(|| Error::Syntax("document root must be a mapping".into()))?;
        let mut digest = if ignore_mac { None } else { Some(IntegrityMac::new()) };
        let mut path = Vec::new();
        self.decrypt_branch(map, b"", stash.as_deref_mut(), digest.as_mut(), true, &mut path)?;

        if let Some(digest) = digest {
            let stored = mac.ok_or(Error::IntegrityMissing)?;
            let lastmodified = lastmodified.ok_or(Error::IntegrityMissing)?;
            self.verify_mac(stored, lastmodified, digest.finalize())?;
        }
        Ok(())
    }

    fn encrypt_branch(
        &self,
        map: &mut Mapping,
        aad: &[u8],
        stash: Option<&StashNode>,
        digest: &mut IntegrityMac,
        is_root: bool,
        path: &mut Vec<String>,
    ) -> Result<()> {
        for (key, node) in map.iter_mut() {
            if is_root && key == METADATA_KEY {
                continue;
            }
            let mut child_aad = aad.to_vec();
            child_aad.extend_from_slice(key.as_bytes());
            child_aad.push(b':');
            let child_stash = stash.and_then(|s| s.child(&StashKey::Key(key.clone())));
            path.push(key.clone());
            self.encrypt_node(node, &child_aad, child_stash, digest, path)?;
            path.pop();
        }
        Ok(())
    }

    fn encrypt_node(
        &self,
        node: &mut Node,
        aad: &[u8],
        stash: Option<&StashNode>,
        digest: &mut IntegrityMac,
        path: &mut Vec<String>,
    ) -> Result<()> {
        match node {
            Node::Map(map) => self.encrypt_branch(map, aad, stash, digest, false, path),
            Node::Seq(items) => {
                for (i, item) in items.iter_mut().enumerate() {
                    let child_stash = stash.and_then(|s| s.child(&StashKey::Index(i)));
                    path.push(i.to_string());
                    self.encrypt_node(item, aad, child_stash, digest, path)?;
                    path.pop();
                }
                Ok(())
            }
            Node::Leaf(leaf) => {
                let (envelope, clear) = self
                    .seal_value(&leaf.value, aad, stash)
                    .map_err(|e| e.at_path(path))?;
                digest.absorb(&clear);
                leaf.value = Value::Str(envelope);
                Ok(())
            }
        }
    }

    /// Encode and encrypt one value. The IV comes from the stash when the
    /// encoded cleartext is unchanged, fresh OS randomness otherwise.
    /// Returns the envelope string and the cleartext that was digested.
    fn seal_value(
        &self,
        value: &Value,
        aad: &[u8],
        stash: Option<&StashNode>,
    ) -> Result<(String, Vec<u8>)> {
        let (clear, type_tag) = value::encode(value);
        let iv = match stash.and_then(|s| s.matching_iv(&clear)) {
            Some(iv) => iv.to_vec(),
            None => {
                let mut iv = vec![0u8; cipher::IV_SIZE];
                OsRng.fill_bytes(&mut iv);
                iv
            }
        };
        let (data, tag) = cipher::encrypt(self.key.expose(), &iv, aad, &clear)?;
        let envelope = Envelope { data, iv, tag, type_tag }.format();
        Ok((envelope, clear))
    }

    fn decrypt_branch(
        &self,
        map: &mut Mapping,
        aad: &[u8],
        mut stash: Option<&mut StashNode>,
        mut digest: Option<&mut IntegrityMac>,
        is_root: bool,
        path: &mut Vec<String>,
    ) -> Result<()> {
        // Pre-0.9 AAD accumulates sibling keys without separators: the carry
        // starts at the inherited AAD and grows by one key per entry, and
        // descent hands the grown value down. 0.9 replaced it with the
        // separator scheme derived from the parent AAD alone.
        let mut carry = aad.to_vec();
        for (key, node) in map.iter_mut() {
            if is_root && key == METADATA_KEY {
                continue;
            }
            let child_aad = if self.version >= 0.9 {
                let mut a = aad.to_vec();
                a.extend_from_slice(key.as_bytes());
                a.push(b':');
                a
            } else {
                carry.extend_from_slice(key.as_bytes());
                carry.clone()
            };
            let child_stash = stash.as_deref_mut().map(|s| s.child_mut(StashKey::Key(key.clone())));
            path.push(key.clone());
            self.decrypt_node(node, &child_aad, child_stash, digest.as_deref_mut(), path)?;
            path.pop();
        }
        Ok(())
    }

    fn decrypt_node(
        &self,
        node: &mut Node,
        aad: &[u8],
        mut stash: Option<&mut StashNode>,
        mut digest: Option<&mut IntegrityMac>,
        path: &mut Vec<String>,
    ) -> Result<()> {
        match node {
            Node::Map(map) => self.decrypt_branch(map, aad, stash, digest, false, path),
            Node::Seq(items) => {
                for (i, item) in items.iter_mut().enumerate() {
                    let child_stash = stash.as_deref_mut().map(|s| s.child_mut(StashKey::Index(i)));
                    path.push(i.to_string());
                    self.decrypt_node(item, aad, child_stash, digest.as_deref_mut(), path)?;
                    path.pop();
                }
                Ok(())
            }
            Node::Leaf(leaf) => self
                .decrypt_leaf(leaf, aad, stash, digest)
                .map_err(|e| e.at_path(path)),
        }
    }

    fn decrypt_leaf(
        &self,
        leaf: &mut Leaf,
        aad: &[u8],
        stash: Option<&mut StashNode>,
        digest: Option<&mut IntegrityMac>,
    ) -> Result<()> {
        // A leaf that is not an envelope is already cleartext and passes
        // through untouched.
        let envelope = match &leaf.value {
            Value::Str(raw) => match Envelope::parse(raw, self.version)? {
                Some(envelope) => envelope,
                None => return Ok(()),
            },
            _ => return Ok(()),
        };

        let clear = cipher::decrypt(
            self.key.expose(),
            &envelope.iv,
            &envelope.tag,
            aad,
            &envelope.data,
        )?;

        if let Some(stash) = stash {
            stash.entry = Some(StashEntry {
                iv: envelope.iv.clone(),
                aad: aad.to_vec(),
                cleartext: Zeroizing::new(clear.clone()),
            });
        }
        if let Some(digest) = digest {
            digest.absorb(&clear);
        }

        leaf.value = value::decode(&clear, envelope.type_tag)?;
        Ok(())
    }

    fn verify_mac(&self, stored: &str, lastmodified: &str, computed: String) -> Result<()> {
        let mismatch = |computed: &str| Error::IntegrityMismatch {
            expected: stored.to_owned(),
            computed: computed.to_owned(),
        };

        let envelope = Envelope::parse(stored, self.version)?.ok_or_else(|| mismatch(&computed))?;
        // The stored digest is trustworthy because it is encrypted with the
        // data key and authenticated by the lastmodified timestamp.
        let clear = cipher::decrypt(
            self.key.expose(),
            &envelope.iv,
            &envelope.tag,
            lastmodified.as_bytes(),
            &envelope.data,
        )
        .map_err(|_| mismatch(&computed))?;

        let expected = match value::decode(&clear, envelope.type_tag)? {
            Value::Str(s) => s,
            other => {
                return Err(Error::IntegrityMismatch {
                    expected: format!("{other:?}"),
                    computed,
                })
            }
        };
        if expected != computed {
            return Err(Error::IntegrityMismatch { expected, computed });
        }
        Ok(())
    }
}
