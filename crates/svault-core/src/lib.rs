//! svault-core: structure-preserving encryption for configuration documents.
//!
//! A document is a tree of keys over scalar leaves. Encryption replaces each
//! leaf with an AES-256-GCM envelope string and leaves the structure (keys,
//! nesting, list shape) readable; the per-document data key is stored
//! wrapped by one or more master keys (AWS KMS, PGP) under the cleartext
//! `sops` metadata branch, next to a SHA-512 integrity MAC over every
//! cleartext leaf.

pub mod cipher;
pub mod codec;
pub mod error;
pub mod keyring;
pub mod kms;
pub mod mac;
pub mod meta;
pub mod pgp;
pub mod security;
pub mod stash;
pub mod tree;
pub mod value;
pub mod walk;

use chrono::Utc;

pub use codec::{BytesCodec, DocumentCodec, FileType, JsonCodec, YamlCodec};
pub use error::{Error, Result};
pub use keyring::{DataKey, KeyRing, KeyWrapProvider};
pub use meta::{Metadata, Recipient, FORMAT_VERSION, METADATA_KEY};
pub use stash::{StashEntry, StashKey, StashNode};
pub use tree::{Leaf, Mapping, Node, ScalarStyle, Value};
pub use value::{Envelope, TypeTag};
pub use walk::TreeWalker;

/// One timestamp per session: every `created_at` and the `lastmodified` of a
/// single encrypt agree to the second.
pub fn session_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Encrypt a document in place: walk the tree, then store the sealed MAC,
/// the timestamp and the (possibly upgraded) format version in its metadata
/// branch.
pub fn encrypt_document(
    root: &mut Node,
    key: &DataKey,
    meta: &mut Metadata,
    stash: Option<&StashNode>,
    now: &str,
) -> Result<()> {
    let walker = TreeWalker::new(key, meta.version);
    let mac = walker.encrypt(root, stash, now)?;
    meta.lastmodified = Some(now.to_owned());
    meta.mac = Some(mac);
    meta.upgrade_version();
    meta.write_to_tree(root);
    Ok(())
}

/// Decrypt a document in place and verify its integrity MAC. The metadata
/// branch stays in the tree; dropping it for display is the caller's call.
pub fn decrypt_document(
    root: &mut Node,
    key: &DataKey,
    meta: &Metadata,
    stash: Option<&mut StashNode>,
    ignore_mac: bool,
) -> Result<()> {
    let walker = TreeWalker::new(key, meta.version);
    walker.decrypt(
        root,
        stash,
        meta.mac.as_deref(),
        meta.lastmodified.as_deref(),
        ignore_mac,
    )
}
