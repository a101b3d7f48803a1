//! The `sops` metadata branch.
//!
//! Everything the document knows about its own encryption lives under the
//! reserved top-level `sops` key, in cleartext: the format version, the
//! master-key recipients holding wrapped copies of the data key, the
//! modification timestamp and the integrity MAC bound to it.

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::tree::{Leaf, Mapping, Node, Value};

/// Highest format version this writer emits. Readers honor the version found
/// in the document for AAD derivation and envelope parsing.
pub const FORMAT_VERSION: f64 = 0.9;

/// Reserved top-level key of the metadata branch.
pub const METADATA_KEY: &str = "sops";

const ATTENTION: &str = "This section contains key material that should only be \
modified with extra care. See `svault -h`.";

/// One master-key recipient. The data key is wrapped once per recipient;
/// any single one suffices to open the document.
#[derive(Debug, Clone, PartialEq)]
pub enum Recipient {
    Kms {
        arn: String,
        role: Option<String>,
        enc: String,
        created_at: String,
    },
    Pgp {
        fp: String,
        enc: String,
        created_at: String,
    },
}

impl Recipient {
    pub fn kms(arn: impl Into<String>, role: Option<String>) -> Self {
        Recipient::Kms {
            arn: arn.into(),
            role,
            enc: String::new(),
            created_at: String::new(),
        }
    }

    pub fn pgp(fp: impl Into<String>) -> Self {
        Recipient::Pgp {
            fp: fp.into(),
            enc: String::new(),
            created_at: String::new(),
        }
    }

    /// The key identifier: a KMS ARN or a PGP fingerprint.
    pub fn id(&self) -> &str {
        match self {
            Recipient::Kms { arn, .. } => arn,
            Recipient::Pgp { fp, .. } => fp,
        }
    }

    pub fn enc(&self) -> &str {
        match self {
            Recipient::Kms { enc, .. } | Recipient::Pgp { enc, .. } => enc,
        }
    }

    pub fn set_enc(&mut self, wrapped: String, created_at: &str) {
        match self {
            Recipient::Kms { enc, created_at: at, .. }
            | Recipient::Pgp { enc, created_at: at, .. } => {
                *enc = wrapped;
                *at = created_at.to_owned();
            }
        }
    }

    pub fn clear_enc(&mut self) {
        match self {
            Recipient::Kms { enc, .. } | Recipient::Pgp { enc, .. } => enc.clear(),
        }
    }

    /// A recipient that can open the document: non-empty identifier holding
    /// a non-empty wrapped key.
    pub fn is_usable(&self) -> bool {
        !self.id().is_empty() && !self.enc().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    pub version: f64,
    /// KMS entries first, then PGP, each in document order.
    pub recipients: Vec<Recipient>,
    pub lastmodified: Option<String>,
    pub mac: Option<String>,
    pub attention: Option<String>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new()
    }
}

impl Metadata {
    pub fn new() -> Self {
        Metadata {
            version: FORMAT_VERSION,
            recipients: Vec::new(),
            lastmodified: None,
            mac: None,
            attention: Some(ATTENTION.to_owned()),
        }
    }

    /// Read the `sops` branch out of a document root. A document without one
    /// yields fresh metadata at the current version.
    pub fn from_tree(root: &Node) -> Result<Self> {
        let branch = match root.get(METADATA_KEY) {
            Some(Node::Map(m)) => m,
            Some(_) => return Err(Error::Syntax("the 'sops' entry must be a mapping".into())),
            None => return Ok(Metadata::new()),
        };

        let mut meta = Metadata {
            version: FORMAT_VERSION,
            recipients: Vec::new(),
            lastmodified: string_field(branch, "lastmodified"),
            mac: string_field(branch, "mac"),
            attention: string_field(branch, "attention"),
        };

        if let Some(node) = branch.get("version") {
            meta.version = match node.as_leaf().map(|l| &l.value) {
                Some(Value::Float(f)) => *f,
                Some(Value::Int(i)) => *i as f64,
                _ => return Err(Error::Syntax("invalid 'sops.version', must be numeric".into())),
            };
        }

        if let Some(node) = branch.get("kms") {
            let items = match node {
                Node::Seq(items) => items,
                _ => return Err(Error::Syntax("invalid KMS format in sops branch, must be a list".into())),
            };
            for item in items {
                let entry = item
                    .as_map()
                    .ok_or_else(|| Error::Syntax("KMS entry must be a mapping".into()))?;
                meta.recipients.push(Recipient::Kms {
                    arn: string_field(entry, "arn").unwrap_or_default(),
                    role: string_field(entry, "role"),
                    enc: string_field(entry, "enc").unwrap_or_default(),
                    created_at: string_field(entry, "created_at").unwrap_or_default(),
                });
            }
        }

        if let Some(node) = branch.get("pgp") {
            let items = match node {
                Node::Seq(items) => items,
                _ => return Err(Error::Syntax("invalid PGP format in sops branch, must be a list".into())),
            };
            for item in items {
                let entry = item
                    .as_map()
                    .ok_or_else(|| Error::Syntax("PGP entry must be a mapping".into()))?;
                meta.recipients.push(Recipient::Pgp {
                    fp: string_field(entry, "fp").unwrap_or_default(),
                    enc: string_field(entry, "enc").unwrap_or_default(),
                    created_at: string_field(entry, "created_at").unwrap_or_default(),
                });
            }
        }

        Ok(meta)
    }

    /// Write the branch back to the document root, replacing any previous
    /// `sops` entry. PGP blobs are literal-style so their line breaks keep.
    pub fn write_to_tree(&self, root: &mut Node) {
        let map = match root {
            Node::Map(m) => m,
            _ => return,
        };

        let mut branch = Mapping::new();
        if let Some(attention) = &self.attention {
            branch.insert("attention".into(), Node::str(attention.clone()));
        }
        branch.insert("version".into(), Node::float(self.version));

        let kms: Vec<Node> = self
            .recipients
            .iter()
            .filter_map(|r| match r {
                Recipient::Kms { arn, role, enc, created_at } => {
                    let mut entry = Mapping::new();
                    entry.insert("arn".into(), Node::str(arn.clone()));
                    if let Some(role) = role {
                        entry.insert("role".into(), Node::str(role.clone()));
                    }
                    entry.insert("enc".into(), Node::str(enc.clone()));
                    entry.insert("created_at".into(), Node::str(created_at.clone()));
                    Some(Node::Map(entry))
                }
                _ => None,
            })
            .collect();
        if !kms.is_empty() {
            branch.insert("kms".into(), Node::Seq(kms));
        }

        let pgp: Vec<Node> = self
            .recipients
            .iter()
            .filter_map(|r| match r {
                Recipient::Pgp { fp, enc, created_at } => {
                    let mut entry = Mapping::new();
                    entry.insert("fp".into(), Node::str(fp.clone()));
                    entry.insert(
                        "enc".into(),
                        Node::Leaf(Leaf::literal(Value::Str(enc.clone()))),
                    );
                    entry.insert("created_at".into(), Node::str(created_at.clone()));
                    Some(Node::Map(entry))
                }
                _ => None,
            })
            .collect();
        if !pgp.is_empty() {
            branch.insert("pgp".into(), Node::Seq(pgp));
        }

        if let Some(lastmodified) = &self.lastmodified {
            branch.insert("lastmodified".into(), Node::str(lastmodified.clone()));
        }
        if let Some(mac) = &self.mac {
            branch.insert("mac".into(), Node::str(mac.clone()));
        }

        map.insert(METADATA_KEY.into(), Node::Map(branch));
    }

    /// A document is valid to open when at least one recipient holds a
    /// wrapped data key.
    pub fn has_usable_recipient(&self) -> bool {
        self.recipients.iter().any(Recipient::is_usable)
    }

    /// At least one recipient has a key identifier, so a fresh data key
    /// could be wrapped.
    pub fn has_any_recipient(&self) -> bool {
        self.recipients.iter().any(|r| !r.id().is_empty())
    }

    /// Raise the document to the current writer version after a successful
    /// encrypt; never lowers it.
    pub fn upgrade_version(&mut self) {
        if self.version < FORMAT_VERSION {
            self.version = FORMAT_VERSION;
        }
    }

    /// Parse a comma-separated KMS ARN list. An item may glue a role to its
    /// ARN with `+`: `arn:aws:kms:...:key/abc+arn:aws:iam::...:role/foo`.
    pub fn parse_kms_specs(specs: &str) -> Vec<Recipient> {
        specs
            .split(',')
            .map(|item| item.replace(' ', ""))
            .filter(|item| !item.is_empty())
            .map(|item| match item.find("+arn:aws:iam::") {
                Some(pos) if pos > 0 => {
                    Recipient::kms(&item[..pos], Some(item[pos + 1..].to_owned()))
                }
                _ => Recipient::kms(item, None),
            })
            .collect()
    }

    /// Parse a comma-separated PGP fingerprint list.
    pub fn parse_pgp_specs(specs: &str) -> Vec<Recipient> {
        specs
            .split(',')
            .map(|item| item.replace(' ', ""))
            .filter(|item| !item.is_empty())
            .map(Recipient::pgp)
            .collect()
    }
}

fn string_field(map: &IndexMap<String, Node>, key: &str) -> Option<String> {
    map.get(key).and_then(Node::as_str).map(str::to_owned)
}
