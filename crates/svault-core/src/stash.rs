//! Session-local IV stash.
//!
//! During decrypt the walker records each leaf's IV, AAD and cleartext into
//! a tree shaped like the document. The following encrypt reuses the stashed
//! IV for any leaf whose cleartext is byte-for-byte unchanged, so untouched
//! leaves re-encrypt to identical envelopes and diffs stay small. The stash
//! never outlives the edit session.

use std::collections::HashMap;

use zeroize::Zeroizing;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StashKey {
    Key(String),
    Index(usize),
}

pub struct StashEntry {
    pub iv: Vec<u8>,
    pub aad: Vec<u8>,
    pub cleartext: Zeroizing<Vec<u8>>,
}

#[derive(Default)]
pub struct StashNode {
    pub entry: Option<StashEntry>,
    children: HashMap<StashKey, StashNode>,
}

impl StashNode {
    pub fn new() -> Self {
        StashNode::default()
    }

    pub fn child(&self, key: &StashKey) -> Option<&StashNode> {
        self.children.get(key)
    }

    /// Child for `key`, created empty if absent. Used on the decrypt walk,
    /// which populates the stash.
    pub fn child_mut(&mut self, key: StashKey) -> &mut StashNode {
        self.children.entry(key).or_default()
    }

    /// The stashed IV, if this leaf's cleartext has not changed.
    pub fn matching_iv(&self, cleartext: &[u8]) -> Option<&[u8]> {
        match &self.entry {
            Some(e) if e.cleartext.as_slice() == cleartext => Some(&e.iv),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iv_reuse_requires_identical_cleartext() {
        let mut root = StashNode::new();
        let leaf = root.child_mut(StashKey::Key("a".into()));
        leaf.entry = Some(StashEntry {
            iv: vec![1; 32],
            aad: b"a:".to_vec(),
            cleartext: Zeroizing::new(b"hello".to_vec()),
        });

        let leaf = root.child(&StashKey::Key("a".into())).unwrap();
        assert_eq!(leaf.matching_iv(b"hello"), Some(&[1u8; 32][..]));
        assert_eq!(leaf.matching_iv(b"hellp"), None);
    }
}
