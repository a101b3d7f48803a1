//! Reading documents written by pre-0.9 producers.
//!
//! Before 0.9 the AAD of a leaf accumulated every *preceding sibling key*
//! of every ancestor mapping, with no separators: within one mapping the
//! carry starts at the inherited AAD and grows by one key per entry, the
//! entry's own key included, and descent hands the grown carry down. The
//! vectors below are derived from that walk by hand and pin the scheme.

use base64::{engine::general_purpose, Engine as _};
use svault_core::{
    cipher, decrypt_document, encrypt_document, DataKey, Envelope, Mapping, Metadata, Node,
    TreeWalker, TypeTag, Value,
};

const IV: [u8; 32] = [7u8; 32];
const LASTMODIFIED: &str = "2015-11-20T09:00:00Z";

fn key() -> DataKey {
    DataKey::from_bytes(&[0x99; 32]).unwrap()
}

/// A pre-0.8 envelope: no `type:` segment, implicitly `str`.
fn legacy_envelope(key: &DataKey, aad: &[u8], plaintext: &[u8]) -> String {
    let (data, tag) = cipher::encrypt(key.expose(), &IV, aad, plaintext).unwrap();
    format!(
        "ENC[AES256_GCM,data:{},iv:{},tag:{}]",
        general_purpose::STANDARD.encode(data),
        general_purpose::STANDARD.encode(IV),
        general_purpose::STANDARD.encode(tag),
    )
}

/// `{a: {b, c}, d, e: [..]}` with each leaf sealed under its hand-derived
/// carry AAD: b => "ab", c => "abc", d => "ad", list elements of e => "ade".
fn legacy_tree(key: &DataKey) -> Node {
    let mut inner = Mapping::new();
    inner.insert("b".into(), Node::str(legacy_envelope(key, b"ab", b"v1")));
    inner.insert("c".into(), Node::str(legacy_envelope(key, b"abc", b"v2")));

    let mut root = Mapping::new();
    root.insert("a".into(), Node::Map(inner));
    root.insert("d".into(), Node::str(legacy_envelope(key, b"ad", b"v3")));
    root.insert(
        "e".into(),
        Node::Seq(vec![
            Node::str(legacy_envelope(key, b"ade", b"v4")),
            Node::str(legacy_envelope(key, b"ade", b"v5")),
        ]),
    );
    Node::Map(root)
}

#[test]
fn pre_09_carry_aad_vectors_decrypt() {
    let key = key();
    let mut tree = legacy_tree(&key);

    TreeWalker::new(&key, 0.7)
        .decrypt(&mut tree, None, None, None, true)
        .unwrap();

    assert_eq!(tree.at_path(r#"["a"]["b"]"#).unwrap().as_str(), Some("v1"));
    assert_eq!(tree.at_path(r#"["a"]["c"]"#).unwrap().as_str(), Some("v2"));
    assert_eq!(tree.at_path(r#"["d"]"#).unwrap().as_str(), Some("v3"));
    assert_eq!(tree.at_path(r#"["e"][0]"#).unwrap().as_str(), Some("v4"));
    assert_eq!(tree.at_path(r#"["e"][1]"#).unwrap().as_str(), Some("v5"));
}

#[test]
fn modern_separator_aads_do_not_open_a_legacy_document() {
    let key = key();
    let mut tree = legacy_tree(&key);
    // same document read as 0.9: the envelopes lack a type segment, so every
    // leaf is passed through as cleartext rather than decrypted
    TreeWalker::new(&key, 0.9)
        .decrypt(&mut tree, None, None, None, true)
        .unwrap();
    assert!(tree
        .at_path(r#"["d"]"#)
        .unwrap()
        .as_str()
        .unwrap()
        .starts_with("ENC[AES256_GCM"));
}

#[test]
fn legacy_mac_verifies_under_the_old_walk() {
    let key = key();
    let mut tree = legacy_tree(&key);

    // digest over the cleartext leaves in traversal order
    let mut digest = svault_core::mac::IntegrityMac::new();
    for clear in [b"v1", b"v2", b"v3", b"v4", b"v5"] {
        digest.absorb(clear);
    }
    let mac = legacy_envelope(&key, LASTMODIFIED.as_bytes(), digest.finalize().as_bytes());

    let mut meta = Metadata::new();
    meta.version = 0.7;
    meta.lastmodified = Some(LASTMODIFIED.to_owned());
    meta.mac = Some(mac);
    meta.write_to_tree(&mut tree);

    let meta = Metadata::from_tree(&tree).unwrap();
    decrypt_document(&mut tree, &key, &meta, None, false).unwrap();
    assert_eq!(tree.at_path(r#"["a"]["b"]"#).unwrap().as_str(), Some("v1"));
}

#[test]
fn version_08_envelopes_carry_types_under_the_carry_aad() {
    let key = key();
    let (data, tag) = cipher::encrypt(key.expose(), &IV, b"count", b"42").unwrap();
    let envelope = Envelope { data, iv: IV.to_vec(), tag, type_tag: TypeTag::Int }.format();

    let mut root = Mapping::new();
    root.insert("count".into(), Node::str(envelope));
    let mut tree = Node::Map(root);

    TreeWalker::new(&key, 0.8)
        .decrypt(&mut tree, None, None, None, true)
        .unwrap();
    assert_eq!(
        tree.get("count").unwrap().as_leaf().unwrap().value,
        Value::Int(42)
    );
}

#[test]
fn legacy_str_that_is_not_utf8_comes_back_as_bytes() {
    let key = key();
    let raw = [0xff, 0x00, 0xfe];
    let mut root = Mapping::new();
    root.insert("blob".into(), Node::str(legacy_envelope(&key, b"blob", &raw)));
    let mut tree = Node::Map(root);

    TreeWalker::new(&key, 0.7)
        .decrypt(&mut tree, None, None, None, true)
        .unwrap();
    assert_eq!(
        tree.get("blob").unwrap().as_leaf().unwrap().value,
        Value::Bytes(raw.to_vec())
    );
}

#[test]
fn reencrypting_a_legacy_document_upgrades_its_version() {
    let key = key();
    let mut tree = legacy_tree(&key);
    let mut meta = Metadata::new();
    meta.version = 0.7;

    decrypt_document(&mut tree, &key, &meta, None, true).unwrap();
    encrypt_document(&mut tree, &key, &mut meta, None, "2026-08-01T12:00:00Z").unwrap();

    assert_eq!(
        tree.at_path(r#"["sops"]["version"]"#).unwrap().as_leaf().unwrap().value,
        Value::Float(0.9)
    );

    // and the rewritten document opens under the modern scheme
    let meta = Metadata::from_tree(&tree).unwrap();
    decrypt_document(&mut tree, &key, &meta, None, false).unwrap();
    assert_eq!(tree.at_path(r#"["a"]["b"]"#).unwrap().as_str(), Some("v1"));
}
