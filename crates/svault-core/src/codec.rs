//! Document codecs: the envelope formats a document travels in on disk.
//!
//! Structured documents (YAML, JSON) keep the `sops` metadata branch as a
//! sibling of the user's top-level keys. Binary payloads append the literal
//! `SOPS=` marker followed by the key-sorted JSON of the metadata branch.

use std::path::Path;
use std::str::FromStr;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::meta::METADATA_KEY;
use crate::tree::{Leaf, Mapping, Node, ScalarStyle, Value};

const BYTES_MARKER: &[u8] = b"SOPS=";

pub trait DocumentCodec {
    fn parse(&self, input: &[u8]) -> Result<Node>;
    fn emit(&self, root: &Node) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Yaml,
    Json,
    Bytes,
}

impl FileType {
    /// Guess the document format from the file extension; anything that is
    /// not YAML or JSON is treated as raw bytes.
    pub fn detect(path: &Path) -> FileType {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => FileType::Yaml,
            Some("json") => FileType::Json,
            _ => FileType::Bytes,
        }
    }

    pub fn codec(self) -> Box<dyn DocumentCodec> {
        match self {
            FileType::Yaml => Box::new(YamlCodec),
            FileType::Json => Box::new(JsonCodec),
            FileType::Bytes => Box::new(BytesCodec),
        }
    }
}

impl FromStr for FileType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "yaml" | "yml" => Ok(FileType::Yaml),
            "json" => Ok(FileType::Json),
            "bytes" => Ok(FileType::Bytes),
            other => Err(Error::Syntax(format!("unknown document type '{other}'"))),
        }
    }
}

pub struct YamlCodec;

impl DocumentCodec for YamlCodec {
    fn parse(&self, input: &[u8]) -> Result<Node> {
        serde_yaml::from_slice(input).map_err(|e| Error::Syntax(e.to_string()))
    }

    /// Block-style emission that honors the leaf style tags. serde_yaml only
    /// picks literal style from scalar content, which can never fire on a
    /// literal-tagged leaf holding a single-line ciphertext envelope, so the
    /// structure is written here and single scalars are delegated to
    /// serde_yaml for quoting.
    fn emit(&self, root: &Node) -> Result<Vec<u8>> {
        let mut out = String::new();
        emit_yaml_node(&mut out, root, 0)?;
        Ok(out.into_bytes())
    }
}

const YAML_INDENT: &str = "  ";

fn pad(out: &mut String, indent: usize) {
    for _ in 0..indent {
        out.push_str(YAML_INDENT);
    }
}

/// A scalar ready for placement: on the current line, or as a block literal
/// whose body lines follow it.
enum Repr {
    Line(String),
    Block(String),
}

fn leaf_repr(leaf: &Leaf) -> Result<Repr> {
    if let Value::Str(s) = &leaf.value {
        if s.contains('\n') || leaf.style == ScalarStyle::Literal {
            if block_scalar_eligible(s) {
                return Ok(Repr::Block(s.clone()));
            }
            return Ok(Repr::Line(quote_double(s)));
        }
    }
    Ok(Repr::Line(scalar_line(&leaf.value)?))
}

/// Single-line rendering of one scalar, with serde_yaml deciding plain
/// versus quoted form.
fn scalar_line(value: &Value) -> Result<String> {
    let rendered = serde_yaml::to_string(value).map_err(|e| Error::Syntax(e.to_string()))?;
    Ok(rendered.trim_end_matches('\n').to_owned())
}

fn key_repr(key: &str) -> Result<String> {
    if key.contains('\n') {
        return Ok(quote_double(key));
    }
    scalar_line(&Value::Str(key.to_owned()))
}

/// A block literal can carry the string exactly when no line needs escaping
/// and the clip/strip chomping indicators suffice for the tail.
fn block_scalar_eligible(s: &str) -> bool {
    let body = s.trim_end_matches('\n');
    if body.is_empty() || s.len() - body.len() > 1 {
        return false;
    }
    body.split('\n').all(|line| {
        !line.starts_with(' ') && !line.ends_with(' ') && line.chars().all(|c| !c.is_control())
    })
}

fn quote_double(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\x{:02x}", c as u32))
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn push_block_literal(out: &mut String, s: &str, indent: usize) {
    let body = s.trim_end_matches('\n');
    out.push('|');
    if s.len() == body.len() {
        out.push('-');
    }
    out.push('\n');
    for line in body.split('\n') {
        if !line.is_empty() {
            pad(out, indent);
            out.push_str(line);
        }
        out.push('\n');
    }
}

fn emit_yaml_node(out: &mut String, node: &Node, indent: usize) -> Result<()> {
    match node {
        Node::Map(map) if map.is_empty() => out.push_str("{}\n"),
        Node::Seq(items) if items.is_empty() => out.push_str("[]\n"),
        Node::Map(map) => emit_yaml_map(out, map, indent, false)?,
        Node::Seq(items) => emit_yaml_seq(out, items, indent)?,
        Node::Leaf(leaf) => match leaf_repr(leaf)? {
            Repr::Line(s) => {
                out.push_str(&s);
                out.push('\n');
            }
            Repr::Block(s) => push_block_literal(out, &s, indent + 1),
        },
    }
    Ok(())
}

fn emit_yaml_map(out: &mut String, map: &Mapping, indent: usize, mut inline_first: bool) -> Result<()> {
    for (key, value) in map {
        if inline_first {
            inline_first = false;
        } else {
            pad(out, indent);
        }
        out.push_str(&key_repr(key)?);
        out.push(':');
        match value {
            Node::Leaf(leaf) => match leaf_repr(leaf)? {
                Repr::Line(s) => {
                    out.push(' ');
                    out.push_str(&s);
                    out.push('\n');
                }
                Repr::Block(s) => {
                    out.push(' ');
                    push_block_literal(out, &s, indent + 1);
                }
            },
            Node::Map(m) if m.is_empty() => out.push_str(" {}\n"),
            Node::Map(m) => {
                out.push('\n');
                emit_yaml_map(out, m, indent + 1, false)?;
            }
            Node::Seq(items) if items.is_empty() => out.push_str(" []\n"),
            // sequences sit at the same indentation as their key
            Node::Seq(items) => {
                out.push('\n');
                emit_yaml_seq(out, items, indent)?;
            }
        }
    }
    Ok(())
}

fn emit_yaml_seq(out: &mut String, items: &[Node], indent: usize) -> Result<()> {
    for item in items {
        pad(out, indent);
        out.push('-');
        match item {
            Node::Leaf(leaf) => match leaf_repr(leaf)? {
                Repr::Line(s) => {
                    out.push(' ');
                    out.push_str(&s);
                    out.push('\n');
                }
                Repr::Block(s) => {
                    out.push(' ');
                    push_block_literal(out, &s, indent + 1);
                }
            },
            Node::Map(m) if m.is_empty() => out.push_str(" {}\n"),
            Node::Map(m) => {
                out.push(' ');
                emit_yaml_map(out, m, indent + 1, true)?;
            }
            Node::Seq(s) if s.is_empty() => out.push_str(" []\n"),
            Node::Seq(s) => {
                out.push('\n');
                emit_yaml_seq(out, s, indent + 1)?;
            }
        }
    }
    Ok(())
}

pub struct JsonCodec;

impl DocumentCodec for JsonCodec {
    fn parse(&self, input: &[u8]) -> Result<Node> {
        serde_json::from_slice(input).map_err(|e| Error::Syntax(e.to_string()))
    }

    fn emit(&self, root: &Node) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
        root.serialize(&mut ser)
            .map_err(|e| Error::Syntax(e.to_string()))?;
        out.push(b'\n');
        Ok(out)
    }
}

pub struct BytesCodec;

impl DocumentCodec for BytesCodec {
    /// Split the payload from the trailing `SOPS=` metadata, if any, into a
    /// `{data, sops}` tree. A file without the marker is a plain payload.
    fn parse(&self, input: &[u8]) -> Result<Node> {
        let mut root = Mapping::new();
        match rfind(input, BYTES_MARKER) {
            Some(pos) => {
                root.insert("data".into(), payload_leaf(&input[..pos]));
                let branch: Node = serde_json::from_slice(&input[pos + BYTES_MARKER.len()..])
                    .map_err(|e| Error::Syntax(format!("invalid metadata trailer: {e}")))?;
                root.insert(METADATA_KEY.into(), branch);
            }
            None => {
                root.insert("data".into(), payload_leaf(input));
            }
        }
        Ok(Node::Map(root))
    }

    fn emit(&self, root: &Node) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match root.get("data").map(|n| n.as_leaf().map(|l| &l.value)) {
            Some(Some(Value::Str(s))) => out.extend_from_slice(s.as_bytes()),
            Some(Some(Value::Bytes(b))) => out.extend_from_slice(b),
            Some(Some(Value::Int(i))) => out.extend_from_slice(i.to_string().as_bytes()),
            Some(Some(Value::Float(f))) => out.extend_from_slice(f.to_string().as_bytes()),
            Some(Some(Value::Bool(b))) => out.extend_from_slice(b.to_string().as_bytes()),
            Some(Some(Value::Null)) | None => {}
            Some(None) => {
                return Err(Error::Syntax("bytes document 'data' entry must be a scalar".into()))
            }
        }
        if let Some(branch) = root.get(METADATA_KEY) {
            out.extend_from_slice(BYTES_MARKER);
            let sorted = sorted_json(branch)?;
            out.extend_from_slice(
                serde_json::to_string(&sorted)
                    .map_err(|e| Error::Syntax(e.to_string()))?
                    .as_bytes(),
            );
        }
        Ok(out)
    }
}

fn payload_leaf(raw: &[u8]) -> Node {
    match std::str::from_utf8(raw) {
        Ok(text) => Node::str(text),
        Err(_) => Node::Leaf(Leaf::new(Value::Bytes(raw.to_vec()))),
    }
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .rposition(|window| window == needle)
}

/// JSON rendering of a subtree with every mapping's keys sorted, regardless
/// of document order. Only the bytes trailer wants this.
fn sorted_json(node: &Node) -> Result<serde_json::Value> {
    Ok(match node {
        Node::Leaf(leaf) => {
            serde_json::to_value(&leaf.value).map_err(|e| Error::Syntax(e.to_string()))?
        }
        Node::Seq(items) => serde_json::Value::Array(
            items.iter().map(sorted_json).collect::<Result<Vec<_>>>()?,
        ),
        Node::Map(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for key in keys {
                out.insert(key.clone(), sorted_json(&map[key])?);
            }
            serde_json::Value::Object(out)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_by_extension() {
        assert_eq!(FileType::detect(Path::new("a.yaml")), FileType::Yaml);
        assert_eq!(FileType::detect(Path::new("a.yml")), FileType::Yaml);
        assert_eq!(FileType::detect(Path::new("a.json")), FileType::Json);
        assert_eq!(FileType::detect(Path::new("a.bin")), FileType::Bytes);
        assert_eq!(FileType::detect(Path::new("nodot")), FileType::Bytes);
    }

    #[test]
    fn json_emits_four_space_indent_in_document_order() {
        let tree: Node = serde_json::from_str(r#"{"z": 1, "a": 2}"#).unwrap();
        let out = JsonCodec.emit(&tree).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "{\n    \"z\": 1,\n    \"a\": 2\n}\n"
        );
    }

    #[test]
    fn yaml_syntax_errors_surface_as_syntax() {
        let res = YamlCodec.parse(b"key: [unclosed");
        assert!(matches!(res, Err(Error::Syntax(_))));
    }

    #[test]
    fn yaml_emission_round_trips_structure_and_styles() {
        let src = "a: 1\nm:\n  x: plain\n  multi: |\n    line one\n    line two\nlist:\n- 1\n- k: v\n";
        let tree = YamlCodec.parse(src.as_bytes()).unwrap();
        let out = YamlCodec.emit(&tree).unwrap();
        let back = YamlCodec.parse(&out).unwrap();
        assert_eq!(back, tree);
    }

    #[test]
    fn literal_tag_forces_block_style_on_single_line_scalars() {
        let envelope = "ENC[AES256_GCM,data:abc,iv:def,tag:ghi,type:str]";
        let mut root = Mapping::new();
        root.insert(
            "cert".into(),
            Node::Leaf(Leaf::literal(Value::Str(envelope.into()))),
        );
        let out = YamlCodec.emit(&Node::Map(root)).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, format!("cert: |-\n  {envelope}\n"));

        let back = YamlCodec.parse(text.as_bytes()).unwrap();
        assert_eq!(back.get("cert").unwrap().as_str(), Some(envelope));
    }

    #[test]
    fn ambiguous_scalars_stay_quoted_through_emission() {
        let src = r#"{"s": "true", "colon": "a: b", "dash": "- x", "num": "0.5", "empty": ""}"#;
        let tree: Node = serde_json::from_str(src).unwrap();
        let out = YamlCodec.emit(&tree).unwrap();
        let back = YamlCodec.parse(&out).unwrap();
        assert_eq!(back, tree);
    }

    #[test]
    fn sequences_of_mappings_inline_the_first_entry() {
        let tree: Node =
            serde_json::from_str(r#"{"kms": [{"arn": "a", "enc": "e"}], "m": {}, "l": []}"#)
                .unwrap();
        let out = String::from_utf8(YamlCodec.emit(&tree).unwrap()).unwrap();
        assert_eq!(out, "kms:\n- arn: a\n  enc: e\nm: {}\nl: []\n");
        let back = YamlCodec.parse(out.as_bytes()).unwrap();
        assert_eq!(back, tree);
    }

    #[test]
    fn bytes_round_trip_with_metadata_trailer() {
        let mut root = Mapping::new();
        root.insert("data".into(), Node::str("ENC[AES256_GCM,data:x,iv:y,tag:z,type:bytes]"));
        let mut sops = Mapping::new();
        sops.insert("version".into(), Node::float(0.9));
        sops.insert("lastmodified".into(), Node::str("2026-08-01T00:00:00Z"));
        root.insert(METADATA_KEY.into(), Node::Map(sops));
        let tree = Node::Map(root);

        let raw = BytesCodec.emit(&tree).unwrap();
        let text = String::from_utf8(raw.clone()).unwrap();
        assert!(text.starts_with("ENC[AES256_GCM"));
        // trailer keys are sorted regardless of document order
        assert!(text.ends_with(r#"SOPS={"lastmodified":"2026-08-01T00:00:00Z","version":0.9}"#));

        let back = BytesCodec.parse(&raw).unwrap();
        assert_eq!(
            back.get("data").unwrap().as_str(),
            Some("ENC[AES256_GCM,data:x,iv:y,tag:z,type:bytes]")
        );
        assert_eq!(
            back.get(METADATA_KEY).unwrap().get("lastmodified").unwrap().as_str(),
            Some("2026-08-01T00:00:00Z")
        );
    }

    #[test]
    fn bytes_without_marker_is_a_plain_payload() {
        let tree = BytesCodec.parse(b"just some text").unwrap();
        assert_eq!(tree.get("data").unwrap().as_str(), Some("just some text"));
        assert!(tree.get(METADATA_KEY).is_none());
    }
}
