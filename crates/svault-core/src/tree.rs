use std::fmt;

use base64::{engine::general_purpose, Engine as _};
use indexmap::IndexMap;
use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

use crate::error::{Error, Result};

/// Marker carrying binary leaves through the text codecs, which have no
/// native byte scalar. Reads like the YAML binary tag but stays an ordinary
/// string on the wire, so both codecs round-trip it unchanged.
const BINARY_PREFIX: &str = "!!binary ";

/// Insertion-ordered mapping. AAD derivation, MAC input order and serialized
/// output all depend on deterministic iteration, so plain `HashMap` is out.
pub type Mapping = IndexMap<String, Node>;

/// Presentation style of a scalar, forwarded untouched across both walks so
/// the document codec can re-emit the original literal form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScalarStyle {
    #[default]
    Plain,
    /// Block-literal scalar (YAML `|`). Non-YAML codecs ignore it.
    Literal,
}

/// A typed scalar leaf value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    /// JSON/YAML `null`. Not a member of the envelope type set; encryption
    /// coerces it through the catch-all `bytes` rule.
    Null,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Leaf {
    pub value: Value,
    pub style: ScalarStyle,
}

impl Leaf {
    pub fn new(value: Value) -> Self {
        Leaf { value, style: ScalarStyle::Plain }
    }

    pub fn literal(value: Value) -> Self {
        Leaf { value, style: ScalarStyle::Literal }
    }
}

/// A node of the document tree: a scalar leaf, an ordered mapping, or a list.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Leaf(Leaf),
    Map(Mapping),
    Seq(Vec<Node>),
}

impl Node {
    pub fn str(s: impl Into<String>) -> Self {
        Node::Leaf(Leaf::new(Value::Str(s.into())))
    }

    pub fn int(i: i64) -> Self {
        Node::Leaf(Leaf::new(Value::Int(i)))
    }

    pub fn float(f: f64) -> Self {
        Node::Leaf(Leaf::new(Value::Float(f)))
    }

    pub fn bool(b: bool) -> Self {
        Node::Leaf(Leaf::new(Value::Bool(b)))
    }

    pub fn map() -> Self {
        Node::Map(Mapping::new())
    }

    pub fn as_map(&self) -> Option<&Mapping> {
        match self {
            Node::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut Mapping> {
        match self {
            Node::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_leaf(&self) -> Option<&Leaf> {
        match self {
            Node::Leaf(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Node::Leaf(Leaf { value: Value::Str(s), .. }) => Some(s),
            _ => None,
        }
    }

    /// Child lookup on a mapping node; `None` for other shapes.
    pub fn get(&self, key: &str) -> Option<&Node> {
        self.as_map().and_then(|m| m.get(key))
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Node> {
        self.as_map_mut().and_then(|m| m.get_mut(key))
    }

    /// Resolve a tree path of the form `["key"][0]["deeper"]` against this
    /// node, as accepted by the CLI `--extract` flag.
    pub fn at_path(&self, path: &str) -> Result<&Node> {
        let mut cur = self;
        for comp in path.split('[') {
            if comp.is_empty() {
                continue;
            }
            let comp = comp
                .strip_suffix(']')
                .ok_or_else(|| Error::Syntax(format!("invalid tree path format: {path}")))?;
            let comp = comp.trim_matches(|c| c == '"' || c == '\'');
            cur = if comp.bytes().all(|b| b.is_ascii_digit()) && !comp.is_empty() {
                let idx: usize = comp
                    .parse()
                    .map_err(|_| Error::Syntax(format!("invalid tree path index: {comp}")))?;
                match cur {
                    Node::Seq(items) => items.get(idx),
                    _ => None,
                }
                .ok_or_else(|| Error::Syntax(format!("no such index in tree: {idx}")))?
            } else {
                cur.get(comp)
                    .ok_or_else(|| Error::Syntax(format!("no such key in tree: {comp}")))?
            };
        }
        Ok(cur)
    }
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Node::Leaf(leaf) => leaf.value.serialize(serializer),
            Node::Map(m) => {
                let mut map = serializer.serialize_map(Some(m.len()))?;
                for (k, v) in m {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Node::Seq(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Str(s) => serializer.serialize_str(s),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Bool(b) => serializer.serialize_bool(*b),
            // Base64 under the binary marker; the bytes document format
            // bypasses serde entirely and writes the raw payload.
            Value::Bytes(b) => serializer.serialize_str(&format!(
                "{BINARY_PREFIX}{}",
                general_purpose::STANDARD.encode(b)
            )),
            Value::Null => serializer.serialize_unit(),
        }
    }
}

struct NodeVisitor;

impl<'de> Visitor<'de> for NodeVisitor {
    type Value = Node;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a scalar, sequence or mapping")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Node, E> {
        Ok(Node::bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Node, E> {
        Ok(Node::int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Node, E> {
        if v <= i64::MAX as u64 {
            Ok(Node::int(v as i64))
        } else {
            Ok(Node::float(v as f64))
        }
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Node, E> {
        Ok(Node::float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Node, E> {
        self.visit_string(v.to_owned())
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<Node, E> {
        // Binary leaves come back from the text codecs under the marker.
        if let Some(encoded) = v.strip_prefix(BINARY_PREFIX) {
            if let Ok(raw) = general_purpose::STANDARD.decode(encoded) {
                return Ok(Node::Leaf(Leaf::new(Value::Bytes(raw))));
            }
        }
        // Multi-line scalars re-emit as block literals; tag them so the
        // style survives the walk.
        let leaf = if v.contains('\n') {
            Leaf::literal(Value::Str(v))
        } else {
            Leaf::new(Value::Str(v))
        };
        Ok(Node::Leaf(leaf))
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Node, E> {
        Ok(Node::Leaf(Leaf::new(Value::Null)))
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<Node, E> {
        self.visit_unit()
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> std::result::Result<Node, D::Error> {
        d.deserialize_any(NodeVisitor)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Node, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element::<Node>()? {
            items.push(item);
        }
        Ok(Node::Seq(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Node, A::Error> {
        let mut entries = Mapping::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((key, value)) = map.next_entry::<MapKey, Node>()? {
            entries.insert(key.0, value);
        }
        Ok(Node::Map(entries))
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        d.deserialize_any(NodeVisitor)
    }
}

/// Mapping key, coerced to text. YAML permits numeric and boolean keys;
/// the tree (and the AAD derived from it) is keyed by strings.
struct MapKey(String);

struct MapKeyVisitor;

impl<'de> Visitor<'de> for MapKeyVisitor {
    type Value = MapKey;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a mapping key")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<MapKey, E> {
        Ok(MapKey(v.to_owned()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<MapKey, E> {
        Ok(MapKey(v))
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<MapKey, E> {
        Ok(MapKey(v.to_string()))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<MapKey, E> {
        Ok(MapKey(v.to_string()))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<MapKey, E> {
        Ok(MapKey(v.to_string()))
    }
}

impl<'de> Deserialize<'de> for MapKey {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        d.deserialize_any(MapKeyVisitor)
    }
}
