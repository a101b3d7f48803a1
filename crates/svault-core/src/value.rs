//! Typed leaf values in and out of the ciphertext envelope.
//!
//! A leaf travels as the single string
//! `ENC[AES256_GCM,data:<b64>,iv:<b64>,tag:<b64>,type:<tag>]`; documents
//! written before format 0.8 omit the `,type:` segment and every leaf is
//! implicitly `str`.

use base64::{engine::general_purpose, Engine as _};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};
use crate::tree::Value;

static ENVELOPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^ENC\[AES256_GCM,data:(.+),iv:(.+),tag:(.+),type:(.+)\]").unwrap()
});

static ENVELOPE_PRE_08: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^ENC\[AES256_GCM,data:(.+),iv:(.+),tag:(.+)\]").unwrap()
});

/// The closed set of leaf types an envelope can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    Str,
    Int,
    Float,
    Bool,
    Bytes,
}

impl TypeTag {
    pub fn as_str(self) -> &'static str {
        match self {
            TypeTag::Str => "str",
            TypeTag::Int => "int",
            TypeTag::Float => "float",
            TypeTag::Bool => "bool",
            TypeTag::Bytes => "bytes",
        }
    }

    pub fn parse(tag: &str) -> Result<Self> {
        match tag {
            "str" => Ok(TypeTag::Str),
            "int" => Ok(TypeTag::Int),
            "float" => Ok(TypeTag::Float),
            "bool" => Ok(TypeTag::Bool),
            "bytes" => Ok(TypeTag::Bytes),
            other => Err(Error::UnsupportedType(other.to_owned())),
        }
    }
}

/// Encode a typed value to the cleartext bytes that get encrypted (and
/// digested), plus the tag that restores the type on the way back.
///
/// `Bool` is its own type even though it would also parse as text, and any
/// value outside the closed set degrades to its textual form under `bytes`.
pub fn encode(value: &Value) -> (Vec<u8>, TypeTag) {
    match value {
        Value::Str(s) => (s.as_bytes().to_vec(), TypeTag::Str),
        Value::Bool(b) => (if *b { b"true".to_vec() } else { b"false".to_vec() }, TypeTag::Bool),
        Value::Int(i) => (i.to_string().into_bytes(), TypeTag::Int),
        Value::Float(f) => (f.to_string().into_bytes(), TypeTag::Float),
        Value::Bytes(b) => (b.clone(), TypeTag::Bytes),
        Value::Null => (b"null".to_vec(), TypeTag::Bytes),
    }
}

/// Restore a typed value from cleartext bytes and an envelope tag.
///
/// `str` cleartext that is not valid UTF-8 comes back as raw bytes: documents
/// written by producers without a `bytes` tag stored binary under `str`.
pub fn decode(clear: &[u8], tag: TypeTag) -> Result<Value> {
    match tag {
        TypeTag::Str => Ok(match String::from_utf8(clear.to_vec()) {
            Ok(s) => Value::Str(s),
            Err(e) => Value::Bytes(e.into_bytes()),
        }),
        TypeTag::Int => {
            let text = std::str::from_utf8(clear)
                .map_err(|_| Error::MalformedEnvelope("int value is not UTF-8".into()))?;
            text.parse::<i64>()
                .map(Value::Int)
                .map_err(|_| Error::MalformedEnvelope(format!("invalid int value '{text}'")))
        }
        TypeTag::Float => {
            let text = std::str::from_utf8(clear)
                .map_err(|_| Error::MalformedEnvelope("float value is not UTF-8".into()))?;
            text.parse::<f64>()
                .map(Value::Float)
                .map_err(|_| Error::MalformedEnvelope(format!("invalid float value '{text}'")))
        }
        TypeTag::Bool => Ok(Value::Bool(clear.eq_ignore_ascii_case(b"true"))),
        TypeTag::Bytes => Ok(Value::Bytes(clear.to_vec())),
    }
}

/// The parsed fields of one leaf ciphertext.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub data: Vec<u8>,
    pub iv: Vec<u8>,
    pub tag: Vec<u8>,
    pub type_tag: TypeTag,
}

impl Envelope {
    /// Render the envelope string stored in the document.
    pub fn format(&self) -> String {
        format!(
            "ENC[AES256_GCM,data:{},iv:{},tag:{},type:{}]",
            general_purpose::STANDARD.encode(&self.data),
            general_purpose::STANDARD.encode(&self.iv),
            general_purpose::STANDARD.encode(&self.tag),
            self.type_tag.as_str(),
        )
    }

    /// Parse a document scalar. `Ok(None)` means the value is not in
    /// encrypted form at all and must pass through unchanged.
    pub fn parse(raw: &str, version: f64) -> Result<Option<Envelope>> {
        let (caps, type_tag) = if version >= 0.8 {
            match ENVELOPE.captures(raw) {
                Some(caps) => {
                    let tag = TypeTag::parse(caps.get(4).unwrap().as_str())?;
                    (caps, tag)
                }
                None => return Ok(None),
            }
        } else {
            match ENVELOPE_PRE_08.captures(raw) {
                Some(caps) => (caps, TypeTag::Str),
                None => return Ok(None),
            }
        };

        let field = |i: usize, name: &str| -> Result<Vec<u8>> {
            general_purpose::STANDARD
                .decode(caps.get(i).unwrap().as_str())
                .map_err(|e| Error::MalformedEnvelope(format!("bad base64 in '{name}': {e}")))
        };

        Ok(Some(Envelope {
            data: field(1, "data")?,
            iv: field(2, "iv")?,
            tag: field(3, "tag")?,
            type_tag,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_its_string_form() {
        let env = Envelope {
            data: vec![1, 2, 3],
            iv: vec![9; 32],
            tag: vec![7; 16],
            type_tag: TypeTag::Int,
        };
        let raw = env.format();
        let back = Envelope::parse(&raw, 0.9).unwrap().expect("should parse");
        assert_eq!(back.data, env.data);
        assert_eq!(back.iv, env.iv);
        assert_eq!(back.tag, env.tag);
        assert_eq!(back.type_tag, TypeTag::Int);
    }

    #[test]
    fn pre_08_envelope_has_no_type_and_is_implicitly_str() {
        let raw = "ENC[AES256_GCM,data:AQID,iv:CQk=,tag:Bwc=]";
        let env = Envelope::parse(raw, 0.7).unwrap().expect("should parse");
        assert_eq!(env.type_tag, TypeTag::Str);
        assert_eq!(env.data, [1, 2, 3]);

        // the same string under a modern version is not an envelope
        assert!(Envelope::parse(raw, 0.9).unwrap().is_none());
    }

    #[test]
    fn cleartext_passes_through_as_none() {
        assert!(Envelope::parse("hello", 0.9).unwrap().is_none());
        assert!(Envelope::parse("ENC[almost]", 0.9).unwrap().is_none());
    }

    #[test]
    fn unknown_type_tag_is_fatal() {
        let raw = "ENC[AES256_GCM,data:AQID,iv:CQk=,tag:Bwc=,type:datetime]";
        match Envelope::parse(raw, 0.9) {
            Err(Error::UnsupportedType(t)) => assert_eq!(t, "datetime"),
            other => panic!("expected UnsupportedType, got {other:?}"),
        }
    }

    #[test]
    fn bool_encodes_as_bool_not_int() {
        assert_eq!(encode(&Value::Bool(true)), (b"true".to_vec(), TypeTag::Bool));
        assert_eq!(encode(&Value::Int(1)), (b"1".to_vec(), TypeTag::Int));
        assert_eq!(decode(b"True", TypeTag::Bool).unwrap(), Value::Bool(true));
        assert_eq!(decode(b"nope", TypeTag::Bool).unwrap(), Value::Bool(false));
    }

    #[test]
    fn str_decode_falls_back_to_bytes_on_invalid_utf8() {
        let raw = vec![0xff, 0xfe, 0x00];
        assert_eq!(decode(&raw, TypeTag::Str).unwrap(), Value::Bytes(raw));
    }

    #[test]
    fn null_coerces_through_the_bytes_rule() {
        assert_eq!(encode(&Value::Null), (b"null".to_vec(), TypeTag::Bytes));
    }

    #[test]
    fn numeric_round_trip_keeps_types() {
        let (bytes, tag) = encode(&Value::Int(42));
        assert_eq!(decode(&bytes, tag).unwrap(), Value::Int(42));
        let (bytes, tag) = encode(&Value::Float(1234.5678));
        assert_eq!(decode(&bytes, tag).unwrap(), Value::Float(1234.5678));
    }
}
