//! Text encoding for [`Data`].
//!
//! The encoding is JSON, written and read with `serde_json`:
//!
//! - verbatim atoms are strings, interpreted atoms keep their literal text
//! - compounds are objects, arrays are arrays, undefined is `null`
//! - node references are written as a string of their markup
//! - blobs are written as `{"$binary": "<hex>", "$mime": "<type>"}`
//! - a compound made only of reserved keys is wrapped as `{"$compound": {..}}`
//!
//! Decoding a bare token that is not an object or array yields a single atom:
//! numbers and booleans are interpreted, everything else is verbatim.

use crate::data::{is_numeric, AtomKind, Blob, Data};
use crate::error::CoreError;
use serde_json::{Map, Number, Value};

const BINARY_KEY: &str = "$binary";
const MIME_KEY: &str = "$mime";
const COMPOUND_KEY: &str = "$compound";

/// Encodes a value.
pub fn encode(data: &Data) -> String {
    to_value(data).to_string()
}

/// Decodes a value.
pub fn decode(text: &str) -> Result<Data, CoreError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Data::Undefined);
    }

    if !trimmed.starts_with('{') && !trimmed.starts_with('[') {
        return Ok(decode_bare(trimmed));
    }

    let value: Value = serde_json::from_str(trimmed).map_err(|e| CoreError::Decode {
        offset: offset_of(trimmed, &e),
        reason: e.to_string(),
    })?;
    Ok(from_value(value))
}

fn decode_bare(token: &str) -> Data {
    if token == "null" {
        return Data::Undefined;
    }
    if token == "true" || token == "false" || is_numeric(token) {
        return Data::interpreted(token);
    }
    if token.len() >= 2 && token.starts_with('"') && token.ends_with('"') {
        if let Ok(s) = serde_json::from_str::<String>(token) {
            return Data::verbatim(s);
        }
    }
    Data::verbatim(token)
}

fn to_value(data: &Data) -> Value {
    match data {
        Data::Undefined => Value::Null,
        Data::Atom {
            text,
            kind: AtomKind::Verbatim,
        } => Value::String(text.clone()),
        Data::Atom { text, .. } => interpreted_value(text),
        Data::Compound(map) => {
            let object: Map<String, Value> =
                map.iter().map(|(k, v)| (k.clone(), to_value(v))).collect();
            if is_reserved_shape(map.keys().map(String::as_str)) {
                let mut envelope = Map::new();
                envelope.insert(COMPOUND_KEY.to_string(), Value::Object(object));
                Value::Object(envelope)
            } else {
                Value::Object(object)
            }
        }
        Data::Array(items) => Value::Array(items.iter().map(to_value).collect()),
        Data::Node(node) => Value::String(node.0.clone()),
        Data::Binary(blob) => {
            let mut object = Map::new();
            object.insert(BINARY_KEY.to_string(), Value::String(hex::encode(&blob.bytes)));
            object.insert(MIME_KEY.to_string(), Value::String(blob.mime_type.clone()));
            Value::Object(object)
        }
    }
}

/// Literal text of an interpreted atom. Numbers keep their exact spelling;
/// text that is no JSON literal is written as a string.
fn interpreted_value(text: &str) -> Value {
    match text {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => match text.parse::<Number>() {
            Ok(n) => Value::Number(n),
            Err(_) => Value::String(text.to_string()),
        },
    }
}

/// A non-empty key set drawn only from the reserved keys would read back as
/// a blob or an envelope.
fn is_reserved_shape<'a>(mut keys: impl Iterator<Item = &'a str>) -> bool {
    let mut any = false;
    let reserved = keys.all(|k| {
        any = true;
        k == BINARY_KEY || k == MIME_KEY || k == COMPOUND_KEY
    });
    any && reserved
}

fn from_value(value: Value) -> Data {
    match value {
        Value::Null => Data::Undefined,
        Value::Bool(b) => Data::interpreted(b.to_string()),
        Value::Number(n) => Data::interpreted(n.to_string()),
        Value::String(s) => Data::verbatim(s),
        Value::Array(items) => Data::Array(items.into_iter().map(from_value).collect()),
        Value::Object(mut object) => {
            let enveloped =
                object.len() == 1 && matches!(object.get(COMPOUND_KEY), Some(Value::Object(_)));
            if enveloped {
                if let Some(Value::Object(inner)) = object.remove(COMPOUND_KEY) {
                    return Data::Compound(
                        inner.into_iter().map(|(k, v)| (k, from_value(v))).collect(),
                    );
                }
            }
            if let Some(blob) = blob_of(&object) {
                return Data::Binary(blob);
            }
            Data::Compound(object.into_iter().map(|(k, v)| (k, from_value(v))).collect())
        }
    }
}

fn blob_of(object: &Map<String, Value>) -> Option<Blob> {
    if object.len() != 2 {
        return None;
    }
    let bytes = object.get(BINARY_KEY)?.as_str()?;
    let mime = object.get(MIME_KEY)?.as_str()?;
    let bytes = hex::decode(bytes).ok()?;
    Some(Blob::new(bytes, mime))
}

/// Byte offset of a parse error.
fn offset_of(text: &str, err: &serde_json::Error) -> usize {
    let line_start: usize = text
        .split_inclusive('\n')
        .take(err.line().saturating_sub(1))
        .map(str::len)
        .sum();
    (line_start + err.column().saturating_sub(1)).min(text.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::NodeRef;
    use proptest::prelude::*;

    #[test]
    fn test_encode_atoms() {
        assert_eq!(encode(&Data::verbatim("hi")), "\"hi\"");
        assert_eq!(encode(&Data::interpreted("42")), "42");
        assert_eq!(encode(&Data::Undefined), "null");
        assert_eq!(encode(&Data::verbatim("")), "\"\"");
    }

    #[test]
    fn test_encode_escapes() {
        let data = Data::verbatim("a\"b\\c\nd\te\u{01}");
        assert_eq!(encode(&data), "\"a\\\"b\\\\c\\nd\\te\\u0001\"");
        assert_eq!(decode(&encode(&data)).unwrap(), data);
    }

    #[test]
    fn test_decode_bare_tokens() {
        assert_eq!(decode("42").unwrap(), Data::interpreted("42"));
        assert_eq!(decode("-1.5e3").unwrap(), Data::interpreted("-1.5e3"));
        assert_eq!(decode("hello world").unwrap(), Data::verbatim("hello world"));
        assert_eq!(decode("\"quoted\"").unwrap(), Data::verbatim("quoted"));
        assert_eq!(decode("true").unwrap(), Data::interpreted("true"));
        assert_eq!(decode("null").unwrap(), Data::Undefined);
        assert_eq!(decode("   ").unwrap(), Data::Undefined);
    }

    #[test]
    fn test_decode_nested() {
        let data = decode(r#"{"a": [1, "x", {"b": null}], "c": false}"#).unwrap();
        let a = data.get("a").unwrap();
        assert_eq!(a.get_index(0), Some(&Data::interpreted("1")));
        assert_eq!(a.get_index(1), Some(&Data::verbatim("x")));
        assert_eq!(a.get_index(2).unwrap().get("b"), Some(&Data::Undefined));
        assert_eq!(data.get("c"), Some(&Data::interpreted("false")));
    }

    #[test]
    fn test_decode_errors() {
        assert!(decode("{\"a\": }").is_err());
        assert!(decode("[1, 2").is_err());
        assert!(decode("{\"a\": 1} trailing").is_err());
        assert!(decode("{a: 1}").is_err());
        assert!(decode("[\"unterminated]").is_err());
    }

    #[test]
    fn test_binary_round_trip() {
        let data = Data::Binary(Blob::new(vec![0u8, 1, 254, 255], "application/octet-stream"));
        let text = encode(&data);
        assert!(text.contains("$binary"));
        assert_eq!(decode(&text).unwrap(), data);
    }

    #[test]
    fn test_compound_with_reserved_keys_round_trips() {
        let lookalike = Data::Compound(
            [
                ("$binary".to_string(), Data::verbatim("00")),
                ("$mime".to_string(), Data::verbatim("x")),
            ]
            .into_iter()
            .collect(),
        );
        let text = encode(&lookalike);
        assert!(text.starts_with("{\"$compound\""));
        assert_eq!(decode(&text).unwrap(), lookalike);

        let nested = Data::Compound(
            [("$compound".to_string(), Data::Array(vec![Data::from(1)]))]
                .into_iter()
                .collect(),
        );
        assert_eq!(decode(&encode(&nested)).unwrap(), nested);

        // Ordinary `$` keys are left alone.
        assert_eq!(encode(&decode(r#"{"$ref": "a"}"#).unwrap()), r#"{"$ref":"a"}"#);
    }

    #[test]
    fn test_numbers_keep_their_spelling() {
        let data = decode("[1.50, -0, 1e3, 12345678901234567890123]").unwrap();
        assert_eq!(data.get_index(0), Some(&Data::interpreted("1.50")));
        assert_eq!(data.get_index(2), Some(&Data::interpreted("1e3")));
        assert_eq!(encode(&data), "[1.50,-0,1e3,12345678901234567890123]");
    }

    #[test]
    fn test_decode_error_offset() {
        match decode("{\"a\": 1,\n \"b\": }") {
            Err(CoreError::Decode { offset, .. }) => assert!(offset > 8, "offset {}", offset),
            other => panic!("expected a decode error, got {:?}", other),
        }
    }

    #[test]
    fn test_node_encodes_as_string() {
        let data = Data::Node(NodeRef("<a href=\"x\"/>".to_string()));
        assert_eq!(
            decode(&encode(&data)).unwrap(),
            Data::verbatim("<a href=\"x\"/>")
        );
    }

    #[test]
    fn test_unicode_escape() {
        assert_eq!(
            decode("[\"\\u00e9\\ud83d\\ude00\"]").unwrap(),
            Data::Array(vec![Data::verbatim("é😀")])
        );
    }

    fn arb_key() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("$binary".to_string()),
            Just("$mime".to_string()),
            Just("$compound".to_string()),
            "[$a-z_]{1,6}",
        ]
    }

    fn arb_data() -> impl Strategy<Value = Data> {
        let leaf = prop_oneof![
            Just(Data::Undefined),
            any::<String>().prop_map(Data::verbatim),
            any::<i64>().prop_map(Data::from),
            any::<bool>().prop_map(Data::from),
            prop::collection::vec(any::<u8>(), 0..8)
                .prop_map(|b| Data::Binary(Blob::new(b, "application/octet-stream"))),
        ];
        leaf.prop_recursive(4, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Data::Array),
                prop::collection::btree_map(arb_key(), inner, 0..6).prop_map(Data::Compound),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_text_round_trip(data in arb_data()) {
            let text = encode(&data);
            prop_assert_eq!(decode(&text).unwrap(), data);
        }

        #[test]
        fn prop_merge_with_self_is_identity(data in arb_data()) {
            let mut merged = data.clone();
            merged.merge(&data);
            prop_assert_eq!(merged, data);
        }
    }
}
