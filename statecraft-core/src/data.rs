//! Tagged data values.
//!
//! [`Data`] is the value type passed between the interpreter, the data model
//! and event payloads. Exactly one representation is populated per value.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// How an atom is to be read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtomKind {
    /// A literal string, encoded quoted.
    #[default]
    Verbatim,
    /// A raw token (number, boolean, expression result), encoded unquoted.
    Interpreted,
}

/// Reference to an external document node, carried as its markup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeRef(pub String);

/// Binary payload with its mime type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    #[serde(with = "hex_bytes")]
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl Blob {
    pub fn new(bytes: impl Into<Vec<u8>>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            mime_type: mime_type.into(),
        }
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// A data value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Data {
    /// No value.
    #[default]
    Undefined,
    /// A string atom.
    Atom { text: String, kind: AtomKind },
    /// Key to value map. Key order carries no meaning.
    Compound(BTreeMap<String, Data>),
    /// Ordered sequence.
    Array(Vec<Data>),
    /// External document node.
    Node(NodeRef),
    /// Binary blob.
    Binary(Blob),
}

impl Data {
    /// A verbatim (quoted) string atom.
    pub fn verbatim(text: impl Into<String>) -> Self {
        Data::Atom {
            text: text.into(),
            kind: AtomKind::Verbatim,
        }
    }

    /// An interpreted (raw) atom. An empty token is undefined.
    pub fn interpreted(text: impl Into<String>) -> Self {
        let text = text.into();
        if text.is_empty() {
            return Data::Undefined;
        }
        Data::Atom {
            text,
            kind: AtomKind::Interpreted,
        }
    }

    /// An empty compound value.
    pub fn compound() -> Self {
        Data::Compound(BTreeMap::new())
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Data::Undefined)
    }

    /// Returns the atom text, if this is an atom.
    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Data::Atom { text, .. } => Some(text),
            _ => None,
        }
    }

    /// Returns the atom parsed as a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Data::Atom {
                text,
                kind: AtomKind::Interpreted,
            } if is_numeric(text) => text.parse().ok(),
            _ => None,
        }
    }

    /// Returns the atom as a boolean literal.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Data::Atom {
                text,
                kind: AtomKind::Interpreted,
            } => match text.as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Truthiness used for guards.
    pub fn is_truthy(&self) -> bool {
        match self {
            Data::Undefined => false,
            Data::Atom {
                text,
                kind: AtomKind::Verbatim,
            } => !text.is_empty(),
            Data::Atom { text, .. } => match self.as_f64() {
                Some(n) => n != 0.0,
                None => text != "false",
            },
            Data::Compound(map) => !map.is_empty(),
            Data::Array(items) => !items.is_empty(),
            Data::Node(_) | Data::Binary(_) => true,
        }
    }

    /// Looks up a compound key.
    pub fn get(&self, key: &str) -> Option<&Data> {
        match self {
            Data::Compound(map) => map.get(key),
            _ => None,
        }
    }

    /// Looks up an array index.
    pub fn get_index(&self, index: usize) -> Option<&Data> {
        match self {
            Data::Array(items) => items.get(index),
            _ => None,
        }
    }

    /// Inserts a compound key, turning an undefined value into a compound.
    pub fn insert(&mut self, key: impl Into<String>, value: Data) -> Option<Data> {
        if !matches!(self, Data::Compound(_)) {
            *self = Data::compound();
        }
        match self {
            Data::Compound(map) => map.insert(key.into(), value),
            _ => None,
        }
    }

    /// Appends to an array, turning a non-array value into an array.
    pub fn push(&mut self, value: Data) {
        if !matches!(self, Data::Array(_)) {
            *self = Data::Array(Vec::new());
        }
        if let Data::Array(items) = self {
            items.push(value);
        }
    }

    /// Number of elements of an array-like value.
    pub fn len(&self) -> Option<usize> {
        match self {
            Data::Array(items) => Some(items.len()),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Data::Undefined => true,
            Data::Atom { text, .. } => text.is_empty(),
            Data::Compound(map) => map.is_empty(),
            Data::Array(items) => items.is_empty(),
            Data::Node(_) | Data::Binary(_) => false,
        }
    }

    /// Merges `other` into `self`.
    ///
    /// Compound keys are unioned recursively with `other` winning on leaf
    /// conflicts, array indices missing from `self` are taken from `other`,
    /// and a non-empty atom in `other` replaces `self` wholesale.
    pub fn merge(&mut self, other: &Data) {
        match other {
            Data::Undefined => {}
            Data::Compound(theirs) => {
                if let Data::Compound(mine) = self {
                    for (key, value) in theirs {
                        match mine.get_mut(key) {
                            Some(existing) => existing.merge(value),
                            None => {
                                mine.insert(key.clone(), value.clone());
                            }
                        }
                    }
                } else {
                    *self = other.clone();
                }
            }
            Data::Array(theirs) => {
                if let Data::Array(mine) = self {
                    if theirs.len() > mine.len() {
                        let start = mine.len();
                        mine.extend(theirs[start..].iter().cloned());
                    }
                } else {
                    *self = other.clone();
                }
            }
            Data::Atom { text, .. } if text.is_empty() => {}
            _ => *self = other.clone(),
        }
    }

    /// Converts a JSON value. Strings become verbatim atoms, numbers and
    /// booleans interpreted atoms, `null` undefined.
    pub fn from_json(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Data::Undefined,
            Value::Bool(b) => Data::interpreted(b.to_string()),
            Value::Number(n) => Data::interpreted(n.to_string()),
            Value::String(s) => Data::verbatim(s.clone()),
            Value::Array(items) => Data::Array(items.iter().map(Data::from_json).collect()),
            Value::Object(map) => Data::Compound(
                map.iter()
                    .map(|(k, v)| (k.clone(), Data::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Converts to a JSON value. Interpreted atoms that are not JSON literals
    /// become strings.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            Data::Undefined => Value::Null,
            Data::Atom {
                text,
                kind: AtomKind::Verbatim,
            } => Value::String(text.clone()),
            Data::Atom { text, .. } => serde_json::from_str::<Value>(text)
                .ok()
                .filter(|v| !v.is_object() && !v.is_array())
                .unwrap_or_else(|| Value::String(text.clone())),
            Data::Compound(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Data::Array(items) => Value::Array(items.iter().map(Data::to_json).collect()),
            Data::Node(node) => Value::String(node.0.clone()),
            Data::Binary(blob) => serde_json::json!({
                "$binary": hex::encode(&blob.bytes),
                "$mime": blob.mime_type,
            }),
        }
    }
}

impl From<&str> for Data {
    fn from(s: &str) -> Self {
        Data::verbatim(s)
    }
}

impl From<String> for Data {
    fn from(s: String) -> Self {
        Data::verbatim(s)
    }
}

impl From<bool> for Data {
    fn from(b: bool) -> Self {
        Data::interpreted(b.to_string())
    }
}

impl From<i64> for Data {
    fn from(n: i64) -> Self {
        Data::interpreted(n.to_string())
    }
}

impl From<i32> for Data {
    fn from(n: i32) -> Self {
        Data::interpreted(n.to_string())
    }
}

impl From<usize> for Data {
    fn from(n: usize) -> Self {
        Data::interpreted(n.to_string())
    }
}

impl From<f64> for Data {
    fn from(n: f64) -> Self {
        if n.fract() == 0.0 && n.abs() < 1e15 {
            Data::interpreted(format!("{}", n as i64))
        } else {
            Data::interpreted(n.to_string())
        }
    }
}

impl FromIterator<Data> for Data {
    fn from_iter<I: IntoIterator<Item = Data>>(iter: I) -> Self {
        Data::Array(iter.into_iter().collect())
    }
}

impl fmt::Display for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::codec::encode(self))
    }
}

/// Returns true if `s` is a JSON number token.
pub fn is_numeric(s: &str) -> bool {
    let bytes = s.as_bytes();
    let mut i = 0;
    if bytes.get(i) == Some(&b'-') {
        i += 1;
    }
    let int_start = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i == int_start {
        return false;
    }
    if bytes.get(i) == Some(&b'.') {
        i += 1;
        let frac_start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i == frac_start {
            return false;
        }
    }
    if matches!(bytes.get(i), Some(b'e') | Some(b'E')) {
        i += 1;
        if matches!(bytes.get(i), Some(b'+') | Some(b'-')) {
            i += 1;
        }
        let exp_start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i == exp_start {
            return false;
        }
    }
    i == bytes.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(pairs: &[(&str, Data)]) -> Data {
        let mut data = Data::compound();
        for (k, v) in pairs {
            data.insert(*k, v.clone());
        }
        data
    }

    #[test]
    fn test_merge_compound_recursive() {
        let mut a = obj(&[
            ("x", Data::from(1)),
            ("nested", obj(&[("keep", Data::from("a")), ("swap", Data::from("old"))])),
        ]);
        let b = obj(&[
            ("y", Data::from(2)),
            ("nested", obj(&[("swap", Data::from("new"))])),
        ]);
        a.merge(&b);

        assert_eq!(a.get("x"), Some(&Data::from(1)));
        assert_eq!(a.get("y"), Some(&Data::from(2)));
        let nested = a.get("nested").unwrap();
        assert_eq!(nested.get("keep"), Some(&Data::from("a")));
        assert_eq!(nested.get("swap"), Some(&Data::from("new")));
    }

    #[test]
    fn test_merge_array_by_index() {
        let mut a: Data = vec![Data::from(1), Data::from(2)].into_iter().collect();
        let b: Data = vec![Data::from(9), Data::from(9), Data::from(3)]
            .into_iter()
            .collect();
        a.merge(&b);
        let expected: Data = vec![Data::from(1), Data::from(2), Data::from(3)]
            .into_iter()
            .collect();
        assert_eq!(a, expected);
    }

    #[test]
    fn test_merge_atom_replaces() {
        let mut a = Data::from("old");
        a.merge(&Data::from("new"));
        assert_eq!(a, Data::from("new"));

        a.merge(&Data::verbatim(""));
        assert_eq!(a, Data::from("new"));

        a.merge(&Data::Undefined);
        assert_eq!(a, Data::from("new"));
    }

    #[test]
    fn test_truthiness() {
        assert!(Data::from(true).is_truthy());
        assert!(!Data::from(false).is_truthy());
        assert!(!Data::from(0).is_truthy());
        assert!(Data::from(3).is_truthy());
        assert!(!Data::verbatim("").is_truthy());
        assert!(Data::verbatim("x").is_truthy());
        assert!(!Data::Undefined.is_truthy());
        assert!(!Data::compound().is_truthy());
    }

    #[test]
    fn test_json_conversion() {
        let value = json!({"a": [1, "two", true, null], "b": {"c": 1.5}});
        let data = Data::from_json(&value);
        assert_eq!(data.get("a").unwrap().get_index(1), Some(&Data::from("two")));
        assert_eq!(data.get("a").unwrap().get_index(2), Some(&Data::from(true)));
        assert_eq!(data.to_json(), value);
    }

    #[test]
    fn test_from_f64_integral() {
        assert_eq!(Data::from(3.0), Data::interpreted("3"));
        assert_eq!(Data::from(2.5), Data::interpreted("2.5"));
    }

    #[test]
    fn test_is_numeric() {
        assert!(is_numeric("0"));
        assert!(is_numeric("-12.5"));
        assert!(is_numeric("1e10"));
        assert!(is_numeric("2.5E-3"));
        assert!(!is_numeric(""));
        assert!(!is_numeric("-"));
        assert!(!is_numeric("1."));
        assert!(!is_numeric("abc"));
        assert!(!is_numeric("1e"));
    }
}
