use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A scalar attribute value as held by a record and captured into a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Short type label used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Uuid(_) => "uuid",
            Self::Timestamp(_) => "timestamp",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => write!(f, "{s:?}"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::Uuid(u) => write!(f, "{u}"),
            Self::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// One component of an entity identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPart {
    Int(i64),
    Text(String),
    Uuid(Uuid),
}

impl KeyPart {
    /// Convert a field value into a key component. Null and non-key scalar
    /// kinds yield `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(i) => Some(Self::Int(*i)),
            Value::Text(s) => Some(Self::Text(s.clone())),
            Value::Uuid(u) => Some(Self::Uuid(*u)),
            _ => None,
        }
    }
}

impl From<KeyPart> for Value {
    fn from(part: KeyPart) -> Self {
        match part {
            KeyPart::Int(i) => Value::Int(i),
            KeyPart::Text(s) => Value::Text(s),
            KeyPart::Uuid(u) => Value::Uuid(u),
        }
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Text(s) => write!(f, "{s:?}"),
            Self::Uuid(u) => write!(f, "{u}"),
        }
    }
}

/// Identity of an entity: a single scalar key or an ordered tuple of key
/// columns (composite key).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Identity {
    Single(KeyPart),
    Composite(Vec<KeyPart>),
}

impl Identity {
    /// Build an identity from key components in key-column order.
    /// A single component yields `Single`; zero components yield `None`.
    pub fn from_parts(mut parts: Vec<KeyPart>) -> Option<Self> {
        match parts.len() {
            0 => None,
            1 => parts.pop().map(Self::Single),
            _ => Some(Self::Composite(parts)),
        }
    }

    pub fn parts(&self) -> &[KeyPart] {
        match self {
            Self::Single(part) => std::slice::from_ref(part),
            Self::Composite(parts) => parts,
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, Self::Composite(_))
    }
}

/// Encoded form used for the `entity_id` column: the bare key for single
/// identities, a parenthesized tuple for composite ones.
impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(part) => write!(f, "{part}"),
            Self::Composite(parts) => {
                f.write_str("(")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{part}")?;
                }
                f.write_str(")")
            }
        }
    }
}

impl From<i64> for Identity {
    fn from(id: i64) -> Self {
        Self::Single(KeyPart::Int(id))
    }
}

impl From<&str> for Identity {
    fn from(id: &str) -> Self {
        Self::Single(KeyPart::Text(id.to_owned()))
    }
}

impl From<Uuid> for Identity {
    fn from(id: Uuid) -> Self {
        Self::Single(KeyPart::Uuid(id))
    }
}

impl From<(i64, i64)> for Identity {
    fn from((a, b): (i64, i64)) -> Self {
        Self::Composite(vec![KeyPart::Int(a), KeyPart::Int(b)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_parts_picks_shape() {
        assert_eq!(Identity::from_parts(vec![]), None);
        assert_eq!(
            Identity::from_parts(vec![KeyPart::Int(7)]),
            Some(Identity::Single(KeyPart::Int(7)))
        );
        let composite = Identity::from_parts(vec![KeyPart::Int(1), KeyPart::Int(2)]).unwrap();
        assert!(composite.is_composite());
        assert_eq!(composite.parts().len(), 2);
    }

    #[test]
    fn identity_encoding() {
        assert_eq!(Identity::from(42).to_string(), "42");
        assert_eq!(Identity::from((123, 456)).to_string(), "(123,456)");
        let mixed = Identity::Composite(vec![KeyPart::Int(1), KeyPart::Text("a,b".into())]);
        assert_eq!(mixed.to_string(), "(1,\"a,b\")");
    }

    #[test]
    fn key_part_from_value() {
        assert_eq!(KeyPart::from_value(&Value::Int(3)), Some(KeyPart::Int(3)));
        assert_eq!(KeyPart::from_value(&Value::Null), None);
        assert_eq!(KeyPart::from_value(&Value::Float(1.5)), None);
    }

    #[test]
    fn option_into_value() {
        let none: Option<i64> = None;
        assert_eq!(Value::from(none), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::Text("x".into()));
    }

    #[test]
    fn value_display_quotes_text() {
        assert_eq!(Value::from("hi").to_string(), "\"hi\"");
        assert_eq!(Value::Null.to_string(), "null");
    }
}
