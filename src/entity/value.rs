use chrono::{DateTime, TimeZone, Utc};

use crate::entity::{Attr, Id};
use crate::error::{Error, Result};

/* ============================= KINDS ============================= */

/// Discriminator for the closed value union.
///
/// The set is fixed; extending it requires a codec version bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    String,
    Bool,
    Int64,
    Float,
    Bytes,
    Time,
    Keyword,
    Label,
    Ref,
    Component,
    Enum,
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ValueKind::String => "string",
            ValueKind::Bool => "bool",
            ValueKind::Int64 => "int64",
            ValueKind::Float => "float",
            ValueKind::Bytes => "bytes",
            ValueKind::Time => "time",
            ValueKind::Keyword => "keyword",
            ValueKind::Label => "label",
            ValueKind::Ref => "ref",
            ValueKind::Component => "component",
            ValueKind::Enum => "enum",
        };
        write!(f, "{s}")
    }
}

/* ============================= VALUE ============================= */

/// A tagged attribute value.
///
/// Wrong-kind access through the typed accessors fails with
/// [`Error::KindMismatch`] rather than panicking.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Bool(bool),
    Int64(i64),
    Float(f64),
    Bytes(Vec<u8>),
    /// Millisecond precision; the codec truncates finer resolutions.
    Time(DateTime<Utc>),
    Keyword(String),
    Label { key: String, value: String },
    Ref(Id),
    /// A nested attribute list, byte-encoded in the wire form.
    Component(Vec<Attr>),
    Enum(Id),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::String(_) => ValueKind::String,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int64(_) => ValueKind::Int64,
            Value::Float(_) => ValueKind::Float,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Time(_) => ValueKind::Time,
            Value::Keyword(_) => ValueKind::Keyword,
            Value::Label { .. } => ValueKind::Label,
            Value::Ref(_) => ValueKind::Ref,
            Value::Component(_) => ValueKind::Component,
            Value::Enum(_) => ValueKind::Enum,
        }
    }

    fn mismatch<T>(&self, expected: ValueKind) -> Result<T> {
        Err(Error::KindMismatch {
            expected,
            got: self.kind(),
        })
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::String(s) => Ok(s),
            other => other.mismatch(ValueKind::String),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => other.mismatch(ValueKind::Bool),
        }
    }

    pub fn as_i64(&self) -> Result<i64> {
        match self {
            Value::Int64(n) => Ok(*n),
            other => other.mismatch(ValueKind::Int64),
        }
    }

    pub fn as_f64(&self) -> Result<f64> {
        match self {
            Value::Float(x) => Ok(*x),
            other => other.mismatch(ValueKind::Float),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            Value::Bytes(b) => Ok(b),
            other => other.mismatch(ValueKind::Bytes),
        }
    }

    pub fn as_time(&self) -> Result<DateTime<Utc>> {
        match self {
            Value::Time(t) => Ok(*t),
            other => other.mismatch(ValueKind::Time),
        }
    }

    pub fn as_keyword(&self) -> Result<&str> {
        match self {
            Value::Keyword(k) => Ok(k),
            other => other.mismatch(ValueKind::Keyword),
        }
    }

    pub fn as_label(&self) -> Result<(&str, &str)> {
        match self {
            Value::Label { key, value } => Ok((key, value)),
            other => other.mismatch(ValueKind::Label),
        }
    }

    pub fn as_ref_id(&self) -> Result<&Id> {
        match self {
            Value::Ref(id) => Ok(id),
            other => other.mismatch(ValueKind::Ref),
        }
    }

    pub fn as_component(&self) -> Result<&[Attr]> {
        match self {
            Value::Component(attrs) => Ok(attrs),
            other => other.mismatch(ValueKind::Component),
        }
    }

    pub fn as_enum(&self) -> Result<&Id> {
        match self {
            Value::Enum(id) => Ok(id),
            other => other.mismatch(ValueKind::Enum),
        }
    }

    /// Universal zero-check backing the per-kind `is_empty` predicates.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::String(s) => s.is_empty(),
            Value::Bool(b) => !b,
            Value::Int64(n) => *n == 0,
            Value::Float(x) => *x == 0.0,
            Value::Bytes(b) => b.is_empty(),
            Value::Time(t) => *t == Utc.timestamp_millis_opt(0).unwrap(),
            Value::Keyword(k) => k.is_empty(),
            Value::Label { key, value } => key.is_empty() && value.is_empty(),
            Value::Ref(id) => id.as_str().is_empty(),
            Value::Component(attrs) => attrs.is_empty(),
            Value::Enum(id) => id.as_str().is_empty(),
        }
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_discriminators() {
        assert_eq!(Value::String("x".into()).kind(), ValueKind::String);
        assert_eq!(Value::Bool(true).kind(), ValueKind::Bool);
        assert_eq!(Value::Int64(7).kind(), ValueKind::Int64);
        assert_eq!(Value::Float(1.5).kind(), ValueKind::Float);
        assert_eq!(Value::Bytes(vec![1]).kind(), ValueKind::Bytes);
        assert_eq!(Value::Keyword("ready".into()).kind(), ValueKind::Keyword);
        assert_eq!(
            Value::Label {
                key: "app".into(),
                value: "nginx".into()
            }
            .kind(),
            ValueKind::Label
        );
        assert_eq!(Value::Ref(Id::new("a/b")).kind(), ValueKind::Ref);
        assert_eq!(Value::Component(vec![]).kind(), ValueKind::Component);
        assert_eq!(Value::Enum(Id::new("a/b")).kind(), ValueKind::Enum);
    }

    #[test]
    fn test_accessor_happy_paths() {
        assert_eq!(Value::String("x".into()).as_str().unwrap(), "x");
        assert!(Value::Bool(true).as_bool().unwrap());
        assert_eq!(Value::Int64(-3).as_i64().unwrap(), -3);
        assert_eq!(Value::Float(2.25).as_f64().unwrap(), 2.25);
        assert_eq!(Value::Bytes(vec![9, 8]).as_bytes().unwrap(), &[9, 8]);
        assert_eq!(Value::Keyword("ready".into()).as_keyword().unwrap(), "ready");
        let label = Value::Label {
            key: "app".into(),
            value: "nginx".into(),
        };
        assert_eq!(label.as_label().unwrap(), ("app", "nginx"));
        assert_eq!(
            Value::Ref(Id::new("a/b")).as_ref_id().unwrap().as_str(),
            "a/b"
        );
    }

    #[test]
    fn test_wrong_kind_access_fails() {
        let err = Value::Int64(1).as_str().unwrap_err();
        match err {
            Error::KindMismatch { expected, got } => {
                assert_eq!(expected, ValueKind::String);
                assert_eq!(got, ValueKind::Int64);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_is_empty_zero_values() {
        assert!(Value::String(String::new()).is_empty());
        assert!(Value::Bool(false).is_empty());
        assert!(Value::Int64(0).is_empty());
        assert!(Value::Float(0.0).is_empty());
        assert!(Value::Bytes(vec![]).is_empty());
        assert!(Value::Keyword(String::new()).is_empty());
        assert!(Value::Component(vec![]).is_empty());
        assert!(
            Value::Label {
                key: String::new(),
                value: String::new()
            }
            .is_empty()
        );
        assert!(Value::Time(Utc.timestamp_millis_opt(0).unwrap()).is_empty());
    }

    #[test]
    fn test_is_empty_non_zero_values() {
        assert!(!Value::String("x".into()).is_empty());
        assert!(!Value::Bool(true).is_empty());
        assert!(!Value::Int64(1).is_empty());
        assert!(!Value::Ref(Id::new("a/b")).is_empty());
        assert!(
            !Value::Label {
                key: "app".into(),
                value: String::new()
            }
            .is_empty()
        );
    }
}
