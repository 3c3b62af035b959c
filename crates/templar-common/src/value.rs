use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

/// A dynamically typed value as it appears in an event map: response facts,
/// payload entries, extracted variables.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Multi-valued extraction results. Rendered space-joined when coerced
    /// to a string.
    List(Vec<String>),
}

/// The variable scope threaded through substitution, DSL evaluation and
/// operator matching. Keys are part selectors, payload names and extractor
/// names.
pub type VarMap = BTreeMap<String, Value>;

impl Value {
    /// String form used by placeholder substitution and extractors.
    pub fn coerce_string(&self) -> String {
        self.to_string()
    }

    /// Numeric form, if the value is a number or parses as one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(n) => Some(*n as f64),
            Self::Float(f) => Some(*f),
            Self::Str(s) => s.trim().parse().ok(),
            Self::Bool(_) | Self::List(_) => None,
        }
    }

    /// Boolean form. Numbers are truthy when non-zero, strings compare
    /// against the literals `true` / `false`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(n) => Some(*n != 0),
            Self::Float(f) => Some(*f != 0.0),
            Self::Str(s) => match s.as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            Self::List(_) => None,
        }
    }

    /// Byte length of the string form; used by the `size` matcher and `len`.
    pub fn len(&self) -> usize {
        match self {
            Self::Str(s) => s.len(),
            Self::List(l) => l.len(),
            _ => self.to_string().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(x) => {
                if x.fract() == 0.0 && x.is_finite() {
                    write!(f, "{x:.0}")
                } else {
                    write!(f, "{x}")
                }
            }
            Self::Str(s) => f.write_str(s),
            Self::List(items) => f.write_str(&items.join(" ")),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Vec<String>> for Value {
    fn from(items: Vec<String>) -> Self {
        Self::List(items)
    }
}

/// Flatten extraction results the way operators bind them into the event
/// map: a single value stays scalar, several stay a list.
pub fn extracted_value(mut values: Vec<String>) -> Value {
    if values.len() == 1 {
        Value::Str(values.remove(0))
    } else {
        Value::List(values)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn display_forms() {
        assert_eq!(Value::Int(200).to_string(), "200");
        assert_eq!(Value::Float(1.5).to_string(), "1.5");
        assert_eq!(Value::Float(3.0).to_string(), "3");
        assert_eq!(Value::Bool(true).to_string(), "true");
        assert_eq!(
            Value::List(vec!["a".into(), "b".into()]).to_string(),
            "a b"
        );
    }

    #[test]
    fn numeric_coercion_from_strings() {
        assert_eq!(Value::Str("42".into()).as_f64(), Some(42.0));
        assert_eq!(Value::Str(" 1.25 ".into()).as_f64(), Some(1.25));
        assert_eq!(Value::Str("nope".into()).as_f64(), None);
    }

    #[test]
    fn extracted_value_flattens_singletons() {
        assert_eq!(
            extracted_value(vec!["only".into()]),
            Value::Str("only".into())
        );
        assert_eq!(
            extracted_value(vec!["a".into(), "b".into()]),
            Value::List(vec!["a".into(), "b".into()])
        );
    }
}
