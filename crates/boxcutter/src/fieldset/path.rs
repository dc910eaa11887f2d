use std::{
    cmp::Ordering,
    fmt::{self, Display},
};

use serde_json::Value;

/// One level of navigation into an unstructured document.
///
/// The ordering sorts by element kind first (fields, then keys, then values,
/// then indices) and within a kind by content, so that sets of path elements
/// have a stable, position-independent order.
#[derive(Debug, Clone, PartialEq)]
pub enum PathElement {
    /// A named field of a mapping.
    Field(String),
    /// An associative-list item identified by its key fields, sorted by name.
    Key(Vec<(String, Value)>),
    /// A scalar-set item identified by its own value.
    Value(Value),
    /// A positional item of a list without a merge key.
    Index(i64),
}

impl Eq for PathElement {}

impl PathElement {
    pub fn field(name: impl Into<String>) -> Self {
        Self::Field(name.into())
    }

    /// Builds a key element, sorting the key fields by name so equal keys
    /// compare equal regardless of input order.
    pub fn key(mut fields: Vec<(String, Value)>) -> Self {
        fields.sort_by(|(a, _), (b, _)| a.cmp(b));
        Self::Key(fields)
    }

    pub fn as_field(&self) -> Option<&str> {
        match self {
            Self::Field(name) => Some(name),
            _ => None,
        }
    }
}

impl PartialOrd for PathElement {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PathElement {
    fn cmp(&self, other: &Self) -> Ordering {
        fn kind_order(element: &PathElement) -> u8 {
            match element {
                PathElement::Field(_) => 0,
                PathElement::Key(_) => 1,
                PathElement::Value(_) => 2,
                PathElement::Index(_) => 3,
            }
        }

        match (self, other) {
            (Self::Field(a), Self::Field(b)) => a.cmp(b),
            (Self::Key(a), Self::Key(b)) => {
                for ((name_a, value_a), (name_b, value_b)) in a.iter().zip(b.iter()) {
                    let by_name = name_a.cmp(name_b);
                    if by_name != Ordering::Equal {
                        return by_name;
                    }
                    let by_value = compare_values(value_a, value_b);
                    if by_value != Ordering::Equal {
                        return by_value;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Self::Value(a), Self::Value(b)) => compare_values(a, b),
            (Self::Index(a), Self::Index(b)) => a.cmp(b),
            _ => kind_order(self).cmp(&kind_order(other)),
        }
    }
}

impl Display for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(name) => write!(f, ".{name}"),
            Self::Key(fields) => {
                write!(f, "[")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{name}={value}")?;
                }
                write!(f, "]")
            }
            Self::Value(value) => write!(f, "[v={value}]"),
            Self::Index(index) => write!(f, "[{index}]"),
        }
    }
}

/// A total order over JSON values: null, booleans, numbers, strings, lists,
/// mappings. Numbers compare numerically, everything else lexicographically.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn kind_order(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Array(a), Value::Array(b)) => {
            for (item_a, item_b) in a.iter().zip(b.iter()) {
                let by_item = compare_values(item_a, item_b);
                if by_item != Ordering::Equal {
                    return by_item;
                }
            }
            a.len().cmp(&b.len())
        }
        (Value::Object(a), Value::Object(b)) => {
            for ((key_a, value_a), (key_b, value_b)) in a.iter().zip(b.iter()) {
                let by_key = key_a.cmp(key_b);
                if by_key != Ordering::Equal {
                    return by_key;
                }
                let by_value = compare_values(value_a, value_b);
                if by_value != Ordering::Equal {
                    return by_value;
                }
            }
            a.len().cmp(&b.len())
        }
        _ => kind_order(a).cmp(&kind_order(b)),
    }
}

/// A complete path to a nested field.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Path(pub Vec<PathElement>);

impl Path {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<PathElement>> for Path {
    fn from(elements: Vec<PathElement>) -> Self {
        Self(elements)
    }
}

impl Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for element in &self.0 {
            write!(f, "{element}")?;
        }
        Ok(())
    }
}
