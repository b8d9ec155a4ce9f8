//! Attribute values
//!
//! Configuration and outputs carry structured values; instance records and
//! diffs carry flat attribute paths (`list.#`, `list.0`, `map.%`, `map.key`).
//! A value that cannot be known until apply is `Value::Unknown` in the tree
//! and [`UNKNOWN`] in flat form.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Sentinel stored in flat attributes whose value is not yet known
pub const UNKNOWN: &str = "74D93920-ED26-11E3-AC10-0800200C9A66";

/// How an unknown value is shown to humans
pub const COMPUTED_DISPLAY: &str = "<computed>";

/// A structured attribute value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Unknown,
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    pub fn list<I, V>(items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::List(items.into_iter().map(Into::into).collect())
    }

    /// Whether the value, including nested elements, is fully known
    pub fn is_known(&self) -> bool {
        match self {
            Self::String(s) => s != UNKNOWN,
            Self::List(items) => items.iter().all(Self::is_known),
            Self::Map(entries) => entries.values().all(Self::is_known),
            Self::Unknown => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Write this value into `out` under `key` using flat attribute paths
    pub fn flatten_into(&self, key: &str, out: &mut BTreeMap<String, String>) {
        match self {
            Self::String(s) => {
                out.insert(key.to_string(), s.clone());
            }
            Self::Unknown => {
                out.insert(key.to_string(), UNKNOWN.to_string());
            }
            Self::List(items) => {
                out.insert(format!("{key}.#"), items.len().to_string());
                for (i, item) in items.iter().enumerate() {
                    item.flatten_into(&format!("{key}.{i}"), out);
                }
            }
            Self::Map(entries) => {
                out.insert(format!("{key}.%"), entries.len().to_string());
                for (k, v) in entries {
                    v.flatten_into(&format!("{key}.{k}"), out);
                }
            }
        }
    }

    /// Rebuild the value stored under `key` from flat attributes
    pub fn from_flat(attrs: &BTreeMap<String, String>, key: &str) -> Option<Self> {
        if let Some(raw) = attrs.get(key) {
            return Some(Self::from_flat_leaf(raw));
        }

        if let Some(count) = attrs.get(&format!("{key}.#")) {
            if count == UNKNOWN {
                return Some(Self::Unknown);
            }
            let len: usize = count.parse().ok()?;
            let items = (0..len)
                .map(|i| Self::from_flat(attrs, &format!("{key}.{i}")).unwrap_or(Self::Unknown))
                .collect();
            return Some(Self::List(items));
        }

        if let Some(count) = attrs.get(&format!("{key}.%")) {
            if count == UNKNOWN {
                return Some(Self::Unknown);
            }
            let prefix = format!("{key}.");
            let mut entries = BTreeMap::new();
            for (k, v) in attrs.range(prefix.clone()..) {
                let Some(rest) = k.strip_prefix(&prefix) else {
                    break;
                };
                if rest == "%" || rest.contains('.') {
                    continue;
                }
                entries.insert(rest.to_string(), Self::from_flat_leaf(v));
            }
            return Some(Self::Map(entries));
        }

        None
    }

    fn from_flat_leaf(raw: &str) -> Self {
        if raw == UNKNOWN {
            Self::Unknown
        } else {
            Self::String(raw.to_string())
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) if s == UNKNOWN => write!(f, "{COMPUTED_DISPLAY}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Unknown => write!(f, "{COMPUTED_DISPLAY}"),
            Self::List(items) => {
                let parts: Vec<String> = items.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", parts.join(","))
            }
            Self::Map(entries) => {
                let parts: Vec<String> = entries.iter().map(|(k, v)| format!("{k}:{v}")).collect();
                write!(f, "{{{}}}", parts.join(","))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_nested() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), Value::string("1"));
        map.insert("b".to_string(), Value::Unknown);

        let mut out = BTreeMap::new();
        Value::list(["x", "y"]).flatten_into("list", &mut out);
        Value::Map(map).flatten_into("tags", &mut out);

        assert_eq!(out.get("list.#").map(String::as_str), Some("2"));
        assert_eq!(out.get("list.1").map(String::as_str), Some("y"));
        assert_eq!(out.get("tags.%").map(String::as_str), Some("2"));
        assert_eq!(out.get("tags.b").map(String::as_str), Some(UNKNOWN));
    }

    #[test]
    fn test_from_flat_rebuilds_list_and_map() {
        let mut attrs = BTreeMap::new();
        attrs.insert("list.#".to_string(), "2".to_string());
        attrs.insert("list.0".to_string(), "a".to_string());
        attrs.insert("list.1".to_string(), "b".to_string());
        attrs.insert("tags.%".to_string(), "1".to_string());
        attrs.insert("tags.env".to_string(), "prod".to_string());

        assert_eq!(Value::from_flat(&attrs, "list"), Some(Value::list(["a", "b"])));
        let tags = Value::from_flat(&attrs, "tags").unwrap();
        assert_eq!(tags.to_string(), "{env:prod}");
        assert_eq!(Value::from_flat(&attrs, "missing"), None);
    }

    #[test]
    fn test_unknown_propagates_through_containers() {
        assert!(Value::list(["a"]).is_known());
        assert!(!Value::List(vec![Value::string("a"), Value::Unknown]).is_known());
        assert!(!Value::string(UNKNOWN).is_known());
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::list(["a", "b", "c"]).to_string(), "[a,b,c]");
        assert_eq!(Value::Unknown.to_string(), "<computed>");
        assert_eq!(Value::string("bar,bar").to_string(), "bar,bar");
    }
}
