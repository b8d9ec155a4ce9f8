//! Resource and module addressing
//!
//! Every record the engine touches is named by a module path plus a
//! resource key (`type.name` with an optional count index). Ordering is
//! part of the contract: State text lists resources by type, name and
//! numeric index, and modules by depth then name.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Ordered sequence of module names from the root (empty for the root module)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModulePath(Vec<String>);

impl ModulePath {
    /// The root module
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Build a path from module names, root first
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Path of the named child module
    pub fn child(&self, name: &str) -> Self {
        let mut names = self.0.clone();
        names.push(name.to_string());
        Self(names)
    }

    /// Path of the enclosing module, `None` for the root
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// Whether `self` is `other` or nested somewhere below it
    pub fn is_within(&self, other: &ModulePath) -> bool {
        self.0.starts_with(&other.0)
    }

    /// Key used when ordering module sections in diff text
    pub(crate) fn diff_sort_key(&self) -> String {
        format!("module.{}", self.0.join("."))
    }
}

impl Ord for ModulePath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.join(".").cmp(&other.0.join(".")))
    }
}

impl PartialOrd for ModulePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ModulePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "root")
        } else {
            write!(f, "module.{}", self.0.join("."))
        }
    }
}

/// Address of a resource instance within one module: `type.name[.index]`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub kind: String,
    pub name: String,
    pub index: Option<usize>,
}

impl ResourceKey {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            index: None,
        }
    }

    pub fn indexed(kind: impl Into<String>, name: impl Into<String>, index: usize) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            index: Some(index),
        }
    }

    /// Same resource with a different instance key
    pub fn with_index(&self, index: Option<usize>) -> Self {
        Self {
            kind: self.kind.clone(),
            name: self.name.clone(),
            index,
        }
    }

    /// `type.name` without the instance key
    pub fn base(&self) -> String {
        format!("{}.{}", self.kind, self.name)
    }

    /// Whether this key names an instance of `kind.name`
    pub fn is_instance_of(&self, kind: &str, name: &str) -> bool {
        self.kind == kind && self.name == name
    }
}

impl Ord for ResourceKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.base()
            .cmp(&other.base())
            .then_with(|| self.index.cmp(&other.index))
    }
}

impl PartialOrd for ResourceKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(i) => write!(f, "{}.{}.{}", self.kind, self.name, i),
            None => write!(f, "{}.{}", self.kind, self.name),
        }
    }
}

/// Error parsing an address string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid address {input:?}: {reason}")]
pub struct AddressParseError {
    pub input: String,
    pub reason: &'static str,
}

impl FromStr for ResourceKey {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| AddressParseError {
            input: s.to_string(),
            reason,
        };
        let parts: Vec<&str> = s.split('.').collect();
        match parts.as_slice() {
            [kind, name] if !kind.is_empty() && !name.is_empty() => Ok(Self::new(*kind, *name)),
            [kind, name, index] if !kind.is_empty() && !name.is_empty() => {
                let index = index.parse().map_err(|_| err("index is not a number"))?;
                Ok(Self::indexed(*kind, *name, index))
            }
            _ => Err(err("expected type.name or type.name.index")),
        }
    }
}

impl Serialize for ResourceKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Fully qualified resource instance address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceAddress {
    pub module: ModulePath,
    pub key: ResourceKey,
}

impl ResourceAddress {
    pub fn new(module: ModulePath, key: ResourceKey) -> Self {
        Self { module, key }
    }

    /// Address in the root module
    pub fn root(key: ResourceKey) -> Self {
        Self {
            module: ModulePath::root(),
            key,
        }
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.module.is_root() {
            write!(f, "{}", self.key)
        } else {
            write!(f, "{}.{}", self.module, self.key)
        }
    }
}

/// One entry of an instance's recorded dependency list
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DependencyRef {
    /// `type.name` or `type.name.N` in the same module
    Resource { kind: String, name: String },
    /// `module.name`, a direct child module
    Module(String),
}

impl DependencyRef {
    /// Parse a recorded dependency string; unknown shapes are ignored
    pub fn parse(raw: &str) -> Option<Self> {
        let parts: Vec<&str> = raw.split('.').collect();
        match parts.as_slice() {
            ["module", name, ..] => Some(Self::Module((*name).to_string())),
            [kind, name] | [kind, name, _] => Some(Self::Resource {
                kind: (*kind).to_string(),
                name: (*name).to_string(),
            }),
            _ => None,
        }
    }
}

impl fmt::Display for DependencyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resource { kind, name } => write!(f, "{kind}.{name}"),
            Self::Module(name) => write!(f, "module.{name}"),
        }
    }
}
