//! Attribute-level change descriptions
//!
//! A [`Diff`] is the product of a plan walk: per module, the instance diffs
//! keyed by resource key, plus a flag for modules being removed outright.

mod render;

use crate::addr::ModulePath;
use crate::state::{InstanceState, State};
use crate::value::UNKNOWN;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Change to one flat attribute
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrDiff {
    pub old: String,
    pub new: String,
    /// The new value is only known after apply
    #[serde(default)]
    pub new_computed: bool,
    #[serde(default)]
    pub new_removed: bool,
    /// Changing this attribute replaces the instance
    #[serde(default)]
    pub requires_new: bool,
}

impl AttrDiff {
    pub fn change(old: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            old: old.into(),
            new: new.into(),
            ..Self::default()
        }
    }

    pub fn computed(old: impl Into<String>) -> Self {
        Self {
            old: old.into(),
            new_computed: true,
            ..Self::default()
        }
    }

    pub fn removed(old: impl Into<String>) -> Self {
        Self {
            old: old.into(),
            new_removed: true,
            ..Self::default()
        }
    }

    pub fn forces_new(mut self) -> Self {
        self.requires_new = true;
        self
    }
}

/// What applying an instance diff does to the primary instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiffAction {
    NoOp,
    Create,
    Update,
    Destroy,
    DestroyThenCreate,
}

impl fmt::Display for DiffAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoOp => "NOOP",
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Destroy => "DESTROY",
            Self::DestroyThenCreate => "DESTROY/CREATE",
        };
        f.write_str(s)
    }
}

/// Changes planned for one resource instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDiff {
    #[serde(default)]
    pub attributes: BTreeMap<String, AttrDiff>,
    /// Destroy the primary instance
    #[serde(default)]
    pub destroy: bool,
    /// The primary is tainted and is replaced regardless of attributes
    #[serde(default)]
    pub destroy_tainted: bool,
    /// Destroy the deposed instances recorded at this address
    #[serde(default)]
    pub destroy_deposed: bool,
}

impl InstanceDiff {
    /// A plain destroy of the primary instance
    pub fn destroy() -> Self {
        Self {
            destroy: true,
            ..Self::default()
        }
    }

    /// Attribute differences between a prior instance and desired flat attributes
    ///
    /// Attributes present only in the prior instance are left alone; they
    /// belong to the provider.
    pub fn between(prior: Option<&InstanceState>, desired: &BTreeMap<String, String>) -> Self {
        let mut diff = Self::default();
        for (key, new) in desired {
            let old = prior.and_then(|p| p.attr(key));
            if new == UNKNOWN {
                diff.attributes
                    .insert(key.clone(), AttrDiff::computed(old.unwrap_or_default()));
                continue;
            }
            if old != Some(new.as_str()) {
                diff.attributes
                    .insert(key.clone(), AttrDiff::change(old.unwrap_or_default(), new.clone()));
            }
        }
        diff
    }

    /// Nothing to do at all, deposed instances included
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty() && !self.destroy && !self.destroy_tainted && !self.destroy_deposed
    }

    /// Any changed attribute forces replacement
    pub fn requires_new(&self) -> bool {
        self.attributes.values().any(|a| a.requires_new)
    }

    /// Action on the primary instance; deposed instances are handled apart
    pub fn action(&self) -> DiffAction {
        if self.attributes.is_empty() && !self.destroy && !self.destroy_tainted {
            return DiffAction::NoOp;
        }
        let requires_new = self.requires_new();
        if requires_new && (self.destroy || self.destroy_tainted) {
            DiffAction::DestroyThenCreate
        } else if self.destroy {
            DiffAction::Destroy
        } else if requires_new {
            DiffAction::Create
        } else {
            DiffAction::Update
        }
    }

    /// Keyword used in diff text, which also covers deposed-only diffs
    fn crud(&self) -> &'static str {
        let requires_new = self.requires_new();
        if requires_new && (self.destroy || self.destroy_tainted) {
            "DESTROY/CREATE"
        } else if self.destroy || self.destroy_deposed {
            "DESTROY"
        } else if requires_new {
            "CREATE"
        } else {
            "UPDATE"
        }
    }
}

/// Instance diffs of one module
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDiff {
    pub path: ModulePath,
    /// Keyed by resource key (`type.name[.index]`)
    #[serde(default)]
    pub resources: BTreeMap<String, InstanceDiff>,
    /// The whole module subtree is being removed
    #[serde(default)]
    pub destroy: bool,
}

impl ModuleDiff {
    pub fn new(path: ModulePath) -> Self {
        Self {
            path,
            resources: BTreeMap::new(),
            destroy: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.destroy && self.resources.values().all(InstanceDiff::is_empty)
    }
}

/// Planned changes across all modules
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    /// Sorted by module path
    #[serde(default)]
    pub modules: Vec<ModuleDiff>,
}

impl Diff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.iter().all(ModuleDiff::is_empty)
    }

    pub fn module(&self, path: &ModulePath) -> Option<&ModuleDiff> {
        self.modules.iter().find(|m| &m.path == path)
    }

    /// Module diff at `path`, created when missing
    pub fn ensure_module(&mut self, path: &ModulePath) -> &mut ModuleDiff {
        let i = match self.modules.binary_search_by(|m| m.path.cmp(path)) {
            Ok(i) => i,
            Err(i) => {
                self.modules.insert(i, ModuleDiff::new(path.clone()));
                i
            }
        };
        &mut self.modules[i]
    }

    /// Instance diff for `key` in module `path`
    pub fn instance(&self, path: &ModulePath, key: &str) -> Option<&InstanceDiff> {
        self.module(path)?.resources.get(key)
    }

    /// Record a non-empty instance diff
    pub fn insert(&mut self, path: &ModulePath, key: String, diff: InstanceDiff) {
        if diff.is_empty() {
            return;
        }
        self.ensure_module(path).resources.insert(key, diff);
    }
}

/// A diff together with the state it was computed against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub diff: Diff,
    pub state: State,
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DIFF:\n\n{}\n\nSTATE:\n\n{}", self.diff, self.state)
    }
}
