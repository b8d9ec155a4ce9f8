//! Record of previously provisioned resources
//!
//! State is organised by module path, then by resource key. Each resource
//! record holds at most one primary instance, any deposed instances left
//! behind by create-before-destroy replacement, and any earlier tainted
//! instances still waiting to be destroyed.

mod render;
mod store;

pub use store::{FileStateStore, MemoryStateStore, StateStore};

use crate::addr::{ModulePath, ResourceAddress, ResourceKey};
use crate::diff::InstanceDiff;
use crate::value::{UNKNOWN, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One concrete resource instance as last confirmed by its provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    pub id: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Known-broken; must be destroyed and recreated
    #[serde(default)]
    pub tainted: bool,
}

impl InstanceState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: BTreeMap::new(),
            tainted: false,
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn tainted(mut self) -> Self {
        self.tainted = true;
        self
    }

    /// Attribute value, with `id` served from the instance id
    pub fn attr(&self, key: &str) -> Option<&str> {
        if key == "id" {
            return Some(&self.id);
        }
        self.attributes.get(key).map(String::as_str)
    }

    /// Structured value of an attribute, rebuilt from flat paths
    pub fn value(&self, key: &str) -> Option<Value> {
        if key == "id" {
            return Some(Value::String(self.id.clone()));
        }
        Value::from_flat(&self.attributes, key)
    }

    /// Project the instance a diff would produce, without any provider
    ///
    /// Computed attributes are left as [`UNKNOWN`]. A diff that replaces the
    /// instance starts from an empty record rather than the prior one.
    pub fn merge_diff(prior: Option<&InstanceState>, diff: &InstanceDiff) -> InstanceState {
        let replacing = diff.requires_new() || prior.is_some_and(|p| p.tainted);
        let mut result = match prior {
            Some(p) if !replacing => p.clone(),
            _ => InstanceState::default(),
        };
        result.tainted = false;

        for (key, attr) in &diff.attributes {
            if key == "id" {
                result.id = if attr.new_computed {
                    UNKNOWN.to_string()
                } else {
                    attr.new.clone()
                };
                continue;
            }
            if attr.new_removed {
                result.attributes.remove(key);
            } else if attr.new_computed {
                result.attributes.insert(key.clone(), UNKNOWN.to_string());
            } else {
                result.attributes.insert(key.clone(), attr.new.clone());
            }
        }

        if result.id.is_empty() {
            result.id = prior.map_or_else(|| UNKNOWN.to_string(), |p| p.id.clone());
        }
        result
    }
}

/// Everything recorded for one resource address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceState {
    pub kind: String,
    /// Provider key that manages the record when it is not the type default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// `type.name` / `module.name` entries this instance was created after
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub primary: Option<InstanceState>,
    /// Prior instances awaiting destruction, oldest first
    #[serde(default)]
    pub deposed: Vec<InstanceState>,
    /// Broken instances destroyed before the address is created again
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tainted: Vec<InstanceState>,
}

impl ResourceState {
    pub fn new(kind: impl Into<String>, primary: InstanceState) -> Self {
        Self {
            kind: kind.into(),
            provider: None,
            dependencies: Vec::new(),
            primary: Some(primary),
            deposed: Vec::new(),
            tainted: Vec::new(),
        }
    }

    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.push(dep.into());
        self
    }

    pub fn with_deposed(mut self, deposed: InstanceState) -> Self {
        self.deposed.push(deposed);
        self
    }

    /// Add a broken instance, marking it tainted
    pub fn with_tainted(mut self, instance: InstanceState) -> Self {
        self.tainted.push(instance.tainted());
        self
    }

    /// Record holding only broken instances, no primary
    pub fn tainted_only(kind: impl Into<String>, instances: impl IntoIterator<Item = InstanceState>) -> Self {
        Self {
            kind: kind.into(),
            tainted: instances.into_iter().map(InstanceState::tainted).collect(),
            ..Self::default()
        }
    }

    /// Tainted instances, the primary included
    pub fn tainted_count(&self) -> usize {
        self.tainted.len() + usize::from(self.primary.as_ref().is_some_and(|p| p.tainted))
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// No primary, nothing deposed or tainted: the record can be dropped
    pub fn is_empty(&self) -> bool {
        self.primary.is_none() && self.deposed.is_empty() && self.tainted.is_empty()
    }
}

/// State of a single module
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleState {
    pub path: ModulePath,
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub resources: BTreeMap<ResourceKey, ResourceState>,
}

impl ModuleState {
    pub fn new(path: ModulePath) -> Self {
        Self {
            path,
            outputs: BTreeMap::new(),
            resources: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty() && self.resources.is_empty()
    }

    /// Keys of every record of `kind.name`, in index order
    pub fn instances_of(&self, kind: &str, name: &str) -> Vec<ResourceKey> {
        self.resources
            .keys()
            .filter(|k| k.is_instance_of(kind, name))
            .cloned()
            .collect()
    }
}

/// A count layout the engine does not expect to leave behind
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutProblem {
    #[error("{module}: {resource} has both unindexed and indexed records")]
    MixedShape { module: ModulePath, resource: String },
    #[error("{module}: {resource} indices are not contiguous: {indices:?}")]
    Gap {
        module: ModulePath,
        resource: String,
        indices: Vec<usize>,
    },
}

/// All recorded resources and outputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    /// Incremented on every committed mutation
    #[serde(default)]
    pub serial: u64,
    /// Sorted by module path
    #[serde(default)]
    pub modules: Vec<ModuleState>,
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    /// Empty state containing only the root module
    pub fn new() -> Self {
        Self {
            serial: 0,
            modules: vec![ModuleState::new(ModulePath::root())],
        }
    }

    /// True when no module holds a resource or output
    pub fn is_empty(&self) -> bool {
        self.modules.iter().all(ModuleState::is_empty)
    }

    pub fn module(&self, path: &ModulePath) -> Option<&ModuleState> {
        self.modules
            .binary_search_by(|m| m.path.cmp(path))
            .ok()
            .map(|i| &self.modules[i])
    }

    pub fn module_mut(&mut self, path: &ModulePath) -> Option<&mut ModuleState> {
        match self.modules.binary_search_by(|m| m.path.cmp(path)) {
            Ok(i) => Some(&mut self.modules[i]),
            Err(_) => None,
        }
    }

    /// Module state at `path`, created when missing
    pub fn ensure_module(&mut self, path: &ModulePath) -> &mut ModuleState {
        let i = match self.modules.binary_search_by(|m| m.path.cmp(path)) {
            Ok(i) => i,
            Err(i) => {
                self.modules.insert(i, ModuleState::new(path.clone()));
                i
            }
        };
        &mut self.modules[i]
    }

    /// Drop every module at or below `path` that holds no resources
    ///
    /// The root module itself is only emptied of outputs, never removed.
    pub fn remove_module_tree(&mut self, path: &ModulePath) {
        self.modules.retain_mut(|m| {
            if !m.path.is_within(path) || !m.resources.is_empty() {
                return true;
            }
            if m.path.is_root() {
                m.outputs.clear();
                return true;
            }
            false
        });
    }

    pub fn resource(&self, addr: &ResourceAddress) -> Option<&ResourceState> {
        self.module(&addr.module)?.resources.get(&addr.key)
    }

    pub fn resource_mut(&mut self, addr: &ResourceAddress) -> Option<&mut ResourceState> {
        self.module_mut(&addr.module)?.resources.get_mut(&addr.key)
    }

    /// Primary instance at `addr`
    pub fn instance(&self, addr: &ResourceAddress) -> Option<&InstanceState> {
        self.resource(addr)?.primary.as_ref()
    }

    /// Insert or replace a whole record
    pub fn set_resource(&mut self, addr: &ResourceAddress, resource: ResourceState) {
        self.ensure_module(&addr.module)
            .resources
            .insert(addr.key.clone(), resource);
    }

    /// Remove the record at `addr` if it no longer holds any instance
    pub fn remove_if_empty(&mut self, addr: &ResourceAddress) {
        if let Some(module) = self.module_mut(&addr.module)
            && module
                .resources
                .get(&addr.key)
                .is_some_and(ResourceState::is_empty)
        {
            module.resources.remove(&addr.key);
        }
    }

    /// Move a record to another key in the same module
    ///
    /// Does nothing when the source is missing or the target is taken.
    pub fn rename(&mut self, module: &ModulePath, from: &ResourceKey, to: &ResourceKey) -> bool {
        let Some(m) = self.module_mut(module) else {
            return false;
        };
        if m.resources.contains_key(to) {
            return false;
        }
        match m.resources.remove(from) {
            Some(record) => {
                m.resources.insert(to.clone(), record);
                true
            }
            None => false,
        }
    }

    /// Every resource address in the state, in module then key order
    pub fn addresses(&self) -> Vec<ResourceAddress> {
        self.modules
            .iter()
            .flat_map(|m| {
                m.resources
                    .keys()
                    .map(|k| ResourceAddress::new(m.path.clone(), k.clone()))
            })
            .collect()
    }

    /// Report count layouts that break the contiguous `0..n-1` rule
    pub fn verify_count_layout(&self) -> Vec<LayoutProblem> {
        let mut problems = Vec::new();
        for module in &self.modules {
            let mut by_base: BTreeMap<String, (bool, BTreeSet<usize>)> = BTreeMap::new();
            for key in module.resources.keys() {
                let entry = by_base.entry(key.base()).or_default();
                match key.index {
                    Some(i) => {
                        entry.1.insert(i);
                    }
                    None => entry.0 = true,
                }
            }

            for (resource, (bare, indices)) in by_base {
                if bare && !indices.is_empty() {
                    problems.push(LayoutProblem::MixedShape {
                        module: module.path.clone(),
                        resource: resource.clone(),
                    });
                }
                let contiguous = indices.iter().enumerate().all(|(pos, i)| pos == *i);
                if !contiguous {
                    problems.push(LayoutProblem::Gap {
                        module: module.path.clone(),
                        resource,
                        indices: indices.into_iter().collect(),
                    });
                }
            }
        }
        problems
    }
}
