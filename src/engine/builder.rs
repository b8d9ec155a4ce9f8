//! Graph Builder
//!
//! Turns configuration plus current state into the work graph of one walk.
//! The same expansion runs for plan and apply so both walks agree on which
//! record every node owns:
//!
//! - each resource's `count` is expanded into instance slots, reusing the
//!   record of the other shape (`foo` / `foo.0`) instead of recreating it
//! - records with no slot (trailing indices, stale shapes, removed
//!   resources and modules) get destroy nodes ordered by the dependencies
//!   recorded when they were created
//! - create-before-destroy replacements are split into a create node and a
//!   node destroying the deposed instance afterwards

use super::eval::eval_static;
use super::graph::{CountShape, Graph, Node, NodeKind, ProviderSlot, ResourceNode, Role};
use crate::addr::{DependencyRef, ModulePath, ResourceAddress, ResourceKey};
use crate::config::{ModuleConfig, Reference, ResourceConfig, provider_key_for_kind};
use crate::diff::{Diff, DiffAction, InstanceDiff};
use crate::error::BuildError;
use crate::state::State;
use crate::value::Value;
use petgraph::stable_graph::NodeIndex;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Which walk the graph is for
#[derive(Debug, Clone, Copy)]
pub(crate) enum Operation<'a> {
    Plan,
    /// Apply a previously computed diff
    Apply(&'a Diff),
    Refresh,
}

pub(crate) struct BuildInput<'a> {
    pub config: &'a ModuleConfig,
    pub state: &'a State,
    pub variables: &'a BTreeMap<String, Value>,
    pub operation: Operation<'a>,
    /// Tear everything down instead of converging on the configuration
    pub destroy: bool,
    /// Provider names with a registered factory
    pub providers: &'a BTreeSet<String>,
    /// Provisioner kinds with a registered factory
    pub provisioners: &'a BTreeSet<String>,
}

/// Instance slots of one counted resource
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Expansion {
    /// Record key each configured instance is diffed against, with its index
    pub slots: Vec<(ResourceKey, Option<usize>)>,
    /// Records of the other shape, superseded by the one kept in a slot
    pub stale: Vec<ResourceKey>,
    /// Records beyond the configured count
    pub trailing: Vec<ResourceKey>,
    /// Shape to rename the first instance to once all of the above are done
    pub shape: Option<CountShape>,
}

/// Expand `count` against the records already present for `kind.name`
///
/// When both a bare and an index-0 record exist, a single instance keeps
/// the bare record and a counted one keeps index 0; the other is destroyed.
pub(crate) fn expand(kind: &str, name: &str, count: Option<usize>, existing: &[ResourceKey]) -> Expansion {
    let bare = ResourceKey::new(kind, name);
    let zero = ResourceKey::indexed(kind, name, 0);
    let has_bare = existing.contains(&bare);
    let has_zero = existing.contains(&zero);
    let n = count.unwrap_or(1);

    let mut exp = Expansion::default();
    if n == 0 {
        exp.trailing = existing.to_vec();
        return exp;
    }

    let first_index = count.map(|_| 0);
    if has_bare && n == 1 {
        exp.slots.push((bare, first_index));
        if has_zero {
            exp.stale.push(zero);
        }
    } else if has_zero {
        exp.slots.push((zero, first_index));
        if has_bare {
            exp.stale.push(bare);
        }
        if n == 1 {
            exp.shape = Some(CountShape::Unindexed);
        }
    } else if has_bare {
        exp.slots.push((bare, first_index));
        exp.shape = Some(CountShape::Indexed);
    } else if n == 1 {
        exp.slots.push((bare, first_index));
    } else {
        exp.slots.push((zero, first_index));
    }

    for i in 1..n {
        exp.slots.push((ResourceKey::indexed(kind, name, i), Some(i)));
    }
    exp.trailing = existing
        .iter()
        .filter(|k| k.index.is_some_and(|i| i >= n.max(1)))
        .cloned()
        .collect();
    exp
}

/// Nodes owning the records of one `kind.name` in one module
#[derive(Debug, Default)]
struct ResourceNodes {
    /// Nodes producing configured instances
    live: Vec<NodeIndex>,
    boundary: Option<NodeIndex>,
    /// Destroys of trailing indices and of records whose configuration is gone
    retire: Vec<NodeIndex>,
    stale: Vec<NodeIndex>,
    deposed: Vec<NodeIndex>,
}

impl ResourceNodes {
    fn destroys(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.retire
            .iter()
            .chain(&self.stale)
            .chain(&self.deposed)
            .copied()
    }
}

/// References a node evaluates, resolved once every node exists
struct PendingRefs {
    node: NodeIndex,
    /// Module the expressions are evaluated in
    module: ModulePath,
    references: Vec<Reference>,
    depends_on: Vec<String>,
    /// Whether this node should run before deposed instances of what it
    /// references are destroyed
    precedes_deposed: bool,
}

struct Builder<'a> {
    input: &'a BuildInput<'a>,
    graph: Graph,
    static_vars: HashMap<ModulePath, BTreeMap<String, Value>>,
    entries: HashMap<ModulePath, NodeIndex>,
    exits: HashMap<ModulePath, NodeIndex>,
    providers: HashMap<(ModulePath, String), NodeIndex>,
    provisioners: HashMap<String, NodeIndex>,
    resources: BTreeMap<(ModulePath, String), ResourceNodes>,
    outputs: HashMap<(ModulePath, String), NodeIndex>,
    by_module: BTreeMap<ModulePath, Vec<NodeIndex>>,
    pending: Vec<PendingRefs>,
}

/// Build the graph for one walk
pub(crate) fn build(input: &BuildInput<'_>) -> Result<Graph, BuildError> {
    let mut builder = Builder {
        input,
        graph: Graph::new(),
        static_vars: HashMap::new(),
        entries: HashMap::new(),
        exits: HashMap::new(),
        providers: HashMap::new(),
        provisioners: HashMap::new(),
        resources: BTreeMap::new(),
        outputs: HashMap::new(),
        by_module: BTreeMap::new(),
        pending: Vec::new(),
    };

    builder.collect_static_vars();
    builder.add_modules()?;
    builder.add_configured_providers()?;
    match input.operation {
        Operation::Refresh => builder.add_refresh_nodes()?,
        Operation::Plan | Operation::Apply(_) => {
            if !input.destroy {
                builder.add_configured_resources()?;
            }
            builder.add_unclaimed_records()?;
            builder.add_outputs();
            builder.add_meta_destroys()?;
        }
    }
    builder.connect_references()?;
    builder.connect_modules();
    builder.connect_destroy_order();
    builder.connect_boundaries();

    let mut graph = builder.graph;
    graph.check_cycles()?;
    log::debug!("Built graph with {} nodes", graph.len());
    Ok(graph)
}

fn prefix(path: &ModulePath) -> String {
    if path.is_root() {
        String::new()
    } else {
        format!("{path}.")
    }
}

impl Builder<'_> {
    fn slots_exist(&self) -> bool {
        !self.input.destroy && !matches!(self.input.operation, Operation::Refresh)
    }

    fn planned(&self, module: &ModulePath, key: &ResourceKey) -> Option<&InstanceDiff> {
        match self.input.operation {
            Operation::Apply(diff) => diff.instance(module, &key.to_string()),
            _ => None,
        }
    }

    /// Module removed along with everything in it
    fn is_removed(&self, path: &ModulePath) -> bool {
        !path.is_root() && (self.input.destroy || self.input.config.descendant(path).is_none())
    }

    fn add_node(&mut self, module: &ModulePath, node: Node) -> Result<NodeIndex, BuildError> {
        let idx = self.graph.add(node)?;
        self.by_module.entry(module.clone()).or_default().push(idx);
        Ok(idx)
    }

    fn collect_static_vars(&mut self) {
        for (path, module) in self.input.config.walk_modules() {
            let mut vars: BTreeMap<String, Value> = module
                .variables
                .iter()
                .filter_map(|(k, v)| v.clone().map(|v| (k.clone(), v)))
                .collect();

            if path.is_root() {
                vars.extend(
                    self.input
                        .variables
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone())),
                );
            } else if let (Some(parent), Some(name)) = (path.parent(), path.names().last()) {
                let parent_vars = self.static_vars.get(&parent).cloned().unwrap_or_default();
                let call = self
                    .input
                    .config
                    .descendant(&parent)
                    .and_then(|m| m.find_module(name));
                if let Some(call) = call {
                    for (key, expr) in &call.inputs {
                        let value = eval_static(expr, &parent_vars).unwrap_or(Value::Unknown);
                        vars.insert(key.clone(), value);
                    }
                }
            }
            self.static_vars.insert(path, vars);
        }
    }

    fn add_modules(&mut self) -> Result<(), BuildError> {
        let input = self.input;
        for (path, _) in input.config.walk_modules() {
            if path.is_root() {
                continue;
            }
            let entry = self.add_node(
                &path,
                Node::new(format!("{path} (entry)"), NodeKind::ModuleEntry { path: path.clone() }),
            )?;
            let exit = self.add_node(
                &path,
                Node::new(format!("{path} (exit)"), NodeKind::ModuleExit { path: path.clone() }),
            )?;
            self.entries.insert(path.clone(), entry);
            self.exits.insert(path.clone(), exit);

            if let (Some(parent), Some(name)) = (path.parent(), path.names().last()) {
                let references = input
                    .config
                    .descendant(&parent)
                    .and_then(|m| m.find_module(name))
                    .map(|call| {
                        call.inputs
                            .values()
                            .flat_map(|e| e.references().into_iter().cloned())
                            .collect()
                    })
                    .unwrap_or_default();
                self.pending.push(PendingRefs {
                    node: entry,
                    module: parent,
                    references,
                    depends_on: Vec::new(),
                    precedes_deposed: false,
                });
            }
        }
        Ok(())
    }

    fn add_configured_providers(&mut self) -> Result<(), BuildError> {
        let input = self.input;
        for (path, module) in input.config.walk_modules() {
            for provider in &module.providers {
                let key = provider.key();
                let name = format!("{}provider.{key}", prefix(&path));
                if !input.providers.contains(&provider.name) {
                    return Err(BuildError::UnresolvedReference {
                        from: name,
                        reference: format!("provider {}", provider.name),
                    });
                }
                let slot = ProviderSlot {
                    module: path.clone(),
                    key: key.clone(),
                };
                let idx = self.add_node(&path, Node::new(name, NodeKind::Provider(slot)))?;
                self.providers.insert((path.clone(), key), idx);
                self.pending.push(PendingRefs {
                    node: idx,
                    module: path.clone(),
                    references: provider
                        .attrs
                        .values()
                        .flat_map(|e| e.references().into_iter().cloned())
                        .collect(),
                    depends_on: Vec::new(),
                    precedes_deposed: false,
                });
            }
        }
        Ok(())
    }

    /// Provider node serving `key` in `module`: the nearest configured
    /// ancestor, else an unconfigured root provider
    fn provider_for(&mut self, module: &ModulePath, key: &str, from: &str) -> Result<(ProviderSlot, NodeIndex), BuildError> {
        let mut cursor = Some(module.clone());
        while let Some(path) = cursor {
            if let Some(idx) = self.providers.get(&(path.clone(), key.to_string())) {
                return Ok((
                    ProviderSlot {
                        module: path,
                        key: key.to_string(),
                    },
                    *idx,
                ));
            }
            cursor = path.parent();
        }

        let unresolved = || BuildError::UnresolvedReference {
            from: from.to_string(),
            reference: format!("provider {key}"),
        };
        if key.contains('.') || !self.input.providers.contains(key) {
            return Err(unresolved());
        }
        let root = ModulePath::root();
        let slot = ProviderSlot {
            module: root.clone(),
            key: key.to_string(),
        };
        let idx = self.add_node(&root, Node::new(format!("provider.{key}"), NodeKind::Provider(slot.clone())))?;
        self.providers.insert((root, key.to_string()), idx);
        Ok((slot, idx))
    }

    fn add_resource_node(
        &mut self,
        address: ResourceAddress,
        role: Role,
        config: Option<&ResourceConfig>,
        count_index: Option<usize>,
    ) -> Result<NodeIndex, BuildError> {
        let record = self.input.state.resource(&address);
        let provider_key = match (config, record) {
            (Some(c), _) => c.provider_key(),
            (None, Some(r)) => r
                .provider
                .clone()
                .unwrap_or_else(|| provider_key_for_kind(&address.key.kind)),
            (None, None) => provider_key_for_kind(&address.key.kind),
        };
        let name = match role {
            Role::Destroy | Role::PlanDestroy => format!("{}{} (destroy)", prefix(&address.module), address.key),
            Role::DestroyDeposed => format!("{}{} (deposed)", prefix(&address.module), address.key),
            _ => format!("{}{}", prefix(&address.module), address.key),
        };
        let (provider, provider_idx) = self.provider_for(&address.module, &provider_key, &name)?;

        let module = address.module.clone();
        let node = ResourceNode {
            address,
            role,
            config: config.cloned(),
            count_index,
            provider,
            dependencies: record.map(|r| r.dependencies.clone()).unwrap_or_default(),
        };
        let idx = self.add_node(&module, Node::new(name, NodeKind::Resource(Box::new(node))))?;
        self.graph.connect(provider_idx, idx);

        if matches!(role, Role::Apply | Role::CreateReplacement)
            && let Some(config) = config
        {
            for provisioner in &config.provisioners {
                let p = self.provisioner_node(&provisioner.kind, idx)?;
                self.graph.connect(p, idx);
            }
        }
        Ok(idx)
    }

    fn provisioner_node(&mut self, kind: &str, from: NodeIndex) -> Result<NodeIndex, BuildError> {
        if let Some(idx) = self.provisioners.get(kind) {
            return Ok(*idx);
        }
        if !self.input.provisioners.contains(kind) {
            return Err(BuildError::UnresolvedReference {
                from: self.graph.node(from).name.clone(),
                reference: format!("provisioner {kind}"),
            });
        }
        let idx = self.add_node(
            &ModulePath::root(),
            Node::new(format!("provisioner.{kind}"), NodeKind::Provisioner { kind: kind.to_string() }),
        )?;
        self.provisioners.insert(kind.to_string(), idx);
        Ok(idx)
    }

    fn count_for(&self, path: &ModulePath, resource: &ResourceConfig) -> Result<Option<usize>, BuildError> {
        let Some(expr) = &resource.count else {
            return Ok(None);
        };
        let invalid = |reason: String| BuildError::InvalidCount {
            resource: ResourceAddress::new(path.clone(), ResourceKey::new(&resource.kind, &resource.name))
                .to_string(),
            reason,
        };
        let empty = BTreeMap::new();
        let vars = self.static_vars.get(path).unwrap_or(&empty);
        let value = eval_static(expr, vars)
            .ok_or_else(|| invalid("count must only use variables known before planning".into()))?;
        let raw = value
            .as_str()
            .ok_or_else(|| invalid(format!("count must be a number, got {value}")))?;
        raw.trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(format!("count must be a number, got {raw:?}")))
    }

    fn add_configured_resources(&mut self) -> Result<(), BuildError> {
        let input = self.input;
        for (path, module) in input.config.walk_modules() {
            let mut seen = BTreeSet::new();
            for resource in &module.resources {
                if !seen.insert(resource.id()) {
                    return Err(BuildError::DuplicateResource(format!("{}{}", prefix(&path), resource.id())));
                }
                self.add_resource_slots(&path, resource)?;
            }
        }
        Ok(())
    }

    fn add_resource_slots(&mut self, path: &ModulePath, resource: &ResourceConfig) -> Result<(), BuildError> {
        let count = self.count_for(path, resource)?;
        let existing = self
            .input
            .state
            .module(path)
            .map(|m| m.instances_of(&resource.kind, &resource.name))
            .unwrap_or_default();
        let expansion = expand(&resource.kind, &resource.name, count, &existing);
        log::trace!(
            "{}{}: {} slot(s), {} stale, {} trailing",
            prefix(path),
            resource.id(),
            expansion.slots.len(),
            expansion.stale.len(),
            expansion.trailing.len()
        );

        let mut nodes = ResourceNodes::default();
        let references: Vec<Reference> = resource.references().into_iter().cloned().collect();

        for (key, count_index) in &expansion.slots {
            let address = ResourceAddress::new(path.clone(), key.clone());
            let mut live_node = None;
            match self.input.operation {
                Operation::Plan => {
                    live_node = Some(self.add_resource_node(address, Role::Plan, Some(resource), *count_index)?);
                }
                Operation::Apply(_) => {
                    let planned = self.planned(path, key).cloned();
                    let has_primary = self.input.state.instance(&address).is_some();
                    let split = resource.lifecycle.create_before_destroy
                        && has_primary
                        && planned
                            .as_ref()
                            .is_some_and(|d| d.action() == DiffAction::DestroyThenCreate);
                    let role = if split { Role::CreateReplacement } else { Role::Apply };
                    let idx = self.add_resource_node(address.clone(), role, Some(resource), *count_index)?;
                    live_node = Some(idx);

                    if split || planned.as_ref().is_some_and(|d| d.destroy_deposed) {
                        let dd = self.add_resource_node(address, Role::DestroyDeposed, Some(resource), *count_index)?;
                        self.graph.connect(idx, dd);
                        nodes.deposed.push(dd);
                    }
                }
                Operation::Refresh => {}
            }
            if let Some(idx) = live_node {
                nodes.live.push(idx);
                self.pending.push(PendingRefs {
                    node: idx,
                    module: path.clone(),
                    references: references.clone(),
                    depends_on: resource.depends_on.clone(),
                    precedes_deposed: true,
                });
            }
        }

        for key in &expansion.stale {
            for idx in self.add_retirement(path, key, Some(resource))? {
                if self.graph.node(idx).resource().is_some_and(|r| r.role == Role::DestroyDeposed) {
                    nodes.deposed.push(idx);
                } else {
                    nodes.stale.push(idx);
                }
            }
        }
        for key in &expansion.trailing {
            for idx in self.add_retirement(path, key, Some(resource))? {
                if self.graph.node(idx).resource().is_some_and(|r| r.role == Role::DestroyDeposed) {
                    nodes.deposed.push(idx);
                } else {
                    nodes.retire.push(idx);
                }
            }
        }

        if let Some(shape) = expansion.shape {
            let boundary = self.add_node(
                path,
                Node::new(
                    format!("{}{} (count)", prefix(path), resource.id()),
                    NodeKind::CountBoundary {
                        module: path.clone(),
                        kind: resource.kind.clone(),
                        name: resource.name.clone(),
                        shape,
                    },
                ),
            )?;
            nodes.boundary = Some(boundary);
        }

        let base = format!("{}.{}", resource.kind, resource.name);
        self.resources.insert((path.clone(), base), nodes);
        Ok(())
    }

    /// Destroy nodes for a record that has no configuration slot
    fn add_retirement(
        &mut self,
        path: &ModulePath,
        key: &ResourceKey,
        config: Option<&ResourceConfig>,
    ) -> Result<Vec<NodeIndex>, BuildError> {
        let address = ResourceAddress::new(path.clone(), key.clone());
        let Some(record) = self.input.state.resource(&address) else {
            return Ok(Vec::new());
        };
        let destroyable = record.primary.is_some() || !record.tainted.is_empty();
        let has_deposed = !record.deposed.is_empty();

        let mut out = Vec::new();
        match self.input.operation {
            Operation::Plan => {
                out.push(self.add_resource_node(address, Role::PlanDestroy, config, key.index)?);
            }
            Operation::Apply(_) => {
                let planned = self.planned(path, key).cloned().unwrap_or_default();
                if destroyable && planned.destroy {
                    out.push(self.add_resource_node(address.clone(), Role::Destroy, config, key.index)?);
                }
                if has_deposed && planned.destroy_deposed {
                    out.push(self.add_resource_node(address, Role::DestroyDeposed, config, key.index)?);
                }
            }
            Operation::Refresh => {}
        }
        Ok(out)
    }

    fn add_unclaimed_records(&mut self) -> Result<(), BuildError> {
        let input = self.input;
        for module in &input.state.modules {
            let path = &module.path;
            let configured = if self.is_removed(path) {
                None
            } else {
                input.config.descendant(path)
            };

            let mut orphans: BTreeMap<String, Vec<ResourceKey>> = BTreeMap::new();
            for key in module.resources.keys() {
                let claimed = configured.is_some_and(|m| m.find_resource(&key.kind, &key.name).is_some())
                    && !input.destroy;
                if !claimed {
                    orphans.entry(key.base()).or_default().push(key.clone());
                }
            }

            for (base, keys) in orphans {
                let mut nodes = ResourceNodes::default();
                for key in &keys {
                    let config = configured.and_then(|m| m.find_resource(&key.kind, &key.name));
                    for idx in self.add_retirement(path, key, config)? {
                        if self.graph.node(idx).resource().is_some_and(|r| r.role == Role::DestroyDeposed) {
                            nodes.deposed.push(idx);
                        } else {
                            nodes.retire.push(idx);
                        }
                    }
                }
                self.resources.insert((path.clone(), base), nodes);
            }
        }
        Ok(())
    }

    fn add_refresh_nodes(&mut self) -> Result<(), BuildError> {
        let input = self.input;
        for module in &input.state.modules {
            for (key, record) in &module.resources {
                if record.primary.is_none() {
                    continue;
                }
                let address = ResourceAddress::new(module.path.clone(), key.clone());
                let config = input
                    .config
                    .descendant(&module.path)
                    .and_then(|m| m.find_resource(&key.kind, &key.name));
                self.add_resource_node(address, Role::Refresh, config, key.index)?;
            }
        }
        Ok(())
    }

    fn add_outputs(&mut self) {
        let input = self.input;
        let mut declared: BTreeSet<(ModulePath, String)> = BTreeSet::new();

        if !input.destroy {
            for (path, module) in input.config.walk_modules() {
                for output in &module.outputs {
                    declared.insert((path.clone(), output.name.clone()));
                    let name = format!("{}output.{}", prefix(&path), output.name);
                    let kind = NodeKind::Output {
                        module: path.clone(),
                        name: output.name.clone(),
                        orphan: false,
                    };
                    if let Ok(idx) = self.add_node(&path, Node::new(name, kind)) {
                        self.outputs.insert((path.clone(), output.name.clone()), idx);
                        self.pending.push(PendingRefs {
                            node: idx,
                            module: path.clone(),
                            references: output.value.references().into_iter().cloned().collect(),
                            depends_on: Vec::new(),
                            precedes_deposed: true,
                        });
                    }
                }
            }
        }

        if !matches!(input.operation, Operation::Apply(_)) {
            return;
        }
        for module in &input.state.modules {
            if self.is_removed(&module.path) {
                continue;
            }
            for name in module.outputs.keys() {
                if declared.contains(&(module.path.clone(), name.clone())) {
                    continue;
                }
                let kind = NodeKind::Output {
                    module: module.path.clone(),
                    name: name.clone(),
                    orphan: true,
                };
                let node_name = format!("{}output.{name} (orphan)", prefix(&module.path));
                let _ = self.add_node(&module.path, Node::new(node_name, kind));
            }
        }
    }

    fn add_meta_destroys(&mut self) -> Result<(), BuildError> {
        let removed: Vec<ModulePath> = self
            .input
            .state
            .modules
            .iter()
            .map(|m| m.path.clone())
            .filter(|p| self.is_removed(p))
            .collect();

        let mut metas: BTreeMap<ModulePath, NodeIndex> = BTreeMap::new();
        for path in removed {
            let idx = self.add_node(
                &path,
                Node::new(format!("{path} (destroy)"), NodeKind::MetaDestroy { path: path.clone() }),
            )?;
            let destroys: Vec<NodeIndex> = self
                .resources
                .iter()
                .filter(|((m, _), _)| m.is_within(&path))
                .flat_map(|(_, nodes)| nodes.destroys().collect::<Vec<_>>())
                .collect();
            for d in destroys {
                self.graph.connect(d, idx);
            }
            metas.insert(path, idx);
        }

        for (path, idx) in &metas {
            let mut cursor = path.parent();
            while let Some(parent) = cursor {
                if let Some(parent_idx) = metas.get(&parent) {
                    self.graph.connect(*idx, *parent_idx);
                    break;
                }
                cursor = parent.parent();
            }
        }
        Ok(())
    }

    /// Nodes a reference has to wait for
    fn reference_targets(&self, module: &ModulePath, reference: &Reference, from: &str) -> Result<Vec<NodeIndex>, BuildError> {
        let unresolved = || BuildError::UnresolvedReference {
            from: from.to_string(),
            reference: reference.to_string(),
        };
        let config = self.input.config.descendant(module);
        match reference {
            Reference::Var(name) => {
                let declared = config.is_some_and(|c| c.variables.contains_key(name))
                    || (module.is_root() && self.input.variables.contains_key(name));
                if declared || !self.slots_exist() {
                    Ok(Vec::new())
                } else {
                    Err(unresolved())
                }
            }
            Reference::CountIndex | Reference::SelfAttr(_) => Ok(Vec::new()),
            Reference::Resource { kind, name, .. } => {
                if !self.slots_exist() {
                    return Ok(Vec::new());
                }
                if config.and_then(|c| c.find_resource(kind, name)).is_none() {
                    return Err(unresolved());
                }
                // referrers see the final instance set, so they wait for
                // trailing and stale records to go; lookups accept either
                // shape so the rename at the boundary is not awaited
                Ok(self
                    .resources
                    .get(&(module.clone(), format!("{kind}.{name}")))
                    .map(|n| n.live.iter().chain(&n.retire).chain(&n.stale).copied().collect())
                    .unwrap_or_default())
            }
            Reference::Module { name, output } => {
                if !self.slots_exist() {
                    return Ok(Vec::new());
                }
                self.outputs
                    .get(&(module.child(name), output.clone()))
                    .map(|idx| vec![*idx])
                    .ok_or_else(unresolved)
            }
        }
    }

    fn depends_on_targets(&self, module: &ModulePath, target: &str, from: &str) -> Result<Vec<NodeIndex>, BuildError> {
        if !self.slots_exist() {
            return Ok(Vec::new());
        }
        let unresolved = || BuildError::UnresolvedReference {
            from: from.to_string(),
            reference: target.to_string(),
        };
        match DependencyRef::parse(target) {
            Some(DependencyRef::Module(name)) => self
                .exits
                .get(&module.child(&name))
                .map(|idx| vec![*idx])
                .ok_or_else(unresolved),
            Some(DependencyRef::Resource { kind, name }) => self.reference_targets(
                module,
                &Reference::Resource {
                    kind,
                    name,
                    index: crate::config::RefIndex::Single,
                    attr: "id".into(),
                },
                from,
            ),
            None => Err(unresolved()),
        }
    }

    fn connect_references(&mut self) -> Result<(), BuildError> {
        let pending = std::mem::take(&mut self.pending);
        for p in &pending {
            let from = self.graph.node(p.node).name.clone();
            let mut targets = Vec::new();
            let mut bases = BTreeSet::new();

            for reference in &p.references {
                targets.extend(self.reference_targets(&p.module, reference, &from)?);
                if let Reference::Resource { kind, name, .. } = reference {
                    bases.insert(format!("{kind}.{name}"));
                }
            }
            for target in &p.depends_on {
                targets.extend(self.depends_on_targets(&p.module, target, &from)?);
                if let Some(DependencyRef::Resource { kind, name }) = DependencyRef::parse(target) {
                    bases.insert(format!("{kind}.{name}"));
                }
            }

            for target in targets {
                if target == p.node {
                    return Err(BuildError::Cycle(vec![from.clone()]));
                }
                self.graph.connect(target, p.node);
            }

            if p.precedes_deposed {
                for base in bases {
                    let deposed: Vec<NodeIndex> = self
                        .resources
                        .get(&(p.module.clone(), base))
                        .map(|n| n.deposed.clone())
                        .unwrap_or_default();
                    for d in deposed {
                        self.graph.connect(p.node, d);
                    }
                }
            }
        }
        Ok(())
    }

    fn connect_modules(&mut self) {
        let by_module: Vec<(ModulePath, Vec<NodeIndex>)> = self
            .by_module
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (path, nodes) in by_module {
            let entry = self.entries.get(&path).copied();
            let exit = self.exits.get(&path).copied();
            for idx in nodes {
                if Some(idx) == entry || Some(idx) == exit {
                    continue;
                }
                if let Some(entry) = entry {
                    self.graph.connect(entry, idx);
                }
                if let Some(exit) = exit {
                    self.graph.connect(idx, exit);
                }
            }
        }

        for (path, entry) in &self.entries {
            let Some(parent) = path.parent() else { continue };
            if let Some(parent_entry) = self.entries.get(&parent) {
                self.graph.connect(*parent_entry, *entry);
            }
            if let (Some(exit), Some(parent_exit)) = (self.exits.get(path), self.exits.get(&parent)) {
                self.graph.connect(*exit, *parent_exit);
            }
        }
    }

    /// Destroy nodes of `nodes`, plus live nodes that destroy their old
    /// instance before creating the new one
    fn destroying(&self, nodes: &ResourceNodes) -> Vec<NodeIndex> {
        let in_place = nodes.live.iter().copied().filter(|idx| {
            self.graph.node(*idx).resource().is_some_and(|r| {
                r.role == Role::Apply
                    && self
                        .planned(&r.address.module, &r.address.key)
                        .is_some_and(|d| d.action() == DiffAction::DestroyThenCreate)
            })
        });
        nodes.destroys().chain(in_place).collect()
    }

    /// Destroy a record before anything it recorded as a dependency
    fn connect_destroy_order(&mut self) {
        let destroys: Vec<(NodeIndex, ModulePath, Vec<String>)> = self
            .resources
            .values()
            .flat_map(|n| n.destroys().collect::<Vec<_>>())
            .filter_map(|idx| {
                let r = self.graph.node(idx).resource()?;
                Some((idx, r.address.module.clone(), r.dependencies.clone()))
            })
            .collect();

        for (idx, module, deps) in destroys {
            for dep in deps {
                let targets: Vec<NodeIndex> = match DependencyRef::parse(&dep) {
                    Some(DependencyRef::Resource { kind, name }) => self
                        .resources
                        .get(&(module.clone(), format!("{kind}.{name}")))
                        .map(|n| self.destroying(n))
                        .unwrap_or_default(),
                    Some(DependencyRef::Module(name)) => {
                        let child = module.child(&name);
                        self.resources
                            .iter()
                            .filter(|((m, _), _)| m.is_within(&child))
                            .flat_map(|(_, n)| self.destroying(n))
                            .collect()
                    }
                    None => Vec::new(),
                };
                for target in targets {
                    self.graph.connect(idx, target);
                }
            }
        }
    }

    fn connect_boundaries(&mut self) {
        let edges: Vec<(NodeIndex, NodeIndex)> = self
            .resources
            .values()
            .filter_map(|n| n.boundary.map(|b| (b, n)))
            .flat_map(|(b, n)| {
                n.live
                    .iter()
                    .chain(&n.stale)
                    .chain(&n.retire)
                    .chain(&n.deposed)
                    .map(move |idx| (*idx, b))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (before, boundary) in edges {
            self.graph.connect(before, boundary);
        }
    }
}
