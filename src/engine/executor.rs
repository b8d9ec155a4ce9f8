//! Node visits
//!
//! A [`WalkContext`] holds what every node of one walk shares: the state
//! being built up, the diff being recorded, configured provider instances
//! and evaluated module variables. Each resource node only touches the
//! record it owns, so locks cover short critical sections and are never
//! held across provider calls.

use super::differ::{diff_destroy, diff_instance};
use super::eval::Scope;
use super::graph::{CountShape, Node, NodeKind, ProviderSlot, ResourceNode, Role};
use super::walker::{CancelToken, NodeOutcome};
use crate::addr::{ModulePath, ResourceAddress, ResourceKey};
use crate::config::{ModuleConfig, ResourceConfig};
use crate::diff::{Diff, DiffAction, InstanceDiff};
use crate::error::NodeError;
use crate::hook::{Hook, HookAction};
use crate::provider::{
    InstanceInfo, ProviderFactory, ProvisionerFactory, ResolvedConfig, ResourceProvider,
    ResourceProvisioner,
};
use crate::state::{InstanceState, ResourceState, State, StateStore};
use crate::value::Value;
use anyhow::anyhow;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WalkMode {
    Plan,
    Apply,
    Refresh,
}

/// Borrowed inputs every walk of a context shares
pub(crate) struct Shared<'a> {
    pub config: &'a ModuleConfig,
    pub provider_factories: &'a HashMap<String, ProviderFactory>,
    pub provisioner_factories: &'a HashMap<String, ProvisionerFactory>,
    pub hooks: &'a [Arc<dyn Hook>],
    pub store: Option<&'a dyn StateStore>,
    pub persist: bool,
    pub cancel: &'a CancelToken,
    pub destroy: bool,
}

pub(crate) struct WalkContext<'a> {
    shared: Shared<'a>,
    mode: WalkMode,
    /// Diff being carried out, for apply walks
    planned: Option<&'a Diff>,
    state: RwLock<State>,
    diff: Mutex<Diff>,
    providers: RwLock<HashMap<ProviderSlot, Arc<dyn ResourceProvider>>>,
    provisioners: RwLock<HashMap<String, Arc<dyn ResourceProvisioner>>>,
    vars: RwLock<HashMap<ModulePath, BTreeMap<String, Value>>>,
}

impl<'a> WalkContext<'a> {
    pub(crate) fn new(
        shared: Shared<'a>,
        mode: WalkMode,
        planned: Option<&'a Diff>,
        state: State,
        root_vars: BTreeMap<String, Value>,
    ) -> Self {
        let mut vars = HashMap::new();
        vars.insert(ModulePath::root(), root_vars);
        Self {
            shared,
            mode,
            planned,
            state: RwLock::new(state),
            diff: Mutex::new(Diff::new()),
            providers: RwLock::new(HashMap::new()),
            provisioners: RwLock::new(HashMap::new()),
            vars: RwLock::new(vars),
        }
    }

    /// Final state and recorded diff
    pub(crate) fn into_parts(self) -> (State, Diff) {
        (
            self.state.into_inner().unwrap_or_else(PoisonError::into_inner),
            self.diff.into_inner().unwrap_or_else(PoisonError::into_inner),
        )
    }

    pub(crate) fn visit(&self, node: &Node) -> Result<NodeOutcome, NodeError> {
        match &node.kind {
            NodeKind::Provider(slot) => self.configure_provider(slot),
            NodeKind::Provisioner { kind } => self.init_provisioner(kind),
            NodeKind::ModuleEntry { path } => self.enter_module(path),
            NodeKind::ModuleExit { path } => {
                log::trace!("Leaving {path}");
                Ok(NodeOutcome::Done)
            }
            NodeKind::Resource(r) => match r.role {
                Role::Plan => self.plan_instance(node, r),
                Role::PlanDestroy => self.plan_destroy(node, r),
                Role::Apply => self.apply_instance(node, r),
                Role::CreateReplacement => self.create_replacement(node, r),
                Role::Destroy => self.destroy_instance(node, r),
                Role::DestroyDeposed => self.destroy_deposed(node, r),
                Role::Refresh => self.refresh_instance(node, r),
            },
            NodeKind::Output {
                module,
                name,
                orphan,
            } => self.write_output(node, module, name, *orphan),
            NodeKind::CountBoundary {
                module,
                kind,
                name,
                shape,
            } => self.settle_count(node, module, kind, name, *shape),
            NodeKind::MetaDestroy { path } => self.prune_module(node, path),
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Unknown values are tolerated everywhere except in apply walks
    fn lenient(&self) -> bool {
        self.mode != WalkMode::Apply || self.shared.destroy
    }

    fn evaluate<T>(
        &self,
        module: &ModulePath,
        count_index: Option<usize>,
        self_state: Option<&InstanceState>,
        eval: impl FnOnce(&Scope<'_>) -> T,
    ) -> T {
        let vars = self
            .vars
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module)
            .cloned()
            .unwrap_or_default();
        let state = self.read_state();
        let scope = Scope {
            module,
            state: &state,
            vars: &vars,
            count_index,
            self_state,
            lenient: self.lenient(),
        };
        eval(&scope)
    }

    /// Run a hook callback that may stop the node before it acts
    fn pre_hook(
        &self,
        node: &Node,
        call: impl Fn(&dyn Hook) -> anyhow::Result<HookAction>,
    ) -> Result<(), NodeError> {
        for hook in self.shared.hooks {
            match call(hook.as_ref()) {
                Ok(HookAction::Continue) => {}
                Ok(HookAction::Halt) => {
                    self.shared.cancel.cancel();
                    return Err(NodeError::Halted {
                        node: node.name.clone(),
                    });
                }
                Err(cause) => {
                    return Err(NodeError::Hook {
                        node: node.name.clone(),
                        cause,
                    });
                }
            }
        }
        Ok(())
    }

    /// Run a hook callback after the node acted; halting only stops the walk
    fn post_hook(
        &self,
        node: &Node,
        call: impl Fn(&dyn Hook) -> anyhow::Result<HookAction>,
    ) -> Result<(), NodeError> {
        for hook in self.shared.hooks {
            match call(hook.as_ref()) {
                Ok(HookAction::Continue) => {}
                Ok(HookAction::Halt) => {
                    log::info!("{}: hook asked to stop", node.name);
                    self.shared.cancel.cancel();
                }
                Err(cause) => {
                    return Err(NodeError::Hook {
                        node: node.name.clone(),
                        cause,
                    });
                }
            }
        }
        Ok(())
    }

    /// Mutate the state and, outside plan walks, persist the result
    fn commit(&self, node: &Node, mutate: impl FnOnce(&mut State)) -> Result<(), NodeError> {
        if self.mode == WalkMode::Plan {
            mutate(&mut *self.write_state());
            return Ok(());
        }

        let snapshot = {
            let mut state = self.write_state();
            mutate(&mut *state);
            state.serial += 1;
            let snapshot = state.clone();
            if self.shared.persist
                && let Some(store) = self.shared.store
            {
                store.write(&snapshot).map_err(|cause| {
                    log::warn!("{}: failed to persist state serial {}: {cause:#}", node.name, snapshot.serial);
                    NodeError::StateStore { cause }
                })?;
            }
            snapshot
        };
        log::trace!("{}: committed state serial {}", node.name, snapshot.serial);
        self.post_hook(node, |h| h.post_state_update(&snapshot))
    }

    fn record_diff(&self, address: &ResourceAddress, diff: InstanceDiff) {
        self.diff
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(&address.module, address.key.to_string(), diff);
    }

    fn planned_for(&self, address: &ResourceAddress) -> Option<InstanceDiff> {
        self.planned
            .and_then(|d| d.instance(&address.module, &address.key.to_string()))
            .cloned()
    }

    fn provider_for(&self, r: &ResourceNode) -> Result<Arc<dyn ResourceProvider>, NodeError> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&r.provider)
            .cloned()
            .ok_or_else(|| NodeError::Provider {
                provider: r.provider.key.clone(),
                cause: anyhow!("provider is not configured"),
            })
    }

    fn configure_provider(&self, slot: &ProviderSlot) -> Result<NodeOutcome, NodeError> {
        let label = if slot.module.is_root() {
            format!("provider.{}", slot.key)
        } else {
            format!("{}.provider.{}", slot.module, slot.key)
        };
        let fail = |cause| NodeError::Provider {
            provider: label.clone(),
            cause,
        };

        let factory = self
            .shared
            .provider_factories
            .get(slot.name())
            .ok_or_else(|| fail(anyhow!("no provider registered as {}", slot.name())))?;
        let provider = factory().map_err(fail)?;

        let block = self
            .shared
            .config
            .descendant(&slot.module)
            .and_then(|m| m.providers.iter().find(|p| p.key() == slot.key));
        let resolved = match block {
            Some(block) => self
                .evaluate(&slot.module, None, None, |s| s.eval_block(&block.attrs))
                .map_err(fail)?,
            None => ResolvedConfig::default(),
        };
        provider.configure(&resolved).map_err(fail)?;
        log::debug!("Configured {label}");

        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(slot.clone(), provider);
        Ok(NodeOutcome::Done)
    }

    fn init_provisioner(&self, kind: &str) -> Result<NodeOutcome, NodeError> {
        let fail = |cause| NodeError::Provider {
            provider: format!("provisioner.{kind}"),
            cause,
        };
        let factory = self
            .shared
            .provisioner_factories
            .get(kind)
            .ok_or_else(|| fail(anyhow!("no provisioner registered as {kind}")))?;
        let provisioner = factory().map_err(fail)?;
        self.provisioners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind.to_string(), provisioner);
        Ok(NodeOutcome::Done)
    }

    /// Evaluate the call's inputs in the parent module into the child's variables
    fn enter_module(&self, path: &ModulePath) -> Result<NodeOutcome, NodeError> {
        let (Some(parent), Some(name)) = (path.parent(), path.names().last()) else {
            return Ok(NodeOutcome::Done);
        };
        let Some(call) = self
            .shared
            .config
            .descendant(&parent)
            .and_then(|m| m.find_module(name))
        else {
            return Ok(NodeOutcome::Done);
        };

        let mut vars: BTreeMap<String, Value> = call
            .module
            .variables
            .iter()
            .filter_map(|(k, v)| v.clone().map(|v| (k.clone(), v)))
            .collect();
        for (key, expr) in &call.inputs {
            let value = self
                .evaluate(&parent, None, None, |s| s.eval(expr))
                .map_err(|cause| NodeError::Module {
                    module: path.to_string(),
                    cause: cause.context(format!("evaluating input {key}")),
                })?;
            vars.insert(key.clone(), value);
        }
        self.vars
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.clone(), vars);
        Ok(NodeOutcome::Done)
    }

    fn plan_instance(&self, node: &Node, r: &ResourceNode) -> Result<NodeOutcome, NodeError> {
        let config = resource_config(r)?;
        let info = InstanceInfo::new(r.address.clone());
        let address = info.id();
        let provider = self.provider_for(r)?;

        let resolved = self
            .evaluate(&r.address.module, r.count_index, None, |s| s.eval_block(&config.attrs))
            .map_err(|cause| NodeError::Diff {
                address: address.clone(),
                cause,
            })?;
        let (prior, has_tainted, has_deposed) = {
            let state = self.read_state();
            let (prior, has_tainted) = diff_prior(&state, &r.address);
            let has_deposed = state.resource(&r.address).is_some_and(|rec| !rec.deposed.is_empty());
            (prior, has_tainted, has_deposed)
        };

        self.pre_hook(node, |h| h.pre_diff(&info, prior.as_ref()))?;
        let mut diff = diff_instance(provider.as_ref(), &info, prior.as_ref(), &resolved, &config.lifecycle)
            .map_err(|cause| NodeError::Diff {
                address: address.clone(),
                cause,
            })?;
        diff.destroy_tainted |= has_tainted;
        diff.destroy_deposed = has_deposed;
        self.post_hook(node, |h| h.post_diff(&info, &diff))?;

        let action = diff.action();
        log::debug!("{address}: {action}");
        if action != DiffAction::NoOp {
            let projected = InstanceState::merge_diff(prior.as_ref(), &diff);
            self.commit(node, |state| {
                record_mut(state, &r.address, Some(config)).primary = Some(projected);
            })?;
        }
        self.record_diff(&r.address, diff);
        Ok(outcome_of(action))
    }

    fn plan_destroy(&self, node: &Node, r: &ResourceNode) -> Result<NodeOutcome, NodeError> {
        let info = InstanceInfo::new(r.address.clone());
        let (prior, has_tainted, has_deposed) = {
            let state = self.read_state();
            let record = state.resource(&r.address);
            (
                record.and_then(|rec| rec.primary.clone()),
                record.is_some_and(|rec| !rec.tainted.is_empty()),
                record.is_some_and(|rec| !rec.deposed.is_empty()),
            )
        };
        if prior.is_none() && !has_tainted && !has_deposed {
            return Ok(NodeOutcome::NoChange);
        }

        self.pre_hook(node, |h| h.pre_diff(&info, prior.as_ref()))?;
        let mut diff = if prior.is_some() || has_tainted {
            diff_destroy(r.config.as_ref().map(|c| &c.lifecycle)).map_err(|cause| NodeError::Diff {
                address: info.id(),
                cause,
            })?
        } else {
            InstanceDiff::default()
        };
        diff.destroy_deposed = has_deposed;
        self.post_hook(node, |h| h.post_diff(&info, &diff))?;

        log::debug!("{}: DESTROY", info.id());
        self.commit(node, |state| {
            if let Some(module) = state.module_mut(&r.address.module) {
                module.resources.remove(&r.address.key);
            }
        })?;
        self.record_diff(&r.address, diff);
        Ok(NodeOutcome::Destroyed)
    }

    fn apply_instance(&self, node: &Node, r: &ResourceNode) -> Result<NodeOutcome, NodeError> {
        let Some(planned) = self.planned_for(&r.address) else {
            return Ok(NodeOutcome::NoChange);
        };
        if planned.action() == DiffAction::NoOp {
            return Ok(NodeOutcome::NoChange);
        }

        let config = resource_config(r)?;
        let info = InstanceInfo::new(r.address.clone());
        let address = info.id();
        let provider = self.provider_for(r)?;
        let apply_error = |cause| NodeError::Apply {
            address: address.clone(),
            cause,
        };

        let resolved = self
            .evaluate(&r.address.module, r.count_index, None, |s| s.eval_block(&config.attrs))
            .map_err(apply_error)?;
        let (prior, has_tainted) = diff_prior(&self.read_state(), &r.address);
        let mut diff = diff_instance(provider.as_ref(), &info, prior.as_ref(), &resolved, &config.lifecycle)
            .map_err(|cause| NodeError::Diff {
                address: address.clone(),
                cause,
            })?;
        diff.destroy_tainted |= has_tainted;
        let action = diff.action();
        if action == DiffAction::NoOp {
            return Ok(NodeOutcome::NoChange);
        }

        self.pre_hook(node, |h| h.pre_apply(&info, prior.as_ref(), &diff))?;
        if has_tainted {
            self.destroy_tainted(node, r, &info, provider.as_ref())?;
        }

        let mut current = prior.clone();
        if action == DiffAction::DestroyThenCreate
            && let Some(old) = &prior
        {
            match provider.apply(&info, Some(old), &InstanceDiff::destroy()) {
                Ok(None) => current = None,
                Ok(Some(_)) => {
                    let cause = anyhow!("provider kept the instance it was asked to destroy");
                    self.post_hook(node, |h| h.post_apply(&info, Some(old), Some(&format!("{cause:#}"))))?;
                    return Err(apply_error(cause));
                }
                Err(partial) => {
                    if let Some(left) = partial.state.clone() {
                        self.commit(node, |state| {
                            record_mut(state, &r.address, Some(config)).primary = Some(left);
                        })?;
                    }
                    self.post_hook(node, |h| h.post_apply(&info, Some(old), Some(&partial.to_string())))?;
                    return Err(apply_error(partial.error));
                }
            }
        }

        let creating = current.is_none();
        let step = if action == DiffAction::DestroyThenCreate {
            create_only(&diff)
        } else {
            diff
        };
        match provider.apply(&info, current.as_ref(), &step) {
            Ok(Some(instance)) => {
                let dependencies = config.recorded_dependencies();
                let stored = instance.clone();
                self.commit(node, |state| {
                    let record = record_mut(state, &r.address, Some(config));
                    record.primary = Some(stored);
                    record.dependencies = dependencies;
                })?;
                self.post_hook(node, |h| h.post_apply(&info, Some(&instance), None))?;

                if creating
                    && !config.provisioners.is_empty()
                    && let Err(err) = self.provision(node, r, config, &info, &instance)
                {
                    self.commit(node, |state| {
                        if let Some(primary) = state
                            .resource_mut(&r.address)
                            .and_then(|rec| rec.primary.as_mut())
                        {
                            primary.tainted = true;
                        }
                    })?;
                    return Err(err);
                }
                Ok(match action {
                    DiffAction::Create => NodeOutcome::Created,
                    DiffAction::DestroyThenCreate => NodeOutcome::Replaced,
                    _ => NodeOutcome::Updated,
                })
            }
            Ok(None) => {
                self.commit(node, |state| {
                    if let Some(record) = state.resource_mut(&r.address) {
                        record.primary = None;
                    }
                    state.remove_if_empty(&r.address);
                })?;
                self.post_hook(node, |h| h.post_apply(&info, None, None))?;
                Ok(NodeOutcome::Destroyed)
            }
            Err(partial) => {
                let message = partial.to_string();
                let left = match partial.state {
                    Some(instance) if creating => Some(instance.tainted()),
                    Some(instance) => Some(instance),
                    None if creating => None,
                    None => prior,
                };
                log::warn!("{address}: apply failed: {message}");
                let recorded = left.clone();
                self.commit(node, |state| {
                    match recorded {
                        Some(instance) => {
                            record_mut(state, &r.address, Some(config)).primary = Some(instance);
                        }
                        None => {
                            if let Some(record) = state.resource_mut(&r.address) {
                                record.primary = None;
                            }
                            state.remove_if_empty(&r.address);
                        }
                    }
                })?;
                self.post_hook(node, |h| h.post_apply(&info, left.as_ref(), Some(&message)))?;
                Err(apply_error(partial.error))
            }
        }
    }

    /// Run every provisioner of `config` against a freshly created instance
    fn provision(
        &self,
        node: &Node,
        r: &ResourceNode,
        config: &ResourceConfig,
        info: &InstanceInfo,
        instance: &InstanceState,
    ) -> Result<(), NodeError> {
        self.pre_hook(node, |h| h.pre_provision_resource(info, instance))?;
        for p in &config.provisioners {
            let fail = |cause| NodeError::Provisioner {
                address: info.id(),
                provisioner: p.kind.clone(),
                cause,
            };
            let provisioner = self
                .provisioners
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&p.kind)
                .cloned()
                .ok_or_else(|| fail(anyhow!("provisioner is not initialised")))?;
            let resolved = self
                .evaluate(&r.address.module, r.count_index, Some(instance), |s| {
                    s.eval_block(&p.attrs)
                })
                .map_err(fail)?;

            self.pre_hook(node, |h| h.pre_provision(info, &p.kind))?;
            provisioner.apply(info, instance, &resolved).map_err(fail)?;
            self.post_hook(node, |h| h.post_provision(info, &p.kind))?;
        }
        self.post_hook(node, |h| h.post_provision_resource(info, instance))
    }

    /// Create the replacement while the old instance still exists
    fn create_replacement(&self, node: &Node, r: &ResourceNode) -> Result<NodeOutcome, NodeError> {
        if self.planned_for(&r.address).is_none() {
            return Ok(NodeOutcome::NoChange);
        }
        let config = resource_config(r)?;
        let info = InstanceInfo::new(r.address.clone());
        let address = info.id();
        let provider = self.provider_for(r)?;
        let apply_error = |cause| NodeError::Apply {
            address: address.clone(),
            cause,
        };

        let resolved = self
            .evaluate(&r.address.module, r.count_index, None, |s| s.eval_block(&config.attrs))
            .map_err(apply_error)?;
        let (prior, has_tainted) = diff_prior(&self.read_state(), &r.address);
        let mut diff = diff_instance(provider.as_ref(), &info, prior.as_ref(), &resolved, &config.lifecycle)
            .map_err(|cause| NodeError::Diff {
                address: address.clone(),
                cause,
            })?;
        diff.destroy_tainted |= has_tainted;
        if diff.action() == DiffAction::NoOp {
            return Ok(NodeOutcome::NoChange);
        }
        let step = create_only(&diff);

        self.pre_hook(node, |h| h.pre_apply(&info, None, &step))?;
        match provider.apply(&info, None, &step) {
            Ok(Some(instance)) => {
                let provisioned = if config.provisioners.is_empty() {
                    Ok(())
                } else {
                    self.provision(node, r, config, &info, &instance)
                };
                match provisioned {
                    Ok(()) => {
                        let dependencies = config.recorded_dependencies();
                        let stored = instance.clone();
                        self.commit(node, |state| {
                            let record = record_mut(state, &r.address, Some(config));
                            if let Some(old) = record.primary.take() {
                                record.deposed.push(old);
                            }
                            let tainted = std::mem::take(&mut record.tainted);
                            record.deposed.extend(tainted);
                            record.primary = Some(stored);
                            record.dependencies = dependencies;
                        })?;
                        self.post_hook(node, |h| h.post_apply(&info, Some(&instance), None))?;
                        Ok(NodeOutcome::Replaced)
                    }
                    Err(err) => {
                        let failed = instance.tainted();
                        let stored = failed.clone();
                        self.commit(node, |state| {
                            record_mut(state, &r.address, Some(config)).deposed.push(stored);
                        })?;
                        self.post_hook(node, |h| h.post_apply(&info, Some(&failed), Some(&err.to_string())))?;
                        Err(err)
                    }
                }
            }
            Ok(None) => Err(apply_error(anyhow!("provider returned no instance for a create"))),
            Err(partial) => {
                let message = partial.to_string();
                if let Some(instance) = partial.state.clone() {
                    self.commit(node, |state| {
                        record_mut(state, &r.address, Some(config))
                            .deposed
                            .push(instance.tainted());
                    })?;
                }
                self.post_hook(node, |h| h.post_apply(&info, partial.state.as_ref(), Some(&message)))?;
                Err(apply_error(partial.error))
            }
        }
    }

    /// Destroy every deposed instance; failures stay deposed and tainted
    fn destroy_deposed(&self, node: &Node, r: &ResourceNode) -> Result<NodeOutcome, NodeError> {
        let deposed = self
            .read_state()
            .resource(&r.address)
            .map(|rec| rec.deposed.clone())
            .unwrap_or_default();
        if deposed.is_empty() {
            return Ok(NodeOutcome::Done);
        }
        let info = InstanceInfo::new(r.address.clone());
        let provider = self.provider_for(r)?;
        let destroy = InstanceDiff::destroy();

        self.pre_hook(node, |h| h.pre_apply(&info, deposed.first(), &destroy))?;
        let total = deposed.len();
        let mut remaining = Vec::new();
        let mut failures = Vec::new();
        for instance in deposed {
            match provider.apply(&info, Some(&instance), &destroy) {
                Ok(None) => log::debug!("{}: destroyed deposed {}", info.id(), instance.id),
                Ok(Some(kept)) => {
                    remaining.push(kept.tainted());
                    failures.push(anyhow!("provider kept deposed instance {}", instance.id));
                }
                Err(partial) => {
                    remaining.push(partial.state.unwrap_or(instance).tainted());
                    failures.push(partial.error);
                }
            }
        }

        let left = remaining.len();
        self.commit(node, |state| {
            if let Some(record) = state.resource_mut(&r.address) {
                record.deposed = remaining;
            }
            state.remove_if_empty(&r.address);
        })?;

        let mut failures = failures.into_iter();
        match failures.next() {
            None => {
                self.post_hook(node, |h| h.post_apply(&info, None, None))?;
                Ok(NodeOutcome::Done)
            }
            Some(first) => {
                let cause = first.context(format!("{left} of {total} deposed instance(s) could not be destroyed"));
                let message = format!("{cause:#}");
                self.post_hook(node, |h| h.post_apply(&info, None, Some(&message)))?;
                Err(NodeError::Apply {
                    address: info.id(),
                    cause,
                })
            }
        }
    }

    /// Destroy the earlier tainted instances of a record; failures stay recorded
    fn destroy_tainted(
        &self,
        node: &Node,
        r: &ResourceNode,
        info: &InstanceInfo,
        provider: &dyn ResourceProvider,
    ) -> Result<(), NodeError> {
        let tainted = self
            .read_state()
            .resource(&r.address)
            .map(|rec| rec.tainted.clone())
            .unwrap_or_default();
        let destroy = InstanceDiff::destroy();

        let mut remaining = Vec::new();
        let mut failure = None;
        for instance in tainted {
            match provider.apply(info, Some(&instance), &destroy) {
                Ok(None) => log::debug!("{}: destroyed tainted {}", info.id(), instance.id),
                Ok(Some(kept)) => {
                    if failure.is_none() {
                        failure = Some(anyhow!("provider kept tainted instance {}", instance.id));
                    }
                    remaining.push(kept.tainted());
                }
                Err(partial) => {
                    remaining.push(partial.state.unwrap_or(instance).tainted());
                    if failure.is_none() {
                        failure = Some(partial.error);
                    }
                }
            }
        }

        self.commit(node, |state| {
            if let Some(record) = state.resource_mut(&r.address) {
                record.tainted = remaining;
            }
            state.remove_if_empty(&r.address);
        })?;
        match failure {
            None => Ok(()),
            Some(cause) => {
                let message = format!("{cause:#}");
                self.post_hook(node, |h| h.post_apply(info, None, Some(&message)))?;
                Err(NodeError::Apply {
                    address: info.id(),
                    cause,
                })
            }
        }
    }

    fn destroy_instance(&self, node: &Node, r: &ResourceNode) -> Result<NodeOutcome, NodeError> {
        let info = InstanceInfo::new(r.address.clone());
        let address = info.id();
        if r.config.as_ref().is_some_and(|c| c.lifecycle.prevent_destroy) {
            return Err(NodeError::Apply {
                address,
                cause: anyhow!("instance is marked prevent_destroy"),
            });
        }
        let (prior, has_tainted) = {
            let state = self.read_state();
            let record = state.resource(&r.address);
            (
                record.and_then(|rec| rec.primary.clone()),
                record.is_some_and(|rec| !rec.tainted.is_empty()),
            )
        };
        if prior.is_none() && !has_tainted {
            return Ok(NodeOutcome::NoChange);
        }
        let provider = self.provider_for(r)?;
        if has_tainted {
            self.destroy_tainted(node, r, &info, provider.as_ref())?;
        }
        let Some(prior) = prior else {
            return Ok(NodeOutcome::Destroyed);
        };
        let destroy = InstanceDiff::destroy();

        self.pre_hook(node, |h| h.pre_apply(&info, Some(&prior), &destroy))?;
        let (left, error) = match provider.apply(&info, Some(&prior), &destroy) {
            Ok(None) => (None, None),
            Ok(Some(kept)) => (Some(kept), Some(anyhow!("provider kept the instance it was asked to destroy"))),
            Err(partial) => (partial.state.or_else(|| Some(prior.clone())), Some(partial.error)),
        };

        let recorded = left.clone();
        self.commit(node, |state| {
            if let Some(record) = state.resource_mut(&r.address) {
                record.primary = recorded;
            }
            state.remove_if_empty(&r.address);
        })?;

        let message = error.as_ref().map(|e| format!("{e:#}"));
        self.post_hook(node, |h| h.post_apply(&info, left.as_ref(), message.as_deref()))?;
        match error {
            Some(cause) => Err(NodeError::Apply { address, cause }),
            None => Ok(NodeOutcome::Destroyed),
        }
    }

    fn refresh_instance(&self, node: &Node, r: &ResourceNode) -> Result<NodeOutcome, NodeError> {
        let Some(prior) = self.read_state().instance(&r.address).cloned() else {
            return Ok(NodeOutcome::Done);
        };
        let info = InstanceInfo::new(r.address.clone());
        let provider = self.provider_for(r)?;

        self.pre_hook(node, |h| h.pre_refresh(&info, &prior))?;
        let refreshed = provider
            .refresh(&info, &prior)
            .map_err(|cause| NodeError::Refresh {
                address: info.id(),
                cause,
            })?
            .map(|mut s| {
                s.tainted = prior.tainted;
                s
            });

        let outcome = match &refreshed {
            None => NodeOutcome::Destroyed,
            Some(s) if *s == prior => NodeOutcome::NoChange,
            Some(_) => NodeOutcome::Updated,
        };
        if outcome != NodeOutcome::NoChange {
            let recorded = refreshed.clone();
            self.commit(node, |state| {
                if let Some(record) = state.resource_mut(&r.address) {
                    record.primary = recorded;
                }
                state.remove_if_empty(&r.address);
            })?;
        }
        self.post_hook(node, |h| h.post_refresh(&info, refreshed.as_ref()))?;
        Ok(outcome)
    }

    fn write_output(
        &self,
        node: &Node,
        module: &ModulePath,
        name: &str,
        orphan: bool,
    ) -> Result<NodeOutcome, NodeError> {
        if orphan {
            let present = self
                .read_state()
                .module(module)
                .is_some_and(|m| m.outputs.contains_key(name));
            if present {
                self.commit(node, |state| {
                    if let Some(m) = state.module_mut(module) {
                        m.outputs.remove(name);
                    }
                })?;
            }
            return Ok(NodeOutcome::Done);
        }

        let fail = |cause| NodeError::Output {
            output: node.name.clone(),
            cause,
        };
        let expr = self
            .shared
            .config
            .descendant(module)
            .and_then(|m| m.outputs.iter().find(|o| o.name == name))
            .map(|o| o.value.clone())
            .ok_or_else(|| fail(anyhow!("output is not configured")))?;
        let value = self.evaluate(module, None, None, |s| s.eval(&expr)).map_err(fail)?;

        let unchanged = self
            .read_state()
            .module(module)
            .and_then(|m| m.outputs.get(name))
            == Some(&value);
        if !unchanged {
            self.commit(node, |state| {
                state
                    .ensure_module(module)
                    .outputs
                    .insert(name.to_string(), value);
            })?;
        }
        Ok(NodeOutcome::Done)
    }

    /// Rename the first instance between `type.name` and `type.name.0`
    fn settle_count(
        &self,
        node: &Node,
        module: &ModulePath,
        kind: &str,
        name: &str,
        shape: CountShape,
    ) -> Result<NodeOutcome, NodeError> {
        let bare = ResourceKey::new(kind, name);
        let zero = ResourceKey::indexed(kind, name, 0);
        let (from, to) = match shape {
            CountShape::Unindexed => (zero, bare),
            CountShape::Indexed => (bare, zero),
        };

        let movable = self
            .read_state()
            .module(module)
            .is_some_and(|m| m.resources.contains_key(&from) && !m.resources.contains_key(&to));
        if movable {
            log::debug!("{}: renaming {from} to {to}", node.name);
            self.commit(node, |state| {
                state.rename(module, &from, &to);
            })?;
        }
        Ok(NodeOutcome::Done)
    }

    fn prune_module(&self, node: &Node, path: &ModulePath) -> Result<NodeOutcome, NodeError> {
        if self.read_state().module(path).is_none() {
            return Ok(NodeOutcome::Done);
        }
        self.commit(node, |state| state.remove_module_tree(path))?;
        Ok(NodeOutcome::Done)
    }
}

fn resource_config(r: &ResourceNode) -> Result<&ResourceConfig, NodeError> {
    r.config.as_ref().ok_or_else(|| NodeError::Apply {
        address: r.address.to_string(),
        cause: anyhow!("resource is no longer configured"),
    })
}

/// Record at `address`, created empty when missing
/// Primary as the differ should see it, and whether earlier tainted
/// instances are recorded
///
/// Any tainted instance at the address forces the primary to be replaced.
fn diff_prior(state: &State, address: &ResourceAddress) -> (Option<InstanceState>, bool) {
    let record = state.resource(address);
    let has_tainted = record.is_some_and(|rec| !rec.tainted.is_empty());
    let prior = record
        .and_then(|rec| rec.primary.clone())
        .map(|p| if has_tainted { p.tainted() } else { p });
    (prior, has_tainted)
}

fn record_mut<'s>(
    state: &'s mut State,
    address: &ResourceAddress,
    config: Option<&ResourceConfig>,
) -> &'s mut ResourceState {
    let record = state
        .ensure_module(&address.module)
        .resources
        .entry(address.key.clone())
        .or_insert_with(|| ResourceState {
            kind: address.key.kind.clone(),
            ..ResourceState::default()
        });
    if let Some(config) = config {
        record.provider.clone_from(&config.provider);
    }
    record
}

/// The create half of a replacement
fn create_only(diff: &InstanceDiff) -> InstanceDiff {
    InstanceDiff {
        attributes: diff.attributes.clone(),
        ..InstanceDiff::default()
    }
}

fn outcome_of(action: DiffAction) -> NodeOutcome {
    match action {
        DiffAction::NoOp => NodeOutcome::NoChange,
        DiffAction::Create => NodeOutcome::Created,
        DiffAction::Update => NodeOutcome::Updated,
        DiffAction::Destroy => NodeOutcome::Destroyed,
        DiffAction::DestroyThenCreate => NodeOutcome::Replaced,
    }
}
