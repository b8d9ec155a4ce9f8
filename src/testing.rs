//! Test doubles shared by the engine tests
//!
//! `MockProvider` diffs and applies flat string attributes:
//!
//! - every diff that changes anything also sets `type` to the resource type
//! - `compute = "x"` is not stored; it declares attribute `x` computed until
//!   the instance exists, and apply fills it with `computed_x`
//! - a change to `require_new` forces replacement
//! - created instances get the id `foo` unless the diff carries one

use crate::addr::{ModulePath, ResourceAddress, ResourceKey};
use crate::diff::{AttrDiff, InstanceDiff};
use crate::hook::{Hook, HookAction};
use crate::provider::{
    InstanceInfo, PartialApply, ResolvedConfig, ResourceProvider, ResourceProvisioner,
};
use crate::state::{InstanceState, ResourceState, State};
use crate::value::UNKNOWN;
use anyhow::{Result, anyhow, bail};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub(crate) struct MockProvider {
    /// Addresses whose create or update fails
    fail_apply: Mutex<BTreeSet<String>>,
    /// Addresses whose failed create still leaves a half-built instance
    partial_apply: Mutex<BTreeSet<String>>,
    /// Addresses whose destroy fails
    fail_destroy: Mutex<BTreeSet<String>>,
    /// Ids whose destroy fails, for deposed instances sharing an address
    fail_destroy_ids: Mutex<BTreeSet<String>>,
    fail_refresh: Mutex<BTreeSet<String>>,
    /// Canned refresh results; `None` means the instance vanished
    refreshed: Mutex<HashMap<String, Option<InstanceState>>>,
    /// Ids handed out on create, by address
    ids: Mutex<HashMap<String, String>>,
    delay: Mutex<Option<Duration>>,
    configured: Mutex<Vec<ResolvedConfig>>,
    calls: Mutex<Vec<String>>,
}

impl MockProvider {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_apply(&self, address: &str) {
        lock(&self.fail_apply).insert(address.to_string());
    }

    pub(crate) fn fail_apply_partially(&self, address: &str) {
        lock(&self.fail_apply).insert(address.to_string());
        lock(&self.partial_apply).insert(address.to_string());
    }

    pub(crate) fn fail_destroy(&self, address: &str) {
        lock(&self.fail_destroy).insert(address.to_string());
    }

    pub(crate) fn fail_destroy_id(&self, id: &str) {
        lock(&self.fail_destroy_ids).insert(id.to_string());
    }

    pub(crate) fn fail_refresh(&self, address: &str) {
        lock(&self.fail_refresh).insert(address.to_string());
    }

    pub(crate) fn refresh_to(&self, address: &str, state: Option<InstanceState>) {
        lock(&self.refreshed).insert(address.to_string(), state);
    }

    pub(crate) fn create_with_id(&self, address: &str, id: &str) {
        lock(&self.ids).insert(address.to_string(), id.to_string());
    }

    /// Sleep inside every apply, to keep several nodes in flight
    pub(crate) fn slow(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    /// `"apply <addr>"`, `"destroy <addr> <id>"` and `"refresh <addr>"`, in call order
    pub(crate) fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub(crate) fn applied(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with("apply ") || c.starts_with("destroy "))
            .collect()
    }

    pub(crate) fn configured(&self) -> Vec<ResolvedConfig> {
        lock(&self.configured).clone()
    }

    fn record(&self, call: String) {
        lock(&self.calls).push(call);
    }
}

impl ResourceProvider for MockProvider {
    fn configure(&self, config: &ResolvedConfig) -> Result<()> {
        if config.get_str("fail") == Some("true") {
            bail!("bad provider configuration");
        }
        lock(&self.configured).push(config.clone());
        Ok(())
    }

    fn diff(
        &self,
        info: &InstanceInfo,
        state: Option<&InstanceState>,
        config: &ResolvedConfig,
    ) -> Result<InstanceDiff> {
        let mut diff = InstanceDiff::default();
        let flat = config.flatten();
        let old = |key: &str| {
            state
                .and_then(|s| s.attr(key))
                .unwrap_or_default()
                .to_string()
        };

        for (key, value) in &flat {
            if key == "compute" {
                if state.and_then(|s| s.attr(value)).is_none() {
                    diff.attributes.insert(value.clone(), AttrDiff::computed(""));
                }
                continue;
            }
            if value == UNKNOWN {
                diff.attributes.insert(key.clone(), AttrDiff::computed(old(key)));
                continue;
            }
            let prior = old(key);
            if state.is_some() && state.and_then(|s| s.attr(key)) == Some(value.as_str()) {
                continue;
            }
            let mut attr = AttrDiff::change(prior, value.clone());
            if key == "require_new" {
                attr.requires_new = true;
            }
            diff.attributes.insert(key.clone(), attr);
        }

        if !diff.attributes.is_empty() && !diff.attributes.contains_key("type") {
            let prior = old("type");
            if state.is_none() || prior != info.kind() {
                diff.attributes
                    .insert("type".to_string(), AttrDiff::change(prior, info.kind()));
            }
        }
        Ok(diff)
    }

    fn apply(
        &self,
        info: &InstanceInfo,
        state: Option<&InstanceState>,
        diff: &InstanceDiff,
    ) -> std::result::Result<Option<InstanceState>, PartialApply> {
        let address = info.id();
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        if diff.destroy && !diff.requires_new() {
            let id = state.map(|s| s.id.clone()).unwrap_or_default();
            self.record(format!("destroy {address} {id}"));
            if lock(&self.fail_destroy).contains(&address) || lock(&self.fail_destroy_ids).contains(&id) {
                return Err(anyhow!("destroy of {id} failed").into());
            }
            return Ok(None);
        }

        self.record(format!("apply {address}"));
        let mut result = InstanceState::merge_diff(state, diff);
        if result.id.is_empty() || result.id == UNKNOWN {
            result.id = lock(&self.ids)
                .get(&address)
                .cloned()
                .unwrap_or_else(|| "foo".to_string());
        }
        for (key, value) in &mut result.attributes {
            if value == UNKNOWN {
                *value = format!("computed_{key}");
            }
        }
        result
            .attributes
            .insert("type".to_string(), info.kind().to_string());

        if lock(&self.fail_apply).contains(&address) {
            let partial = lock(&self.partial_apply)
                .contains(&address)
                .then_some(result);
            return Err(PartialApply::new(partial, anyhow!("apply of {address} failed")));
        }
        Ok(Some(result))
    }

    fn refresh(&self, info: &InstanceInfo, state: &InstanceState) -> Result<Option<InstanceState>> {
        let address = info.id();
        self.record(format!("refresh {address}"));
        if lock(&self.fail_refresh).contains(&address) {
            bail!("refresh of {address} failed");
        }
        Ok(lock(&self.refreshed)
            .get(&address)
            .cloned()
            .unwrap_or_else(|| Some(state.clone())))
    }
}

/// Provisioner recording every run; fails when `fail` is set in its config
#[derive(Debug, Default)]
pub(crate) struct MockProvisioner {
    runs: Mutex<Vec<(String, BTreeMap<String, String>)>>,
}

impl MockProvisioner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Address and flattened config of every run, in order
    pub(crate) fn runs(&self) -> Vec<(String, BTreeMap<String, String>)> {
        lock(&self.runs).clone()
    }
}

impl ResourceProvisioner for MockProvisioner {
    fn apply(&self, info: &InstanceInfo, _state: &InstanceState, config: &ResolvedConfig) -> Result<()> {
        lock(&self.runs).push((info.id(), config.flatten()));
        if config.get_str("fail") == Some("true") {
            bail!("provisioner failed");
        }
        Ok(())
    }
}

/// Hook recording apply and provisioning events
#[derive(Debug, Default)]
pub(crate) struct RecordingHook {
    events: Mutex<Vec<String>>,
    halt_before: Mutex<Option<String>>,
    state_updates: Mutex<Vec<u64>>,
}

impl RecordingHook {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Halt the walk when `address` is about to be applied
    pub(crate) fn halting_before(address: &str) -> Self {
        let hook = Self::default();
        *lock(&hook.halt_before) = Some(address.to_string());
        hook
    }

    pub(crate) fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }

    /// Serials of every committed state snapshot, in order
    pub(crate) fn serials(&self) -> Vec<u64> {
        lock(&self.state_updates).clone()
    }

    fn push(&self, event: String) {
        lock(&self.events).push(event);
    }
}

impl Hook for RecordingHook {
    fn pre_diff(&self, info: &InstanceInfo, _state: Option<&InstanceState>) -> Result<HookAction> {
        self.push(format!("pre_diff {}", info.id()));
        Ok(HookAction::Continue)
    }

    fn pre_apply(
        &self,
        info: &InstanceInfo,
        _state: Option<&InstanceState>,
        _diff: &InstanceDiff,
    ) -> Result<HookAction> {
        let address = info.id();
        if lock(&self.halt_before).as_deref() == Some(address.as_str()) {
            self.push(format!("halt {address}"));
            return Ok(HookAction::Halt);
        }
        self.push(format!("pre_apply {address}"));
        Ok(HookAction::Continue)
    }

    fn post_apply(
        &self,
        info: &InstanceInfo,
        _state: Option<&InstanceState>,
        error: Option<&str>,
    ) -> Result<HookAction> {
        let suffix = if error.is_some() { " (error)" } else { "" };
        self.push(format!("post_apply {}{suffix}", info.id()));
        Ok(HookAction::Continue)
    }

    fn pre_provision(&self, info: &InstanceInfo, provisioner: &str) -> Result<HookAction> {
        self.push(format!("pre_provision {} {provisioner}", info.id()));
        Ok(HookAction::Continue)
    }

    fn post_provision(&self, info: &InstanceInfo, provisioner: &str) -> Result<HookAction> {
        self.push(format!("post_provision {} {provisioner}", info.id()));
        Ok(HookAction::Continue)
    }

    fn post_state_update(&self, state: &State) -> Result<HookAction> {
        lock(&self.state_updates).push(state.serial);
        Ok(HookAction::Continue)
    }
}

pub(crate) fn addr(raw: &str) -> ResourceAddress {
    addr_in(&ModulePath::root(), raw)
}

pub(crate) fn addr_in(module: &ModulePath, raw: &str) -> ResourceAddress {
    let key: ResourceKey = raw.parse().unwrap_or_else(|e| panic!("bad key {raw}: {e}"));
    ResourceAddress::new(module.clone(), key)
}

/// Record with a primary instance and the given flat attributes
pub(crate) fn record(kind: &str, id: &str, attrs: &[(&str, &str)]) -> ResourceState {
    let instance = attrs
        .iter()
        .fold(InstanceState::new(id), |inst, (k, v)| inst.with_attr(*k, *v));
    ResourceState::new(kind, instance)
}

/// State holding the given root records
pub(crate) fn root_state(records: Vec<(&str, ResourceState)>) -> State {
    let mut state = State::new();
    for (key, resource) in records {
        state.set_resource(&addr(key), resource);
    }
    state
}
