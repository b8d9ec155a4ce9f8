//! Lifecycle notifications
//!
//! Hooks observe a walk; they never change what is diffed or applied. They
//! can only ask the walk to stop early by returning [`HookAction::Halt`].
//!
//! Callbacks for one node arrive in program order, but callbacks for
//! different nodes may run concurrently on different threads. A hook that
//! accumulates data must synchronise it internally.

use crate::diff::InstanceDiff;
use crate::provider::InstanceInfo;
use crate::state::{InstanceState, State};
use anyhow::Result;

/// What the walk should do after a callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookAction {
    #[default]
    Continue,
    /// Stop dispatching new nodes; running nodes finish
    Halt,
}

/// Observer of walk lifecycle events. Every method defaults to `Continue`.
#[allow(unused_variables)]
pub trait Hook: Send + Sync {
    fn pre_diff(&self, info: &InstanceInfo, state: Option<&InstanceState>) -> Result<HookAction> {
        Ok(HookAction::Continue)
    }

    fn post_diff(&self, info: &InstanceInfo, diff: &InstanceDiff) -> Result<HookAction> {
        Ok(HookAction::Continue)
    }

    fn pre_apply(
        &self,
        info: &InstanceInfo,
        state: Option<&InstanceState>,
        diff: &InstanceDiff,
    ) -> Result<HookAction> {
        Ok(HookAction::Continue)
    }

    /// `error` is set when the apply failed
    fn post_apply(
        &self,
        info: &InstanceInfo,
        state: Option<&InstanceState>,
        error: Option<&str>,
    ) -> Result<HookAction> {
        Ok(HookAction::Continue)
    }

    fn pre_provision_resource(&self, info: &InstanceInfo, state: &InstanceState) -> Result<HookAction> {
        Ok(HookAction::Continue)
    }

    fn post_provision_resource(&self, info: &InstanceInfo, state: &InstanceState) -> Result<HookAction> {
        Ok(HookAction::Continue)
    }

    fn pre_provision(&self, info: &InstanceInfo, provisioner: &str) -> Result<HookAction> {
        Ok(HookAction::Continue)
    }

    fn post_provision(&self, info: &InstanceInfo, provisioner: &str) -> Result<HookAction> {
        Ok(HookAction::Continue)
    }

    fn pre_refresh(&self, info: &InstanceInfo, state: &InstanceState) -> Result<HookAction> {
        Ok(HookAction::Continue)
    }

    fn post_refresh(&self, info: &InstanceInfo, state: Option<&InstanceState>) -> Result<HookAction> {
        Ok(HookAction::Continue)
    }

    /// Called after every committed state mutation with the new snapshot
    fn post_state_update(&self, state: &State) -> Result<HookAction> {
        Ok(HookAction::Continue)
    }
}

/// Hook that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NilHook;

impl Hook for NilHook {}
