//! Provider and provisioner contracts
//!
//! Resource types are implemented outside the engine. The engine reaches
//! them through [`ResourceProvider`] (diff, apply and refresh of one
//! instance per call) and runs post-create side effects through
//! [`ResourceProvisioner`]. Both are obtained from factories so each walk
//! gets fresh, separately configured instances.

use crate::addr::ResourceAddress;
use crate::diff::InstanceDiff;
use crate::state::InstanceState;
use crate::value::Value;
use anyhow::Result;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Identity of the instance a provider call concerns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub address: ResourceAddress,
}

impl InstanceInfo {
    pub fn new(address: ResourceAddress) -> Self {
        Self { address }
    }

    /// Resource type, e.g. `aws_instance`
    pub fn kind(&self) -> &str {
        &self.address.key.kind
    }

    /// Address string used in hooks and errors
    pub fn id(&self) -> String {
        self.address.to_string()
    }
}

/// Evaluated attribute values of a resource, provider or provisioner block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub attrs: BTreeMap<String, Value>,
}

impl ResolvedConfig {
    pub fn new(attrs: BTreeMap<String, Value>) -> Self {
        Self { attrs }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attrs.get(key)
    }

    /// String value of `key`, if it is a known string
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(Value::as_str)
    }

    /// The value of `key` is not known yet
    pub fn is_computed(&self, key: &str) -> bool {
        self.attrs.get(key).is_some_and(|v| !v.is_known())
    }

    /// Flat attribute paths, unknowns as the computed sentinel
    pub fn flatten(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for (key, value) in &self.attrs {
            value.flatten_into(key, &mut out);
        }
        out
    }
}

/// Apply failure that may still have created something real
///
/// When `state` is set, the provider got far enough to create or change the
/// instance and the engine records it before reporting the error.
pub struct PartialApply {
    pub state: Option<InstanceState>,
    pub error: anyhow::Error,
}

impl PartialApply {
    pub fn new(state: Option<InstanceState>, error: anyhow::Error) -> Self {
        Self { state, error }
    }
}

impl From<anyhow::Error> for PartialApply {
    fn from(error: anyhow::Error) -> Self {
        Self { state: None, error }
    }
}

impl fmt::Debug for PartialApply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartialApply")
            .field("state", &self.state)
            .field("error", &format_args!("{:#}", self.error))
            .finish()
    }
}

impl fmt::Display for PartialApply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.error)
    }
}

/// Capability interface for one provider (a family of resource types)
///
/// Calls for different instances may arrive concurrently. `apply` is never
/// retried by the engine.
pub trait ResourceProvider: Send + Sync {
    /// Accept the evaluated provider block before any other call
    fn configure(&self, _config: &ResolvedConfig) -> Result<()> {
        Ok(())
    }

    /// Attribute changes needed to move `state` to `config`
    ///
    /// `state` is `None` when the instance does not exist yet. The default
    /// compares flat attributes and never forces replacement.
    fn diff(
        &self,
        _info: &InstanceInfo,
        state: Option<&InstanceState>,
        config: &ResolvedConfig,
    ) -> Result<InstanceDiff> {
        Ok(InstanceDiff::between(state, &config.flatten()))
    }

    /// Carry out a diff. `Ok(None)` means the instance no longer exists.
    fn apply(
        &self,
        info: &InstanceInfo,
        state: Option<&InstanceState>,
        diff: &InstanceDiff,
    ) -> std::result::Result<Option<InstanceState>, PartialApply>;

    /// Re-read the real instance. `Ok(None)` means it is gone.
    fn refresh(&self, _info: &InstanceInfo, state: &InstanceState) -> Result<Option<InstanceState>> {
        Ok(Some(state.clone()))
    }
}

/// Post-create side effect run against a freshly created instance
pub trait ResourceProvisioner: Send + Sync {
    fn apply(&self, info: &InstanceInfo, state: &InstanceState, config: &ResolvedConfig) -> Result<()>;
}

/// Builds a provider instance for a walk
pub type ProviderFactory = Arc<dyn Fn() -> Result<Arc<dyn ResourceProvider>> + Send + Sync>;

/// Builds a provisioner instance for a walk
pub type ProvisionerFactory = Arc<dyn Fn() -> Result<Arc<dyn ResourceProvisioner>> + Send + Sync>;

/// Factory that always hands out the same provider
pub fn fixed_provider(provider: Arc<dyn ResourceProvider>) -> ProviderFactory {
    Arc::new(move || Ok(Arc::clone(&provider)))
}

/// Factory that always hands out the same provisioner
pub fn fixed_provisioner(provisioner: Arc<dyn ResourceProvisioner>) -> ProvisionerFactory {
    Arc::new(move || Ok(Arc::clone(&provisioner)))
}
