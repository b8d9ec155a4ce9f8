//! # Terrace
//!
//! Graph-based planning and execution engine for declarative infrastructure.
//!
//! Given an evaluated configuration and the recorded state of previously
//! created resources, terrace works out the create/update/destroy actions
//! needed to reconcile the two, then carries them out in dependency order,
//! updating the state as each real-world action is confirmed.
//!
//! ## Core Concepts
//!
//! - **State**: records of created instances, per module and address
//! - **Diff**: per-instance attribute changes and the action they imply
//! - **Graph**: one node per instance, provider, module boundary and output
//! - **Walk**: a bounded concurrent traversal of the graph
//!
//! ## Example
//!
//! ```ignore
//! use terrace::{Context, ContextOpts, Expr, ModuleConfig, ResourceConfig, fixed_provider};
//!
//! let config = ModuleConfig::new()
//!     .resource(ResourceConfig::new("aws_instance", "web").attr("ami", Expr::lit("ami-1")));
//!
//! let ctx = Context::new(
//!     ContextOpts { config, ..ContextOpts::default() }
//!         .provider("aws", fixed_provider(my_provider)),
//! );
//! println!("{}", ctx.plan()?);
//! let report = ctx.apply()?;
//! for err in &report.errors {
//!     eprintln!("{err}");
//! }
//! ```
//!
//! ## Extension Traits
//!
//! - [`ResourceProvider`]: diffs, applies and refreshes resource instances
//! - [`ResourceProvisioner`]: post-create side effects
//! - [`Hook`]: lifecycle notifications, with cooperative cancellation
//! - [`StateStore`]: persistence of state snapshots

pub mod addr;
pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod hook;
pub mod provider;
pub mod settings;
pub mod shadow;
pub mod state;
pub mod value;

#[cfg(test)]
mod testing;

pub use addr::{ModulePath, ResourceAddress, ResourceKey};
pub use config::{Expr, Lifecycle, ModuleConfig, ProviderConfig, ProvisionerConfig, Reference, ResourceConfig};
pub use diff::{AttrDiff, Diff, DiffAction, InstanceDiff, ModuleDiff, Plan};
pub use engine::{CancelToken, Context, ContextOpts, NodeOutcome, NodeStatus, WalkReport, WalkSummary};
pub use error::{BuildError, Error, NodeError};
pub use hook::{Hook, HookAction, NilHook};
pub use provider::{
    InstanceInfo, PartialApply, ProviderFactory, ProvisionerFactory, ResolvedConfig, ResourceProvider,
    ResourceProvisioner, fixed_provider, fixed_provisioner,
};
pub use settings::{EngineSettings, init_logging};
pub use shadow::{ShadowError, ShadowRun, run_shadow};
pub use state::{FileStateStore, InstanceState, MemoryStateStore, ResourceState, State, StateStore};
pub use value::Value;
