//! Planning and execution engine
//!
//! A [`Context`] ties a configuration to the current state and the
//! provider factories, and runs three kinds of walk over it:
//!
//! 1. Plan - diff every instance without touching real infrastructure
//! 2. Apply - carry out a plan, committing state after every confirmed action
//! 3. Refresh - re-read every recorded instance from its provider

mod builder;
mod differ;
mod eval;
mod executor;
mod graph;
mod walker;


pub use walker::{CancelToken, NodeOutcome, NodeStatus, WalkSummary};

use crate::config::ModuleConfig;
use crate::diff::{Diff, Plan};
use crate::error::{BuildError, Error, NodeError};
use crate::hook::Hook;
use crate::provider::{ProviderFactory, ProvisionerFactory};
use crate::settings::EngineSettings;
use crate::state::{State, StateStore};
use crate::value::Value;
use builder::{BuildInput, Operation};
use executor::{Shared, WalkContext, WalkMode};
use graph::Graph;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Everything needed to create a [`Context`]
pub struct ContextOpts {
    pub config: ModuleConfig,
    pub state: State,
    /// Values for the root module's variables
    pub variables: BTreeMap<String, Value>,
    pub providers: HashMap<String, ProviderFactory>,
    pub provisioners: HashMap<String, ProvisionerFactory>,
    pub hooks: Vec<Arc<dyn Hook>>,
    /// Maximum number of nodes visited at once
    pub parallelism: usize,
    /// Plan a full teardown instead of converging on the configuration
    pub destroy: bool,
    /// Diff to apply instead of planning again
    pub diff: Option<Diff>,
    pub store: Option<Arc<dyn StateStore>>,
    /// Write every committed mutation to `store`
    pub persist_state: bool,
    pub cancel: CancelToken,
}

impl Default for ContextOpts {
    fn default() -> Self {
        Self {
            config: ModuleConfig::default(),
            state: State::new(),
            variables: BTreeMap::new(),
            providers: HashMap::new(),
            provisioners: HashMap::new(),
            hooks: Vec::new(),
            parallelism: 10,
            destroy: false,
            diff: None,
            store: None,
            persist_state: true,
            cancel: CancelToken::new(),
        }
    }
}

impl ContextOpts {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            parallelism: settings.parallelism(),
            persist_state: settings.persist_state,
            ..Self::default()
        }
    }

    /// Persist to `store`, starting from the state it holds (if any)
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Result<Self, Error> {
        if let Some(state) = store.read().map_err(Error::Store)? {
            log::debug!("Loaded state serial {} from store", state.serial);
            self.state = state;
        }
        self.store = Some(store);
        Ok(self)
    }

    #[must_use]
    pub fn provider(mut self, name: impl Into<String>, factory: ProviderFactory) -> Self {
        self.providers.insert(name.into(), factory);
        self
    }

    #[must_use]
    pub fn provisioner(mut self, kind: impl Into<String>, factory: ProvisionerFactory) -> Self {
        self.provisioners.insert(kind.into(), factory);
        self
    }

    #[must_use]
    pub fn hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hooks.push(hook);
        self
    }

    #[must_use]
    pub fn variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }
}

/// Result of an apply or refresh walk
///
/// The state is always the real outcome, even when some nodes failed.
#[derive(Debug)]
pub struct WalkReport {
    pub state: State,
    pub errors: Vec<NodeError>,
    pub summary: WalkSummary,
    /// Final status of every node, by node name
    pub statuses: BTreeMap<String, NodeStatus>,
}

impl WalkReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// The resulting state, or every error the walk collected
    pub fn into_result(self) -> Result<State, Error> {
        if self.errors.is_empty() {
            Ok(self.state)
        } else {
            Err(Error::Walk(self.errors))
        }
    }
}

/// Plans and applies one configuration against its state
pub struct Context {
    config: ModuleConfig,
    state: Mutex<State>,
    diff: Mutex<Option<Diff>>,
    variables: BTreeMap<String, Value>,
    providers: HashMap<String, ProviderFactory>,
    provisioners: HashMap<String, ProvisionerFactory>,
    hooks: Vec<Arc<dyn Hook>>,
    parallelism: usize,
    destroy: bool,
    store: Option<Arc<dyn StateStore>>,
    persist_state: bool,
    cancel: CancelToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Context {
    pub fn new(opts: ContextOpts) -> Self {
        Self {
            config: opts.config,
            state: Mutex::new(opts.state),
            diff: Mutex::new(opts.diff),
            variables: opts.variables,
            providers: opts.providers,
            provisioners: opts.provisioners,
            hooks: opts.hooks,
            parallelism: opts.parallelism.max(1),
            destroy: opts.destroy,
            store: opts.store,
            persist_state: opts.persist_state,
            cancel: opts.cancel,
        }
    }

    /// Current state
    pub fn state(&self) -> State {
        lock(&self.state).clone()
    }

    /// Diff of the last plan, until it is applied
    pub fn diff(&self) -> Option<Diff> {
        lock(&self.diff).clone()
    }

    /// Ask the running walk to stop; nodes already running finish
    pub fn stop(&self) {
        log::info!("Stop requested");
        self.cancel.cancel();
    }

    /// Declared defaults overlaid with the supplied values
    fn root_variables(&self) -> Result<BTreeMap<String, Value>, BuildError> {
        let mut vars = BTreeMap::new();
        for (name, default) in &self.config.variables {
            match (self.variables.get(name), default) {
                (Some(value), _) | (None, Some(value)) => {
                    vars.insert(name.clone(), value.clone());
                }
                (None, None) => {
                    return Err(BuildError::UnresolvedReference {
                        from: "root module".to_string(),
                        reference: format!("var.{name}"),
                    });
                }
            }
        }
        for (name, value) in &self.variables {
            vars.entry(name.clone()).or_insert_with(|| value.clone());
        }
        Ok(vars)
    }

    fn shared(&self) -> Shared<'_> {
        Shared {
            config: &self.config,
            provider_factories: &self.providers,
            provisioner_factories: &self.provisioners,
            hooks: &self.hooks,
            store: self.store.as_deref(),
            persist: self.persist_state,
            cancel: &self.cancel,
            destroy: self.destroy,
        }
    }

    fn build_graph(
        &self,
        state: &State,
        variables: &BTreeMap<String, Value>,
        operation: Operation<'_>,
    ) -> Result<Graph, BuildError> {
        let providers: BTreeSet<String> = self.providers.keys().cloned().collect();
        let provisioners: BTreeSet<String> = self.provisioners.keys().cloned().collect();
        builder::build(&BuildInput {
            config: &self.config,
            state,
            variables,
            operation,
            destroy: self.destroy,
            providers: &providers,
            provisioners: &provisioners,
        })
    }

    /// Compute the diff between the configuration and the current state
    ///
    /// Nothing real is touched and the state is left as it was. Any node
    /// failure fails the whole plan.
    pub fn plan(&self) -> Result<Plan, Error> {
        self.cancel.reset();
        self.plan_walk()
    }

    fn plan_walk(&self) -> Result<Plan, Error> {
        let prior = self.state();
        let variables = self.root_variables()?;
        let graph = self.build_graph(&prior, &variables, Operation::Plan)?;
        log::info!("Planning {} node(s)", graph.len());

        let ctx = WalkContext::new(self.shared(), WalkMode::Plan, None, prior.clone(), variables);
        let outcome = walker::walk(&graph, self.parallelism, &self.cancel, |node| ctx.visit(node))?;
        if !outcome.errors.is_empty() {
            return Err(Error::Walk(outcome.errors));
        }
        let (_, mut diff) = ctx.into_parts();

        for module in &prior.modules {
            let path = &module.path;
            if !path.is_root() && (self.destroy || self.config.descendant(path).is_none()) {
                diff.ensure_module(path).destroy = true;
            }
        }
        log::info!("Plan: {} change(s)", outcome.summary.total_changes());

        *lock(&self.diff) = Some(diff.clone());
        Ok(Plan { diff, state: prior })
    }

    /// Carry out the last plan, planning first when there is none
    ///
    /// Node failures don't fail the call: the report carries them together
    /// with the state as it really is afterwards.
    pub fn apply(&self) -> Result<WalkReport, Error> {
        self.cancel.reset();
        let stored = lock(&self.diff).clone();
        let planned = match stored {
            Some(diff) => diff,
            None => self.plan_walk()?.diff,
        };

        let prior = self.state();
        let variables = self.root_variables()?;
        let graph = self.build_graph(&prior, &variables, Operation::Apply(&planned))?;
        log::info!("Applying {} node(s) with parallelism {}", graph.len(), self.parallelism);

        let ctx = WalkContext::new(self.shared(), WalkMode::Apply, Some(&planned), prior, variables);
        let outcome = walker::walk(&graph, self.parallelism, &self.cancel, |node| ctx.visit(node))?;
        let (state, _) = ctx.into_parts();

        for problem in state.verify_count_layout() {
            log::warn!("State layout: {problem}");
        }
        log::info!(
            "Apply finished: {} created, {} updated, {} replaced, {} destroyed, {} failed",
            outcome.summary.created,
            outcome.summary.updated,
            outcome.summary.replaced,
            outcome.summary.destroyed,
            outcome.summary.failed,
        );

        *lock(&self.state) = state.clone();
        *lock(&self.diff) = None;
        Ok(WalkReport {
            state,
            errors: outcome.errors,
            summary: outcome.summary,
            statuses: outcome.statuses,
        })
    }

    /// Re-read every recorded instance from its provider
    pub fn refresh(&self) -> Result<WalkReport, Error> {
        self.cancel.reset();
        let prior = self.state();
        let variables = self.root_variables()?;
        let graph = self.build_graph(&prior, &variables, Operation::Refresh)?;
        log::info!("Refreshing {} node(s)", graph.len());

        let ctx = WalkContext::new(self.shared(), WalkMode::Refresh, None, prior, variables);
        let outcome = walker::walk(&graph, self.parallelism, &self.cancel, |node| ctx.visit(node))?;
        let (state, _) = ctx.into_parts();

        *lock(&self.state) = state.clone();
        Ok(WalkReport {
            state,
            errors: outcome.errors,
            summary: outcome.summary,
            statuses: outcome.statuses,
        })
    }

    /// Text dump of the plan graph, one node per line with its dependencies
    pub fn graph(&self) -> Result<String, Error> {
        let state = self.state();
        let variables = self.root_variables()?;
        let graph = self.build_graph(&state, &variables, Operation::Plan)?;
        Ok(graph.to_string())
    }
}
