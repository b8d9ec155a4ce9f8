//! Differential walks
//!
//! Runs the same plan and apply twice from independent copies of the
//! inputs, once visiting one node at a time and once at the configured
//! parallelism, and reports any difference between the two. Nothing here
//! is used by [`Context`] itself.

use crate::engine::{Context, ContextOpts};
use crate::error::Error;
use thiserror::Error;

/// Rendered outcome of one plan + apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowRun {
    pub plan: String,
    pub state: String,
    pub errors: usize,
}

#[derive(Debug, Error)]
pub enum ShadowError {
    #[error(transparent)]
    Engine(#[from] Error),

    #[error("{what} differs between serial and parallel walks\n--- serial\n{serial}\n--- parallel\n{parallel}")]
    Mismatch {
        what: &'static str,
        serial: String,
        parallel: String,
    },
}

/// Plan and apply with options from `make_opts` twice and compare
///
/// `make_opts` is called once per run so each run gets its own state,
/// providers and hooks.
pub fn run_shadow(make_opts: impl Fn() -> ContextOpts) -> Result<ShadowRun, ShadowError> {
    let serial = run_once(ContextOpts {
        parallelism: 1,
        ..make_opts()
    })?;
    let parallel = run_once(make_opts())?;

    compare("plan", &serial.plan, &parallel.plan)?;
    compare("state", &serial.state, &parallel.state)?;
    compare("error count", &serial.errors.to_string(), &parallel.errors.to_string())?;
    log::debug!("Serial and parallel walks agree");
    Ok(parallel)
}

fn run_once(opts: ContextOpts) -> Result<ShadowRun, Error> {
    let ctx = Context::new(opts);
    let plan = ctx.plan()?;
    let report = ctx.apply()?;
    Ok(ShadowRun {
        plan: plan.to_string(),
        state: report.state.to_string(),
        errors: report.errors.len(),
    })
}

fn compare(what: &'static str, serial: &str, parallel: &str) -> Result<(), ShadowError> {
    if serial == parallel {
        return Ok(());
    }
    log::warn!("Shadow walk mismatch in {what}");
    Err(ShadowError::Mismatch {
        what,
        serial: serial.to_string(),
        parallel: parallel.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Expr, ModuleConfig, ResourceConfig};
    use crate::provider::fixed_provider;
    use crate::state::State;
    use crate::testing::{MockProvider, init_logging};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(num: &str) -> ModuleConfig {
        let mut config = ModuleConfig::new();
        for name in ["a", "b", "c", "d"] {
            config = config.resource(ResourceConfig::new("aws_instance", name).attr("num", Expr::lit(num)));
        }
        config.resource(
            ResourceConfig::new("aws_instance", "e").attr("a", Expr::reference("aws_instance.a.num")),
        )
    }

    fn opts(num: &str, provider: MockProvider) -> ContextOpts {
        ContextOpts {
            config: config(num),
            state: State::new(),
            parallelism: 4,
            ..ContextOpts::default()
        }
        .provider("aws", fixed_provider(Arc::new(provider)))
    }

    #[test]
    fn test_serial_and_parallel_agree() {
        init_logging();
        let run = run_shadow(|| opts("1", MockProvider::new())).unwrap();
        assert_eq!(run.errors, 0);
        assert!(run.state.contains("aws_instance.e:\n  ID = foo\n  a = 1\n"));
    }

    #[test]
    fn test_failures_agree() {
        init_logging();
        let run = run_shadow(|| {
            let provider = MockProvider::new();
            provider.fail_apply("aws_instance.a");
            opts("1", provider)
        })
        .unwrap();
        assert_eq!(run.errors, 1);
        assert!(!run.state.contains("aws_instance.e"));
    }

    #[test]
    fn test_mismatch_reported() {
        init_logging();
        let runs = AtomicUsize::new(0);
        let err = run_shadow(|| {
            let num = if runs.fetch_add(1, Ordering::SeqCst) == 0 { "1" } else { "2" };
            opts(num, MockProvider::new())
        })
        .unwrap_err();
        assert!(matches!(err, ShadowError::Mismatch { what: "plan", .. }));
    }
}
