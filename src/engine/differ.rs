//! Diff policy layered over the provider's own diff
//!
//! The provider decides which attributes changed and which changes force
//! replacement. On top of that the engine applies its own rules: tainted
//! instances are always replaced, unknown values never force replacement,
//! `ignore_changes` hides drift on updates, and `prevent_destroy` refuses
//! any plan that would destroy the instance.

use crate::config::Lifecycle;
use crate::diff::{AttrDiff, InstanceDiff};
use crate::provider::{InstanceInfo, ResolvedConfig, ResourceProvider};
use crate::state::InstanceState;
use crate::value::UNKNOWN;
use anyhow::{Result, bail};

/// Diff a configured instance against its current record
pub(crate) fn diff_instance(
    provider: &dyn ResourceProvider,
    info: &InstanceInfo,
    prior: Option<&InstanceState>,
    config: &ResolvedConfig,
    lifecycle: &Lifecycle,
) -> Result<InstanceDiff> {
    let tainted = prior.is_some_and(|p| p.tainted);
    let live = prior.filter(|p| !p.tainted);

    let mut diff = provider.diff(info, live, config)?;
    overlay_unknowns(&mut diff, live, config);

    if let Some(current) = live {
        apply_ignore_changes(&mut diff, &lifecycle.ignore_changes);
        if diff.requires_new() {
            diff = replacement(provider, info, current, config, &diff)?;
        }
    } else {
        diff.attributes.insert(
            "id".to_string(),
            AttrDiff::computed(prior.map(|p| p.id.clone()).unwrap_or_default()).forces_new(),
        );
        diff.destroy_tainted = tainted;
    }

    if lifecycle.prevent_destroy && prior.is_some() && (diff.destroy || diff.destroy_tainted) {
        bail!("instance is marked prevent_destroy but the plan replaces it");
    }
    Ok(diff)
}

/// Destroy diff for a record with no configuration slot
pub(crate) fn diff_destroy(lifecycle: Option<&Lifecycle>) -> Result<InstanceDiff> {
    if lifecycle.is_some_and(|l| l.prevent_destroy) {
        bail!("instance is marked prevent_destroy but the plan destroys it");
    }
    Ok(InstanceDiff::destroy())
}

/// Mark every configured unknown as computed, whatever the provider said
///
/// With a prior instance, computed attributes never force replacement.
fn overlay_unknowns(diff: &mut InstanceDiff, prior: Option<&InstanceState>, config: &ResolvedConfig) {
    for (key, value) in config.flatten() {
        if value != UNKNOWN {
            continue;
        }
        let old = prior.and_then(|p| p.attr(&key)).unwrap_or_default().to_string();
        let entry = diff
            .attributes
            .entry(key)
            .or_insert_with(|| AttrDiff::computed(old));
        entry.new_computed = true;
        entry.new.clear();
        if prior.is_some() {
            entry.requires_new = false;
        }
    }
}

fn apply_ignore_changes(diff: &mut InstanceDiff, ignore: &[String]) {
    if ignore.is_empty() {
        return;
    }
    diff.attributes.retain(|key, _| {
        !ignore.iter().any(|pattern| {
            pattern == "*" || key == pattern || key.starts_with(&format!("{pattern}."))
        })
    });
}

/// Full diff for replacing `prior`: every desired attribute as a create,
/// with the old values kept for display
fn replacement(
    provider: &dyn ResourceProvider,
    info: &InstanceInfo,
    prior: &InstanceState,
    config: &ResolvedConfig,
    original: &InstanceDiff,
) -> Result<InstanceDiff> {
    let mut diff = provider.diff(info, None, config)?;
    overlay_unknowns(&mut diff, None, config);

    for (key, attr) in &mut diff.attributes {
        if let Some(old) = prior.attr(key) {
            attr.old = old.to_string();
        }
        if original.attributes.get(key).is_some_and(|a| a.requires_new) {
            attr.requires_new = true;
        }
    }
    diff.attributes.insert(
        "id".to_string(),
        AttrDiff::computed(prior.id.clone()).forces_new(),
    );
    diff.destroy = true;
    Ok(diff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::ResourceAddress;
    use crate::diff::DiffAction;
    use crate::provider::PartialApply;
    use crate::value::Value;
    use std::collections::BTreeMap;

    /// Diffs flat attributes; `ami` forces replacement
    struct AmiProvider;

    impl ResourceProvider for AmiProvider {
        fn diff(
            &self,
            _info: &InstanceInfo,
            state: Option<&InstanceState>,
            config: &ResolvedConfig,
        ) -> Result<InstanceDiff> {
            let mut diff = InstanceDiff::between(state, &config.flatten());
            if let Some(attr) = diff.attributes.get_mut("ami")
                && state.is_some()
            {
                attr.requires_new = true;
            }
            Ok(diff)
        }

        fn apply(
            &self,
            _info: &InstanceInfo,
            _state: Option<&InstanceState>,
            _diff: &InstanceDiff,
        ) -> std::result::Result<Option<InstanceState>, PartialApply> {
            Ok(None)
        }
    }

    fn info() -> InstanceInfo {
        InstanceInfo::new(ResourceAddress::root("aws_instance.web".parse().unwrap()))
    }

    fn config(pairs: &[(&str, Value)]) -> ResolvedConfig {
        ResolvedConfig::new(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    fn prior() -> InstanceState {
        InstanceState::new("i-1")
            .with_attr("ami", "ami-old")
            .with_attr("size", "small")
    }

    #[test]
    fn test_create_has_synthetic_id() {
        let diff = diff_instance(
            &AmiProvider,
            &info(),
            None,
            &config(&[("ami", Value::string("ami-1"))]),
            &Lifecycle::default(),
        )
        .unwrap();
        assert_eq!(diff.action(), DiffAction::Create);
        assert!(diff.attributes["id"].new_computed);
    }

    #[test]
    fn test_equal_attributes_are_noop() {
        let diff = diff_instance(
            &AmiProvider,
            &info(),
            Some(&prior()),
            &config(&[("ami", Value::string("ami-old")), ("size", Value::string("small"))]),
            &Lifecycle::default(),
        )
        .unwrap();
        assert_eq!(diff.action(), DiffAction::NoOp);
    }

    #[test]
    fn test_tainted_is_always_replaced() {
        let diff = diff_instance(
            &AmiProvider,
            &info(),
            Some(&prior().tainted()),
            &config(&[("ami", Value::string("ami-old")), ("size", Value::string("small"))]),
            &Lifecycle::default(),
        )
        .unwrap();
        assert_eq!(diff.action(), DiffAction::DestroyThenCreate);
        assert!(diff.destroy_tainted);
    }

    #[test]
    fn test_requires_new_becomes_replacement() {
        let diff = diff_instance(
            &AmiProvider,
            &info(),
            Some(&prior()),
            &config(&[("ami", Value::string("ami-new")), ("size", Value::string("small"))]),
            &Lifecycle::default(),
        )
        .unwrap();
        assert_eq!(diff.action(), DiffAction::DestroyThenCreate);
        assert_eq!(diff.attributes["ami"].old, "ami-old");
        assert!(diff.attributes["ami"].requires_new);
        assert_eq!(diff.attributes["size"], AttrDiff::change("small", "small"));
    }

    #[test]
    fn test_unknown_never_forces_replacement() {
        let diff = diff_instance(
            &AmiProvider,
            &info(),
            Some(&prior()),
            &config(&[("ami", Value::Unknown), ("size", Value::string("small"))]),
            &Lifecycle::default(),
        )
        .unwrap();
        assert_eq!(diff.action(), DiffAction::Update);
        assert!(diff.attributes["ami"].new_computed);
    }

    #[test]
    fn test_ignore_changes_hides_updates_only() {
        let lifecycle = Lifecycle {
            ignore_changes: vec!["size".into()],
            ..Lifecycle::default()
        };
        let cfg = config(&[("ami", Value::string("ami-old")), ("size", Value::string("large"))]);

        let update = diff_instance(&AmiProvider, &info(), Some(&prior()), &cfg, &lifecycle).unwrap();
        assert_eq!(update.action(), DiffAction::NoOp);

        let create = diff_instance(&AmiProvider, &info(), None, &cfg, &lifecycle).unwrap();
        assert!(create.attributes.contains_key("size"));
    }

    #[test]
    fn test_prevent_destroy() {
        let lifecycle = Lifecycle {
            prevent_destroy: true,
            ..Lifecycle::default()
        };
        let err = diff_instance(
            &AmiProvider,
            &info(),
            Some(&prior()),
            &config(&[("ami", Value::string("ami-new"))]),
            &lifecycle,
        );
        assert!(err.is_err());
        assert!(diff_destroy(Some(&lifecycle)).is_err());
        assert!(diff_destroy(None).unwrap().destroy);
    }
}
