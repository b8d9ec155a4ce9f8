//! Expression evaluation against the state of a walk
//!
//! In lenient mode (plan walks, teardown) a value that cannot be resolved
//! yet evaluates to [`Value::Unknown`] and the unknown-ness flows into every
//! expression built from it. In strict mode a missing value is an error.

use crate::addr::ModulePath;
use crate::config::{Expr, RefIndex, Reference};
use crate::provider::ResolvedConfig;
use crate::state::{InstanceState, ModuleState, State};
use crate::value::{UNKNOWN, Value};
use anyhow::{Result, anyhow, bail};
use std::collections::BTreeMap;

/// Everything an expression can see
pub(crate) struct Scope<'a> {
    pub module: &'a ModulePath,
    pub state: &'a State,
    pub vars: &'a BTreeMap<String, Value>,
    pub count_index: Option<usize>,
    /// Instance `self.*` refers to inside provisioner blocks
    pub self_state: Option<&'a InstanceState>,
    pub lenient: bool,
}

impl Scope<'_> {
    pub(crate) fn eval(&self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Ref(r) => self.resolve(r),
            Expr::Concat(parts) => {
                let mut out = String::new();
                for part in parts {
                    match self.eval(part)? {
                        Value::String(s) if s != UNKNOWN => out.push_str(&s),
                        Value::Unknown | Value::String(_) => return Ok(Value::Unknown),
                        other => bail!("cannot interpolate {other} into a string"),
                    }
                }
                Ok(Value::String(out))
            }
            Expr::Join { separator, list } => match self.eval(list)? {
                Value::List(items) => {
                    let mut parts = Vec::with_capacity(items.len());
                    for item in items {
                        match item {
                            Value::String(s) if s != UNKNOWN => parts.push(s),
                            Value::Unknown | Value::String(_) => return Ok(Value::Unknown),
                            other => bail!("cannot join nested value {other}"),
                        }
                    }
                    Ok(Value::String(parts.join(separator)))
                }
                Value::Unknown => Ok(Value::Unknown),
                other => bail!("join expects a list, got {other}"),
            },
            Expr::List(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::List),
            Expr::Map(entries) => entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), self.eval(v)?)))
                .collect::<Result<BTreeMap<_, _>>>()
                .map(Value::Map),
        }
    }

    /// Evaluate every attribute of a block
    pub(crate) fn eval_block(&self, attrs: &BTreeMap<String, Expr>) -> Result<ResolvedConfig> {
        let mut out = BTreeMap::new();
        for (key, expr) in attrs {
            let value = self
                .eval(expr)
                .map_err(|e| e.context(format!("evaluating {key}")))?;
            out.insert(key.clone(), value);
        }
        Ok(ResolvedConfig::new(out))
    }

    fn resolve(&self, reference: &Reference) -> Result<Value> {
        match reference {
            Reference::Var(name) => self
                .vars
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("unknown variable {name}")),
            Reference::CountIndex => Ok(Value::String(self.count_index.unwrap_or(0).to_string())),
            Reference::SelfAttr(attr) => {
                let instance = self
                    .self_state
                    .ok_or_else(|| anyhow!("self.{attr} used outside a provisioner"))?;
                self.attribute(instance, attr, "self")
            }
            Reference::Resource {
                kind,
                name,
                index,
                attr,
            } => self.resolve_resource(kind, name, index, attr, reference),
            Reference::Module { name, output } => {
                let value = self
                    .state
                    .module(&self.module.child(name))
                    .and_then(|m| m.outputs.get(output));
                match value {
                    Some(v) => Ok(v.clone()),
                    None if self.lenient => Ok(Value::Unknown),
                    None => Err(anyhow!("module.{name} has no output {output}")),
                }
            }
        }
    }

    fn resolve_resource(
        &self,
        kind: &str,
        name: &str,
        index: &RefIndex,
        attr: &str,
        reference: &Reference,
    ) -> Result<Value> {
        let module = self.state.module(self.module);

        if *index == RefIndex::Splat {
            let Some(module) = module else {
                return Ok(Value::List(Vec::new()));
            };
            let mut items = Vec::new();
            for key in module.instances_of(kind, name) {
                if let Some(instance) = module.resources[&key].primary.as_ref() {
                    items.push(self.attribute(instance, attr, &reference.to_string())?);
                }
            }
            return Ok(Value::List(items));
        }

        let instance = module.and_then(|m| find_instance(m, kind, name, index));
        match instance {
            Some(instance) => self.attribute(instance, attr, &reference.to_string()),
            None if self.lenient => Ok(Value::Unknown),
            None => Err(anyhow!("{kind}.{name} has no instance for {reference}")),
        }
    }

    fn attribute(&self, instance: &InstanceState, attr: &str, what: &str) -> Result<Value> {
        match instance.value(attr) {
            Some(Value::String(s)) if s == UNKNOWN => Ok(Value::Unknown),
            Some(v) => Ok(v),
            // a record still being planned has no attributes to speak of
            None if self.lenient && instance.id == UNKNOWN => Ok(Value::Unknown),
            None => Err(anyhow!("{what}: attribute {attr} is not set")),
        }
    }
}

/// Instance addressed by a single-instance reference
///
/// `type.name` falls back to index 0 and `type.name.0` to the bare record,
/// so references survive a count change in either direction.
fn find_instance<'a>(
    module: &'a ModuleState,
    kind: &str,
    name: &str,
    index: &RefIndex,
) -> Option<&'a InstanceState> {
    let lookup = |i: Option<usize>| {
        module
            .resources
            .iter()
            .find(|(k, _)| k.is_instance_of(kind, name) && k.index == i)
            .and_then(|(_, r)| r.primary.as_ref())
    };
    match index {
        RefIndex::Single => lookup(None).or_else(|| lookup(Some(0))),
        RefIndex::Index(0) => lookup(Some(0)).or_else(|| lookup(None)),
        RefIndex::Index(i) => lookup(Some(*i)),
        RefIndex::Splat => None,
    }
}

/// Evaluate an expression that may only use variables and literals
///
/// Used for `count`, which must be known before the graph exists.
pub(crate) fn eval_static(expr: &Expr, vars: &BTreeMap<String, Value>) -> Option<Value> {
    let only_vars = expr
        .references()
        .iter()
        .all(|r| matches!(r, Reference::Var(_)));
    if !only_vars {
        return None;
    }
    let root = ModulePath::root();
    let state = State::new();
    let scope = Scope {
        module: &root,
        state: &state,
        vars,
        count_index: None,
        self_state: None,
        lenient: false,
    };
    scope.eval(expr).ok().filter(Value::is_known)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{ResourceAddress, ResourceKey};
    use crate::state::ResourceState;

    fn state() -> State {
        let mut state = State::new();
        for (key, id, foo) in [
            ("aws_instance.foo.0", "a", "x"),
            ("aws_instance.foo.1", "b", "y"),
            ("aws_instance.single", "c", "z"),
            ("aws_instance.planned", UNKNOWN, UNKNOWN),
        ] {
            let key: ResourceKey = key.parse().unwrap();
            state.set_resource(
                &ResourceAddress::root(key),
                ResourceState::new("aws_instance", InstanceState::new(id).with_attr("foo", foo)),
            );
        }
        state
            .ensure_module(&ModulePath::new(["child"]))
            .outputs
            .insert("leader".into(), Value::string("1"));
        state
    }

    fn eval(expr: &Expr, lenient: bool) -> Result<Value> {
        let state = state();
        let root = ModulePath::root();
        let mut vars = BTreeMap::new();
        vars.insert("region".to_string(), Value::string("us-east-1"));
        let scope = Scope {
            module: &root,
            state: &state,
            vars: &vars,
            count_index: Some(2),
            self_state: None,
            lenient,
        };
        scope.eval(expr)
    }

    #[test]
    fn test_references() {
        assert_eq!(eval(&Expr::reference("var.region"), false).unwrap(), Value::string("us-east-1"));
        assert_eq!(eval(&Expr::reference("count.index"), false).unwrap(), Value::string("2"));
        assert_eq!(
            eval(&Expr::reference("aws_instance.foo.1.foo"), false).unwrap(),
            Value::string("y")
        );
        assert_eq!(
            eval(&Expr::reference("aws_instance.single.0.id"), false).unwrap(),
            Value::string("c")
        );
        assert_eq!(
            eval(&Expr::reference("aws_instance.foo.foo"), false).unwrap(),
            Value::string("x")
        );
        assert_eq!(
            eval(&Expr::reference("module.child.leader"), false).unwrap(),
            Value::string("1")
        );
    }

    #[test]
    fn test_splat_and_join() {
        let splat = Expr::reference("aws_instance.foo.*.foo");
        assert_eq!(eval(&splat, false).unwrap(), Value::list(["x", "y"]));
        assert_eq!(
            eval(&Expr::join(",", splat), false).unwrap(),
            Value::string("x,y")
        );
        assert_eq!(
            eval(&Expr::join(",", Expr::reference("aws_instance.none.*.foo")), false).unwrap(),
            Value::string("")
        );
    }

    #[test]
    fn test_unknown_propagates() {
        let concat = Expr::Concat(vec![Expr::lit("id-"), Expr::reference("aws_instance.planned.foo")]);
        assert_eq!(eval(&concat, true).unwrap(), Value::Unknown);
        assert_eq!(
            eval(&Expr::reference("aws_instance.planned.missing"), true).unwrap(),
            Value::Unknown
        );
        assert_eq!(
            eval(&Expr::reference("aws_instance.gone.foo"), true).unwrap(),
            Value::Unknown
        );
    }

    #[test]
    fn test_strict_mode_errors() {
        assert!(eval(&Expr::reference("aws_instance.gone.foo"), false).is_err());
        assert!(eval(&Expr::reference("aws_instance.single.missing"), false).is_err());
        assert!(eval(&Expr::reference("var.missing"), false).is_err());
        assert!(eval(&Expr::reference("self.foo"), false).is_err());
    }

    #[test]
    fn test_eval_static() {
        let mut vars = BTreeMap::new();
        vars.insert("n".to_string(), Value::string("3"));
        assert_eq!(eval_static(&Expr::reference("var.n"), &vars), Some(Value::string("3")));
        assert_eq!(eval_static(&Expr::lit("2"), &vars), Some(Value::string("2")));
        assert_eq!(eval_static(&Expr::reference("aws_instance.foo.count"), &vars), None);

        vars.insert("later".to_string(), Value::Unknown);
        assert_eq!(eval_static(&Expr::reference("var.later"), &vars), None);
    }
}
