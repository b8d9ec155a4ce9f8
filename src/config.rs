//! Evaluated configuration tree
//!
//! The configuration language and its parser live outside the engine. What
//! arrives here is a tree of modules whose attribute values are expressions
//! over literals and references; the engine only needs the references to
//! order work and to propagate unknown values.

use crate::addr::ModulePath;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Which instances of a resource a reference addresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefIndex {
    /// `type.name.attr`
    Single,
    /// `type.name.N.attr`
    Index(usize),
    /// `type.name.*.attr`
    Splat,
}

/// A reference from one configuration value to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reference {
    /// `var.name`
    Var(String),
    /// `count.index`
    CountIndex,
    /// `self.attr`, only meaningful inside provisioner blocks
    SelfAttr(String),
    /// `type.name[.N|.*].attr`
    Resource {
        kind: String,
        name: String,
        index: RefIndex,
        attr: String,
    },
    /// `module.name.output`
    Module { name: String, output: String },
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Var(name) => write!(f, "var.{name}"),
            Self::CountIndex => write!(f, "count.index"),
            Self::SelfAttr(attr) => write!(f, "self.{attr}"),
            Self::Resource {
                kind,
                name,
                index,
                attr,
            } => match index {
                RefIndex::Single => write!(f, "{kind}.{name}.{attr}"),
                RefIndex::Index(i) => write!(f, "{kind}.{name}.{i}.{attr}"),
                RefIndex::Splat => write!(f, "{kind}.{name}.*.{attr}"),
            },
            Self::Module { name, output } => write!(f, "module.{name}.{output}"),
        }
    }
}

/// Error parsing a reference string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid reference {0:?}")]
pub struct ReferenceParseError(pub String);

impl FromStr for Reference {
    type Err = ReferenceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        let reference = match parts.as_slice() {
            ["var", name] => Self::Var((*name).to_string()),
            ["count", "index"] => Self::CountIndex,
            ["self", attr @ ..] if !attr.is_empty() => Self::SelfAttr(attr.join(".")),
            ["module", name, output] => Self::Module {
                name: (*name).to_string(),
                output: (*output).to_string(),
            },
            [kind, name, "*", attr @ ..] if !attr.is_empty() => Self::Resource {
                kind: (*kind).to_string(),
                name: (*name).to_string(),
                index: RefIndex::Splat,
                attr: attr.join("."),
            },
            [kind, name, index, attr @ ..] if !attr.is_empty() && index.parse::<usize>().is_ok() => {
                Self::Resource {
                    kind: (*kind).to_string(),
                    name: (*name).to_string(),
                    index: RefIndex::Index(index.parse().map_err(|_| ReferenceParseError(s.into()))?),
                    attr: attr.join("."),
                }
            }
            [kind, name, attr @ ..] if !attr.is_empty() => Self::Resource {
                kind: (*kind).to_string(),
                name: (*name).to_string(),
                index: RefIndex::Single,
                attr: attr.join("."),
            },
            _ => return Err(ReferenceParseError(s.to_string())),
        };
        Ok(reference)
    }
}

/// An attribute value expression
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expr {
    Literal(Value),
    Ref(Reference),
    /// String interpolation of the parts in order
    Concat(Vec<Expr>),
    /// Elements of a list joined with a separator
    Join { separator: String, list: Box<Expr> },
    List(Vec<Expr>),
    Map(BTreeMap<String, Expr>),
}

impl Expr {
    /// Literal string
    pub fn lit(s: impl Into<String>) -> Self {
        Self::Literal(Value::String(s.into()))
    }

    /// Reference parsed from its dotted form
    pub fn try_reference(raw: &str) -> Result<Self, ReferenceParseError> {
        raw.parse().map(Self::Ref)
    }

    #[cfg(test)]
    pub(crate) fn reference(raw: &str) -> Self {
        Self::try_reference(raw).unwrap()
    }

    pub fn join(separator: impl Into<String>, list: Expr) -> Self {
        Self::Join {
            separator: separator.into(),
            list: Box::new(list),
        }
    }

    /// Every reference this expression mentions, in order of appearance
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Literal(_) => {}
            Self::Ref(r) => out.push(r),
            Self::Concat(parts) | Self::List(parts) => {
                for part in parts {
                    part.collect_references(out);
                }
            }
            Self::Join { list, .. } => list.collect_references(out),
            Self::Map(entries) => {
                for value in entries.values() {
                    value.collect_references(out);
                }
            }
        }
    }
}

/// Lifecycle options of a resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    #[serde(default)]
    pub create_before_destroy: bool,
    #[serde(default)]
    pub prevent_destroy: bool,
    /// Attribute names (or prefixes, or `*`) whose drift is not diffed
    #[serde(default)]
    pub ignore_changes: Vec<String>,
}

/// A provisioner attached to a resource, run after creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    pub kind: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, Expr>,
}

impl ProvisionerConfig {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn attr(mut self, key: impl Into<String>, value: Expr) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }
}

/// One `resource` block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub kind: String,
    pub name: String,
    /// Absent means a single unindexed instance
    #[serde(default)]
    pub count: Option<Expr>,
    /// Explicit provider key such as `aws.west`
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub attrs: BTreeMap<String, Expr>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    #[serde(default)]
    pub provisioners: Vec<ProvisionerConfig>,
}

impl ResourceConfig {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            count: None,
            provider: None,
            attrs: BTreeMap::new(),
            depends_on: Vec::new(),
            lifecycle: Lifecycle::default(),
            provisioners: Vec::new(),
        }
    }

    pub fn attr(mut self, key: impl Into<String>, value: Expr) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }

    pub fn count(mut self, count: Expr) -> Self {
        self.count = Some(count);
        self
    }

    pub fn provider(mut self, key: impl Into<String>) -> Self {
        self.provider = Some(key.into());
        self
    }

    pub fn depends_on(mut self, target: impl Into<String>) -> Self {
        self.depends_on.push(target.into());
        self
    }

    pub fn create_before_destroy(mut self) -> Self {
        self.lifecycle.create_before_destroy = true;
        self
    }

    pub fn prevent_destroy(mut self) -> Self {
        self.lifecycle.prevent_destroy = true;
        self
    }

    pub fn ignore_changes(mut self, attr: impl Into<String>) -> Self {
        self.lifecycle.ignore_changes.push(attr.into());
        self
    }

    pub fn provisioner(mut self, provisioner: ProvisionerConfig) -> Self {
        self.provisioners.push(provisioner);
        self
    }

    /// `type.name`
    pub fn id(&self) -> String {
        format!("{}.{}", self.kind, self.name)
    }

    /// Provider key this resource is served by
    ///
    /// Defaults to the resource type prefix before the first underscore.
    pub fn provider_key(&self) -> String {
        self.provider
            .clone()
            .unwrap_or_else(|| provider_key_for_kind(&self.kind))
    }

    /// References that order this resource after others
    ///
    /// `self` references inside provisioners and `count.index` are local
    /// and excluded.
    pub fn references(&self) -> Vec<&Reference> {
        let mut refs: Vec<&Reference> = Vec::new();
        if let Some(count) = &self.count {
            refs.extend(count.references());
        }
        for expr in self.attrs.values() {
            refs.extend(expr.references());
        }
        for provisioner in &self.provisioners {
            for expr in provisioner.attrs.values() {
                refs.extend(expr.references());
            }
        }
        refs.retain(|r| !matches!(r, Reference::SelfAttr(_) | Reference::CountIndex));
        refs
    }

    /// Dependency list recorded on every instance after a successful apply
    pub fn recorded_dependencies(&self) -> Vec<String> {
        let mut deps: Vec<String> = self
            .references()
            .into_iter()
            .filter_map(|r| match r {
                Reference::Resource { kind, name, .. } => Some(format!("{kind}.{name}")),
                Reference::Module { name, .. } => Some(format!("module.{name}")),
                _ => None,
            })
            .filter(|dep| *dep != self.id())
            .collect();
        deps.extend(self.depends_on.iter().cloned());
        deps.sort();
        deps.dedup();
        deps
    }
}

/// Provider key implied by a resource type (`aws_instance` is served by `aws`)
pub fn provider_key_for_kind(kind: &str) -> String {
    kind.split('_').next().unwrap_or(kind).to_string()
}

/// One `provider` block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub attrs: BTreeMap<String, Expr>,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            attrs: BTreeMap::new(),
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn attr(mut self, key: impl Into<String>, value: Expr) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }

    /// `name` or `name.alias`
    pub fn key(&self) -> String {
        match &self.alias {
            Some(alias) => format!("{}.{}", self.name, alias),
            None => self.name.clone(),
        }
    }
}

/// One `output` block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub name: String,
    pub value: Expr,
}

/// A `module` block: a child module plus the inputs passed to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleCall {
    pub name: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, Expr>,
    pub module: ModuleConfig,
}

/// Body of one module
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Declared variables and their defaults
    #[serde(default)]
    pub variables: BTreeMap<String, Option<Value>>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
    #[serde(default)]
    pub modules: Vec<ModuleCall>,
}

impl ModuleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn variable(mut self, name: impl Into<String>, default: Option<Value>) -> Self {
        self.variables.insert(name.into(), default);
        self
    }

    pub fn provider(mut self, provider: ProviderConfig) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn resource(mut self, resource: ResourceConfig) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn output(mut self, name: impl Into<String>, value: Expr) -> Self {
        self.outputs.push(OutputConfig {
            name: name.into(),
            value,
        });
        self
    }

    pub fn module(mut self, name: impl Into<String>, module: ModuleConfig) -> Self {
        self.modules.push(ModuleCall {
            name: name.into(),
            inputs: BTreeMap::new(),
            module,
        });
        self
    }

    pub fn module_with_inputs(
        mut self,
        name: impl Into<String>,
        inputs: BTreeMap<String, Expr>,
        module: ModuleConfig,
    ) -> Self {
        self.modules.push(ModuleCall {
            name: name.into(),
            inputs,
            module,
        });
        self
    }

    pub fn find_resource(&self, kind: &str, name: &str) -> Option<&ResourceConfig> {
        self.resources
            .iter()
            .find(|r| r.kind == kind && r.name == name)
    }

    pub fn find_module(&self, name: &str) -> Option<&ModuleCall> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Descend to the module at `path`, if it is configured
    pub fn descendant(&self, path: &ModulePath) -> Option<&ModuleConfig> {
        let mut current = self;
        for name in path.names() {
            current = &current.find_module(name)?.module;
        }
        Some(current)
    }

    /// Every configured module with its path, parents before children
    pub fn walk_modules(&self) -> Vec<(ModulePath, &ModuleConfig)> {
        let mut out = vec![(ModulePath::root(), self)];
        let mut i = 0;
        while i < out.len() {
            let (path, module) = (out[i].0.clone(), out[i].1);
            for call in &module.modules {
                out.push((path.child(&call.name), &call.module));
            }
            i += 1;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_references() {
        assert_eq!("var.region".parse(), Ok(Reference::Var("region".into())));
        assert_eq!("count.index".parse(), Ok(Reference::CountIndex));
        assert_eq!(
            "aws_instance.foo.*.id".parse(),
            Ok(Reference::Resource {
                kind: "aws_instance".into(),
                name: "foo".into(),
                index: RefIndex::Splat,
                attr: "id".into(),
            })
        );
        assert_eq!(
            "aws_instance.foo.2.num".parse::<Reference>().unwrap().to_string(),
            "aws_instance.foo.2.num"
        );
        assert_eq!(
            "module.child.leader".parse(),
            Ok(Reference::Module {
                name: "child".into(),
                output: "leader".into()
            })
        );
        assert!("aws_instance.foo".parse::<Reference>().is_err());
    }

    #[test]
    fn test_try_reference() {
        assert_eq!(
            Expr::try_reference("var.region"),
            Ok(Expr::Ref(Reference::Var("region".into())))
        );
        assert_eq!(
            Expr::try_reference("aws_instance"),
            Err(ReferenceParseError("aws_instance".into()))
        );
    }

    #[test]
    fn test_recorded_dependencies_exclude_self_and_locals() {
        let resource = ResourceConfig::new("aws_instance", "bar")
            .attr("foo", Expr::reference("aws_instance.foo.id"))
            .attr("other", Expr::reference("aws_instance.foo.*.num"))
            .attr("idx", Expr::reference("count.index"))
            .attr("mod", Expr::reference("module.child.out"))
            .provisioner(
                ProvisionerConfig::new("shell").attr("cmd", Expr::reference("self.id")),
            )
            .depends_on("aws_instance.baz");

        assert_eq!(
            resource.recorded_dependencies(),
            vec!["aws_instance.baz", "aws_instance.foo", "module.child"]
        );
    }

    #[test]
    fn test_provider_key() {
        assert_eq!(ResourceConfig::new("aws_instance", "a").provider_key(), "aws");
        assert_eq!(
            ResourceConfig::new("aws_instance", "a").provider("aws.west").provider_key(),
            "aws.west"
        );
        assert_eq!(ProviderConfig::new("aws").alias("west").key(), "aws.west");
    }

    #[test]
    fn test_walk_modules_and_descendant() {
        let config = ModuleConfig::new().module(
            "child",
            ModuleConfig::new().module("sub", ModuleConfig::new()),
        );
        let paths: Vec<String> = config
            .walk_modules()
            .iter()
            .map(|(p, _)| p.to_string())
            .collect();
        assert_eq!(paths, vec!["root", "module.child", "module.child.sub"]);
        assert!(config.descendant(&ModulePath::new(["child", "sub"])).is_some());
        assert!(config.descendant(&ModulePath::new(["gone"])).is_none());
    }
}
