//! Human-readable State text

use super::{ModuleState, State};
use std::fmt::{self, Write as _};

impl ModuleState {
    /// Text block for this module without any module header
    pub fn render(&self) -> String {
        let mut buf = String::new();
        if self.resources.is_empty() {
            buf.push_str("<no state>");
        }

        for (key, resource) in &self.resources {
            let id = resource
                .primary
                .as_ref()
                .map(|p| p.id.as_str())
                .filter(|id| !id.is_empty())
                .unwrap_or("<not created>");
            let taint = match resource.tainted_count() {
                0 => String::new(),
                1 if resource.tainted.is_empty() => " (tainted)".to_string(),
                n => format!(" ({n} tainted)"),
            };
            let deposed = if resource.deposed.is_empty() {
                String::new()
            } else {
                format!(" ({} deposed)", resource.deposed.len())
            };

            let _ = writeln!(buf, "{key}:{taint}{deposed}");
            let _ = writeln!(buf, "  ID = {id}");
            if let Some(provider) = &resource.provider {
                let _ = writeln!(buf, "  provider = {provider}");
            }
            if let Some(primary) = &resource.primary {
                for (k, v) in primary.attributes.iter().filter(|(k, _)| *k != "id") {
                    let _ = writeln!(buf, "  {k} = {v}");
                }
            }
            for (i, t) in resource.tainted.iter().enumerate() {
                let _ = writeln!(buf, "  Tainted ID {} = {}", i + 1, t.id);
            }
            for (i, d) in resource.deposed.iter().enumerate() {
                let taint = if d.tainted { " (tainted)" } else { "" };
                let _ = writeln!(buf, "  Deposed ID {} = {}{taint}", i + 1, d.id);
            }
            if !resource.dependencies.is_empty() {
                buf.push_str("\n  Dependencies:\n");
                for dep in &resource.dependencies {
                    let _ = writeln!(buf, "    {dep}");
                }
            }
        }

        if !self.outputs.is_empty() {
            buf.push_str("\nOutputs:\n\n");
            for (k, v) in &self.outputs {
                let _ = writeln!(buf, "{k} = {v}");
            }
        }
        buf
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.modules.is_empty() {
            return f.write_str("<no state>");
        }

        let mut buf = String::new();
        for module in &self.modules {
            let body = module.render();
            if module.path.is_root() {
                buf.push_str(&body);
                buf.push('\n');
                continue;
            }
            let _ = writeln!(buf, "{}:", module.path);
            for line in body.lines() {
                if line.is_empty() {
                    buf.push('\n');
                } else {
                    let _ = writeln!(buf, "  {line}");
                }
            }
        }
        f.write_str(buf.trim())
    }
}

#[cfg(test)]
mod tests {
    use crate::addr::{ModulePath, ResourceAddress};
    use crate::state::{InstanceState, ResourceState, State};
    use crate::value::Value;

    fn addr(raw: &str) -> ResourceAddress {
        ResourceAddress::root(raw.parse().unwrap())
    }

    #[test]
    fn test_empty_state() {
        assert_eq!(State::new().to_string(), "<no state>");
    }

    #[test]
    fn test_render_resources_dependencies_and_outputs() {
        let mut state = State::new();
        state.set_resource(
            &addr("aws_instance.foo"),
            ResourceState::new(
                "aws_instance",
                InstanceState::new("foo")
                    .with_attr("num", "2")
                    .with_attr("type", "aws_instance")
                    .with_attr("id", "foo"),
            ),
        );
        state.set_resource(
            &addr("aws_instance.bar"),
            ResourceState::new(
                "aws_instance",
                InstanceState::new("foo").with_attr("foo", "computed_dynamical"),
            )
            .with_dependency("aws_instance.foo"),
        );
        state
            .ensure_module(&ModulePath::root())
            .outputs
            .insert("foo_num".into(), Value::list(["bar", "bar"]));

        let expected = "\
aws_instance.bar:
  ID = foo
  foo = computed_dynamical

  Dependencies:
    aws_instance.foo
aws_instance.foo:
  ID = foo
  num = 2
  type = aws_instance

Outputs:

foo_num = [bar,bar]";
        assert_eq!(state.to_string(), expected);
    }

    #[test]
    fn test_render_tainted_deposed_and_provider() {
        let mut state = State::new();
        state.set_resource(
            &addr("aws_instance.bar"),
            ResourceState::new(
                "aws_instance",
                InstanceState::new("bar").with_attr("require_new", "abc"),
            )
            .with_deposed(InstanceState::new("foo").tainted()),
        );
        state.set_resource(
            &addr("aws_instance.baz"),
            ResourceState::new("aws_instance", InstanceState::new("baz").tainted())
                .with_provider("aws.west"),
        );

        let expected = "\
aws_instance.bar: (1 deposed)
  ID = bar
  require_new = abc
  Deposed ID 1 = foo (tainted)
aws_instance.baz: (tainted)
  ID = baz
  provider = aws.west";
        assert_eq!(state.to_string(), expected);
    }

    #[test]
    fn test_render_multiple_tainted() {
        let mut state = State::new();
        state.set_resource(
            &addr("aws_instance.bar"),
            ResourceState::tainted_only("aws_instance", [InstanceState::new("baz"), InstanceState::new("zip")]),
        );
        state.set_resource(
            &addr("aws_instance.foo"),
            ResourceState::new("aws_instance", InstanceState::new("foo").tainted())
                .with_tainted(InstanceState::new("old")),
        );

        let expected = "\
aws_instance.bar: (2 tainted)
  ID = <not created>
  Tainted ID 1 = baz
  Tainted ID 2 = zip
aws_instance.foo: (2 tainted)
  ID = foo
  Tainted ID 1 = old";
        assert_eq!(state.to_string(), expected);
    }

    #[test]
    fn test_render_nested_modules_indented() {
        let mut state = State::new();
        let child = ModulePath::new(["child"]);
        state.set_resource(
            &ResourceAddress::new(child.clone(), "aws_instance.baz".parse().unwrap()),
            ResourceState::new("aws_instance", InstanceState::new("foo").with_attr("foo", "bar")),
        );
        state
            .ensure_module(&ModulePath::new(["child", "sub"]))
            .outputs
            .insert("leader".into(), Value::string("1"));

        let expected = "\
<no state>
module.child:
  aws_instance.baz:
    ID = foo
    foo = bar
module.child.sub:
  <no state>
  Outputs:

  leader = 1";
        assert_eq!(state.to_string(), expected);
    }
}
