//! Human-readable Diff text

use super::{Diff, ModuleDiff};
use crate::value::COMPUTED_DISPLAY;
use std::fmt::{self, Write as _};

impl ModuleDiff {
    /// Text block for this module without any module header
    pub fn render(&self) -> String {
        let mut buf = String::new();
        if self.destroy {
            buf.push_str("DESTROY MODULE\n");
        }

        for (name, diff) in &self.resources {
            if diff.is_empty() {
                continue;
            }
            let extra = if !diff.destroy && diff.destroy_deposed {
                " (deposed only)"
            } else {
                ""
            };
            let _ = writeln!(buf, "{}: {name}{extra}", diff.crud());

            let width = diff
                .attributes
                .keys()
                .filter(|k| *k != "id")
                .map(String::len)
                .max()
                .unwrap_or(0);
            for (key, attr) in diff.attributes.iter().filter(|(k, _)| *k != "id") {
                let new = if attr.new_computed {
                    COMPUTED_DISPLAY
                } else {
                    attr.new.as_str()
                };
                let forces = if attr.requires_new {
                    " (forces new resource)"
                } else {
                    ""
                };
                let pad = " ".repeat(width - key.len());
                let _ = writeln!(buf, "  {key}:{pad} {:?} => {new:?}{forces}", attr.old);
            }
        }
        buf
    }
}

impl fmt::Display for Diff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut modules: Vec<&ModuleDiff> = self.modules.iter().filter(|m| !m.is_empty()).collect();
        modules.sort_by_key(|m| m.path.diff_sort_key());

        let mut buf = String::new();
        for module in modules {
            let body = module.render();
            if module.path.is_root() {
                buf.push_str(&body);
                buf.push('\n');
                continue;
            }
            let _ = writeln!(buf, "{}:", module.path.diff_sort_key());
            for line in body.lines() {
                let _ = writeln!(buf, "  {line}");
            }
        }
        f.write_str(buf.trim())
    }
}

#[cfg(test)]
mod tests {
    use crate::addr::ModulePath;
    use crate::diff::{AttrDiff, Diff, InstanceDiff, Plan};
    use crate::state::State;

    fn create(attrs: &[(&str, AttrDiff)]) -> InstanceDiff {
        let mut diff = InstanceDiff::default();
        diff.attributes
            .insert("id".into(), AttrDiff::computed("").forces_new());
        for (k, v) in attrs {
            diff.attributes.insert((*k).to_string(), v.clone());
        }
        diff
    }

    #[test]
    fn test_plan_text_for_computed_reference() {
        let mut diff = Diff::new();
        let root = ModulePath::root();
        diff.insert(
            &root,
            "aws_instance.foo".into(),
            create(&[
                ("dynamical", AttrDiff::computed("")),
                ("num", AttrDiff::change("", "2")),
                ("type", AttrDiff::change("", "aws_instance")),
            ]),
        );
        diff.insert(
            &root,
            "aws_instance.bar".into(),
            create(&[
                ("foo", AttrDiff::computed("")),
                ("type", AttrDiff::change("", "aws_instance")),
            ]),
        );

        let plan = Plan {
            diff,
            state: State::new(),
        };
        let expected = r#"DIFF:

CREATE: aws_instance.bar
  foo:  "" => "<computed>"
  type: "" => "aws_instance"
CREATE: aws_instance.foo
  dynamical: "" => "<computed>"
  num:       "" => "2"
  type:      "" => "aws_instance"

STATE:

<no state>"#;
        assert_eq!(plan.to_string(), expected);
    }

    #[test]
    fn test_module_destroy_and_annotations() {
        let mut diff = Diff::new();
        let child = ModulePath::new(["child"]);
        diff.ensure_module(&child).destroy = true;
        diff.insert(&child, "aws_instance.foo".into(), InstanceDiff::destroy());

        let mut replace = InstanceDiff {
            destroy: true,
            ..InstanceDiff::default()
        };
        replace
            .attributes
            .insert("require_new".into(), AttrDiff::change("abc", "xyz").forces_new());
        diff.insert(&ModulePath::root(), "aws_instance.bar".into(), replace);
        diff.insert(
            &ModulePath::root(),
            "aws_instance.baz".into(),
            InstanceDiff {
                destroy_deposed: true,
                ..InstanceDiff::default()
            },
        );

        let expected = r#"DESTROY/CREATE: aws_instance.bar
  require_new: "abc" => "xyz" (forces new resource)
DESTROY: aws_instance.baz (deposed only)

module.child:
  DESTROY MODULE
  DESTROY: aws_instance.foo"#;
        assert_eq!(diff.to_string(), expected);
    }

    #[test]
    fn test_modules_sorted_lexically() {
        let mut diff = Diff::new();
        for path in [ModulePath::new(["b"]), ModulePath::new(["a", "z"]), ModulePath::new(["a"])] {
            diff.insert(&path, "aws_instance.x".into(), InstanceDiff::destroy());
        }
        let headers: Vec<String> = diff
            .to_string()
            .lines()
            .filter(|l| l.starts_with("module."))
            .map(str::to_string)
            .collect();
        assert_eq!(headers, vec!["module.a:", "module.a.z:", "module.b:"]);
    }
}
