//! `tmt test|plan|story ls|show`: browse objects of the metadata tree.

use std::path::Path;

use anyhow::Result;
use serde_yaml::Value;

use crate::core::filter::{Filter, compile_patterns};
use crate::error::specification;
use crate::fmf::{Node, Tree};
use crate::io::output::Printer;

/// Kinds of metadata objects, each identified by one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Test,
    Plan,
    Story,
}

impl ObjectKind {
    pub fn key(self) -> &'static str {
        match self {
            ObjectKind::Test => "test",
            ObjectKind::Plan => "execute",
            ObjectKind::Story => "story",
        }
    }
}

/// Load the tree found at or above `start`.
pub fn load_tree(start: &Path) -> Result<Tree> {
    let root = Tree::find_root(start).map_err(|err| specification(format!("{err:#}")))?;
    Tree::load(&root).map_err(|err| specification(format!("{err:#}")))
}

/// Enabled objects of `kind` matching `names` (regex search) and `filters`.
pub fn select<'a>(tree: &'a Tree, kind: ObjectKind, names: &[String], filters: &[String]) -> Result<Vec<&'a Node>> {
    let names = compile_patterns(names).map_err(|err| specification(format!("{err:#}")))?;
    let filters = filters
        .iter()
        .map(|raw| Filter::parse(raw).map_err(|err| specification(format!("{err:#}"))))
        .collect::<Result<Vec<_>>>()?;
    Ok(tree
        .select(kind.key(), &names, &filters)
        .into_iter()
        .filter(|node| node.enabled())
        .collect())
}

/// Print one line per object name.
pub fn ls(nodes: &[&Node], printer: &Printer) {
    for node in nodes {
        printer.line(&node.name);
    }
}

/// Render a value for a `key: value` line; mappings and lists use flow style.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => serde_json::to_string(other).unwrap_or_else(|_| format!("{other:?}")),
    }
}

/// Print the object name followed by its keys, `summary` first.
pub fn show(nodes: &[&Node], printer: &Printer) {
    for node in nodes {
        printer.line(&printer.paint(&node.name, crate::io::output::Color::Bold));
        if let Some(summary) = node.get("summary") {
            printer.line(&crate::io::output::format_entry("summary", &render(summary), 1));
        }
        for (key, value) in &node.data {
            let Some(key) = key.as_str() else {
                continue;
            };
            if key == "summary" {
                continue;
            }
            printer.line(&crate::io::output::format_entry(key, &render(value), 1));
        }
        printer.line("");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tree(root: &Path) -> Tree {
        fs::create_dir_all(root.join(".fmf")).expect("fmf");
        fs::write(root.join(".fmf/version"), "1\n").expect("version");
        fs::write(
            root.join("tests.fmf"),
            "/smoke:\n  test: 'true'\n  tier: 1\n/slow:\n  test: sleep 100\n  tier: 2\n\
             /off:\n  test: 'true'\n  enabled: false\n",
        )
        .expect("tests");
        fs::write(root.join("plan.fmf"), "summary: All\nexecute:\n  how: tmt\n").expect("plan");
        Tree::load(root).expect("tree")
    }

    fn names(nodes: &[&Node]) -> Vec<String> {
        nodes.iter().map(|node| node.name.clone()).collect()
    }

    #[test]
    fn selects_by_kind_name_and_filter() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tree = tree(temp.path());
        let tests = select(&tree, ObjectKind::Test, &[], &[]).expect("tests");
        assert_eq!(names(&tests), ["/tests/smoke", "/tests/slow"]);
        let tier = select(&tree, ObjectKind::Test, &[], &["tier: 1".to_string()]).expect("tier");
        assert_eq!(names(&tier), ["/tests/smoke"]);
        let plans = select(&tree, ObjectKind::Plan, &["pla".to_string()], &[]).expect("plans");
        assert_eq!(names(&plans), ["/plan"]);
        assert!(select(&tree, ObjectKind::Story, &[], &[]).expect("stories").is_empty());
    }

    #[test]
    fn invalid_patterns_are_specification_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tree = tree(temp.path());
        let err = select(&tree, ObjectKind::Test, &["(".to_string()], &[]).expect_err("bad regex");
        assert_eq!(crate::error::kind_of(&err), crate::error::ErrorKind::Specification);
    }

    #[test]
    fn renders_nested_values_inline() {
        let value: Value = serde_yaml::from_str("{how: tmt}").expect("yaml");
        assert_eq!(render(&value), r#"{"how":"tmt"}"#);
        assert_eq!(render(&Value::from("x")), "x");
    }
}
