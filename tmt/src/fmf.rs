//! Metadata tree reader.
//!
//! A tree root is a directory containing `.fmf/version`. Every directory is a
//! node whose data lives in `main.fmf`; any other `x.fmf` file defines the
//! child `/x`, and mapping keys starting with `/` define nested children.
//! Children inherit their parent's data:
//!
//! - plain keys override (mappings merge recursively),
//! - `key+` extends a list, string or mapping,
//! - `key-` removes list items, substrings or mapping keys.
//!
//! Hidden entries and nested tree roots are skipped.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde_yaml::{Mapping, Value};
use tracing::{debug, instrument};

use crate::core::filter::{Filter, name_selected};

pub const VERSION_FILE: &str = ".fmf/version";
const MAIN_FILE: &str = "main.fmf";
const SUFFIX: &str = ".fmf";

/// One node of the tree with fully inherited data.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub data: Mapping,
    /// Directory holding the file that defined this node.
    pub source_dir: PathBuf,
    pub children: Vec<Node>,
    /// Whether any file contributed data at or below this node.
    defined: bool,
}

impl Node {
    fn new(name: String, data: Mapping, source_dir: PathBuf) -> Self {
        Self {
            name,
            data,
            source_dir,
            children: Vec::new(),
            defined: false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// `enabled` key, defaulting to true.
    pub fn enabled(&self) -> bool {
        self.get("enabled").and_then(Value::as_bool).unwrap_or(true)
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Node>) {
        if self.is_leaf() {
            out.push(self);
            return;
        }
        for child in &self.children {
            child.collect_leaves(out);
        }
    }
}

/// A loaded metadata tree.
#[derive(Debug, Clone)]
pub struct Tree {
    root: PathBuf,
    top: Node,
}

impl Tree {
    /// Load the tree rooted at `root` (the directory holding `.fmf/`).
    #[instrument(skip_all, fields(root = %root.display()))]
    pub fn load(root: &Path) -> Result<Self> {
        if !root.join(VERSION_FILE).is_file() {
            return Err(anyhow!(
                "no metadata tree found at {} (missing {VERSION_FILE})",
                root.display()
            ));
        }
        let root = root
            .canonicalize()
            .with_context(|| format!("resolve {}", root.display()))?;
        let top = load_dir(&root, "/", &Mapping::new())?;
        debug!(nodes = top.children.len(), "metadata tree loaded");
        Ok(Self { root, top })
    }

    /// Walk up from `start` to the nearest directory holding `.fmf/version`.
    pub fn find_root(start: &Path) -> Result<PathBuf> {
        let start = start
            .canonicalize()
            .with_context(|| format!("resolve {}", start.display()))?;
        start
            .ancestors()
            .find(|dir| dir.join(VERSION_FILE).is_file())
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("no metadata tree found in {} or its parents", start.display()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Leaf nodes in depth-first order.
    pub fn leaves(&self) -> Vec<&Node> {
        let mut out = Vec::new();
        self.top.collect_leaves(&mut out);
        out
    }

    pub fn find(&self, name: &str) -> Option<&Node> {
        fn walk<'a>(node: &'a Node, name: &str) -> Option<&'a Node> {
            if node.name == name {
                return Some(node);
            }
            node.children.iter().find_map(|child| walk(child, name))
        }
        walk(&self.top, name)
    }

    /// Leaves that carry `key`, match any of `names` and every filter.
    pub fn select<'a>(&'a self, key: &str, names: &[Regex], filters: &[Filter]) -> Vec<&'a Node> {
        self.leaves()
            .into_iter()
            .filter(|node| node.data.contains_key(key))
            .filter(|node| name_selected(&node.name, names))
            .filter(|node| filters.iter().all(|filter| filter.matches(&node.data)))
            .collect()
    }
}

/// Create `.fmf/version` under `root`. Returns false when it already exists.
pub fn init_tree(root: &Path) -> Result<bool> {
    let version = root.join(VERSION_FILE);
    if version.exists() {
        return Ok(false);
    }
    let parent = root.join(".fmf");
    fs::create_dir_all(&parent).with_context(|| format!("create {}", parent.display()))?;
    fs::write(&version, "1\n").with_context(|| format!("write {}", version.display()))?;
    Ok(true)
}

fn child_name(parent: &str, child: &str) -> String {
    let child = child.trim_start_matches('/');
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

fn load_dir(dir: &Path, name: &str, inherited: &Mapping) -> Result<Node> {
    let mut node = Node::new(name.to_string(), inherited.clone(), dir.to_path_buf());

    let main = dir.join(MAIN_FILE);
    if main.is_file() {
        let data = read_fmf(&main)?;
        apply_document(&mut node, data, dir)?;
        node.defined = true;
    }

    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("read directory {}", dir.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("list {}", dir.display()))?;
    entries.sort();

    for path in entries {
        let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        if file_name.starts_with('.') {
            continue;
        }
        if path.is_dir() {
            if path.join(VERSION_FILE).is_file() {
                debug!(path = %path.display(), "skipping nested metadata tree");
                continue;
            }
            let child = load_dir(&path, &child_name(name, &file_name), &node.data)?;
            if child.defined {
                node.defined = true;
                node.children.push(child);
            }
        } else if file_name != MAIN_FILE
            && let Some(stem) = file_name.strip_suffix(SUFFIX)
        {
            let mut child = Node::new(child_name(name, stem), node.data.clone(), dir.to_path_buf());
            apply_document(&mut child, read_fmf(&path)?, dir)?;
            child.defined = true;
            node.defined = true;
            node.children.push(child);
        }
    }
    Ok(node)
}

fn read_fmf(path: &Path) -> Result<Mapping> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value: Value =
        serde_yaml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    match value {
        Value::Null => Ok(Mapping::new()),
        Value::Mapping(map) => Ok(map),
        _ => Err(anyhow!("{} must contain a mapping", path.display())),
    }
}

/// Merge a document into `node`, splitting off `/child` keys into children.
fn apply_document(node: &mut Node, document: Mapping, dir: &Path) -> Result<()> {
    let mut children = Vec::new();
    let mut own = Mapping::new();
    for (key, value) in document {
        match key.as_str() {
            Some(k) if k.starts_with('/') => children.push((k.to_string(), value)),
            _ => {
                own.insert(key, value);
            }
        }
    }
    merge(&mut node.data, own).with_context(|| format!("inheritance in {}", node.name))?;

    for (key, value) in children {
        let data = match value {
            Value::Mapping(map) => map,
            Value::Null => Mapping::new(),
            _ => return Err(anyhow!("child '{key}' of {} must be a mapping", node.name)),
        };
        let mut child = Node::new(child_name(&node.name, &key), node.data.clone(), dir.to_path_buf());
        apply_document(&mut child, data, dir)?;
        child.defined = true;
        node.children.push(child);
    }
    Ok(())
}

/// Apply `child` on top of `parent` following the inheritance operators.
pub fn merge(parent: &mut Mapping, child: Mapping) -> Result<()> {
    for (key, value) in child {
        let Some(raw) = key.as_str().map(str::to_string) else {
            parent.insert(key, value);
            continue;
        };
        if let Some(base) = raw.strip_suffix('+') {
            extend(parent, base, value)?;
        } else if let Some(base) = raw.strip_suffix('-') {
            reduce(parent, base, value)?;
        } else {
            match (parent.get_mut(raw.as_str()), value) {
                (Some(Value::Mapping(existing)), Value::Mapping(incoming)) => {
                    merge(existing, incoming)?;
                }
                (_, value) => {
                    parent.insert(Value::String(raw), value);
                }
            }
        }
    }
    Ok(())
}

fn extend(parent: &mut Mapping, key: &str, value: Value) -> Result<()> {
    if let (Some(Value::Number(a)), Value::Number(b)) = (parent.get(key), &value) {
        let sum = match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Value::from(a + b),
            _ => Value::from(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0)),
        };
        parent.insert(Value::String(key.to_string()), sum);
        return Ok(());
    }
    let Some(existing) = parent.get_mut(key) else {
        parent.insert(Value::String(key.to_string()), value);
        return Ok(());
    };
    match (existing, value) {
        (Value::Sequence(items), Value::Sequence(more)) => items.extend(more),
        (Value::Sequence(items), scalar) => items.push(scalar),
        (Value::String(text), Value::String(more)) => text.push_str(&more),
        (Value::Mapping(map), Value::Mapping(more)) => merge(map, more)?,
        (existing, value) => {
            return Err(anyhow!(
                "cannot extend '{key}': incompatible types {existing:?} and {value:?}"
            ));
        }
    }
    Ok(())
}

fn reduce(parent: &mut Mapping, key: &str, value: Value) -> Result<()> {
    let Some(existing) = parent.get_mut(key) else {
        return Ok(());
    };
    match (existing, value) {
        (Value::Sequence(items), Value::Sequence(remove)) => {
            items.retain(|item| !remove.contains(item));
        }
        (Value::Sequence(items), scalar) => items.retain(|item| *item != scalar),
        (Value::String(text), Value::String(remove)) => *text = text.replace(&remove, ""),
        (Value::Mapping(map), Value::Sequence(keys)) => {
            for k in keys {
                map.remove(&k);
            }
        }
        (Value::Mapping(map), Value::Mapping(keys)) => {
            for (k, _) in keys {
                map.remove(&k);
            }
        }
        (existing, value) => {
            return Err(anyhow!(
                "cannot reduce '{key}': incompatible types {existing:?} and {value:?}"
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, contents).expect("write");
    }

    fn tree(files: &[(&str, &str)]) -> (tempfile::TempDir, Tree) {
        let temp = tempfile::tempdir().expect("tempdir");
        init_tree(temp.path()).expect("init");
        for (rel, contents) in files {
            write(temp.path(), rel, contents);
        }
        let tree = Tree::load(temp.path()).expect("load");
        (temp, tree)
    }

    fn names(nodes: &[&Node]) -> Vec<String> {
        nodes.iter().map(|n| n.name.clone()).collect()
    }

    #[test]
    fn directories_files_and_slash_keys_define_nodes() {
        let (_temp, tree) = tree(&[
            ("tests/main.fmf", "test: ./run.sh\n/fast:\n  tag: [fast]\n/slow:\n  tag: [slow]\n"),
            ("plans/smoke.fmf", "execute:\n  how: tmt\n"),
        ]);
        assert_eq!(
            names(&tree.leaves()),
            vec!["/plans/smoke", "/tests/fast", "/tests/slow"]
        );
        let fast = tree.find("/tests/fast").expect("node");
        assert_eq!(fast.get_str("test"), Some("./run.sh"));
        assert!(fast.source_dir.ends_with("tests"));
    }

    #[test]
    fn inheritance_operators_extend_and_reduce() {
        let (_temp, tree) = tree(&[
            ("main.fmf", "tag: [base, slow]\nsummary: Base\nenvironment:\n  A: '1'\n  B: '2'\n"),
            (
                "child/main.fmf",
                "tag+: [extra]\ntag-: [slow]\nsummary+: ' child'\nenvironment:\n  B: '3'\ntest: 'true'\n",
            ),
        ]);
        let child = tree.find("/child").expect("node");
        let tags: Vec<&str> = child
            .get("tag")
            .and_then(Value::as_sequence)
            .expect("tags")
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(tags, vec!["base", "extra"]);
        assert_eq!(child.get_str("summary"), Some("Base child"));
        let env = child.get("environment").and_then(Value::as_mapping).expect("env");
        assert_eq!(env.get("A").and_then(Value::as_str), Some("1"));
        assert_eq!(env.get("B").and_then(Value::as_str), Some("3"));
    }

    #[test]
    fn hidden_entries_and_nested_roots_are_skipped() {
        let (temp, _) = tree(&[("a.fmf", "test: 'true'\n")]);
        write(temp.path(), ".hidden/main.fmf", "test: 'true'\n");
        write(temp.path(), "nested/.fmf/version", "1\n");
        write(temp.path(), "nested/main.fmf", "test: 'true'\n");
        let tree = Tree::load(temp.path()).expect("load");
        assert_eq!(names(&tree.leaves()), vec!["/a"]);
    }

    #[test]
    fn select_applies_key_names_and_filters() {
        let (_temp, tree) = tree(&[
            ("one.fmf", "test: 'true'\ntier: 1\n"),
            ("two.fmf", "test: 'true'\ntier: 2\n"),
            ("plan.fmf", "execute: {how: tmt}\n"),
        ]);
        let all = tree.select("test", &[], &[]);
        assert_eq!(names(&all), vec!["/one", "/two"]);
        let tier2 = tree.select("test", &[], &[Filter::parse("tier: 2").expect("filter")]);
        assert_eq!(names(&tier2), vec!["/two"]);
        let named = tree.select("test", &[Regex::new("one").expect("re")], &[]);
        assert_eq!(names(&named), vec!["/one"]);
    }

    #[test]
    fn find_root_walks_up() {
        let (temp, _) = tree(&[("a/b/main.fmf", "test: 'true'\n")]);
        let root = Tree::find_root(&temp.path().join("a/b")).expect("root");
        assert_eq!(root, temp.path().canonicalize().expect("canon"));
    }

    #[test]
    fn missing_root_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = Tree::load(temp.path()).expect_err("should fail");
        assert!(err.to_string().contains(".fmf/version"));
    }

    #[test]
    fn init_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(init_tree(temp.path()).expect("init"));
        assert!(!init_tree(temp.path()).expect("init"));
    }
}
