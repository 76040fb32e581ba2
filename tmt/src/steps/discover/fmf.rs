//! `discover: how: fmf` — tests from a metadata tree.
//!
//! The tree is either the plan's own tree (copied into the phase) or a
//! remote repository cloned there. Tests are leaves with a `test` key,
//! narrowed by name patterns, filters, exclusions, links and, with
//! `modified-only`, by the files changed since a reference.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, info, instrument};

use crate::core::filter::{Filter, compile_patterns};
use crate::core::test::{Link, Test};
use crate::fmf::Tree;
use crate::io::git::Git;
use crate::io::process::{self, RunOptions};
use crate::io::files;
use crate::steps::PluginData;
use crate::steps::discover::{DiscoverContext, DiscoverPlugin};

pub const SCHEMA: &str = crate::phase_schema!(
    r#",
    "url": {"type": "string"},
    "ref": {"type": "string"},
    "path": {"type": "string"},
    "test": {"type": ["string", "array"]},
    "exclude": {"type": ["string", "array"]},
    "filter": {"type": ["string", "array"]},
    "link": {"type": ["string", "array"]},
    "modified-only": {"type": "boolean"},
    "modified-url": {"type": "string"},
    "modified-ref": {"type": "string"},
    "dist-git-source": {"type": "boolean"}"#
);

const DEFAULT_MODIFIED_REF: &str = "main";

#[derive(Debug, Clone, Default)]
pub struct FmfDiscover {
    url: Option<String>,
    reference: Option<String>,
    path: Option<String>,
    names: Vec<String>,
    exclude: Vec<String>,
    filters: Vec<String>,
    links: Vec<String>,
    modified_only: bool,
    modified_url: Option<String>,
    modified_ref: Option<String>,
    dist_git_source: bool,
}

impl FmfDiscover {
    pub fn create(data: &PluginData) -> Result<Box<dyn DiscoverPlugin>> {
        Ok(Box::new(Self::from_data(data)))
    }

    pub fn from_data(data: &PluginData) -> Self {
        Self {
            url: data.get_str("url"),
            reference: data.get_str("ref"),
            path: data.get_str("path"),
            names: data.get_list("test"),
            exclude: data.get_list("exclude"),
            filters: data.get_list("filter"),
            links: data.get_list("link"),
            modified_only: data.get_bool("modified-only"),
            modified_url: data.get_str("modified-url"),
            modified_ref: data.get_str("modified-ref"),
            dist_git_source: data.get_bool("dist-git-source"),
        }
    }

    /// Populate the tests directory from the remote repository or the plan tree.
    fn fetch_tree(&self, ctx: &DiscoverContext<'_>, tests_dir: &Path) -> Result<()> {
        if tests_dir.exists() {
            fs::remove_dir_all(tests_dir).with_context(|| format!("clean {}", tests_dir.display()))?;
        }
        match &self.url {
            Some(url) => {
                info!(url = %url, "cloning test repository");
                Git::clone_repo(url, tests_dir)?;
            }
            None => {
                // git metadata is needed to check out a ref or diff against one
                let keep_git = self.reference.is_some() || self.modified_only;
                let skip: &[&str] = if keep_git { &[] } else { &[".git"] };
                files::copy_tree(&ctx.plan.tree_root, tests_dir, skip)?;
            }
        }
        if let Some(reference) = &self.reference {
            Git::new(tests_dir).checkout(reference)?;
        }
        Ok(())
    }

    fn compiled_links(&self) -> Result<Vec<(Option<Regex>, Regex)>> {
        self.links.iter().map(|raw| parse_link_filter(raw)).collect()
    }

    /// Directories (relative to the repository top) touched since the reference.
    fn modified_dirs(&self, tree_dir: &Path) -> Result<Vec<String>> {
        let git = Git::new(tree_dir);
        let reference = match &self.modified_url {
            Some(url) => {
                let reference = self.modified_ref.as_deref().unwrap_or(DEFAULT_MODIFIED_REF);
                git.fetch(url, reference)?
            }
            None => self
                .modified_ref
                .clone()
                .unwrap_or_else(|| DEFAULT_MODIFIED_REF.to_string()),
        };
        let files = git.changed_files(&reference)?;
        debug!(count = files.len(), reference = %reference, "modified files");
        Ok(files
            .into_iter()
            .map(|file| match file.rsplit_once('/') {
                Some((dir, _)) => dir.to_string(),
                None => String::new(),
            })
            .collect())
    }
}

/// `relation:target` (relation optional) into regexes.
fn parse_link_filter(raw: &str) -> Result<(Option<Regex>, Regex)> {
    let relation_like = |prefix: &str| {
        !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_lowercase() || c == '-')
    };
    let (relation, target) = match raw.split_once(':') {
        Some((relation, target)) if relation_like(relation) && !target.starts_with("//") => {
            (Some(relation), target)
        }
        _ => (None, raw),
    };
    let relation = relation
        .map(|r| Regex::new(&format!("^{r}$")))
        .transpose()
        .map_err(|err| anyhow!("invalid link filter '{raw}': {err}"))?;
    let target = Regex::new(target).map_err(|err| anyhow!("invalid link filter '{raw}': {err}"))?;
    Ok((relation, target))
}

fn link_matches(links: &[Link], filters: &[(Option<Regex>, Regex)]) -> bool {
    filters.iter().all(|(relation, target)| {
        links.iter().any(|link| {
            relation.as_ref().is_none_or(|r| r.is_match(&link.relation)) && target.is_match(&link.target)
        })
    })
}

/// Extract `*.tar.*` and `*.tgz` archives found directly in `dir`.
fn extract_sources(ctx: &DiscoverContext<'_>, dir: &Path) -> Result<()> {
    let entries = fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))?;
    for entry in entries {
        let path = entry.with_context(|| format!("read {}", dir.display()))?.path();
        let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        if !(name.contains(".tar.") || name.ends_with(".tgz")) {
            continue;
        }
        info!(archive = %name, "extracting sources");
        let mut cmd = Command::new("tar");
        cmd.arg("-xf").arg(&path).arg("-C").arg(dir);
        let output = process::run_command(
            cmd,
            &RunOptions {
                timeout: Some(Duration::from_secs(600)),
                ..RunOptions::default()
            },
        )?;
        process::append_log(ctx.log, &format!("tar -xf {name}"), &output)?;
        if !output.success() {
            return Err(anyhow!("failed to extract {name}: {}", output.stderr_lossy().trim()));
        }
    }
    Ok(())
}

impl DiscoverPlugin for FmfDiscover {
    #[instrument(skip_all, fields(phase = %ctx.phase_dir.display()))]
    fn go(&self, ctx: &DiscoverContext<'_>) -> Result<Vec<Test>> {
        let tests_dir = ctx.tests_dir();
        self.fetch_tree(ctx, &tests_dir)?;
        let tests_dir = tests_dir
            .canonicalize()
            .with_context(|| format!("resolve {}", tests_dir.display()))?;

        let tree_dir: PathBuf = match &self.path {
            Some(path) => tests_dir.join(path.trim_start_matches('/')),
            None => tests_dir.clone(),
        };
        if self.dist_git_source {
            extract_sources(ctx, &tree_dir)?;
        }
        let tree = Tree::load(&tree_dir)?;

        let names = compile_patterns(&self.names)?;
        let exclude = compile_patterns(&self.exclude)?;
        let filters = self
            .filters
            .iter()
            .map(|raw| Filter::parse(raw))
            .collect::<Result<Vec<_>>>()?;
        let links = self.compiled_links()?;
        let modified = if self.modified_only {
            Some(self.modified_dirs(&tree_dir)?)
        } else {
            None
        };
        let toplevel = match &modified {
            Some(_) => Git::new(&tree_dir).toplevel()?.canonicalize()?,
            None => tests_dir.clone(),
        };

        let mut tests = Vec::new();
        for node in tree.select("test", &names, &filters) {
            if !node.enabled() {
                continue;
            }
            if exclude.iter().any(|pattern| pattern.is_match(&node.name)) {
                continue;
            }
            let mut test = Test::from_metadata(&node.name, &node.data)?;
            if !link_matches(&test.link, &links) {
                continue;
            }
            if let Some(dirs) = &modified {
                let relative = node
                    .source_dir
                    .strip_prefix(&toplevel)
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_default();
                let prefix = format!("{relative}/");
                if !dirs.iter().any(|dir| *dir == relative || dir.starts_with(&prefix)) {
                    debug!(test = %node.name, "not modified");
                    continue;
                }
            }
            // paths are relative to the tests directory
            let relative_source = node
                .source_dir
                .strip_prefix(&tests_dir)
                .map(Path::to_path_buf)
                .unwrap_or_default();
            test.path = if node.data.contains_key("path") {
                let tree_prefix = tree_dir.strip_prefix(&tests_dir).unwrap_or(Path::new(""));
                format!(
                    "/{}",
                    tree_prefix.join(test.path.trim_start_matches('/')).display()
                )
            } else {
                format!("/{}", relative_source.display())
            };
            tests.push(test);
        }
        Ok(tests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::environment::Environment;
    use crate::io::config::TmtConfig;
    use crate::io::output::Printer;
    use crate::steps::PlanContext;

    fn write(path: &Path, contents: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(path, contents).expect("write");
    }

    fn tree(root: &Path) {
        write(&root.join(".fmf/version"), "1\n");
        write(&root.join("tests/smoke/main.fmf"), "test: ./run.sh\ntag: [tier1]\n");
        write(
            &root.join("tests/slow/main.fmf"),
            "test: sleep 100\ntag: [slow]\nlink:\n  - verifies: https://issues/7\n",
        );
        write(&root.join("tests/off/main.fmf"), "test: 'true'\nenabled: false\n");
        write(&root.join("plans/main.fmf"), "execute:\n  how: tmt\n");
    }

    fn run(data: PluginData, tree_root: &Path, phase_dir: &Path) -> Result<Vec<Test>> {
        let plan = PlanContext {
            plan_name: "/plans".to_string(),
            plan_workdir: phase_dir.join("plan"),
            tree_root: tree_root.to_path_buf(),
            config: TmtConfig::default(),
            printer: Printer::silent(),
            environment: Environment::new(),
            force: false,
            dry: false,
        };
        let log = phase_dir.join("log.txt");
        fs::create_dir_all(phase_dir).expect("phase dir");
        let ctx = DiscoverContext {
            plan: &plan,
            phase_dir,
            log: &log,
        };
        FmfDiscover::create(&data)?.go(&ctx)
    }

    #[test]
    fn discovers_enabled_tests_with_source_paths() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("tree");
        tree(&root);
        let tests = run(
            PluginData::new("default-0", "fmf"),
            &root,
            &temp.path().join("phase"),
        )
        .expect("discover");
        let names: Vec<&str> = tests.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["/tests/slow", "/tests/smoke"]);
        let smoke = &tests[1];
        assert_eq!(smoke.path, "/tests/smoke");
        assert!(temp.path().join("phase/tests/tests/smoke/main.fmf").is_file());
    }

    #[test]
    fn applies_names_filters_and_exclusions() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("tree");
        tree(&root);

        let by_filter = run(
            PluginData::new("default-0", "fmf").with_key("filter", "tag: tier1"),
            &root,
            &temp.path().join("a"),
        )
        .expect("discover");
        assert_eq!(by_filter.len(), 1);
        assert_eq!(by_filter[0].name, "/tests/smoke");

        let excluded = run(
            PluginData::new("default-0", "fmf")
                .with_key("test", "/tests/")
                .with_key("exclude", "slow"),
            &root,
            &temp.path().join("b"),
        )
        .expect("discover");
        assert_eq!(excluded.len(), 1);
        assert_eq!(excluded[0].name, "/tests/smoke");
    }

    #[test]
    fn link_filter_matches_relation_and_target() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("tree");
        tree(&root);
        let tests = run(
            PluginData::new("default-0", "fmf").with_key("link", "verifies:issues/7"),
            &root,
            &temp.path().join("phase"),
        )
        .expect("discover");
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].name, "/tests/slow");
    }

    #[test]
    fn link_filter_without_relation() {
        let (relation, target) = parse_link_filter("https://issues/7").expect("parse");
        assert!(relation.is_none());
        assert!(target.is_match("https://issues/7"));
        let (relation, _) = parse_link_filter("verifies:https://issues/7").expect("parse");
        assert!(relation.expect("relation").is_match("verifies"));
    }

    #[test]
    fn path_key_selects_subtree() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("repo");
        write(&root.join("readme"), "x");
        tree(&root.join("meta"));
        let tests = run(
            PluginData::new("default-0", "fmf").with_key("path", "/meta"),
            &root,
            &temp.path().join("phase"),
        )
        .expect("discover");
        assert_eq!(tests.len(), 2);
        assert_eq!(tests[1].path, "/meta/tests/smoke");
    }

    #[test]
    fn missing_tree_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("empty");
        fs::create_dir_all(&root).expect("mkdir");
        assert!(
            run(PluginData::new("default-0", "fmf"), &root, &temp.path().join("phase")).is_err()
        );
    }
}
