//! `discover: how: shell` — tests listed inline in the plan.
//!
//! The metadata tree is copied into the tests directory so inline tests can
//! refer to scripts stored next to the plan. `path` defaults to the copy's
//! root.

use anyhow::{Context, Result, anyhow};
use serde_yaml::Value;
use tracing::debug;

use crate::core::test::Test;
use crate::io::files;
use crate::steps::PluginData;
use crate::steps::discover::{DiscoverContext, DiscoverPlugin};

pub const SCHEMA: &str = crate::phase_schema!(
    r#",
    "tests": {
      "type": "array",
      "items": {
        "type": "object",
        "required": ["name", "test"],
        "properties": {
          "name": {"type": "string"},
          "test": {"type": "string"},
          "path": {"type": "string"},
          "duration": {"type": "string"}
        }
      }
    },
    "keep-git-metadata": {"type": "boolean"}"#
);

#[derive(Debug, Clone)]
pub struct ShellDiscover {
    tests: Vec<Value>,
    keep_git: bool,
}

impl ShellDiscover {
    pub fn create(data: &PluginData) -> Result<Box<dyn DiscoverPlugin>> {
        let tests = match data.get("tests") {
            Some(Value::Sequence(items)) => items.clone(),
            None | Some(Value::Null) => Vec::new(),
            Some(_) => return Err(anyhow!("'tests' must be a list")),
        };
        Ok(Box::new(Self {
            tests,
            keep_git: data.get_bool("keep-git-metadata"),
        }))
    }
}

impl DiscoverPlugin for ShellDiscover {
    fn go(&self, ctx: &DiscoverContext<'_>) -> Result<Vec<Test>> {
        let tests_dir = ctx.tests_dir();
        if ctx.plan.tree_root.is_dir() {
            let skip: &[&str] = if self.keep_git { &[] } else { &[".git"] };
            files::copy_tree(&ctx.plan.tree_root, &tests_dir, skip)?;
        } else {
            std::fs::create_dir_all(&tests_dir)
                .with_context(|| format!("create {}", tests_dir.display()))?;
        }

        let mut tests = Vec::with_capacity(self.tests.len());
        for (index, raw) in self.tests.iter().enumerate() {
            let mut test: Test = serde_yaml::from_value(raw.clone())
                .with_context(|| format!("invalid inline test #{index}"))?;
            if test.path.is_empty() {
                test.path = "/".to_string();
            }
            test.normalize()?;
            debug!(test = %test.name, "inline test");
            tests.push(test);
        }
        Ok(tests)
    }
}
