//! Test-only helpers: throwaway metadata trees and run options.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::core::step_name::StepName;
use crate::fmf::VERSION_FILE;
use crate::io::config::TmtConfig;
use crate::options::RunOptions;

/// A metadata tree and a workdir root inside one temporary directory.
pub struct Sandbox {
    temp: TempDir,
}

impl Sandbox {
    /// Create `tree/.fmf/version` and an empty `workdirs/`.
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("create tempdir");
        let tree = temp.path().join("tree");
        fs::create_dir_all(tree.join(".fmf")).expect("create .fmf");
        fs::write(tree.join(VERSION_FILE), "1\n").expect("write version");
        fs::create_dir_all(temp.path().join("workdirs")).expect("create workdirs");
        Self { temp }
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn tree(&self) -> PathBuf {
        self.temp.path().join("tree")
    }

    pub fn workdirs(&self) -> PathBuf {
        self.temp.path().join("workdirs")
    }

    /// Write `<tree>/<relative>` creating parent directories.
    pub fn write(&self, relative: &str, contents: &str) -> &Self {
        let path = self.tree().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, contents).expect("write metadata");
        self
    }

    /// Run options for this tree, allocating workdirs under [`Sandbox::workdirs`].
    pub fn options(&self) -> RunOptions {
        RunOptions {
            workdir_root: Some(self.workdirs()),
            ..RunOptions::new(self.tree())
        }
    }

    /// Options resuming (or creating) `run-<id>`.
    pub fn options_for(&self, id: u32) -> RunOptions {
        RunOptions {
            id: Some(id.to_string()),
            ..self.options()
        }
    }

    /// Tool configuration with workdirs under the sandbox and local provisioning.
    pub fn config(&self) -> TmtConfig {
        TmtConfig {
            workdir_root: self.workdirs(),
            default_provision: "local".to_string(),
            ..TmtConfig::default()
        }
    }

    /// Path of a step workdir of `plan` in `run-<id>`.
    pub fn step_dir(&self, id: u32, plan: &str, step: StepName) -> PathBuf {
        self.workdirs()
            .join(crate::io::workdir::run_dir_name(id))
            .join(crate::io::workdir::relative_for(plan))
            .join(step.as_str())
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new()
    }
}

/// A plan with one inline shell test run on the local guest.
pub fn local_plan(test: &str) -> String {
    format!(
        "discover:\n  how: shell\n  tests:\n    - name: /t1\n      test: {}\n\
         provision:\n  how: local\nexecute:\n  how: tmt\n",
        serde_yaml::to_string(test).expect("quote test").trim_end()
    )
}
