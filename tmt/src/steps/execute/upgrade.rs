//! `how: upgrade` — test an in-place upgrade.
//!
//! The discovered tests run three times around an upgrade:
//!
//! 1. `IN_PLACE_UPGRADE=old`, results prefixed `/old`,
//! 2. the upgrade tasks found by the single discover phase of the plan at
//!    `upgrade-path` in the repository `url`, with that plan's environment,
//!    `IN_PLACE_UPGRADE=upgrade` and prefix `/upgrade`,
//! 3. `IN_PLACE_UPGRADE=new`, results prefixed `/new`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::core::environment::{self, Environment};
use crate::core::result::TestResult;
use crate::core::step_name::StepName;
use crate::core::test::Test;
use crate::error::specification;
use crate::fmf::Tree;
use crate::guest::Guest;
use crate::io::git::Git;
use crate::io::workdir;
use crate::steps::discover::discover_phase;
use crate::steps::execute::internal::{Stage, TmtExecute};
use crate::steps::execute::{ExecuteContext, ExecutePlugin};
use crate::steps::{PluginData, normalize_data};

pub const SCHEMA: &str = crate::phase_schema!(
    r#",
    "url": {"type": "string"},
    "ref": {"type": "string"},
    "upgrade-path": {"type": "string"},
    "exit-first": {"type": "boolean"},
    "interactive": {"type": "boolean"}"#
);

pub const UPGRADE_VARIABLE: &str = "IN_PLACE_UPGRADE";
const UPGRADE_DIR: &str = "upgrade";

#[derive(Debug, Clone)]
pub struct UpgradeExecute {
    url: String,
    reference: Option<String>,
    upgrade_path: String,
    runner: TmtExecute,
}

/// Upgrade tasks found in the remote repository.
#[derive(Debug, Clone)]
struct UpgradeTasks {
    tests: Vec<Test>,
    environment: Environment,
    tests_root: PathBuf,
}

impl UpgradeExecute {
    pub fn create(data: &PluginData) -> Result<Box<dyn ExecutePlugin>> {
        let url = data
            .get_str("url")
            .ok_or_else(|| specification(format!("upgrade phase '{}' needs a 'url'", data.name)))?;
        let upgrade_path = data
            .get_str("upgrade-path")
            .ok_or_else(|| specification(format!("upgrade phase '{}' needs an 'upgrade-path'", data.name)))?;
        Ok(Box::new(Self {
            url,
            reference: data.get_str("ref"),
            upgrade_path,
            runner: TmtExecute::from_data(data),
        }))
    }

    fn stage_env(stage: &str) -> Environment {
        Environment::from([(UPGRADE_VARIABLE.to_string(), stage.to_string())])
    }

    #[instrument(skip_all, fields(url = %self.url, path = %self.upgrade_path))]
    fn discover_tasks(&self, ctx: &ExecuteContext<'_>) -> Result<UpgradeTasks> {
        let base = ctx.workdir.join(UPGRADE_DIR);
        workdir::clean(&base)?;
        let repo = base.join("repo");
        let git = Git::clone_repo(&self.url, &repo)?;
        if let Some(reference) = &self.reference {
            git.checkout(reference)?;
        }
        let tree = Tree::load(&repo).with_context(|| format!("load upgrade repository {}", self.url))?;
        let plan = tree.find(&self.upgrade_path).ok_or_else(|| {
            specification(format!("upgrade plan '{}' not found in {}", self.upgrade_path, self.url))
        })?;
        let phases = normalize_data(StepName::Discover, plan.get("discover"), "fmf")?;
        let [phase] = phases.as_slice() else {
            return Err(specification(format!(
                "upgrade plan '{}' must have exactly one discover phase, found {}",
                self.upgrade_path,
                phases.len()
            )));
        };
        let environment = match plan.get("environment") {
            Some(raw) => environment::from_yaml(raw)
                .map_err(|err| specification(format!("upgrade plan environment: {err}")))?,
            None => Environment::new(),
        };

        let mut upgrade_plan = ctx.plan.clone();
        upgrade_plan.tree_root = tree.root().to_path_buf();
        let tests_root = tasks_dir(ctx.workdir);
        let mut tests = discover_phase(&upgrade_plan, phase, &tests_root.join(&phase.name), ctx.log)
            .context("discover upgrade tasks")?;
        for (index, test) in tests.iter_mut().enumerate() {
            test.serial_number = u32::try_from(index + 1).unwrap_or(u32::MAX);
        }
        info!(tasks = tests.len(), "upgrade tasks discovered");
        Ok(UpgradeTasks {
            tests,
            environment,
            tests_root,
        })
    }
}

impl ExecutePlugin for UpgradeExecute {
    fn go(
        &self,
        ctx: &ExecuteContext<'_>,
        guests: &mut [Guest],
        tests: &[Test],
        results: &mut Vec<TestResult>,
    ) -> Result<()> {
        let old = Stage {
            prefix: Some("old"),
            tests_root: None,
            environment: Self::stage_env("old"),
        };
        if !self.runner.run_stage(ctx, guests, tests, &old, results)? {
            return Ok(());
        }

        let tasks = self.discover_tasks(ctx)?;
        let upgrade = Stage {
            prefix: Some("upgrade"),
            tests_root: Some(tasks.tests_root.as_path()),
            environment: environment::compose([&tasks.environment, &Self::stage_env("upgrade")]),
        };
        if !self.runner.run_stage(ctx, guests, &tasks.tests, &upgrade, results)? {
            return Ok(());
        }

        let new = Stage {
            prefix: Some("new"),
            tests_root: None,
            environment: Self::stage_env("new"),
        };
        self.runner.run_stage(ctx, guests, tests, &new, results)?;
        Ok(())
    }
}

/// Where upgrade tasks of an execute workdir are copied.
pub fn tasks_dir(execute_workdir: &Path) -> PathBuf {
    execute_workdir.join(UPGRADE_DIR).join("discover")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::result::Outcome;
    use crate::guest::{GuestCommon, GuestState, LocalGuest};
    use crate::io::config::TmtConfig;
    use crate::io::output::Printer;
    use crate::steps::PlanContext;
    use std::fs;
    use std::process::Command;

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_NAME", "t")
            .env("GIT_AUTHOR_EMAIL", "t@example.com")
            .env("GIT_COMMITTER_NAME", "t")
            .env("GIT_COMMITTER_EMAIL", "t@example.com")
            .status()
            .expect("git");
        assert!(status.success(), "git {args:?}");
    }

    fn upgrade_repo(root: &Path, discover: &str) -> PathBuf {
        let repo = root.join("remote");
        fs::create_dir_all(repo.join(".fmf")).expect("fmf");
        fs::write(repo.join(".fmf/version"), "1\n").expect("version");
        fs::write(
            repo.join("upgrade.fmf"),
            format!(
                "discover:\n{discover}\nexecute:\n  how: tmt\nenvironment:\n  TARGET: f40\n"
            ),
        )
        .expect("plan");
        fs::create_dir_all(repo.join("tasks")).expect("tasks");
        fs::write(repo.join("tasks/main.fmf"), "test: test \"$TARGET\" = f40\n").expect("task");
        git(&repo, &["init", "-q"]);
        git(&repo, &["add", "."]);
        git(&repo, &["commit", "-q", "-m", "init"]);
        repo
    }

    fn context(root: &Path) -> PlanContext {
        PlanContext {
            plan_name: "/plan".to_string(),
            plan_workdir: root.join("plan"),
            tree_root: root.join("tree"),
            config: TmtConfig::default(),
            printer: Printer::silent(),
            environment: Environment::new(),
            force: false,
            dry: false,
        }
    }

    fn data(url: &Path) -> PluginData {
        PluginData::new("default-0", "upgrade")
            .with_key("url", url.display().to_string())
            .with_key("upgrade-path", "/upgrade")
    }

    #[test]
    fn url_and_path_are_required() {
        assert!(UpgradeExecute::create(&PluginData::new("default-0", "upgrade")).is_err());
        assert!(
            UpgradeExecute::create(&PluginData::new("default-0", "upgrade").with_key("url", "https://x")).is_err()
        );
    }

    #[test]
    fn runs_old_upgrade_and_new_stages() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = upgrade_repo(temp.path(), "  how: fmf");
        let ctx = context(temp.path());
        let discover = ctx.step_workdir(StepName::Discover);
        fs::create_dir_all(discover.join("default-0/tests")).expect("tests");
        let workdir = ctx.step_workdir(StepName::Execute);
        fs::create_dir_all(&workdir).expect("workdir");
        let log = workdir.join("log.txt");
        let env = Environment::new();
        let ectx = ExecuteContext {
            plan: &ctx,
            workdir: &workdir,
            tests_root: &discover,
            environment: &env,
            log: &log,
        };
        let mut test = Test::from_metadata(
            "/check",
            &serde_yaml::from_str("test: test -n \"$IN_PLACE_UPGRADE\"\npath: /default-0/tests").expect("yaml"),
        )
        .expect("test");
        test.serial_number = 1;

        let mut common = GuestCommon::new("default-0", None);
        common.state = GuestState::Ready;
        let mut guests = vec![Guest::Local(LocalGuest::new(common))];
        let plugin = UpgradeExecute::create(&data(&repo)).expect("plugin");
        let mut results = Vec::new();
        plugin.go(&ectx, &mut guests, &[test], &mut results).expect("go");

        let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["/old/check", "/upgrade/tasks", "/new/check"]);
        assert!(results.iter().all(|r| r.result == Outcome::Pass), "{results:?}");
        assert!(tasks_dir(&workdir).join("default-0/tests").is_dir());
    }

    #[test]
    fn stage_variables_win_over_plan_environment() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = upgrade_repo(temp.path(), "  how: fmf");
        let ctx = context(temp.path());
        let discover = ctx.step_workdir(StepName::Discover);
        fs::create_dir_all(discover.join("default-0/tests")).expect("tests");
        let workdir = ctx.step_workdir(StepName::Execute);
        fs::create_dir_all(&workdir).expect("workdir");
        let log = workdir.join("log.txt");
        let env = Environment::from([
            ("TARGET".to_string(), "f39".to_string()),
            (UPGRADE_VARIABLE.to_string(), "bogus".to_string()),
        ]);
        let ectx = ExecuteContext {
            plan: &ctx,
            workdir: &workdir,
            tests_root: &discover,
            environment: &env,
            log: &log,
        };
        let mut test = Test::from_metadata(
            "/check",
            &serde_yaml::from_str(
                "test: test \"$IN_PLACE_UPGRADE\" = old -o \"$IN_PLACE_UPGRADE\" = new\npath: /default-0/tests",
            )
            .expect("yaml"),
        )
        .expect("test");
        test.serial_number = 1;

        let mut common = GuestCommon::new("default-0", None);
        common.state = GuestState::Ready;
        let mut guests = vec![Guest::Local(LocalGuest::new(common))];
        let plugin = UpgradeExecute::create(&data(&repo)).expect("plugin");
        let mut results = Vec::new();
        plugin.go(&ectx, &mut guests, &[test], &mut results).expect("go");

        let outcomes: Vec<(&str, Outcome)> = results.iter().map(|r| (r.name.as_str(), r.result)).collect();
        assert_eq!(
            outcomes,
            [
                ("/old/check", Outcome::Pass),
                ("/upgrade/tasks", Outcome::Pass),
                ("/new/check", Outcome::Pass),
            ]
        );
    }

    #[test]
    fn several_discover_phases_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = upgrade_repo(temp.path(), "  - name: a\n    how: fmf\n  - name: b\n    how: fmf");
        let ctx = context(temp.path());
        let workdir = ctx.step_workdir(StepName::Execute);
        fs::create_dir_all(&workdir).expect("workdir");
        let log = workdir.join("log.txt");
        let env = Environment::new();
        let ectx = ExecuteContext {
            plan: &ctx,
            workdir: &workdir,
            tests_root: &workdir,
            environment: &env,
            log: &log,
        };
        let plugin = UpgradeExecute {
            url: repo.display().to_string(),
            reference: None,
            upgrade_path: "/upgrade".to_string(),
            runner: TmtExecute::default(),
        };
        let err = plugin.discover_tasks(&ectx).expect_err("two phases");
        assert_eq!(crate::error::kind_of(&err), crate::error::ErrorKind::Specification);
    }
}
