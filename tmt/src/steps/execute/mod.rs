//! Execute step: run every discovered test on every guest.
//!
//! A failing test is data, not an error: each test yields one result (or
//! several with `result: custom`) and execution continues. Only
//! infrastructure failures and interruption abort the step; results
//! gathered so far are saved either way.

pub mod internal;
pub mod upgrade;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_yaml::{Mapping, Value};
use tracing::{info, instrument};

use crate::core::environment::Environment;
use crate::core::ordering::DEFAULT_ORDER;
use crate::core::result::{Summary, TestResult};
use crate::core::step_name::StepName;
use crate::core::test::Test;
use crate::error::{ErrorKind, classify, specification};
use crate::guest::Guest;
use crate::io::output::{Color, Printer};
use crate::io::{persist, workdir};
use crate::steps::registry::{PluginInfo, Registry};
use crate::steps::{PlanContext, PluginData, Step, StepCore, StepOverride};

pub const RESULTS_FILE: &str = "results.yaml";
/// Per-test data directories live under `execute/data/`.
pub const DATA_DIR: &str = "data";

/// Inputs shared by all tests of one execute run.
#[derive(Debug, Clone, Copy)]
pub struct ExecuteContext<'a> {
    pub plan: &'a PlanContext,
    /// `execute/` step workdir.
    pub workdir: &'a Path,
    /// Discover step workdir; test paths are relative to it.
    pub tests_root: &'a Path,
    /// Plan environment with role variables; wins over test environment.
    pub environment: &'a Environment,
    pub log: &'a Path,
}

pub trait ExecutePlugin {
    /// Run `tests` on `guests`, appending results as they are produced.
    fn go(
        &self,
        ctx: &ExecuteContext<'_>,
        guests: &mut [Guest],
        tests: &[Test],
        results: &mut Vec<TestResult>,
    ) -> Result<()>;
}

pub type ExecuteFactory = fn(&PluginData) -> Result<Box<dyn ExecutePlugin>>;

pub fn registry() -> Registry<ExecuteFactory> {
    Registry::<ExecuteFactory>::new(StepName::Execute)
        .register(PluginInfo {
            method: "tmt",
            order: DEFAULT_ORDER,
            schema: internal::SCHEMA,
            factory: internal::TmtExecute::create,
        })
        .register(PluginInfo {
            method: "upgrade",
            order: DEFAULT_ORDER,
            schema: upgrade::SCHEMA,
            factory: upgrade::UpgradeExecute::create,
        })
}

#[derive(Debug, Clone)]
pub struct Execute {
    core: StepCore,
    ctx: PlanContext,
    results: Vec<TestResult>,
}

impl Execute {
    pub fn new(ctx: &PlanContext, raw: Option<&Value>) -> Result<Self> {
        Ok(Self {
            core: StepCore::new(StepName::Execute, ctx, raw, "tmt")?,
            ctx: ctx.clone(),
            results: Vec::new(),
        })
    }

    pub fn results(&self) -> &[TestResult] {
        &self.results
    }

    fn results_path(&self) -> PathBuf {
        self.core.workdir.join(RESULTS_FILE)
    }

    fn save_results(&self) -> Result<()> {
        save_results(&self.results_path(), &self.results)
    }

    #[instrument(skip_all, fields(plan = %self.ctx.plan_name, tests = tests.len()))]
    pub fn go(&mut self, guests: &mut [Guest], tests: &[Test], environment: &Environment) -> Result<()> {
        if self.core.is_done() {
            info!(results = self.results.len(), "execute already done");
            return Ok(());
        }
        let [phase] = self.core.data.as_slice() else {
            return Err(specification(format!(
                "plan '{}' defines {} execute phases, exactly one is supported",
                self.ctx.plan_name,
                self.core.data.len()
            )));
        };
        let registry = registry();
        let info = registry.resolve(phase)?;
        let plugin = (info.factory)(phase)?;

        workdir::clean(&self.core.workdir.join(DATA_DIR))?;
        let tests_root = self.ctx.step_workdir(StepName::Discover);
        let log = self.core.log_path();
        let ctx = ExecuteContext {
            plan: &self.ctx,
            workdir: &self.core.workdir,
            tests_root: &tests_root,
            environment,
            log: &log,
        };
        let mut results = Vec::new();
        let outcome = plugin.go(&ctx, guests, tests, &mut results);
        self.results = results;
        self.save_results()?;
        outcome.map_err(|err| classify(err, ErrorKind::Execute))?;

        self.ctx.printer.info("summary", &self.summary(), 1);
        self.core.mark_done()
    }
}

/// Persist results as an ordered `name → result` mapping.
pub fn save_results(path: &Path, results: &[TestResult]) -> Result<()> {
    let mut doc = Mapping::new();
    for result in results {
        let value = serde_yaml::to_value(result).context("serialize result")?;
        doc.insert(Value::from(result.name.clone()), value);
    }
    persist::write_yaml(path, &doc)
}

pub fn load_results(path: &Path) -> Result<Vec<TestResult>> {
    let Some(doc) = persist::load_yaml::<Mapping>(path)? else {
        return Ok(Vec::new());
    };
    doc.into_iter()
        .map(|(_, value)| {
            serde_yaml::from_value(value).with_context(|| format!("invalid result in {}", path.display()))
        })
        .collect()
}

/// One line per result, shown with `-v`.
pub(crate) fn print_result(printer: &Printer, result: &TestResult) {
    let outcome = printer.paint(result.result.as_str(), Color::for_outcome(result.result));
    let line = match &result.note {
        Some(note) => format!("{} ({note})", result.name),
        None => result.name.clone(),
    };
    printer.detail(&outcome, &line, 2, 1);
}

impl Step for Execute {
    fn core(&self) -> &StepCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StepCore {
        &mut self.core
    }

    fn summary(&self) -> String {
        let summary = Summary::from_results(&self.results);
        format!(
            "{} executed: {}",
            crate::core::result::pluralize(summary.total(), "test"),
            summary.describe()
        )
    }

    fn wake(&mut self, overrides: Option<&StepOverride>, force: bool) -> Result<()> {
        self.core.wake(overrides, force)?;
        if self.core.is_done() {
            self.results = load_results(&self.results_path())?;
        }
        Ok(())
    }
}
