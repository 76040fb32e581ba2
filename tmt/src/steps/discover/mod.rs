//! Discover step: gather the tests to execute.
//!
//! Each phase works in `discover/<phase>/` and leaves a copy of the tests it
//! found in `discover/<phase>/tests`. Test paths are rewritten to point there
//! (`/<phase>/tests/<path>`) and, with more than one phase, test names get a
//! `/<phase>` prefix so they stay unique.

pub mod fmf;
pub mod shell;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{info, instrument};

use crate::core::filter::{Filter, name_selected};
use crate::core::step_name::StepName;
use crate::core::test::Test;
use crate::io::output::Printer;
use crate::io::{persist, workdir};
use crate::steps::registry::{PluginInfo, Registry};
use crate::steps::{PlanContext, PluginData, Step, StepCore, StepOverride};

pub const TESTS_FILE: &str = "tests.yaml";
/// Directory inside each phase workdir holding the discovered tests.
pub const TESTS_DIR: &str = "tests";

/// Inputs of one discover phase.
#[derive(Debug, Clone, Copy)]
pub struct DiscoverContext<'a> {
    pub plan: &'a PlanContext,
    /// `discover/<phase>/`.
    pub phase_dir: &'a Path,
    /// Step `log.txt`.
    pub log: &'a Path,
}

impl DiscoverContext<'_> {
    pub fn tests_dir(&self) -> PathBuf {
        self.phase_dir.join(TESTS_DIR)
    }
}

pub trait DiscoverPlugin {
    /// Discover tests. Returned paths are relative to [`DiscoverContext::tests_dir`].
    fn go(&self, ctx: &DiscoverContext<'_>) -> Result<Vec<Test>>;
}

pub type DiscoverFactory = fn(&PluginData) -> Result<Box<dyn DiscoverPlugin>>;

pub fn registry() -> Registry<DiscoverFactory> {
    Registry::<DiscoverFactory>::new(StepName::Discover)
        .register(PluginInfo {
            method: "fmf",
            order: crate::core::ordering::DEFAULT_ORDER,
            schema: fmf::SCHEMA,
            factory: fmf::FmfDiscover::create,
        })
        .register(PluginInfo {
            method: "shell",
            order: crate::core::ordering::DEFAULT_ORDER,
            schema: shell::SCHEMA,
            factory: shell::ShellDiscover::create,
        })
}

/// Run a single discover phase into `phase_dir` and rewrite test paths.
pub fn discover_phase(plan: &PlanContext, data: &PluginData, phase_dir: &Path, log: &Path) -> Result<Vec<Test>> {
    let registry = registry();
    let info = registry.resolve(data)?;
    let plugin = (info.factory)(data)?;
    std::fs::create_dir_all(phase_dir).with_context(|| format!("create {}", phase_dir.display()))?;
    let ctx = DiscoverContext { plan, phase_dir, log };
    let mut tests = plugin.go(&ctx)?;
    for test in &mut tests {
        test.path = format!(
            "/{}/{TESTS_DIR}{}",
            data.name,
            if test.path == "/" { "" } else { test.path.as_str() }
        );
    }
    Ok(tests)
}

/// Run-level test selection (`tmt run test --name .. --filter ..`).
#[derive(Debug, Clone, Default)]
pub struct TestSelection {
    pub names: Vec<Regex>,
    pub filters: Vec<Filter>,
}

impl TestSelection {
    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.filters.is_empty()
    }

    pub fn matches(&self, test: &Test) -> bool {
        if !name_selected(&test.name, &self.names) {
            return false;
        }
        if self.filters.is_empty() {
            return true;
        }
        match serde_yaml::to_value(test) {
            Ok(serde_yaml::Value::Mapping(data)) => self.filters.iter().all(|filter| filter.matches(&data)),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Discover {
    core: StepCore,
    ctx: PlanContext,
    tests: Vec<Test>,
    selection: TestSelection,
}

impl Discover {
    pub fn new(ctx: &PlanContext, raw: Option<&serde_yaml::Value>) -> Result<Self> {
        Ok(Self {
            core: StepCore::new(StepName::Discover, ctx, raw, "fmf")?,
            ctx: ctx.clone(),
            tests: Vec::new(),
            selection: TestSelection::default(),
        })
    }

    /// Keep only tests matching `selection`; a finished step is discovered again.
    pub fn set_selection(&mut self, selection: TestSelection) {
        self.selection = selection;
    }

    pub fn tests(&self) -> &[Test] {
        &self.tests
    }

    /// Hard requirements of all discovered tests, first occurrence order.
    pub fn requires(&self) -> Vec<String> {
        collect_unique(self.tests.iter().flat_map(|test| test.require.iter()))
    }

    pub fn recommends(&self) -> Vec<String> {
        collect_unique(self.tests.iter().flat_map(|test| test.recommend.iter()))
    }

    fn tests_path(&self) -> PathBuf {
        self.core.workdir.join(TESTS_FILE)
    }

    #[instrument(skip_all, fields(plan = %self.ctx.plan_name))]
    pub fn go(&mut self) -> Result<()> {
        if self.core.is_done() {
            info!(tests = self.tests.len(), "discover already done");
            return Ok(());
        }
        let registry = registry();
        for phase in &self.core.data {
            registry.resolve(phase)?;
        }

        let multiple = self.core.data.len() > 1;
        let log = self.core.log_path();
        let mut tests = Vec::new();
        for phase in &self.core.data {
            let phase_dir = self.core.workdir.join(&phase.name);
            let found = discover_phase(&self.ctx, phase, &phase_dir, &log)
                .with_context(|| format!("discover phase '{}'", phase.name))?;
            info!(phase = %phase.name, tests = found.len(), "phase discovered tests");
            for mut test in found {
                if multiple {
                    test.name = format!("/{}{}", phase.name, test.name);
                }
                tests.push(test);
            }
        }
        if !self.selection.is_empty() {
            tests.retain(|test| self.selection.matches(test));
        }
        for (index, test) in tests.iter_mut().enumerate() {
            test.serial_number = u32::try_from(index + 1).unwrap_or(u32::MAX);
        }

        persist::write_yaml(&self.tests_path(), &tests)?;
        self.tests = tests;
        self.ctx.printer.info("summary", &self.summary(), 1);
        for test in &self.tests {
            self.ctx.printer.detail("test", &test.name, 2, 1);
        }
        self.core.mark_done()
    }
}

fn collect_unique<'a>(items: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

impl Step for Discover {
    fn core(&self) -> &StepCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StepCore {
        &mut self.core
    }

    fn summary(&self) -> String {
        crate::core::result::pluralize(self.tests.len(), "test") + " selected"
    }

    fn wake(&mut self, overrides: Option<&StepOverride>, force: bool) -> Result<()> {
        self.core.wake(overrides, force)?;
        if self.core.is_done() && !self.selection.is_empty() {
            info!("tests selected on the command line, discovering again");
            workdir::clean(&self.core.workdir)?;
            self.core.status = crate::core::step_name::StepStatus::Todo;
        }
        if self.core.is_done() {
            self.tests = persist::load_yaml(&self.tests_path())?.unwrap_or_default();
        }
        Ok(())
    }

    fn show(&self, printer: &Printer) {
        let core = self.core();
        printer.header(core.name.as_str(), 1);
        for phase in &core.data {
            printer.info("how", &phase.how, 2);
            for key in ["url", "ref", "path", "test", "filter", "exclude"] {
                let values = phase.get_list(key);
                if !values.is_empty() {
                    printer.info(key, &values.join(", "), 2);
                }
            }
        }
    }
}
