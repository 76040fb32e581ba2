//! A plan: six steps built from one metadata node and driven in order.
//!
//! Every enabled step is woken from disk first. Steps up to report then run
//! in order and stop at the first error; finish always runs afterwards
//! (even after an interruption) and its own error is chained to a pending
//! one. Steps that are already `done` do nothing, which makes re-running a
//! finished plan a no-op.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::environment::{self, Environment};
use crate::core::result::TestResult;
use crate::core::step_name::StepName;
use crate::error::specification;
use crate::fmf::Node;
use crate::io::cancel;
use crate::io::config::TmtConfig;
use crate::io::output::Printer;
use crate::io::workdir;
use crate::steps::discover::{Discover, TestSelection};
use crate::steps::execute::Execute;
use crate::steps::finish::Finish;
use crate::steps::prepare::Prepare;
use crate::steps::provision::Provision;
use crate::steps::report::Report;
use crate::steps::{PlanContext, Step, StepOverride};

/// Run-level inputs shared by every plan.
#[derive(Debug, Clone, Copy)]
pub struct PlanSettings<'a> {
    /// Run workdir (`run-NNN`).
    pub workdir: &'a Path,
    pub tree_root: &'a Path,
    pub config: &'a TmtConfig,
    pub printer: Printer,
    /// `-e` values, overriding the plan environment.
    pub environment: &'a Environment,
    pub force: bool,
    pub dry: bool,
}

#[derive(Debug)]
pub struct Plan {
    ctx: PlanContext,
    summary: Option<String>,
    enabled: Vec<StepName>,
    discover: Discover,
    provision: Provision,
    prepare: Prepare,
    execute: Execute,
    report: Report,
    finish: Finish,
}

impl Plan {
    pub fn from_node(node: &Node, settings: &PlanSettings<'_>) -> Result<Self> {
        let plan_env = match node.get("environment") {
            Some(raw) => environment::from_yaml(raw)
                .map_err(|err| specification(format!("invalid environment of plan '{}': {err}", node.name)))?,
            None => Environment::new(),
        };
        let ctx = PlanContext {
            plan_name: node.name.clone(),
            plan_workdir: settings.workdir.join(workdir::relative_for(&node.name)),
            tree_root: settings.tree_root.to_path_buf(),
            config: settings.config.clone(),
            printer: settings.printer,
            environment: environment::compose([&plan_env, settings.environment]),
            force: settings.force,
            dry: settings.dry,
        };
        let section = |step: StepName| node.get(step.as_str());
        Ok(Self {
            discover: Discover::new(&ctx, section(StepName::Discover))?,
            provision: Provision::new(&ctx, section(StepName::Provision))?,
            prepare: Prepare::new(&ctx, section(StepName::Prepare))?,
            execute: Execute::new(&ctx, section(StepName::Execute))?,
            report: Report::new(&ctx, section(StepName::Report))?,
            finish: Finish::new(&ctx, section(StepName::Finish))?,
            summary: node.get_str("summary").map(str::to_string),
            enabled: StepName::ALL.to_vec(),
            ctx,
        })
    }

    pub fn name(&self) -> &str {
        &self.ctx.plan_name
    }

    pub fn workdir(&self) -> &PathBuf {
        &self.ctx.plan_workdir
    }

    pub fn results(&self) -> &[TestResult] {
        self.execute.results()
    }

    /// Restrict discovered tests; call before [`Plan::wake`].
    pub fn select_tests(&mut self, selection: TestSelection) {
        self.discover.set_selection(selection);
    }

    fn step(&self, name: StepName) -> &dyn Step {
        match name {
            StepName::Discover => &self.discover,
            StepName::Provision => &self.provision,
            StepName::Prepare => &self.prepare,
            StepName::Execute => &self.execute,
            StepName::Report => &self.report,
            StepName::Finish => &self.finish,
        }
    }

    fn step_mut(&mut self, name: StepName) -> &mut dyn Step {
        match name {
            StepName::Discover => &mut self.discover,
            StepName::Provision => &mut self.provision,
            StepName::Prepare => &mut self.prepare,
            StepName::Execute => &mut self.execute,
            StepName::Report => &mut self.report,
            StepName::Finish => &mut self.finish,
        }
    }

    fn is_enabled(&self, name: StepName) -> bool {
        self.enabled.contains(&name)
    }

    /// Load every step from disk; `--force` and overrides apply to enabled steps only.
    #[instrument(skip_all, fields(plan = %self.ctx.plan_name))]
    pub fn wake(&mut self, enabled: &[StepName], overrides: &BTreeMap<StepName, StepOverride>) -> Result<()> {
        self.enabled = enabled.to_vec();
        let force = self.ctx.force;
        let plan_name = self.ctx.plan_name.clone();
        for name in StepName::ALL {
            let active = self.is_enabled(name);
            let step = self.step_mut(name);
            step.core_mut().enabled = active;
            let overrides = overrides.get(&name).filter(|_| active);
            step.wake(overrides, force && active)
                .with_context(|| format!("wake {name} of plan '{plan_name}'"))?;
        }
        debug!(enabled = ?self.enabled, "plan woken");
        Ok(())
    }

    /// Plan environment with role variables of the provisioned guests.
    fn environment(&self) -> Environment {
        environment::compose([&self.ctx.environment, &self.provision.role_environment()])
    }

    #[instrument(skip_all, fields(plan = %self.ctx.plan_name))]
    pub fn go(&mut self) -> Result<()> {
        let printer = self.ctx.printer;
        printer.header(&self.ctx.plan_name, 0);
        if let Some(summary) = &self.summary {
            printer.detail("summary", summary, 1, 1);
        }
        printer.detail("workdir", &self.ctx.plan_workdir.display().to_string(), 1, 1);
        if self.ctx.dry {
            for name in StepName::ALL.into_iter().filter(|name| self.is_enabled(*name)) {
                self.step(name).show(&printer);
            }
            return Ok(());
        }

        let outcome = self.go_steps();
        if let Err(err) = &outcome {
            warn!(error = %format!("{err:#}"), "plan failed, running finish");
        }
        if !self.is_enabled(StepName::Finish) {
            return outcome;
        }

        let was_interrupted = cancel::suspend();
        let commit = outcome.is_ok()
            && !was_interrupted
            && StepName::ALL
                .into_iter()
                .filter(|name| *name != StepName::Finish)
                .all(|name| self.step(name).core().is_done());
        printer.header(StepName::Finish.as_str(), 1);
        let environment = self.environment();
        let finished = self
            .finish
            .go(self.provision.guests_mut(), &environment, commit)
            .and_then(|()| self.provision.save_guests());
        cancel::restore(was_interrupted);

        match (outcome, finished) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(finish_err)) => Err(finish_err.context("finish failed")),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(finish_err)) => Err(err.context(format!("finish also failed: {finish_err:#}"))),
        }
    }

    fn go_steps(&mut self) -> Result<()> {
        let printer = self.ctx.printer;
        if self.is_enabled(StepName::Discover) {
            printer.header(StepName::Discover.as_str(), 1);
            self.discover.go()?;
        }
        if self.is_enabled(StepName::Provision) {
            printer.header(StepName::Provision.as_str(), 1);
            self.provision.go()?;
        }
        if self.is_enabled(StepName::Prepare) {
            printer.header(StepName::Prepare.as_str(), 1);
            if !self.prepare.core().is_done() {
                self.provision.ensure_ready()?;
            }
            let environment = self.environment();
            let requires = self.discover.requires();
            let recommends = self.discover.recommends();
            self.prepare
                .go(self.provision.guests(), &environment, &requires, &recommends)?;
        }
        if self.is_enabled(StepName::Execute) {
            printer.header(StepName::Execute.as_str(), 1);
            if !self.execute.core().is_done() {
                self.provision.ensure_ready()?;
            }
            let environment = self.environment();
            let tests = self.discover.tests().to_vec();
            let executed = self.execute.go(self.provision.guests_mut(), &tests, &environment);
            self.provision.save_guests()?;
            executed?;
        }
        if self.is_enabled(StepName::Report) {
            printer.header(StepName::Report.as_str(), 1);
            self.report.go(self.execute.results())?;
        }
        info!(plan = %self.ctx.plan_name, "steps completed");
        Ok(())
    }
}
