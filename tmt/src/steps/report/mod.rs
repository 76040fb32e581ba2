//! Report step: hand the results to every configured sink.
//!
//! Sinks never change results. A failing sink is fatal only when no earlier
//! sink of this step delivered the results; later failures are warnings.

pub mod display;
pub mod html;
pub mod junit;
pub mod polarion;
pub mod reportportal;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use minijinja::AutoEscape;
use serde::Serialize;
use serde_yaml::Value;
use tracing::{info, instrument, warn};

use crate::core::ordering::DEFAULT_ORDER;
use crate::core::result::{Summary, TestResult};
use crate::core::step_name::StepName;
use crate::error::{ErrorKind, classify};
use crate::steps::registry::{PluginInfo, Registry};
use crate::steps::{PlanContext, PluginData, Step, StepCore};

/// Inputs of one report phase.
#[derive(Debug, Clone, Copy)]
pub struct ReportContext<'a> {
    pub plan: &'a PlanContext,
    /// `report/<phase>/`, created before the sink runs.
    pub phase_dir: &'a Path,
    /// `execute/`; result log paths are relative to it.
    pub execute_workdir: &'a Path,
    pub results: &'a [TestResult],
}

impl ReportContext<'_> {
    /// Output path from the phase's `file` key, or `default` in the phase directory.
    pub fn output_path(&self, data_file: Option<&str>, default: &str) -> PathBuf {
        match data_file {
            Some(file) => {
                let path = PathBuf::from(file);
                if path.is_absolute() { path } else { self.phase_dir.join(path) }
            }
            None => self.phase_dir.join(default),
        }
    }
}

pub trait ReportPlugin {
    fn go(&self, ctx: &ReportContext<'_>) -> Result<()>;
}

pub type ReportFactory = fn(&PluginData) -> Result<Box<dyn ReportPlugin>>;

pub fn registry() -> Registry<ReportFactory> {
    let plugin = |method: &'static str, schema: &'static str, factory: ReportFactory| PluginInfo {
        method,
        order: DEFAULT_ORDER,
        schema,
        factory,
    };
    Registry::new(StepName::Report)
        .register(plugin("display", display::SCHEMA, display::DisplayReport::create))
        .register(plugin("html", html::SCHEMA, html::HtmlReport::create))
        .register(plugin("junit", junit::SCHEMA, junit::JunitReport::create))
        .register(plugin("polarion", polarion::SCHEMA, polarion::PolarionReport::create))
        .register(plugin(
            "reportportal",
            reportportal::SCHEMA,
            reportportal::ReportPortalReport::create,
        ))
}

#[derive(Debug, Clone)]
pub struct Report {
    core: StepCore,
    ctx: PlanContext,
    delivered: usize,
}

impl Report {
    pub fn new(ctx: &PlanContext, raw: Option<&Value>) -> Result<Self> {
        Ok(Self {
            core: StepCore::new(StepName::Report, ctx, raw, "display")?,
            ctx: ctx.clone(),
            delivered: 0,
        })
    }

    #[instrument(skip_all, fields(plan = %self.ctx.plan_name, results = results.len()))]
    pub fn go(&mut self, results: &[TestResult]) -> Result<()> {
        if self.core.is_done() {
            info!("report already done");
            return Ok(());
        }
        let registry = registry();
        let mut plugins = Vec::with_capacity(self.core.data.len());
        for phase in &self.core.data {
            let info = registry.resolve(phase)?;
            plugins.push((phase, (info.factory)(phase)?));
        }

        let execute_workdir = self.ctx.step_workdir(StepName::Execute);
        self.delivered = 0;
        for (phase, plugin) in plugins {
            let phase_dir = self.core.workdir.join(&phase.name);
            std::fs::create_dir_all(&phase_dir).with_context(|| format!("create {}", phase_dir.display()))?;
            let ctx = ReportContext {
                plan: &self.ctx,
                phase_dir: &phase_dir,
                execute_workdir: &execute_workdir,
                results,
            };
            match plugin.go(&ctx) {
                Ok(()) => self.delivered += 1,
                Err(err) if self.delivered == 0 => {
                    return Err(classify(
                        err.context(format!("report phase '{}' failed", phase.name)),
                        ErrorKind::Report,
                    ));
                }
                Err(err) => {
                    warn!(phase = %phase.name, error = %format!("{err:#}"), "report sink failed");
                    self.ctx
                        .printer
                        .warn(&format!("report phase '{}' failed: {err:#}", phase.name));
                }
            }
        }
        self.core.mark_done()
    }
}

impl Step for Report {
    fn core(&self) -> &StepCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StepCore {
        &mut self.core
    }

    fn summary(&self) -> String {
        crate::core::result::pluralize(self.delivered, "report") + " generated"
    }
}

/// Seconds of an `HH:MM:SS` duration, 0 when absent or malformed.
pub fn duration_seconds(result: &TestResult) -> u64 {
    result
        .duration
        .as_deref()
        .and_then(|raw| {
            raw.split(':')
                .map(|part| part.parse::<u64>().ok())
                .try_fold(0u64, |acc, part| part.map(|p| acc * 60 + p))
        })
        .unwrap_or(0)
}

/// Counts shared by the summary lines of every sink.
pub fn summary(results: &[TestResult]) -> Summary {
    Summary::from_results(results)
}

const JUNIT_TEMPLATE: &str = include_str!("../../../templates/junit.xml.j2");
const HTML_TEMPLATE: &str = include_str!("../../../templates/index.html.j2");

/// Render a bundled template (`junit.xml` or `index.html`).
///
/// HTML templates are auto-escaped; XML templates escape through the `xml` filter.
pub(crate) fn render<S: Serialize>(name: &str, context: S) -> Result<String> {
    let mut env = minijinja::Environment::new();
    env.set_auto_escape_callback(|name| {
        if name.ends_with(".html") {
            AutoEscape::Html
        } else {
            AutoEscape::None
        }
    });
    env.add_filter("xml", xml_escape);
    env.add_template("junit.xml", JUNIT_TEMPLATE)?;
    env.add_template("index.html", HTML_TEMPLATE)?;
    let rendered = env
        .get_template(name)?
        .render(context)
        .with_context(|| format!("render {name}"))?;
    Ok(rendered)
}

fn xml_escape(value: String) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}
