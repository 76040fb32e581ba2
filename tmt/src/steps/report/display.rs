//! `how: display` — print results to the terminal.
//!
//! The summary line is always printed; `-v` adds one line per result, `-vv`
//! adds notes and log paths.

use anyhow::Result;

use crate::io::output::Color;
use crate::steps::PluginData;
use crate::steps::report::{ReportContext, ReportPlugin, summary};

pub const SCHEMA: &str = crate::phase_schema!("");

#[derive(Debug, Clone, Default)]
pub struct DisplayReport;

impl DisplayReport {
    pub fn create(_data: &PluginData) -> Result<Box<dyn ReportPlugin>> {
        Ok(Box::new(Self))
    }
}

impl ReportPlugin for DisplayReport {
    fn go(&self, ctx: &ReportContext<'_>) -> Result<()> {
        let printer = &ctx.plan.printer;
        for result in ctx.results {
            let outcome = printer.paint(result.result.as_str(), Color::for_outcome(result.result));
            printer.detail(&outcome, &result.name, 2, 1);
            if let Some(note) = &result.note {
                printer.detail("note", note, 3, 2);
            }
            for log in &result.log {
                let path = ctx.execute_workdir.join(log);
                printer.detail("log", &path.display().to_string(), 3, 2);
            }
        }
        printer.info("summary", &summary(ctx.results).describe(), 1);
        Ok(())
    }
}
