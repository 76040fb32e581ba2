//! `how: junit` — write results as a JUnit (xUnit) XML document.
//!
//! [`XunitDocument`] is shared with the Polarion and ReportPortal sinks,
//! which upload the same document with extra properties.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use crate::core::result::{Outcome, TestResult};
use crate::steps::PluginData;
use crate::steps::report::{ReportContext, ReportPlugin, duration_seconds, render, summary};

pub const SCHEMA: &str = crate::phase_schema!(
    r#",
    "file": {"type": "string"}"#
);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Property {
    pub name: String,
    pub value: String,
}

impl Property {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Case {
    name: String,
    time: u64,
    result: Outcome,
    message: String,
    log: Vec<String>,
    properties: Vec<Property>,
}

/// Suite-level data of one xUnit document.
#[derive(Debug, Clone, Default)]
pub struct XunitDocument {
    pub suite: String,
    pub properties: Vec<Property>,
}

impl XunitDocument {
    pub fn new(suite: impl Into<String>) -> Self {
        Self {
            suite: suite.into(),
            properties: Vec::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push(Property::new(name, value));
        self
    }

    /// Render `results`, with `case_properties` supplying per-testcase properties.
    pub fn render(
        &self,
        results: &[TestResult],
        execute_workdir: &Path,
        case_properties: impl Fn(&TestResult) -> Vec<Property>,
    ) -> Result<String> {
        let counts = summary(results);
        let cases: Vec<Case> = results
            .iter()
            .map(|result| Case {
                name: result.name.clone(),
                time: duration_seconds(result),
                result: result.result,
                message: result
                    .note
                    .clone()
                    .unwrap_or_else(|| format!("test {}", result.result)),
                log: result
                    .log
                    .iter()
                    .map(|log| execute_workdir.join(log).display().to_string())
                    .collect(),
                properties: case_properties(result),
            })
            .collect();
        let time: u64 = cases.iter().map(|case| case.time).sum();
        render(
            "junit.xml",
            minijinja::context! {
                suite => self.suite,
                properties => self.properties,
                cases => cases,
                total => counts.total(),
                failures => counts.count(Outcome::Fail),
                errors => counts.count(Outcome::Error),
                skipped => counts.count(Outcome::Info) + counts.count(Outcome::Warn),
                time => time,
            },
        )
    }
}

#[derive(Debug, Clone)]
pub struct JunitReport {
    file: Option<String>,
}

impl JunitReport {
    pub fn create(data: &PluginData) -> Result<Box<dyn ReportPlugin>> {
        Ok(Box::new(Self {
            file: data.get_str("file"),
        }))
    }
}

impl ReportPlugin for JunitReport {
    fn go(&self, ctx: &ReportContext<'_>) -> Result<()> {
        let xml = XunitDocument::new(ctx.plan.plan_name.as_str()).render(
            ctx.results,
            ctx.execute_workdir,
            |_| Vec::new(),
        )?;
        let path = ctx.output_path(self.file.as_deref(), "junit.xml");
        fs::write(&path, xml).with_context(|| format!("write {}", path.display()))?;
        info!(path = %path.display(), "junit report written");
        ctx.plan.printer.info("output", &path.display().to_string(), 2);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_counts_and_failures() {
        let mut pass = TestResult::new("/t1", Outcome::Pass);
        pass.duration = Some("00:00:03".to_string());
        pass.log.push("data/t1/out.log".to_string());
        let results = vec![
            pass,
            TestResult::new("/t2", Outcome::Fail).with_note("a < b"),
            TestResult::new("/t3", Outcome::Error),
        ];
        let xml = XunitDocument::new("/plans/smoke")
            .with_property("polarion-project-id", "RHEL")
            .render(&results, Path::new("/w/execute"), |r| {
                vec![Property::new("id", r.name.trim_start_matches('/'))]
            })
            .expect("render");
        assert!(xml.contains(r#"<testsuite name="/plans/smoke" tests="3" failures="1" errors="1" skipped="0" time="3">"#));
        assert!(xml.contains(r#"<property name="polarion-project-id" value="RHEL"/>"#));
        assert!(xml.contains(r#"<testcase name="/t1" classname="/plans/smoke" time="3">"#));
        assert!(xml.contains(r#"<failure type="failure" message="a &lt; b"/>"#));
        assert!(xml.contains(r#"<error type="error" message="test error"/>"#));
        assert!(xml.contains("<system-out>/w/execute/data/t1/out.log</system-out>"));
        assert!(xml.contains(r#"<property name="id" value="t2"/>"#));
    }
}
