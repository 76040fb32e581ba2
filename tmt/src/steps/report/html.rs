//! `how: html` — a static `index.html` with links to test logs.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use crate::steps::PluginData;
use crate::steps::report::{ReportContext, ReportPlugin, render, summary};

pub const SCHEMA: &str = crate::phase_schema!(
    r#",
    "file": {"type": "string"}"#
);

#[derive(Debug, Serialize)]
struct LogLink {
    name: String,
    href: String,
}

#[derive(Debug, Serialize)]
struct Row {
    name: String,
    result: String,
    guest: String,
    duration: String,
    note: String,
    logs: Vec<LogLink>,
}

#[derive(Debug, Clone)]
pub struct HtmlReport {
    file: Option<String>,
}

impl HtmlReport {
    pub fn create(data: &PluginData) -> Result<Box<dyn ReportPlugin>> {
        Ok(Box::new(Self {
            file: data.get_str("file"),
        }))
    }
}

/// `target` relative to `base` (both absolute), for links inside the workdir.
fn relative_to(target: &Path, base: &Path) -> PathBuf {
    let target: Vec<Component> = target.components().collect();
    let base: Vec<Component> = base.components().collect();
    let common = target.iter().zip(&base).take_while(|(a, b)| a == b).count();
    let mut out = PathBuf::new();
    for _ in common..base.len() {
        out.push("..");
    }
    for part in &target[common..] {
        out.push(part);
    }
    out
}

impl ReportPlugin for HtmlReport {
    fn go(&self, ctx: &ReportContext<'_>) -> Result<()> {
        let path = ctx.output_path(self.file.as_deref(), "index.html");
        let base = path.parent().unwrap_or(ctx.phase_dir);
        let rows: Vec<Row> = ctx
            .results
            .iter()
            .map(|result| Row {
                name: result.name.clone(),
                result: result.result.to_string(),
                guest: result.guest.clone().unwrap_or_default(),
                duration: result.duration.clone().unwrap_or_default(),
                note: result.note.clone().unwrap_or_default(),
                logs: result
                    .log
                    .iter()
                    .map(|log| LogLink {
                        name: Path::new(log)
                            .file_name()
                            .map(|name| name.to_string_lossy().to_string())
                            .unwrap_or_else(|| log.clone()),
                        href: relative_to(&ctx.execute_workdir.join(log), base)
                            .display()
                            .to_string(),
                    })
                    .collect(),
            })
            .collect();
        let html = render(
            "index.html",
            minijinja::context! {
                plan => ctx.plan.plan_name,
                summary => summary(ctx.results).describe(),
                results => rows,
            },
        )?;
        fs::write(&path, html).with_context(|| format!("write {}", path.display()))?;
        info!(path = %path.display(), "html report written");
        ctx.plan.printer.info("output", &path.display().to_string(), 2);
        Ok(())
    }
}
