//! `tmt run`: select plans, drive them through the pipeline, compute the exit code.
//!
//! The run manifest (`run.yaml`) records the selected plans and enabled steps
//! before any plan starts, so an interrupted run can be resumed with `--id`
//! without repeating the selection.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::core::filter::{Filter, compile_patterns};
use crate::core::result::{Outcome, Summary};
use crate::core::step_name::StepName;
use crate::error::{ErrorKind, kind_of, specification};
use crate::exit_codes;
use crate::fmf::Tree;
use crate::io::config::TmtConfig;
use crate::io::output::Printer;
use crate::io::{persist, workdir};
use crate::options::RunOptions;
use crate::plan::{Plan, PlanSettings};
use crate::steps::discover::TestSelection;

pub const RUN_FILE: &str = "run.yaml";

/// Saved selection of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub plans: Vec<String>,
    pub steps: Vec<StepName>,
}

/// First error of a plan.
#[derive(Debug)]
pub struct PlanError {
    pub plan: String,
    pub kind: ErrorKind,
    pub error: anyhow::Error,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub workdir: PathBuf,
    pub summary: Summary,
    pub errors: Vec<PlanError>,
    pub exit_code: i32,
}

/// Exit code for a finished run.
pub fn exit_code(summary: &Summary, errors: &[PlanError]) -> i32 {
    if errors.iter().any(|err| err.kind == ErrorKind::Interrupted) {
        exit_codes::INTERRUPTED
    } else if !errors.is_empty() || summary.count(Outcome::Error) > 0 {
        exit_codes::ERROR
    } else if summary.count(Outcome::Fail) > 0 || summary.count(Outcome::Warn) > 0 {
        exit_codes::FAILED
    } else {
        exit_codes::OK
    }
}

fn filters(raw: &[String]) -> Result<Vec<Filter>> {
    raw.iter()
        .map(|expression| Filter::parse(expression).map_err(|err| specification(format!("{err:#}"))))
        .collect()
}

fn patterns(raw: &[String]) -> Result<Vec<regex::Regex>> {
    compile_patterns(raw).map_err(|err| specification(format!("{err:#}")))
}

fn select_plans(tree: &Tree, options: &RunOptions) -> Result<Vec<String>> {
    let names = patterns(&options.plan_names)?;
    let filters = filters(&options.plan_filters)?;
    Ok(tree
        .select("execute", &names, &filters)
        .into_iter()
        .filter(|node| node.enabled())
        .map(|node| node.name.clone())
        .collect())
}

/// Load the saved manifest or build a new one from the command line.
fn manifest(workdir: &Path, tree: &Tree, options: &RunOptions) -> Result<RunManifest> {
    let fresh_selection = !options.plan_names.is_empty() || !options.plan_filters.is_empty();
    let saved: Option<RunManifest> = persist::load_yaml(&workdir.join(RUN_FILE))?;
    let mut manifest = match saved {
        Some(saved) if !fresh_selection => {
            info!(plans = saved.plans.len(), "resuming saved run");
            saved
        }
        _ => RunManifest {
            plans: select_plans(tree, options)?,
            steps: options.enabled_steps(),
        },
    };
    if options.selects_steps() {
        manifest.steps = options.enabled_steps();
    }
    if manifest.plans.is_empty() {
        return Err(specification(format!(
            "no plans found in {}",
            tree.root().display()
        )));
    }
    Ok(manifest)
}

#[instrument(skip_all, fields(root = %options.tree_root.display()))]
pub fn run(options: &RunOptions, config: &TmtConfig, printer: Printer) -> Result<RunOutcome> {
    let root = Tree::find_root(&options.tree_root).map_err(|err| specification(format!("{err:#}")))?;
    let tree = Tree::load(&root).map_err(|err| specification(format!("{err:#}")))?;
    let workdir_root = options
        .workdir_root
        .clone()
        .unwrap_or_else(|| config.workdir_root.clone());
    let (workdir, existed) = workdir::resolve(&workdir_root, &workdir::WorkdirRequest::parse(options.id.as_deref()))?;
    printer.info("workdir", &workdir.display().to_string(), 0);
    if existed {
        info!(workdir = %workdir.display(), "existing run");
    }

    let manifest = manifest(&workdir, &tree, options)?;
    if !options.dry {
        persist::write_yaml(&workdir.join(RUN_FILE), &manifest)?;
    }
    let selection = TestSelection {
        names: patterns(&options.test_names)?,
        filters: filters(&options.test_filters)?,
    };

    let settings = PlanSettings {
        workdir: &workdir,
        tree_root: tree.root(),
        config,
        printer,
        environment: &options.environment,
        force: options.force,
        dry: options.dry,
    };
    let mut summary = Summary::default();
    let mut errors = Vec::new();
    for name in &manifest.plans {
        let outcome = tree
            .find(name)
            .ok_or_else(|| specification(format!("plan '{name}' not found in {}", tree.root().display())))
            .and_then(|node| Plan::from_node(node, &settings))
            .and_then(|mut plan| {
                plan.select_tests(selection.clone());
                let woken = plan.wake(&manifest.steps, &options.overrides);
                let went = woken.and_then(|()| plan.go());
                summary.merge(&Summary::from_results(plan.results()));
                went
            });
        if let Err(error) = outcome {
            let kind = kind_of(&error);
            printer.error(&format!("plan {name}: {error:#}"));
            errors.push(PlanError {
                plan: name.clone(),
                kind,
                error,
            });
            if kind == ErrorKind::Interrupted {
                warn!("run interrupted, remaining plans skipped");
                break;
            }
        }
    }

    if !options.dry {
        if summary.total() == 0 && manifest.steps.contains(&StepName::Execute) {
            printer.warn("no results found");
        }
        printer.header("total", 0);
        printer.info("summary", &summary.describe(), 1);
    }
    let exit_code = exit_code(&summary, &errors);
    if options.remove && exit_code == exit_codes::OK && !options.dry {
        fs::remove_dir_all(&workdir).with_context(|| format!("remove workdir {}", workdir.display()))?;
        info!(workdir = %workdir.display(), "workdir removed");
    }
    Ok(RunOutcome {
        workdir,
        summary,
        errors,
        exit_code,
    })
}
