//! Options of a single `tmt run` invocation.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;

use crate::core::environment::Environment;
use crate::core::step_name::StepName;
use crate::error::specification;
use crate::steps::{StepOverride, cli_value};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// `--id`: a run number or a workdir path.
    pub id: Option<String>,
    /// Where to look for the metadata tree.
    pub tree_root: PathBuf,
    /// Overrides `workdir_root` from the tool configuration.
    pub workdir_root: Option<PathBuf>,
    pub all: bool,
    /// Steps named as subcommands (`tmt run discover provision`).
    pub steps: Vec<StepName>,
    pub since: Option<StepName>,
    pub until: Option<StepName>,
    pub skip: Vec<StepName>,
    pub force: bool,
    pub dry: bool,
    /// Delete the workdir after a successful run.
    pub remove: bool,
    pub environment: Environment,
    pub plan_names: Vec<String>,
    pub plan_filters: Vec<String>,
    pub test_names: Vec<String>,
    pub test_filters: Vec<String>,
    pub overrides: BTreeMap<StepName, StepOverride>,
}

impl RunOptions {
    pub fn new(tree_root: impl Into<PathBuf>) -> Self {
        Self {
            tree_root: tree_root.into(),
            ..Self::default()
        }
    }

    /// Whether the command line said anything about which steps to run.
    pub fn selects_steps(&self) -> bool {
        self.all || !self.steps.is_empty() || self.since.is_some() || self.until.is_some() || !self.skip.is_empty()
    }

    /// Steps enabled for this run, in pipeline order.
    ///
    /// `--all` enables everything; `--since`/`--until` enable a range that is
    /// joined with explicitly named steps; no selection at all means every
    /// step. `--skip` is applied last.
    pub fn enabled_steps(&self) -> Vec<StepName> {
        let ranged = self.since.is_some() || self.until.is_some();
        let mut enabled: Vec<StepName> = if self.all || (!ranged && self.steps.is_empty()) {
            StepName::ALL.to_vec()
        } else {
            let mut selected = self.steps.clone();
            if ranged {
                selected.extend(StepName::range(
                    self.since.unwrap_or(StepName::Discover),
                    self.until.unwrap_or(StepName::Finish),
                ));
            }
            StepName::ALL
                .into_iter()
                .filter(|step| selected.contains(step))
                .collect()
        };
        enabled.retain(|step| !self.skip.contains(step));
        enabled
    }
}

/// A section of the `tmt run` trailing arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Step(StepName),
    Plan,
    Test,
}

impl Section {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "plan" => Some(Section::Plan),
            "test" => Some(Section::Test),
            other => other.parse().ok().map(Section::Step),
        }
    }
}

impl RunOptions {
    /// Apply trailing `tmt run` arguments.
    ///
    /// `discover --how fmf provision --how container --image fedora plan
    /// --name smoke test --filter 'tier: 1'`: a step name enables the step and
    /// its `--key value` options override the step configuration; `plan` and
    /// `test` take `--name` and `--filter`. An option without a value is
    /// `true`.
    pub fn apply_sections(&mut self, args: &[String]) -> Result<()> {
        let mut section: Option<Section> = None;
        let mut index = 0;
        while index < args.len() {
            let token = args[index].as_str();
            index += 1;
            if let Some(next) = Section::parse(token) {
                if let Section::Step(step) = next
                    && !self.steps.contains(&step)
                {
                    self.steps.push(step);
                }
                section = Some(next);
                continue;
            }
            let Some(current) = section else {
                return Err(specification(format!("unexpected argument '{token}'")));
            };
            let Some(option) = token.strip_prefix("--") else {
                return Err(specification(format!("unexpected argument '{token}' after '{}'", section_name(current))));
            };
            let (key, value) = match option.split_once('=') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => match args.get(index) {
                    Some(next) if !next.starts_with("--") && Section::parse(next).is_none() => {
                        index += 1;
                        (option.to_string(), next.clone())
                    }
                    _ => (option.to_string(), "true".to_string()),
                },
            };
            self.apply_option(current, key, value)?;
        }
        Ok(())
    }

    fn apply_option(&mut self, section: Section, key: String, value: String) -> Result<()> {
        match (section, key.as_str()) {
            (Section::Plan, "name") => self.plan_names.push(value),
            (Section::Plan, "filter") => self.plan_filters.push(value),
            (Section::Test, "name") => self.test_names.push(value),
            (Section::Test, "filter") => self.test_filters.push(value),
            (Section::Plan | Section::Test, _) => {
                return Err(specification(format!(
                    "unknown option '--{key}' for '{}'",
                    section_name(section)
                )));
            }
            (Section::Step(step), "how") => {
                self.overrides.entry(step).or_default().how = Some(value);
            }
            (Section::Step(step), _) => {
                self.overrides
                    .entry(step)
                    .or_default()
                    .keys
                    .insert(key, cli_value(&value));
            }
        }
        Ok(())
    }
}

fn section_name(section: Section) -> &'static str {
    match section {
        Section::Step(step) => step.as_str(),
        Section::Plan => "plan",
        Section::Test => "test",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_yaml::Value;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn sections_enable_steps_and_collect_overrides() {
        let mut options = RunOptions::default();
        options
            .apply_sections(&args(&[
                "provision", "--how", "container", "--image=fedora", "prepare", "--order", "40",
                "execute", "--exit-first", "plan", "--name", "/smoke", "test", "--filter", "tier: 1",
            ]))
            .expect("sections");
        assert_eq!(options.steps, [StepName::Provision, StepName::Prepare, StepName::Execute]);
        let provision = &options.overrides[&StepName::Provision];
        assert_eq!(provision.how.as_deref(), Some("container"));
        assert_eq!(provision.keys["image"], Value::from("fedora"));
        assert_eq!(options.overrides[&StepName::Prepare].keys["order"], Value::from(40));
        assert_eq!(options.overrides[&StepName::Execute].keys["exit-first"], Value::Bool(true));
        assert_eq!(options.plan_names, ["/smoke"]);
        assert_eq!(options.test_filters, ["tier: 1"]);
    }

    #[test]
    fn stray_arguments_are_rejected() {
        assert!(RunOptions::default().apply_sections(&args(&["--how", "local"])).is_err());
        assert!(RunOptions::default().apply_sections(&args(&["plan", "--how", "x"])).is_err());
        assert!(RunOptions::default().apply_sections(&args(&["discover", "fmf"])).is_err());
    }

    #[test]
    fn default_enables_every_step() {
        assert_eq!(RunOptions::default().enabled_steps(), StepName::ALL.to_vec());
        assert!(!RunOptions::default().selects_steps());
    }

    #[test]
    fn explicit_steps_keep_pipeline_order() {
        let options = RunOptions {
            steps: vec![StepName::Provision, StepName::Discover],
            ..RunOptions::default()
        };
        assert_eq!(options.enabled_steps(), [StepName::Discover, StepName::Provision]);
    }

    #[test]
    fn ranges_join_named_steps_and_skip_wins() {
        let options = RunOptions {
            until: Some(StepName::Provision),
            steps: vec![StepName::Finish],
            skip: vec![StepName::Provision],
            ..RunOptions::default()
        };
        assert_eq!(options.enabled_steps(), [StepName::Discover, StepName::Finish]);

        let since = RunOptions {
            since: Some(StepName::Report),
            ..RunOptions::default()
        };
        assert_eq!(since.enabled_steps(), [StepName::Report, StepName::Finish]);
    }

    #[test]
    fn all_overrides_named_steps() {
        let options = RunOptions {
            all: true,
            steps: vec![StepName::Discover],
            skip: vec![StepName::Report],
            ..RunOptions::default()
        };
        assert_eq!(options.enabled_steps().len(), 5);
    }
}
