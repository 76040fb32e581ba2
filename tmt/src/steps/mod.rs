//! The six pipeline steps and what they share.
//!
//! Every step owns a list of phases ([`PluginData`], one per configured
//! entry), a status and a workdir under the plan workdir. [`StepCore`] holds
//! that state and implements resumption: a step saved as `done` is reloaded
//! and skipped, a step saved as `todo` was interrupted and starts over from
//! a clean workdir, `--force` always starts over.
//!
//! Steps exchange typed data (tests, guests, results), so each concrete step
//! has its own `go`; the [`Step`] trait covers what the plan drives
//! uniformly.

pub mod discover;
pub mod execute;
pub mod finish;
pub mod prepare;
pub mod provision;
pub mod registry;
pub mod report;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::{debug, info};

use crate::core::environment::{self, Environment};
use crate::core::ordering::DEFAULT_ORDER;
use crate::core::step_name::{StepName, StepStatus};
use crate::error::specification;
use crate::guest::{Guest, GuestContext};
use crate::io::config::TmtConfig;
use crate::io::output::Printer;
use crate::io::{persist, workdir};

pub const STEP_FILE: &str = "step.yaml";
pub const LOG_FILE: &str = "log.txt";

/// One configured phase of a step (an entry of the step's `data` list).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginData {
    pub name: String,
    pub how: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
    /// Guest names or roles this phase applies to (prepare/finish).
    #[serde(
        default,
        rename = "where",
        deserialize_with = "crate::core::test::one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub where_: Vec<String>,
    /// Method specific keys.
    #[serde(flatten)]
    pub keys: BTreeMap<String, Value>,
}

impl PluginData {
    pub fn new(name: impl Into<String>, how: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            how: how.into(),
            order: None,
            where_: Vec::new(),
            keys: BTreeMap::new(),
        }
    }

    pub fn with_key(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.keys.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.keys.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.as_str(), "true" | "yes" | "1"),
            _ => false,
        }
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// A string or list of strings as a list.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(Value::Sequence(items)) => items
                .iter()
                .filter_map(|item| environment::scalar_to_string(item).ok())
                .collect(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => environment::scalar_to_string(other).into_iter().collect(),
        }
    }

    pub fn order(&self) -> i64 {
        self.order.unwrap_or(DEFAULT_ORDER)
    }

    /// Whether this phase targets `guest` (no `where` means every guest).
    pub fn applies_to(&self, guest: &Guest) -> bool {
        self.where_.is_empty()
            || self
                .where_
                .iter()
                .any(|target| target == guest.name() || Some(target.as_str()) == guest.role())
    }
}

/// Saved form of a step (`step.yaml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    pub data: Vec<PluginData>,
}

/// Command line override of one step: `provision --how container --image fedora`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOverride {
    pub how: Option<String>,
    pub keys: BTreeMap<String, Value>,
}

impl StepOverride {
    pub fn is_empty(&self) -> bool {
        self.how.is_none() && self.keys.is_empty()
    }
}

/// Normalize a step section of plan metadata into a list of phases.
///
/// Accepts nothing (one default phase), a single mapping or a list of
/// mappings. Names default to `default-N`, `how` to `default_how`.
pub fn normalize_data(step: StepName, raw: Option<&Value>, default_how: &str) -> Result<Vec<PluginData>> {
    let entries: Vec<Value> = match raw {
        None | Some(Value::Null) => vec![Value::Mapping(Default::default())],
        Some(Value::Mapping(map)) => vec![Value::Mapping(map.clone())],
        Some(Value::Sequence(items)) if items.is_empty() => vec![Value::Mapping(Default::default())],
        Some(Value::Sequence(items)) => items.clone(),
        Some(other) => {
            return Err(specification(format!(
                "invalid '{step}' configuration: expected a mapping or a list, got {other:?}"
            )));
        }
    };

    let mut data = Vec::with_capacity(entries.len());
    let mut seen = BTreeSet::new();
    for (index, entry) in entries.into_iter().enumerate() {
        let Value::Mapping(mut map) = entry else {
            return Err(specification(format!(
                "invalid '{step}' phase #{index}: expected a mapping"
            )));
        };
        let name_key = Value::from("name");
        if !map.contains_key(&name_key) {
            map.insert(name_key, Value::from(format!("default-{index}")));
        }
        let how_key = Value::from("how");
        if !map.contains_key(&how_key) {
            map.insert(how_key, Value::from(default_how));
        }
        let phase: PluginData = serde_yaml::from_value(Value::Mapping(map))
            .map_err(|err| specification(format!("invalid '{step}' phase #{index}: {err}")))?;
        if !seen.insert(phase.name.clone()) {
            return Err(specification(format!(
                "duplicate phase name '{}' in step '{step}'",
                phase.name
            )));
        }
        data.push(phase);
    }
    Ok(data)
}

/// Parse a command line value as a YAML scalar (`40` → int, `true` → bool).
pub fn cli_value(raw: &str) -> Value {
    match serde_yaml::from_str::<Value>(raw) {
        Ok(value @ (Value::Bool(_) | Value::Number(_) | Value::String(_))) => value,
        _ => Value::String(raw.to_string()),
    }
}

/// Information every step needs about its plan.
#[derive(Debug, Clone)]
pub struct PlanContext {
    pub plan_name: String,
    pub plan_workdir: PathBuf,
    /// Root of the metadata tree the plan was read from.
    pub tree_root: PathBuf,
    pub config: TmtConfig,
    pub printer: Printer,
    /// Plan environment with run-level (`-e`) values applied on top.
    pub environment: Environment,
    pub force: bool,
    pub dry: bool,
}

impl PlanContext {
    pub fn step_workdir(&self, step: StepName) -> PathBuf {
        self.plan_workdir.join(step.as_str())
    }

    /// Context for guest operations logging into `log`.
    pub fn guest_context<'a>(&'a self, environment: &'a Environment, log: &'a Path) -> GuestContext<'a> {
        GuestContext {
            plan_workdir: &self.plan_workdir,
            environment,
            config: &self.config,
            log: Some(log),
        }
    }
}

/// State shared by all steps.
#[derive(Debug, Clone, PartialEq)]
pub struct StepCore {
    pub name: StepName,
    pub data: Vec<PluginData>,
    pub status: StepStatus,
    pub workdir: PathBuf,
    /// Whether the step's `go` should do any work in this run.
    pub enabled: bool,
}

impl StepCore {
    pub fn new(name: StepName, ctx: &PlanContext, raw: Option<&Value>, default_how: &str) -> Result<Self> {
        Ok(Self {
            name,
            data: normalize_data(name, raw, default_how)?,
            status: StepStatus::Todo,
            workdir: ctx.step_workdir(name),
            enabled: true,
        })
    }

    pub fn state_path(&self) -> PathBuf {
        self.workdir.join(STEP_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.workdir.join(LOG_FILE)
    }

    pub fn is_done(&self) -> bool {
        self.status == StepStatus::Done
    }

    /// Load saved state and apply command line overrides.
    pub fn wake(&mut self, overrides: Option<&StepOverride>, force: bool) -> Result<()> {
        if force {
            debug!(step = %self.name, "forced, cleaning step workdir");
            workdir::clean(&self.workdir)?;
            self.status = StepStatus::Todo;
        } else {
            match persist::load_yaml::<StepState>(&self.state_path())? {
                Some(saved) if saved.status == StepStatus::Done => {
                    debug!(step = %self.name, "step already done");
                    self.data = saved.data;
                    self.status = StepStatus::Done;
                }
                Some(_) => {
                    info!(step = %self.name, "step was interrupted, starting over");
                    workdir::clean(&self.workdir)?;
                    self.status = StepStatus::Todo;
                }
                None => {}
            }
        }

        if let Some(overrides) = overrides.filter(|o| !o.is_empty()) {
            for phase in &mut self.data {
                if let Some(how) = &overrides.how {
                    phase.how = how.clone();
                }
                for (key, value) in &overrides.keys {
                    match key.as_str() {
                        "order" => phase.order = value.as_i64(),
                        _ => {
                            phase.keys.insert(key.clone(), value.clone());
                        }
                    }
                }
            }
            if self.is_done() {
                info!(step = %self.name, "options given on the command line, step will run again");
                workdir::clean(&self.workdir)?;
                self.status = StepStatus::Todo;
            }
        }

        fs::create_dir_all(&self.workdir)
            .with_context(|| format!("create step workdir {}", self.workdir.display()))
    }

    pub fn save(&self) -> Result<()> {
        persist::write_yaml(
            &self.state_path(),
            &StepState {
                status: self.status,
                data: self.data.clone(),
            },
        )
    }

    /// Commit the step as done (artifacts must already be written).
    pub fn mark_done(&mut self) -> Result<()> {
        self.status = StepStatus::Done;
        self.save()
    }

    /// Reset the status to `todo` and persist it.
    pub fn mark_todo(&mut self) -> Result<()> {
        self.status = StepStatus::Todo;
        self.save()
    }
}

/// What the plan drives uniformly across steps.
pub trait Step {
    fn core(&self) -> &StepCore;

    fn core_mut(&mut self) -> &mut StepCore;

    /// One-line human summary (`3 tests executed`).
    fn summary(&self) -> String;

    /// Load saved state, then step specific artifacts.
    fn wake(&mut self, overrides: Option<&StepOverride>, force: bool) -> Result<()> {
        self.core_mut().wake(overrides, force)
    }

    /// Print configured phases.
    fn show(&self, printer: &Printer) {
        let core = self.core();
        printer.header(core.name.as_str(), 1);
        for phase in &core.data {
            printer.info("name", &phase.name, 2);
            printer.info("how", &phase.how, 2);
            if let Some(order) = phase.order {
                printer.info("order", &order.to_string(), 2);
            }
            if !phase.where_.is_empty() {
                printer.info("where", &phase.where_.join(", "), 2);
            }
            for (key, value) in &phase.keys {
                let rendered = serde_yaml::to_string(value).unwrap_or_default();
                printer.detail(key, rendered.trim(), 2, 1);
            }
        }
    }
}

/// Warn about phases that target names no guest has.
pub fn check_where(phases: &[PluginData], guests: &[Guest], printer: &Printer) {
    for phase in phases {
        for target in &phase.where_ {
            let known = guests
                .iter()
                .any(|g| g.name() == target || g.role() == Some(target.as_str()));
            if !known {
                printer.warn(&format!(
                    "phase '{}' targets '{target}' but no guest has that name or role",
                    phase.name
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).expect("yaml")
    }

    #[test]
    fn missing_section_yields_default_phase() {
        let data = normalize_data(StepName::Discover, None, "fmf").expect("normalize");
        assert_eq!(data, vec![PluginData::new("default-0", "fmf")]);
    }

    #[test]
    fn single_mapping_becomes_list() {
        let raw = yaml("how: shell\nscript: echo hi\n");
        let data = normalize_data(StepName::Prepare, Some(&raw), "shell").expect("normalize");
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].name, "default-0");
        assert_eq!(data[0].get_str("script").as_deref(), Some("echo hi"));
    }

    #[test]
    fn list_entries_get_indexed_default_names() {
        let raw = yaml("- how: shell\n- name: custom\n  order: 40\n");
        let data = normalize_data(StepName::Prepare, Some(&raw), "shell").expect("normalize");
        assert_eq!(data[0].name, "default-0");
        assert_eq!(data[1].name, "custom");
        assert_eq!(data[1].how, "shell");
        assert_eq!(data[1].order(), 40);
        assert_eq!(data[0].order(), DEFAULT_ORDER);
    }

    #[test]
    fn duplicate_names_are_specification_errors() {
        let raw = yaml("- name: a\n- name: a\n");
        let err = normalize_data(StepName::Prepare, Some(&raw), "shell").expect_err("dup");
        assert_eq!(crate::error::kind_of(&err), crate::error::ErrorKind::Specification);
        assert!(err.to_string().contains("duplicate phase name"));
    }

    #[test]
    fn scalar_section_is_rejected() {
        let raw = yaml("just a string");
        assert!(normalize_data(StepName::Execute, Some(&raw), "tmt").is_err());
    }

    #[test]
    fn where_accepts_a_single_string() {
        let raw = yaml("how: shell\nwhere: server\n");
        let data = normalize_data(StepName::Prepare, Some(&raw), "shell").expect("normalize");
        assert_eq!(data[0].where_, vec!["server".to_string()]);

        let raw = yaml("how: shell\nwhere: [server, client]\n");
        let data = normalize_data(StepName::Prepare, Some(&raw), "shell").expect("normalize");
        assert_eq!(data[0].where_, ["server", "client"]);
    }

    #[test]
    fn cli_values_parse_as_scalars() {
        assert_eq!(cli_value("40"), Value::from(40));
        assert_eq!(cli_value("true"), Value::from(true));
        assert_eq!(cli_value("fedora:39"), Value::from("fedora:39"));
        assert_eq!(cli_value("[a"), Value::from("[a"));
    }

    #[test]
    fn step_state_round_trips() {
        let state = StepState {
            status: StepStatus::Done,
            data: vec![
                PluginData::new("default-0", "shell").with_key("script", "echo hi"),
                PluginData {
                    order: Some(40),
                    where_: vec!["client".to_string()],
                    ..PluginData::new("second", "install")
                },
            ],
        };
        let text = serde_yaml::to_string(&state).expect("serialize");
        let back: StepState = serde_yaml::from_str(&text).expect("deserialize");
        assert_eq!(back, state);
        assert_eq!(serde_yaml::to_string(&back).expect("serialize"), text);
    }

    fn context(root: &Path) -> PlanContext {
        PlanContext {
            plan_name: "/plan".to_string(),
            plan_workdir: root.join("plan"),
            tree_root: root.to_path_buf(),
            config: TmtConfig::default(),
            printer: Printer::silent(),
            environment: Environment::new(),
            force: false,
            dry: false,
        }
    }

    #[test]
    fn wake_restores_done_and_resets_interrupted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context(temp.path());

        let mut core = StepCore::new(StepName::Discover, &ctx, None, "fmf").expect("core");
        core.wake(None, false).expect("wake");
        fs::write(core.workdir.join("artifact"), "x").expect("write");
        core.mark_done().expect("done");

        let mut again = StepCore::new(StepName::Discover, &ctx, None, "shell").expect("core");
        again.wake(None, false).expect("wake");
        assert!(again.is_done());
        assert_eq!(again.data[0].how, "fmf");
        assert!(again.workdir.join("artifact").exists());

        again.mark_todo().expect("todo");
        let mut interrupted = StepCore::new(StepName::Discover, &ctx, None, "fmf").expect("core");
        interrupted.wake(None, false).expect("wake");
        assert!(!interrupted.is_done());
        assert!(!interrupted.workdir.join("artifact").exists());
    }

    #[test]
    fn override_replaces_how_and_reruns() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context(temp.path());
        let raw = yaml("- how: virtual\n- how: virtual\n  name: second\n");
        let mut core = StepCore::new(StepName::Provision, &ctx, Some(&raw), "virtual").expect("core");
        core.wake(None, false).expect("wake");
        core.mark_done().expect("done");

        let overrides = StepOverride {
            how: Some("container".to_string()),
            keys: BTreeMap::from([("image".to_string(), cli_value("fedora"))]),
        };
        let mut again = StepCore::new(StepName::Provision, &ctx, Some(&raw), "virtual").expect("core");
        again.wake(Some(&overrides), false).expect("wake");
        assert!(!again.is_done());
        assert!(again.data.iter().all(|p| p.how == "container"));
        assert!(again.data.iter().all(|p| p.get_str("image").as_deref() == Some("fedora")));
    }

    #[test]
    fn force_cleans_done_step() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context(temp.path());
        let mut core = StepCore::new(StepName::Report, &ctx, None, "display").expect("core");
        core.wake(None, false).expect("wake");
        core.mark_done().expect("done");

        let mut forced = StepCore::new(StepName::Report, &ctx, None, "display").expect("core");
        forced.wake(None, true).expect("wake");
        assert!(!forced.is_done());
        assert!(!forced.state_path().exists());
    }
}
