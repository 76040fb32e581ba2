//! Prepare step and the phase machinery it shares with finish.
//!
//! Phases run in ascending `order` (configuration order breaks ties), each
//! on every guest it targets. The plan workdir is pushed to the guest before
//! every phase. Besides the configured phases, prepare adds:
//!
//! - `multihost` (order 30) when the plan has more than one guest,
//! - `requires` (order 70) installing packages required by the tests,
//! - `recommends` (order 75) installing recommended packages, skipping
//!   the ones that do not exist.

pub mod ansible;
pub mod install;
pub mod multihost;
pub mod shell;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use serde_yaml::Value;
use tracing::{debug, info, instrument};

use crate::core::environment::Environment;
use crate::core::ordering::{DEFAULT_ORDER, ORDER_MULTIHOST, ORDER_RECOMMENDS, ORDER_REQUIRES, sort_phases};
use crate::core::step_name::StepName;
use crate::error::{ErrorKind, classify};
use crate::guest::{Guest, GuestContext};
use crate::io::cancel;
use crate::steps::registry::{PluginInfo, Registry};
use crate::steps::{PlanContext, PluginData, Step, StepCore, check_where};

pub use install::PackageManager;

/// Everything a phase sees while running on one guest.
#[derive(Debug, Clone, Copy)]
pub struct PhaseContext<'a> {
    pub plan: &'a PlanContext,
    pub guest: GuestContext<'a>,
    /// `(guest name, address)` of every guest in the plan.
    pub hosts: &'a [(String, String)],
    /// Package manager detected per guest, kept for the step's duration.
    pub package_managers: &'a RefCell<BTreeMap<String, PackageManager>>,
}

/// A prepare or finish method bound to one phase.
pub trait PhasePlugin {
    fn go(&self, guest: &Guest, ctx: &PhaseContext<'_>) -> Result<()>;

    /// Whether the phase needs guest addresses (`hosts` in the context).
    fn needs_hosts(&self) -> bool {
        false
    }
}

pub type PhaseFactory = fn(&PluginData) -> Result<Box<dyn PhasePlugin>>;

fn info(method: &'static str, order: i64, schema: &'static str, factory: PhaseFactory) -> PluginInfo<PhaseFactory> {
    PluginInfo {
        method,
        order,
        schema,
        factory,
    }
}

pub fn registry() -> Registry<PhaseFactory> {
    Registry::new(StepName::Prepare)
        .register(info("shell", DEFAULT_ORDER, shell::SCHEMA, shell::ShellPhase::create))
        .register(info("ansible", DEFAULT_ORDER, ansible::SCHEMA, ansible::AnsiblePhase::create))
        .register(info("install", DEFAULT_ORDER, install::SCHEMA, install::InstallPhase::create))
        .register(info(
            "multihost",
            ORDER_MULTIHOST,
            multihost::SCHEMA,
            multihost::MultihostPhase::create,
        ))
}

/// Resolve, order and run `phases` on `guests`.
#[instrument(skip_all, fields(step = %step))]
pub fn run_phases(
    step: StepName,
    registry: &Registry<PhaseFactory>,
    phases: &[PluginData],
    plan: &PlanContext,
    guests: &[Guest],
    environment: &Environment,
    log: &Path,
) -> Result<usize> {
    let mut resolved = Vec::with_capacity(phases.len());
    for data in phases {
        let info = registry.resolve(data)?;
        let order = data.order.unwrap_or(info.order);
        resolved.push((order, data, (info.factory)(data)?));
    }
    sort_phases(&mut resolved, |(order, ..)| *order);
    check_where(phases, guests, &plan.printer);

    let guest_ctx = plan.guest_context(environment, log);
    let hosts = if resolved.iter().any(|(_, _, plugin)| plugin.needs_hosts()) {
        multihost::collect_hosts(guests, &guest_ctx)
    } else {
        Vec::new()
    };
    let package_managers = RefCell::new(BTreeMap::new());
    let ctx = PhaseContext {
        plan,
        guest: guest_ctx,
        hosts: &hosts,
        package_managers: &package_managers,
    };

    let kind = match step {
        StepName::Finish => ErrorKind::General,
        _ => ErrorKind::Prepare,
    };
    let mut applied = 0;
    for (order, data, plugin) in &resolved {
        for guest in guests.iter().filter(|guest| data.applies_to(guest)) {
            cancel::check()?;
            plan.printer.info(
                &data.name,
                &format!("{} on {} (order {order})", data.how, guest.name()),
                1,
            );
            debug!(phase = %data.name, guest = %guest.name(), "running phase");
            guest.push(&ctx.guest, None, None)?;
            plugin
                .go(guest, &ctx)
                .map_err(|err| classify(err.context(format!("{step} phase '{}' failed", data.name)), kind))?;
            applied += 1;
        }
    }
    Ok(applied)
}

#[derive(Debug, Clone)]
pub struct Prepare {
    core: StepCore,
    ctx: PlanContext,
}

impl Prepare {
    pub fn new(ctx: &PlanContext, raw: Option<&Value>) -> Result<Self> {
        Ok(Self {
            core: StepCore::new(StepName::Prepare, ctx, raw, "shell")?,
            ctx: ctx.clone(),
        })
    }

    /// Configured phases plus the implicit ones for this plan.
    ///
    /// A `shell` entry without a script (the default phase) does nothing.
    pub fn phases(&self, guest_count: usize, requires: &[String], recommends: &[String]) -> Vec<PluginData> {
        let mut phases: Vec<PluginData> = self
            .core
            .data
            .iter()
            .filter(|phase| phase.how != "shell" || phase.get("script").is_some())
            .cloned()
            .collect();
        let has_multihost = phases.iter().any(|phase| phase.how.starts_with("multi"));
        if guest_count > 1 && !has_multihost {
            phases.push(PluginData {
                order: Some(ORDER_MULTIHOST),
                ..PluginData::new("multihost", "multihost")
            });
        }
        let packages = |list: &[String]| {
            Value::Sequence(list.iter().map(|p| Value::from(p.as_str())).collect())
        };
        if !requires.is_empty() {
            phases.push(PluginData {
                order: Some(ORDER_REQUIRES),
                ..PluginData::new("requires", "install").with_key("package", packages(requires))
            });
        }
        if !recommends.is_empty() {
            phases.push(PluginData {
                order: Some(ORDER_RECOMMENDS),
                ..PluginData::new("recommends", "install")
                    .with_key("package", packages(recommends))
                    .with_key("missing", "skip")
            });
        }
        phases
    }

    #[instrument(skip_all, fields(plan = %self.ctx.plan_name))]
    pub fn go(
        &mut self,
        guests: &[Guest],
        environment: &Environment,
        requires: &[String],
        recommends: &[String],
    ) -> Result<()> {
        if self.core.is_done() {
            info!("prepare already done");
            return Ok(());
        }
        let phases = self.phases(guests.len(), requires, recommends);
        self.core.save()?;
        let applied = run_phases(
            StepName::Prepare,
            &registry(),
            &phases,
            &self.ctx,
            guests,
            environment,
            &self.core.log_path(),
        )?;
        self.ctx.printer.info(
            "summary",
            &(crate::core::result::pluralize(applied, "preparation") + " applied"),
            1,
        );
        self.core.mark_done()
    }
}

impl Step for Prepare {
    fn core(&self) -> &StepCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StepCore {
        &mut self.core
    }

    fn summary(&self) -> String {
        crate::core::result::pluralize(self.core.data.len(), "preparation") + " configured"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::{GuestCommon, GuestState, LocalGuest};
    use crate::io::config::TmtConfig;
    use crate::io::output::Printer;
    use std::fs;

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

    fn local(name: &str) -> Guest {
        let mut common = GuestCommon::new(name, None);
        common.state = GuestState::Ready;
        Guest::Local(LocalGuest::new(common))
    }

    #[test]
    fn implicit_phases_are_added() {
        let temp = tempfile::tempdir().expect("tempdir");
        let step = Prepare::new(&context(temp.path()), None).expect("step");
        let phases = step.phases(2, &["make".to_string()], &["vim".to_string()]);
        let names: Vec<(&str, i64)> = phases.iter().map(|p| (p.name.as_str(), p.order())).collect();
        assert_eq!(
            names,
            [("multihost", 30), ("requires", 70), ("recommends", 75)]
        );
        assert_eq!(phases[2].get_str("missing").as_deref(), Some("skip"));

        let single = step.phases(1, &[], &[]);
        assert!(single.is_empty(), "default phase without a script is dropped");
    }

    #[test]
    fn phases_run_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context(temp.path());
        fs::create_dir_all(&ctx.plan_workdir).expect("workdir");
        let trace = temp.path().join("trace");
        let raw: Value = serde_yaml::from_str(&format!(
            "- name: late\n  how: shell\n  order: 50\n  script: echo late >> {0}\n\
             - name: early\n  how: shell\n  order: 40\n  script: echo early >> {0}\n\
             - name: also-late\n  how: shell\n  script: echo also-late >> {0}\n",
            trace.display()
        ))
        .expect("yaml");
        let mut step = Prepare::new(&ctx, Some(&raw)).expect("step");
        step.wake(None, false).expect("wake");
        step.go(&[local("default-0")], &Environment::new(), &[], &[])
            .expect("go");
        let lines = fs::read_to_string(&trace).expect("trace");
        assert_eq!(lines, "early\nlate\nalso-late\n");
        assert!(step.core().is_done());
    }

    #[test]
    fn where_limits_target_guests() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context(temp.path());
        fs::create_dir_all(&ctx.plan_workdir).expect("workdir");
        let trace = temp.path().join("trace");
        let phases = vec![PluginData {
            where_: vec!["b".to_string()],
            ..PluginData::new("only-b", "shell").with_key("script", format!("echo hit >> {}", trace.display()))
        }];
        let applied = run_phases(
            StepName::Prepare,
            &registry(),
            &phases,
            &ctx,
            &[local("a"), local("b")],
            &Environment::new(),
            &temp.path().join("log.txt"),
        )
        .expect("run");
        assert_eq!(applied, 1);
        assert_eq!(fs::read_to_string(&trace).expect("trace"), "hit\n");
    }

    #[test]
    fn failing_phase_is_a_prepare_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context(temp.path());
        fs::create_dir_all(&ctx.plan_workdir).expect("workdir");
        let phases = vec![PluginData::new("broken", "shell").with_key("script", "exit 3")];
        let err = run_phases(
            StepName::Prepare,
            &registry(),
            &phases,
            &ctx,
            &[local("default-0")],
            &Environment::new(),
            &temp.path().join("log.txt"),
        )
        .expect_err("failure");
        assert_eq!(crate::error::kind_of(&err), ErrorKind::Prepare);
    }
}
