//! Provision step: one guest per phase, in configuration order.
//!
//! Guests are written to `guests.yaml` (keyed by phase name) before they are
//! started, so a guest that fails half way still gets cleaned up by finish.
//! A done step wakes its saved guests instead of starting new ones; guests
//! saved by a provision that never completed are stopped and removed before
//! the step starts over.

pub mod plugins;

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::environment::{self, Environment};
use crate::core::ordering::DEFAULT_ORDER;
use crate::core::step_name::StepName;
use crate::guest::{Guest, GuestState};
use crate::io::output::Printer;
use crate::io::persist;
use crate::steps::registry::{PluginInfo, Registry};
use crate::steps::{PlanContext, PluginData, Step, StepCore, StepOverride};

pub use plugins::ProvisionFactory;

pub const GUESTS_FILE: &str = "guests.yaml";

pub fn registry() -> Registry<ProvisionFactory> {
    let method = |method: &'static str, schema: &'static str, factory: ProvisionFactory| PluginInfo {
        method,
        order: DEFAULT_ORDER,
        schema,
        factory,
    };
    Registry::new(StepName::Provision)
        .register(method("local", plugins::LOCAL_SCHEMA, plugins::local))
        .register(method("container", plugins::CONTAINER_SCHEMA, plugins::container))
        .register(method("connect", plugins::CONNECT_SCHEMA, plugins::connect))
        .register(method("virtual", plugins::VIRTUAL_SCHEMA, plugins::virtual_machine))
        .register(method("artemis", plugins::ARTEMIS_SCHEMA, plugins::artemis))
        .register(method("minute", plugins::MINUTE_SCHEMA, plugins::minute))
}

#[derive(Debug, Clone)]
pub struct Provision {
    core: StepCore,
    ctx: PlanContext,
    guests: Vec<Guest>,
}

impl Provision {
    pub fn new(ctx: &PlanContext, raw: Option<&serde_yaml::Value>) -> Result<Self> {
        Ok(Self {
            core: StepCore::new(StepName::Provision, ctx, raw, &ctx.config.default_provision)?,
            ctx: ctx.clone(),
            guests: Vec::new(),
        })
    }

    pub fn guests(&self) -> &[Guest] {
        &self.guests
    }

    pub fn guests_mut(&mut self) -> &mut [Guest] {
        &mut self.guests
    }

    /// `TMT_ROLE_<role>` variables for the provisioned guests.
    pub fn role_environment(&self) -> Environment {
        environment::role_variables(self.guests.iter().map(|g| (g.name(), g.role())))
    }

    fn guests_path(&self) -> PathBuf {
        self.core.workdir.join(GUESTS_FILE)
    }

    fn instance_dir(&self, phase: &PluginData) -> PathBuf {
        self.core.workdir.join(&phase.name)
    }

    /// Persist guest documents keyed by phase name.
    pub fn save_guests(&self) -> Result<()> {
        let documents: BTreeMap<&str, &Guest> = self.guests.iter().map(|g| (g.name(), g)).collect();
        persist::write_yaml(&self.guests_path(), &documents)
    }

    fn load_guests(&self) -> Result<Option<BTreeMap<String, Guest>>> {
        persist::load_yaml::<BTreeMap<String, Guest>>(&self.guests_path())
    }

    /// Saved guests in phase order.
    fn adopt_guests(&mut self, mut saved: BTreeMap<String, Guest>) {
        let mut guests = Vec::with_capacity(saved.len());
        for phase in &self.core.data {
            if let Some(guest) = saved.remove(&phase.name) {
                guests.push(guest);
            }
        }
        // guests of phases no longer configured still need cleanup
        guests.extend(saved.into_values());
        self.guests = guests;
    }

    /// Stop and remove guests left behind by a provision that never completed.
    fn release_guests(&self, saved: BTreeMap<String, Guest>) -> Result<()> {
        let log = self.core.log_path();
        let gctx = self.ctx.guest_context(&self.ctx.environment, &log);
        for mut guest in saved.into_values() {
            debug!(guest = %guest.name(), "releasing guest of an unfinished provision");
            if let Err(err) = guest.stop(&gctx).and_then(|()| guest.remove(&gctx)) {
                warn!(guest = %guest.name(), error = %format!("{err:#}"), "stale guest cleanup failed");
            }
        }
        let path = self.guests_path();
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        }
        Ok(())
    }

    fn create_guest(&self, phase: &PluginData) -> Result<Guest> {
        let registry = registry();
        let info = registry.resolve(phase)?;
        (info.factory)(phase, &self.ctx, &self.instance_dir(phase))
    }

    #[instrument(skip_all, fields(plan = %self.ctx.plan_name))]
    pub fn go(&mut self) -> Result<()> {
        if self.core.is_done() {
            info!(guests = self.guests.len(), "provision already done");
            return Ok(());
        }
        self.guests.clear();
        self.core.save()?;
        let mut pending = Vec::with_capacity(self.core.data.len());
        for phase in &self.core.data {
            pending.push(self.create_guest(phase)?);
        }

        let log = self.core.log_path();
        for guest in pending {
            self.guests.push(guest);
            self.save_guests()?;
            let index = self.guests.len() - 1;
            let gctx = self.ctx.guest_context(&self.ctx.environment, &log);
            let guest = &mut self.guests[index];
            self.ctx.printer.info("guest", &format!("{} ({})", guest.name(), guest.how()), 1);
            let started = guest.start(&gctx);
            if started.is_ok() {
                let (distro, kernel) = guest.details(&gctx);
                if let Some(distro) = distro {
                    self.ctx.printer.detail("distro", &distro, 2, 1);
                }
                if let Some(kernel) = kernel {
                    self.ctx.printer.detail("kernel", &kernel, 2, 1);
                }
            }
            self.save_guests()?;
            started?;
        }
        self.ctx.printer.info("summary", &self.summary(), 1);
        self.core.mark_done()
    }

    /// Make sure every guest is ready before a later step uses it.
    ///
    /// Guests removed by an earlier finish are provisioned again from their
    /// phase configuration; stopped guests are started.
    pub fn ensure_ready(&mut self) -> Result<()> {
        let log = self.core.log_path();
        let mut changed = false;
        for index in 0..self.guests.len() {
            let state = self.guests[index].state();
            if state == GuestState::Ready {
                continue;
            }
            if state == GuestState::Removed {
                let name = self.guests[index].name().to_string();
                let phase = self
                    .core
                    .data
                    .iter()
                    .find(|phase| phase.name == name)
                    .cloned()
                    .ok_or_else(|| anyhow!("no provision phase for removed guest '{name}'"))?;
                debug!(guest = %name, "provisioning removed guest again");
                self.guests[index] = self.create_guest(&phase)?;
            }
            let gctx = self.ctx.guest_context(&self.ctx.environment, &log);
            let started = self.guests[index].start(&gctx);
            changed = true;
            if started.is_err() {
                self.save_guests()?;
            }
            started?;
        }
        if changed {
            self.save_guests()?;
        }
        Ok(())
    }
}

impl Step for Provision {
    fn core(&self) -> &StepCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StepCore {
        &mut self.core
    }

    fn summary(&self) -> String {
        crate::core::result::pluralize(self.guests.len(), "guest") + " provisioned"
    }

    fn wake(&mut self, overrides: Option<&StepOverride>, force: bool) -> Result<()> {
        let saved = self.load_guests()?;
        self.core.wake(overrides, force)?;
        if !self.core.is_done() {
            self.guests.clear();
            if let Some(saved) = saved.filter(|_| !self.ctx.dry) {
                self.release_guests(saved)?;
            }
            return Ok(());
        }
        if let Some(saved) = saved {
            self.adopt_guests(saved);
        }
        let log = self.core.log_path();
        let gctx = self.ctx.guest_context(&self.ctx.environment, &log);
        for guest in &mut self.guests {
            guest.wake(&gctx)?;
        }
        Ok(())
    }

    fn show(&self, printer: &Printer) {
        let core = self.core();
        printer.header(core.name.as_str(), 1);
        for phase in &core.data {
            printer.info("name", &phase.name, 2);
            printer.info("how", &phase.how, 2);
            for key in ["image", "guest", "role", "api-url"] {
                if let Some(value) = phase.get_str(key) {
                    printer.info(key, &value, 2);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::TmtConfig;
    use std::path::Path;

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

    fn raw(yaml: &str) -> serde_yaml::Value {
        serde_yaml::from_str(yaml).expect("yaml")
    }

    #[test]
    fn default_method_comes_from_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let step = Provision::new(&context(temp.path()), None).expect("step");
        assert_eq!(step.core().data[0].how, "virtual");
    }

    #[test]
    fn local_guests_start_and_persist() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context(temp.path());
        let data = raw("- name: server\n  how: local\n  role: server\n- name: client\n  how: local\n  role: client\n");
        let mut step = Provision::new(&ctx, Some(&data)).expect("step");
        step.wake(None, false).expect("wake");
        step.go().expect("go");
        assert!(step.core().is_done());
        assert_eq!(step.guests().len(), 2);
        assert!(step.guests().iter().all(|g| g.state() == GuestState::Ready));
        assert_eq!(step.role_environment()["TMT_ROLE_client"], "client");

        let mut again = Provision::new(&ctx, Some(&data)).expect("step");
        again.wake(None, false).expect("wake");
        let names: Vec<&str> = again.guests().iter().map(Guest::name).collect();
        assert_eq!(names, ["server", "client"]);
        assert_eq!(again.guests(), step.guests());
    }

    #[test]
    fn removed_guests_are_provisioned_again() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context(temp.path());
        let data = raw("how: local\n");
        let mut step = Provision::new(&ctx, Some(&data)).expect("step");
        step.wake(None, false).expect("wake");
        step.go().expect("go");

        let log = temp.path().join("log.txt");
        let env = Environment::new();
        let gctx = ctx.guest_context(&env, &log);
        step.guests_mut()[0].remove(&gctx).expect("remove");
        step.save_guests().expect("save");

        let mut again = Provision::new(&ctx, Some(&data)).expect("step");
        again.wake(None, false).expect("wake");
        assert_eq!(again.guests()[0].state(), GuestState::Removed);
        again.ensure_ready().expect("ready");
        assert_eq!(again.guests()[0].state(), GuestState::Ready);
    }

    #[test]
    fn unfinished_provision_starts_over_with_one_guest_per_phase() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context(temp.path());
        let data = raw("how: local\n");
        let mut step = Provision::new(&ctx, Some(&data)).expect("step");
        step.wake(None, false).expect("wake");
        step.go().expect("go");
        // guests.yaml without step.yaml: a start that never returned
        fs::remove_file(step.core().state_path()).expect("drop step state");

        let mut resumed = Provision::new(&ctx, Some(&data)).expect("step");
        resumed.wake(None, false).expect("wake");
        assert!(resumed.guests().is_empty());
        resumed.go().expect("go");

        let names: Vec<&str> = resumed.guests().iter().map(Guest::name).collect();
        assert_eq!(names, ["default-0"]);
        let saved: BTreeMap<String, Guest> =
            persist::load_yaml(&resumed.guests_path()).expect("load").expect("guests.yaml");
        assert_eq!(saved.len(), 1);
    }

    #[test]
    fn missing_required_key_fails_before_any_guest_starts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context(temp.path());
        let data = raw("- how: local\n- how: connect\n");
        let mut step = Provision::new(&ctx, Some(&data)).expect("step");
        step.wake(None, false).expect("wake");
        assert!(step.go().is_err());
        assert!(step.guests().is_empty());
        assert!(!step.core().is_done());
    }
}
