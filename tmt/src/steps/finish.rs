//! Finish step: cleanup phases, then stop and remove every guest.
//!
//! Finish runs even when an earlier step failed. Guest removal is attempted
//! for every guest even if a phase or another guest fails; the first error
//! is returned afterwards. The step is only committed as done when the rest
//! of the plan completed, so a resumed run finishes again.

use anyhow::Result;
use serde_yaml::Value;
use tracing::{info, instrument, warn};

use crate::core::environment::Environment;
use crate::core::ordering::DEFAULT_ORDER;
use crate::core::step_name::StepName;
use crate::guest::{Guest, GuestState};
use crate::steps::prepare::{self, PhaseFactory, run_phases};
use crate::steps::registry::{PluginInfo, Registry};
use crate::steps::{PlanContext, Step, StepCore};

pub fn registry() -> Registry<PhaseFactory> {
    Registry::<PhaseFactory>::new(StepName::Finish)
        .register(PluginInfo {
            method: "shell",
            order: DEFAULT_ORDER,
            schema: prepare::shell::SCHEMA,
            factory: prepare::shell::ShellPhase::create,
        })
        .register(PluginInfo {
            method: "ansible",
            order: DEFAULT_ORDER,
            schema: prepare::ansible::SCHEMA,
            factory: prepare::ansible::AnsiblePhase::create,
        })
}

#[derive(Debug, Clone)]
pub struct Finish {
    core: StepCore,
    ctx: PlanContext,
    removed: usize,
}

impl Finish {
    pub fn new(ctx: &PlanContext, raw: Option<&Value>) -> Result<Self> {
        Ok(Self {
            core: StepCore::new(StepName::Finish, ctx, raw, "shell")?,
            ctx: ctx.clone(),
            removed: 0,
        })
    }

    /// Phases without a script are placeholders (the default entry).
    fn configured_phases(&self) -> Vec<crate::steps::PluginData> {
        self.core
            .data
            .iter()
            .filter(|phase| phase.how != "shell" || phase.get("script").is_some())
            .cloned()
            .collect()
    }

    /// Run cleanup phases on ready guests, then stop and remove all guests.
    ///
    /// `commit` marks the step done; pass false when an earlier step did not
    /// complete.
    #[instrument(skip_all, fields(plan = %self.ctx.plan_name))]
    pub fn go(&mut self, guests: &mut [Guest], environment: &Environment, commit: bool) -> Result<()> {
        if self.core.is_done() {
            info!("finish already done");
            return Ok(());
        }
        let log = self.core.log_path();
        let phases = self.configured_phases();
        let ready: Vec<Guest> = guests
            .iter()
            .filter(|guest| guest.state() == GuestState::Ready)
            .cloned()
            .collect();
        let mut first_error = None;
        if !phases.is_empty() && !ready.is_empty() {
            if let Err(err) = run_phases(
                StepName::Finish,
                &registry(),
                &phases,
                &self.ctx,
                &ready,
                environment,
                &log,
            ) {
                warn!(error = %format!("{err:#}"), "finish phase failed");
                first_error = Some(err);
            }
        }

        let gctx = self.ctx.guest_context(environment, &log);
        self.removed = 0;
        for guest in guests.iter_mut() {
            let cleaned = guest.stop(&gctx).and_then(|()| guest.remove(&gctx));
            match cleaned {
                Ok(()) => {
                    self.removed += 1;
                    self.ctx.printer.detail("removed", guest.name(), 2, 1);
                }
                Err(err) => {
                    warn!(guest = %guest.name(), error = %format!("{err:#}"), "guest cleanup failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        self.ctx.printer.info("summary", &self.summary(), 1);
        if commit {
            self.core.mark_done()
        } else {
            self.core.save()
        }
    }
}

impl Step for Finish {
    fn core(&self) -> &StepCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StepCore {
        &mut self.core
    }

    fn summary(&self) -> String {
        crate::core::result::pluralize(self.removed, "guest") + " cleaned up"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::{GuestCommon, LocalGuest};
    use crate::io::config::TmtConfig;
    use crate::io::output::Printer;
    use std::fs;
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

    fn ready_local(name: &str) -> Guest {
        let mut common = GuestCommon::new(name, None);
        common.state = GuestState::Ready;
        Guest::Local(LocalGuest::new(common))
    }

    #[test]
    fn registry_knows_cleanup_methods() {
        assert_eq!(registry().methods(), ["shell", "ansible"]);
        assert_eq!(registry().find("ans").expect("prefix").method, "ansible");
    }

    #[test]
    fn runs_phases_then_removes_guests() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context(temp.path());
        fs::create_dir_all(&ctx.plan_workdir).expect("workdir");
        let marker = temp.path().join("cleaned");
        let raw: Value =
            serde_yaml::from_str(&format!("how: shell\nscript: touch {}\n", marker.display())).expect("yaml");
        let mut step = Finish::new(&ctx, Some(&raw)).expect("step");
        step.wake(None, false).expect("wake");
        let mut guests = vec![ready_local("default-0")];
        step.go(&mut guests, &Environment::new(), true).expect("go");
        assert!(marker.exists());
        assert_eq!(guests[0].state(), GuestState::Removed);
        assert!(step.core().is_done());
        assert_eq!(step.summary(), "1 guest cleaned up");
    }

    #[test]
    fn default_entry_only_cleans_up() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context(temp.path());
        let mut step = Finish::new(&ctx, None).expect("step");
        step.wake(None, false).expect("wake");
        let mut guests = vec![ready_local("a"), ready_local("b")];
        step.go(&mut guests, &Environment::new(), false).expect("go");
        assert!(guests.iter().all(|g| g.state() == GuestState::Removed));
        assert!(!step.core().is_done());
    }

    #[test]
    fn failing_phase_still_removes_guests() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context(temp.path());
        fs::create_dir_all(&ctx.plan_workdir).expect("workdir");
        let raw: Value = serde_yaml::from_str("how: shell\nscript: exit 1\n").expect("yaml");
        let mut step = Finish::new(&ctx, Some(&raw)).expect("step");
        step.wake(None, false).expect("wake");
        let mut guests = vec![ready_local("default-0")];
        assert!(step.go(&mut guests, &Environment::new(), true).is_err());
        assert_eq!(guests[0].state(), GuestState::Removed);
        assert!(!step.core().is_done());
    }
}
