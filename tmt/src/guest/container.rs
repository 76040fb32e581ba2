//! Podman container guest.
//!
//! The container name is derived from the plan workdir so a resumed run
//! finds the same container. The plan workdir is bind-mounted at the same
//! path, which makes push and pull of the workdir no-ops.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::environment::Environment;
use crate::guest::{Backend, GuestCommon, GuestContext, run_host};
use crate::io::process::{RunOptions, run_command};

const PODMAN: &str = "podman";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ContainerGuest {
    #[serde(flatten)]
    pub common: GuestCommon,
    pub image: String,
    /// Container name, assigned on start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    /// Always pull the image before starting.
    #[serde(default)]
    pub pull: bool,
    #[serde(default = "default_user")]
    pub user: String,
}

fn default_user() -> String {
    "root".to_string()
}

impl ContainerGuest {
    pub fn new(common: GuestCommon, image: impl Into<String>, pull: bool, user: Option<String>) -> Self {
        Self {
            common,
            image: image.into(),
            container: None,
            pull,
            user: user.unwrap_or_else(default_user),
        }
    }

    fn name(&self, plan_workdir: &Path) -> String {
        self.container
            .clone()
            .unwrap_or_else(|| container_name(plan_workdir, &self.common.name))
    }

    fn container_exists(&self, name: &str) -> bool {
        let mut cmd = Command::new(PODMAN);
        cmd.args(["container", "exists", name]);
        run_command(cmd, &RunOptions::default())
            .map(|output| output.success())
            .unwrap_or(false)
    }

    fn image_exists(&self) -> bool {
        let mut cmd = Command::new(PODMAN);
        cmd.args(["image", "exists", &self.image]);
        run_command(cmd, &RunOptions::default())
            .map(|output| output.success())
            .unwrap_or(false)
    }
}

/// Deterministic container name for a plan workdir and guest.
pub fn container_name(plan_workdir: &Path, guest: &str) -> String {
    let raw = format!("tmt{}-{guest}", plan_workdir.to_string_lossy());
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '.' { c } else { '-' })
        .collect::<String>()
        .trim_end_matches('-')
        .to_string()
}

/// `podman run` arguments for a fresh container.
pub fn run_args(name: &str, image: &str, user: &str, plan_workdir: &Path) -> Vec<String> {
    let mount = format!("{0}:{0}:Z", plan_workdir.display());
    vec![
        "run".to_string(),
        "--name".to_string(),
        name.to_string(),
        "--detach".to_string(),
        "--user".to_string(),
        user.to_string(),
        "-v".to_string(),
        mount,
        image.to_string(),
        "sleep".to_string(),
        "infinity".to_string(),
    ]
}

impl Backend for ContainerGuest {
    fn start(&mut self, ctx: &GuestContext<'_>) -> Result<()> {
        let name = self.name(ctx.plan_workdir);
        if self.container_exists(&name) {
            info!(container = %name, "reusing existing container");
            let mut cmd = Command::new(PODMAN);
            cmd.args(["start", &name]);
            run_host(ctx, cmd, Some(Duration::from_secs(120)))?;
        } else {
            if self.pull || !self.image_exists() {
                info!(image = %self.image, "pulling image");
                let mut cmd = Command::new(PODMAN);
                cmd.args(["pull", "-q", &self.image]);
                run_host(ctx, cmd, Some(Duration::from_secs(1800)))?;
            }
            std::fs::create_dir_all(ctx.plan_workdir)
                .with_context(|| format!("create {}", ctx.plan_workdir.display()))?;
            let mut cmd = Command::new(PODMAN);
            cmd.args(run_args(&name, &self.image, &self.user, ctx.plan_workdir));
            run_host(ctx, cmd, Some(Duration::from_secs(300)))?;
        }
        self.container = Some(name);
        Ok(())
    }

    fn wake(&mut self, ctx: &GuestContext<'_>) -> Result<()> {
        let name = self.name(ctx.plan_workdir);
        debug!(container = %name, "waking container");
        self.container = Some(name);
        Ok(())
    }

    fn exec_command(&self, script: &str, cwd: &Path, env: &Environment, interactive: bool) -> Command {
        let name = self
            .container
            .clone()
            .unwrap_or_else(|| self.common.name.clone());
        let mut cmd = Command::new(PODMAN);
        cmd.arg("exec");
        if interactive {
            cmd.arg("-it");
        }
        for (key, value) in env {
            cmd.arg("-e").arg(format!("{key}={value}"));
        }
        cmd.arg("-w")
            .arg(cwd)
            .arg(name)
            .args(["sh", "-c", script]);
        cmd
    }

    fn push(&self, ctx: &GuestContext<'_>, src: &Path, dst: &Path) -> Result<()> {
        if src.starts_with(ctx.plan_workdir) && src == dst {
            debug!("plan workdir is bind-mounted, nothing to push");
            return Ok(());
        }
        let name = self.name(ctx.plan_workdir);
        let mut cmd = Command::new(PODMAN);
        cmd.arg("cp")
            .arg(src)
            .arg(format!("{name}:{}", dst.display()));
        run_host(ctx, cmd, None).map(|_| ())
    }

    fn pull(&self, ctx: &GuestContext<'_>, src: &Path, dst: &Path) -> Result<()> {
        if src.starts_with(ctx.plan_workdir) && src == dst {
            return Ok(());
        }
        let name = self.name(ctx.plan_workdir);
        let mut cmd = Command::new(PODMAN);
        cmd.arg("cp")
            .arg(format!("{name}:{}", src.display()))
            .arg(dst);
        run_host(ctx, cmd, None).map(|_| ())
    }

    fn reboot(&mut self, ctx: &GuestContext<'_>, _hard: bool, timeout: Duration) -> Result<bool> {
        let name = self.name(ctx.plan_workdir);
        let mut cmd = Command::new(PODMAN);
        cmd.args(["restart", &name]);
        run_host(ctx, cmd, Some(timeout))?;
        Ok(true)
    }

    fn ansible_command(&self, playbook: &Path, extra_args: &[String]) -> Command {
        let name = self
            .container
            .clone()
            .unwrap_or_else(|| self.common.name.clone());
        let mut cmd = Command::new("ansible-playbook");
        cmd.args(["-c", "podman", "-i"])
            .arg(format!("{name},"))
            .args(extra_args)
            .arg(playbook);
        cmd
    }

    fn stop(&mut self, ctx: &GuestContext<'_>) -> Result<()> {
        let name = self.name(ctx.plan_workdir);
        let mut cmd = Command::new(PODMAN);
        cmd.args(["stop", "--time", "5", &name]);
        run_host(ctx, cmd, Some(Duration::from_secs(60))).map(|_| ())
    }

    fn remove(&mut self, ctx: &GuestContext<'_>) -> Result<()> {
        let name = self.name(ctx.plan_workdir);
        let mut cmd = Command::new(PODMAN);
        cmd.args(["rm", "-f", &name]);
        run_host(ctx, cmd, Some(Duration::from_secs(60))).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::args_of;

    fn guest() -> ContainerGuest {
        let mut guest = ContainerGuest::new(GuestCommon::new("default-0", None), "fedora", false, None);
        guest.container = Some("tmt-run-001-plan-default-0".to_string());
        guest
    }

    #[test]
    fn container_name_is_derived_from_workdir() {
        let a = container_name(Path::new("/var/tmp/tmt/run-001/plans/smoke"), "default-0");
        let b = container_name(Path::new("/var/tmp/tmt/run-001/plans/smoke"), "default-0");
        assert_eq!(a, b);
        assert_eq!(a, "tmt-var-tmp-tmt-run-001-plans-smoke-default-0");
        let other = container_name(Path::new("/var/tmp/tmt/run-002/plans/smoke"), "default-0");
        assert_ne!(a, other);
    }

    #[test]
    fn run_bind_mounts_workdir() {
        let args = run_args("box", "fedora", "root", Path::new("/var/tmp/run-001/plan"));
        assert!(args.contains(&"/var/tmp/run-001/plan:/var/tmp/run-001/plan:Z".to_string()));
        assert_eq!(args[0], "run");
        assert_eq!(args[2], "box");
    }

    #[test]
    fn exec_delegates_to_podman_exec_sh() {
        let mut env = Environment::new();
        env.insert("A".to_string(), "1".to_string());
        let cmd = guest().exec_command("whoami", Path::new("/work"), &env, false);
        assert_eq!(cmd.get_program(), "podman");
        assert_eq!(
            args_of(&cmd),
            vec![
                "exec",
                "-e",
                "A=1",
                "-w",
                "/work",
                "tmt-run-001-plan-default-0",
                "sh",
                "-c",
                "whoami"
            ]
        );
    }

    #[test]
    fn interactive_exec_allocates_tty() {
        let cmd = guest().exec_command("bash", Path::new("/"), &Environment::new(), true);
        assert_eq!(args_of(&cmd)[1], "-it");
    }

    #[test]
    fn ansible_uses_podman_connection() {
        let cmd = guest().ansible_command(Path::new("site.yml"), &[]);
        assert_eq!(
            args_of(&cmd),
            vec!["-c", "podman", "-i", "tmt-run-001-plan-default-0,", "site.yml"]
        );
    }
}
