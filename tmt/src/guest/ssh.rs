//! SSH transport shared by every remote guest, and the `connect` guest.
//!
//! Host keys are never checked or recorded. Authentication uses the
//! configured private key or a password passed through `sshpass`. Push and
//! pull are rsync runs carrying the same ssh command in `-e`.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::environment::Environment;
use crate::guest::{Backend, GuestCommon, GuestContext, remote_script, run_host, shell_quote};
use crate::io::cancel;
use crate::io::process::{RunOptions, run_command};

const READY_PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Connection details for an SSH-reachable target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SshTransport {
    #[serde(default)]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_user() -> String {
    "root".to_string()
}

impl SshTransport {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            ..Self::default()
        }
    }

    /// `user@host`.
    pub fn target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Options passed to every ssh invocation.
    pub fn ssh_options(&self) -> Vec<String> {
        let mut options = vec![
            "-oForwardX11=no".to_string(),
            "-oStrictHostKeyChecking=no".to_string(),
            "-oUserKnownHostsFile=/dev/null".to_string(),
            "-oServerAliveInterval=60".to_string(),
            "-oServerAliveCountMax=5".to_string(),
            "-oLogLevel=ERROR".to_string(),
        ];
        if let Some(port) = self.port {
            options.push(format!("-p{port}"));
        }
        if let Some(key) = &self.key {
            options.push(format!("-i{}", key.display()));
            options.push("-oIdentitiesOnly=yes".to_string());
        }
        if self.password.is_some() {
            options.push("-oPasswordAuthentication=yes".to_string());
        }
        options
    }

    /// The ssh command line as one string, for rsync `-e` and ansible.
    pub fn ssh_command_line(&self) -> String {
        let mut parts = vec!["ssh".to_string()];
        parts.extend(self.ssh_options().iter().map(|o| shell_quote(o)));
        parts.join(" ")
    }

    /// Start a command, wrapped in `sshpass` when a password is configured.
    fn program(&self, program: &str) -> Command {
        match &self.password {
            Some(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-p").arg(password).arg(program);
                cmd
            }
            None => Command::new(program),
        }
    }

    /// `ssh ... user@host <remote>`.
    pub fn command(&self, remote: &str, interactive: bool) -> Command {
        let mut cmd = self.program("ssh");
        cmd.args(self.ssh_options());
        if interactive {
            cmd.arg("-t");
        }
        cmd.arg(self.target()).arg(remote);
        cmd
    }

    fn rsync_base(&self) -> Command {
        let mut cmd = self.program("rsync");
        cmd.args(["-rz", "--links", "--safe-links", "--protect-args"])
            .arg("-e")
            .arg(self.ssh_command_line());
        cmd
    }

    /// rsync from the host to the target; same-path copies keep the full path (`-R`).
    pub fn rsync_push(&self, src: &Path, dst: &Path) -> Command {
        let mut cmd = self.rsync_base();
        if src == dst {
            cmd.arg("-R")
                .arg(src)
                .arg(format!("{}:/", self.target()));
        } else {
            cmd.arg(format!(
                "--rsync-path=mkdir -p {} && rsync",
                shell_quote(&dst.to_string_lossy())
            ))
            .arg(format!("{}/", src.display()))
            .arg(format!("{}:{}", self.target(), dst.display()));
        }
        cmd
    }

    /// rsync from the target back to the host.
    pub fn rsync_pull(&self, src: &Path, dst: &Path) -> Command {
        let mut cmd = self.rsync_base();
        if src == dst {
            cmd.arg("-R")
                .arg(format!("{}:{}", self.target(), src.display()))
                .arg("/");
        } else {
            cmd.arg(format!("{}:{}/", self.target(), src.display()))
                .arg(dst);
        }
        cmd
    }

    pub fn ansible_command(&self, playbook: &Path, extra_args: &[String]) -> Command {
        let mut cmd = Command::new("ansible-playbook");
        let mut common_args: Vec<String> = self
            .ssh_options()
            .into_iter()
            .filter(|o| !o.starts_with("-p") && !o.starts_with("-i"))
            .collect();
        common_args.retain(|o| o != "-oIdentitiesOnly=yes");
        cmd.arg(format!("--ssh-common-args={}", common_args.join(" ")))
            .arg("-i")
            .arg(format!("{},", self.host))
            .arg("-u")
            .arg(&self.user);
        if let Some(port) = self.port {
            cmd.arg("-e").arg(format!("ansible_port={port}"));
        }
        if let Some(key) = &self.key {
            cmd.arg("--private-key").arg(key);
        }
        if let Some(password) = &self.password {
            cmd.arg("-e").arg(format!("ansible_ssh_pass={password}"));
        }
        cmd.args(extra_args).arg(playbook);
        cmd
    }

    /// Poll until `ssh true` succeeds or `timeout` elapses.
    #[instrument(skip_all, fields(host = %self.host, timeout_secs = timeout.as_secs()))]
    pub fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        loop {
            let mut cmd = self.program("ssh");
            cmd.args(self.ssh_options())
                .arg("-oConnectTimeout=10")
                .arg(self.target())
                .arg("true");
            let output = run_command(
                cmd,
                &RunOptions {
                    timeout: Some(READY_PROBE_TIMEOUT),
                    ..RunOptions::default()
                },
            )?;
            if output.success() {
                debug!(elapsed_secs = started.elapsed().as_secs(), "ssh ready");
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(anyhow!(
                    "ssh to {} not ready after {}s: {}",
                    self.target(),
                    timeout.as_secs(),
                    output.stderr_lossy().trim()
                ));
            }
            cancel::sleep(READY_POLL_INTERVAL)?;
        }
    }

    fn boot_id(&self) -> Option<String> {
        let output = run_command(
            self.command("cat /proc/sys/kernel/random/boot_id", false),
            &RunOptions {
                timeout: Some(READY_PROBE_TIMEOUT),
                ..RunOptions::default()
            },
        )
        .ok()?;
        output.success().then(|| output.stdout_lossy().trim().to_string())
    }

    /// Issue `reboot` and wait for a different boot id.
    #[instrument(skip_all, fields(host = %self.host))]
    pub fn soft_reboot(&self, ctx: &GuestContext<'_>, timeout: Duration) -> Result<bool> {
        let before = self.boot_id();
        if let Err(err) = run_host(ctx, self.command("reboot", false), Some(READY_PROBE_TIMEOUT)) {
            debug!(err = %err, "reboot command ended the connection");
        }
        self.wait_for_new_boot(before, timeout)
    }

    /// Wait until the target answers with a boot id different from `before`.
    pub fn wait_for_new_boot(&self, before: Option<String>, timeout: Duration) -> Result<bool> {
        let started = Instant::now();
        while started.elapsed() < timeout {
            cancel::sleep(READY_POLL_INTERVAL)?;
            if let Some(now) = self.boot_id()
                && before.as_ref() != Some(&now)
            {
                info!("guest rebooted");
                return Ok(true);
            }
        }
        warn!(timeout_secs = timeout.as_secs(), "guest did not come back after reboot");
        Err(anyhow!("reboot of {} timed out", self.target()))
    }

    pub fn exec_command(&self, script: &str, cwd: &Path, env: &Environment, interactive: bool) -> Command {
        self.command(&remote_script(cwd, env, script), interactive)
    }

    pub fn push(&self, ctx: &GuestContext<'_>, src: &Path, dst: &Path) -> Result<()> {
        run_host(ctx, self.rsync_push(src, dst), None).map(|_| ())
    }

    pub fn pull(&self, ctx: &GuestContext<'_>, src: &Path, dst: &Path) -> Result<()> {
        run_host(ctx, self.rsync_pull(src, dst), None).map(|_| ())
    }
}

/// A pre-existing host reached over SSH (`how: connect`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshGuest {
    #[serde(flatten)]
    pub common: GuestCommon,
    #[serde(flatten)]
    pub transport: SshTransport,
}

impl SshGuest {
    pub fn new(common: GuestCommon, transport: SshTransport) -> Self {
        Self { common, transport }
    }
}

impl Backend for SshGuest {
    fn start(&mut self, ctx: &GuestContext<'_>) -> Result<()> {
        if self.transport.host.is_empty() {
            return Err(anyhow!("guest '{}' has no host configured", self.common.name));
        }
        self.transport
            .wait_ready(Duration::from_secs(ctx.config.virtual_machine.ssh_timeout_secs))
    }

    fn exec_command(&self, script: &str, cwd: &Path, env: &Environment, interactive: bool) -> Command {
        self.transport.exec_command(script, cwd, env, interactive)
    }

    fn push(&self, ctx: &GuestContext<'_>, src: &Path, dst: &Path) -> Result<()> {
        self.transport.push(ctx, src, dst)
    }

    fn pull(&self, ctx: &GuestContext<'_>, src: &Path, dst: &Path) -> Result<()> {
        self.transport.pull(ctx, src, dst)
    }

    fn reboot(&mut self, ctx: &GuestContext<'_>, hard: bool, timeout: Duration) -> Result<bool> {
        if hard {
            warn!("hard reboot not supported for connected hosts, using soft reboot");
        }
        self.transport.soft_reboot(ctx, timeout)
    }

    fn ansible_command(&self, playbook: &Path, extra_args: &[String]) -> Command {
        self.transport.ansible_command(playbook, extra_args)
    }
}
