//! Execution targets.
//!
//! A [`Guest`] is a sum type over every supported target. All variants share
//! the same capability set: start/wake, execute, push/pull, reboot, ansible,
//! stop/remove and details. Each variant implements [`Backend`], which only
//! composes commands and manages its own resources; running commands, plan
//! environment precedence and transcripts are handled once in [`Guest`].
//!
//! Guests are persisted by the provision step (`guests.yaml`), so every
//! variant is plain serializable data. Runtime inputs (plan workdir, plan
//! environment, tool configuration) arrive through [`GuestContext`].

pub mod artemis;
pub mod container;
pub mod local;
pub mod minute;
pub mod ssh;
pub mod virtual_machine;

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::environment::{self, Environment};
use crate::error::{ErrorKind, classify};
use crate::io::config::TmtConfig;
use crate::io::process::{self, CommandOutput, RunOptions};

pub use artemis::ArtemisGuest;
pub use container::ContainerGuest;
pub use local::LocalGuest;
pub use minute::MinuteGuest;
pub use ssh::{SshGuest, SshTransport};
pub use virtual_machine::VirtualGuest;

/// Default timeout for a reboot to complete.
pub const DEFAULT_REBOOT_TIMEOUT: Duration = Duration::from_secs(600);

/// Lifecycle position of a guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestState {
    #[default]
    Created,
    Ready,
    Stopped,
    Removed,
}

/// Fields shared by all variants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GuestCommon {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub state: GuestState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distro: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,
}

impl GuestCommon {
    pub fn new(name: impl Into<String>, role: Option<String>) -> Self {
        Self {
            name: name.into(),
            role,
            ..Self::default()
        }
    }
}

/// Runtime inputs for guest operations.
#[derive(Debug, Clone, Copy)]
pub struct GuestContext<'a> {
    pub plan_workdir: &'a Path,
    /// Plan environment; overrides request variables with the same name.
    pub environment: &'a Environment,
    pub config: &'a TmtConfig,
    /// Step `log.txt` receiving command transcripts.
    pub log: Option<&'a Path>,
}

/// One command to run on a guest.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub script: String,
    pub env: Environment,
    /// Defaults to the plan workdir.
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub interactive: bool,
    /// Stream combined output into this file (`out.log`).
    pub output: Option<PathBuf>,
}

impl ExecRequest {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            ..Self::default()
        }
    }

    pub fn env(mut self, env: Environment) -> Self {
        self.env = env;
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }
}

/// Per-variant behaviour behind [`Guest`].
pub trait Backend {
    /// Bring the target to `ready`. Must tolerate an already running target.
    fn start(&mut self, ctx: &GuestContext<'_>) -> Result<()>;

    /// Reconnect to a running target without reconfiguring it.
    fn wake(&mut self, _ctx: &GuestContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Host-side command running `script` on the target.
    fn exec_command(&self, script: &str, cwd: &Path, env: &Environment, interactive: bool) -> Command;

    /// Copy `src` on the host to `dst` on the target.
    fn push(&self, ctx: &GuestContext<'_>, src: &Path, dst: &Path) -> Result<()>;

    /// Copy `src` on the target to `dst` on the host.
    fn pull(&self, ctx: &GuestContext<'_>, src: &Path, dst: &Path) -> Result<()>;

    /// Reboot and wait for the target to come back. `Ok(false)` when unsupported.
    fn reboot(&mut self, ctx: &GuestContext<'_>, hard: bool, timeout: Duration) -> Result<bool>;

    /// `ansible-playbook` invocation targeting this guest.
    fn ansible_command(&self, playbook: &Path, extra_args: &[String]) -> Command;

    /// Release runtime resources, keeping identity.
    fn stop(&mut self, _ctx: &GuestContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Destroy the target.
    fn remove(&mut self, _ctx: &GuestContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// A provisioned execution target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "how", rename_all = "kebab-case")]
pub enum Guest {
    Local(LocalGuest),
    Container(ContainerGuest),
    Connect(SshGuest),
    Virtual(VirtualGuest),
    Artemis(ArtemisGuest),
    Minute(MinuteGuest),
}

impl Guest {
    pub fn common(&self) -> &GuestCommon {
        match self {
            Guest::Local(g) => &g.common,
            Guest::Container(g) => &g.common,
            Guest::Connect(g) => &g.common,
            Guest::Virtual(g) => &g.common,
            Guest::Artemis(g) => &g.common,
            Guest::Minute(g) => &g.common,
        }
    }

    fn common_mut(&mut self) -> &mut GuestCommon {
        match self {
            Guest::Local(g) => &mut g.common,
            Guest::Container(g) => &mut g.common,
            Guest::Connect(g) => &mut g.common,
            Guest::Virtual(g) => &mut g.common,
            Guest::Artemis(g) => &mut g.common,
            Guest::Minute(g) => &mut g.common,
        }
    }

    fn backend(&self) -> &dyn Backend {
        match self {
            Guest::Local(g) => g,
            Guest::Container(g) => g,
            Guest::Connect(g) => g,
            Guest::Virtual(g) => g,
            Guest::Artemis(g) => g,
            Guest::Minute(g) => g,
        }
    }

    fn backend_mut(&mut self) -> &mut dyn Backend {
        match self {
            Guest::Local(g) => g,
            Guest::Container(g) => g,
            Guest::Connect(g) => g,
            Guest::Virtual(g) => g,
            Guest::Artemis(g) => g,
            Guest::Minute(g) => g,
        }
    }

    pub fn name(&self) -> &str {
        &self.common().name
    }

    pub fn role(&self) -> Option<&str> {
        self.common().role.as_deref()
    }

    pub fn state(&self) -> GuestState {
        self.common().state
    }

    /// Method name as used in `provision: how:`.
    pub fn how(&self) -> &'static str {
        match self {
            Guest::Local(_) => "local",
            Guest::Container(_) => "container",
            Guest::Connect(_) => "connect",
            Guest::Virtual(_) => "virtual",
            Guest::Artemis(_) => "artemis",
            Guest::Minute(_) => "minute",
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Guest::Local(_))
    }

    #[instrument(skip_all, fields(guest = %self.name(), how = self.how()))]
    pub fn start(&mut self, ctx: &GuestContext<'_>) -> Result<()> {
        if self.state() == GuestState::Ready {
            debug!("guest already started");
            return Ok(());
        }
        if self.state() == GuestState::Removed {
            return Err(anyhow!("guest '{}' has been removed", self.name()));
        }
        self.backend_mut()
            .start(ctx)
            .map_err(|err| classify(err, ErrorKind::Provision))?;
        self.common_mut().state = GuestState::Ready;
        info!("guest ready");
        Ok(())
    }

    #[instrument(skip_all, fields(guest = %self.name(), how = self.how()))]
    pub fn wake(&mut self, ctx: &GuestContext<'_>) -> Result<()> {
        if self.state() != GuestState::Ready {
            debug!(state = ?self.state(), "not waking a guest that is not ready");
            return Ok(());
        }
        self.backend_mut().wake(ctx)
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.state() != GuestState::Ready {
            return Err(anyhow!(
                "guest '{}' is not ready (state {:?})",
                self.name(),
                self.state()
            ));
        }
        Ok(())
    }

    /// Run a command on the guest.
    ///
    /// Plan environment wins over `request.env`. A timed out command is
    /// reported through `CommandOutput::timed_out`, not as an error.
    #[instrument(skip_all, fields(guest = %self.name()))]
    pub fn execute(&self, ctx: &GuestContext<'_>, request: &ExecRequest) -> Result<CommandOutput> {
        self.ensure_ready()?;
        let env = environment::compose([&request.env, ctx.environment]);
        let cwd = request
            .cwd
            .clone()
            .unwrap_or_else(|| ctx.plan_workdir.to_path_buf());
        let cmd = self
            .backend()
            .exec_command(&request.script, &cwd, &env, request.interactive);
        debug!(script = %request.script, cwd = %cwd.display(), "executing");
        let output = process::run_command(
            cmd,
            &RunOptions {
                timeout: request.timeout,
                stream_path: request.output.as_deref(),
                interactive: request.interactive,
                ..RunOptions::default()
            },
        )?;
        if let Some(log) = ctx.log {
            process::append_log(log, &request.script, &output)?;
        }
        Ok(output)
    }

    /// Run a command and fail unless it succeeds.
    pub fn execute_checked(&self, ctx: &GuestContext<'_>, request: &ExecRequest) -> Result<CommandOutput> {
        let output = self.execute(ctx, request)?;
        if output.timed_out {
            return Err(anyhow!("command timed out on {}: {}", self.name(), request.script));
        }
        if !output.success() {
            return Err(anyhow!(
                "command failed on {} with exit code {}: {}\n{}",
                self.name(),
                output.code(),
                request.script,
                output.stderr_lossy().trim()
            ));
        }
        Ok(output)
    }

    /// Copy the plan workdir (or `src`) to the guest, keeping relative paths and symlinks.
    pub fn push(&self, ctx: &GuestContext<'_>, src: Option<&Path>, dst: Option<&Path>) -> Result<()> {
        self.ensure_ready()?;
        let src = src.unwrap_or(ctx.plan_workdir);
        let dst = dst.unwrap_or(src);
        debug!(guest = %self.name(), src = %src.display(), dst = %dst.display(), "push");
        self.backend().push(ctx, src, dst)
    }

    /// Copy the plan workdir (or `src`) back from the guest.
    pub fn pull(&self, ctx: &GuestContext<'_>, src: Option<&Path>, dst: Option<&Path>) -> Result<()> {
        self.ensure_ready()?;
        let src = src.unwrap_or(ctx.plan_workdir);
        let dst = dst.unwrap_or(src);
        debug!(guest = %self.name(), src = %src.display(), dst = %dst.display(), "pull");
        self.backend().pull(ctx, src, dst)
    }

    #[instrument(skip_all, fields(guest = %self.name(), hard = hard))]
    pub fn reboot(&mut self, ctx: &GuestContext<'_>, hard: bool, timeout: Option<Duration>) -> Result<bool> {
        self.ensure_ready()?;
        let timeout = timeout.unwrap_or(DEFAULT_REBOOT_TIMEOUT);
        let rebooted = self.backend_mut().reboot(ctx, hard, timeout)?;
        if !rebooted {
            warn!("guest does not support reboot");
        }
        Ok(rebooted)
    }

    /// Apply an Ansible playbook using the variant's connector.
    #[instrument(skip_all, fields(guest = %self.name(), playbook = %playbook.display()))]
    pub fn ansible(&self, ctx: &GuestContext<'_>, playbook: &Path, extra_args: &[String]) -> Result<CommandOutput> {
        self.ensure_ready()?;
        let mut cmd = self.backend().ansible_command(playbook, extra_args);
        cmd.current_dir(ctx.plan_workdir)
            .env("ANSIBLE_HOST_KEY_CHECKING", "False");
        let output = process::run_command(cmd, &RunOptions::default())?;
        if let Some(log) = ctx.log {
            process::append_log(log, &format!("ansible-playbook {}", playbook.display()), &output)?;
        }
        if !output.success() {
            return Err(anyhow!(
                "playbook {} failed on {}: {}",
                playbook.display(),
                self.name(),
                output.stderr_lossy().trim()
            ));
        }
        Ok(output)
    }

    #[instrument(skip_all, fields(guest = %self.name()))]
    pub fn stop(&mut self, ctx: &GuestContext<'_>) -> Result<()> {
        if matches!(self.state(), GuestState::Stopped | GuestState::Removed) {
            return Ok(());
        }
        self.backend_mut().stop(ctx)?;
        self.common_mut().state = GuestState::Stopped;
        info!("guest stopped");
        Ok(())
    }

    #[instrument(skip_all, fields(guest = %self.name()))]
    pub fn remove(&mut self, ctx: &GuestContext<'_>) -> Result<()> {
        if self.state() == GuestState::Removed {
            return Ok(());
        }
        self.backend_mut().remove(ctx)?;
        self.common_mut().state = GuestState::Removed;
        info!("guest removed");
        Ok(())
    }

    /// Best-effort distro and kernel discovery, stored on the guest.
    pub fn details(&mut self, ctx: &GuestContext<'_>) -> (Option<String>, Option<String>) {
        let query = |script: &str| -> Option<String> {
            let request = ExecRequest::new(script).timeout(Duration::from_secs(60));
            match self.execute(ctx, &request) {
                Ok(output) if output.success() => {
                    let text = output.stdout_lossy().trim().to_string();
                    (!text.is_empty()).then_some(text)
                }
                Ok(_) => None,
                Err(err) => {
                    debug!(err = %err, "details query failed");
                    None
                }
            }
        };
        let distro = query(". /etc/os-release 2>/dev/null && echo \"$PRETTY_NAME\"");
        let kernel = query("uname -r");
        let common = self.common_mut();
        common.distro = distro.clone();
        common.kernel = kernel.clone();
        (distro, kernel)
    }
}

/// Run a host-side helper command (podman, rsync, qemu...) and require success.
pub(crate) fn run_host(ctx: &GuestContext<'_>, cmd: Command, timeout: Option<Duration>) -> Result<CommandOutput> {
    let label = describe(&cmd);
    debug!(command = %label, "running host command");
    let output = process::run_command(
        cmd,
        &RunOptions {
            timeout,
            ..RunOptions::default()
        },
    )?;
    if let Some(log) = ctx.log {
        process::append_log(log, &label, &output)?;
    }
    if output.timed_out {
        return Err(anyhow!("{label} timed out"));
    }
    if !output.success() {
        return Err(anyhow!(
            "{label} failed with exit code {}: {}",
            output.code(),
            output.stderr_lossy().trim()
        ));
    }
    Ok(output)
}

/// Program and arguments as one printable line.
pub fn describe(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().to_string()];
    parts.extend(cmd.get_args().map(|arg| shell_quote(&arg.to_string_lossy())));
    parts.join(" ")
}

/// Arguments of a command as strings (for assertions and logging).
pub fn args_of(cmd: &Command) -> Vec<String> {
    cmd.get_args()
        .map(|arg| arg.to_string_lossy().to_string())
        .collect()
}

/// Quote a string for POSIX `sh`.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Script run remotely: enter `cwd`, export `env`, then run `script`.
pub fn remote_script(cwd: &Path, env: &Environment, script: &str) -> String {
    let mut out = format!("cd {}", shell_quote(&cwd.to_string_lossy()));
    if !env.is_empty() {
        let exports: Vec<String> = env
            .iter()
            .map(|(key, value)| format!("{key}={}", shell_quote(value)))
            .collect();
        out.push_str(&format!(" && export {}", exports.join(" ")));
    }
    out.push_str(&format!(" && {script}"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_leaves_safe_words_alone() {
        assert_eq!(shell_quote("abc/def-1.0"), "abc/def-1.0");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn remote_script_changes_directory_and_exports() {
        let mut env = Environment::new();
        env.insert("A".to_string(), "1 2".to_string());
        env.insert("B".to_string(), "x".to_string());
        let script = remote_script(Path::new("/var/tmp/run-001/plan"), &env, "./test.sh");
        assert_eq!(
            script,
            "cd /var/tmp/run-001/plan && export A='1 2' B=x && ./test.sh"
        );
    }

    #[test]
    fn guest_documents_round_trip() {
        let guests = vec![
            Guest::Local(LocalGuest::new(GuestCommon::new("default-0", None))),
            Guest::Container(ContainerGuest {
                common: GuestCommon::new("box", Some("server".to_string())),
                image: "fedora:latest".to_string(),
                container: Some("tmt-abc".to_string()),
                pull: true,
                user: "root".to_string(),
            }),
        ];
        for guest in guests {
            let yaml = serde_yaml::to_string(&guest).expect("serialize");
            let back: Guest = serde_yaml::from_str(&yaml).expect("deserialize");
            assert_eq!(back, guest);
            assert_eq!(serde_yaml::to_string(&back).expect("serialize"), yaml);
        }
    }

    #[test]
    fn execute_requires_ready_guest() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = TmtConfig::default();
        let env = Environment::new();
        let ctx = GuestContext {
            plan_workdir: temp.path(),
            environment: &env,
            config: &config,
            log: None,
        };
        let guest = Guest::Local(LocalGuest::new(GuestCommon::new("default-0", None)));
        let err = guest
            .execute(&ctx, &ExecRequest::new("true"))
            .expect_err("should fail");
        assert!(err.to_string().contains("not ready"));
    }

    #[test]
    fn plan_environment_overrides_request_environment() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = TmtConfig::default();
        let mut plan_env = Environment::new();
        plan_env.insert("WHO".to_string(), "plan".to_string());
        let ctx = GuestContext {
            plan_workdir: temp.path(),
            environment: &plan_env,
            config: &config,
            log: None,
        };
        let mut guest = Guest::Local(LocalGuest::new(GuestCommon::new("default-0", None)));
        guest.start(&ctx).expect("start");
        let mut env = Environment::new();
        env.insert("WHO".to_string(), "test".to_string());
        let output = guest
            .execute(&ctx, &ExecRequest::new("echo $WHO").env(env))
            .expect("execute");
        assert_eq!(output.stdout_lossy().trim(), "plan");
    }

    #[test]
    fn stop_and_remove_are_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = TmtConfig::default();
        let env = Environment::new();
        let ctx = GuestContext {
            plan_workdir: temp.path(),
            environment: &env,
            config: &config,
            log: None,
        };
        let mut guest = Guest::Local(LocalGuest::new(GuestCommon::new("default-0", None)));
        guest.start(&ctx).expect("start");
        guest.stop(&ctx).expect("stop");
        guest.stop(&ctx).expect("stop again");
        guest.remove(&ctx).expect("remove");
        assert_eq!(guest.state(), GuestState::Removed);
        assert!(guest.start(&ctx).is_err());
    }
}
