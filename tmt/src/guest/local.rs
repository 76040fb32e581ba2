//! The host itself as a guest.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::environment::Environment;
use crate::guest::{Backend, GuestCommon, GuestContext};
use crate::io::files::copy_tree;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalGuest {
    #[serde(flatten)]
    pub common: GuestCommon,
}

impl LocalGuest {
    pub fn new(common: GuestCommon) -> Self {
        Self { common }
    }
}

impl Backend for LocalGuest {
    fn start(&mut self, _ctx: &GuestContext<'_>) -> Result<()> {
        Ok(())
    }

    fn exec_command(&self, script: &str, cwd: &Path, env: &Environment, _interactive: bool) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script).current_dir(cwd).envs(env);
        cmd
    }

    fn push(&self, _ctx: &GuestContext<'_>, src: &Path, dst: &Path) -> Result<()> {
        if src == dst {
            debug!("push to the same path on the host is a no-op");
            return Ok(());
        }
        copy_tree(src, dst, &[])
    }

    fn pull(&self, _ctx: &GuestContext<'_>, src: &Path, dst: &Path) -> Result<()> {
        if src == dst {
            return Ok(());
        }
        copy_tree(src, dst, &[])
    }

    fn reboot(&mut self, _ctx: &GuestContext<'_>, _hard: bool, _timeout: Duration) -> Result<bool> {
        Ok(false)
    }

    fn ansible_command(&self, playbook: &Path, extra_args: &[String]) -> Command {
        let mut cmd = Command::new("ansible-playbook");
        cmd.args(["-c", "local", "-i", "localhost,"])
            .args(extra_args)
            .arg(playbook);
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ansible_uses_local_connection() {
        let guest = LocalGuest::new(GuestCommon::new("default-0", None));
        let cmd = guest.ansible_command(Path::new("setup.yml"), &["-vv".to_string()]);
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(args, vec!["-c", "local", "-i", "localhost,", "-vv", "setup.yml"]);
    }

    #[test]
    fn exec_runs_in_cwd_with_env() {
        let mut env = Environment::new();
        env.insert("X".to_string(), "1".to_string());
        let guest = LocalGuest::new(GuestCommon::new("default-0", None));
        let cmd = guest.exec_command("echo $X", Path::new("/tmp"), &env, false);
        assert_eq!(cmd.get_program(), "sh");
        assert_eq!(cmd.get_current_dir(), Some(Path::new("/tmp")));
        assert!(cmd.get_envs().any(|(k, v)| k == "X" && v.is_some_and(|v| v == "1")));
    }
}
