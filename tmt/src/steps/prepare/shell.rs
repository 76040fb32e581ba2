//! `how: shell` — run scripts on the guest.

use anyhow::Result;

use crate::error::specification;
use crate::guest::{ExecRequest, Guest};
use crate::steps::PluginData;
use crate::steps::prepare::{PhaseContext, PhasePlugin};

pub const SCHEMA: &str = crate::phase_schema!(
    r#",
    "script": {"type": ["string", "array"], "items": {"type": "string"}}"#
);

/// Prepended to every script: stop on the first failure, including inside pipes.
pub const STRICT_PREAMBLE: &str = "set -e\n(set -o pipefail) 2>/dev/null && set -o pipefail\n";

#[derive(Debug, Clone)]
pub struct ShellPhase {
    scripts: Vec<String>,
}

impl ShellPhase {
    pub fn create(data: &PluginData) -> Result<Box<dyn PhasePlugin>> {
        let scripts = data.get_list("script");
        if scripts.is_empty() {
            return Err(specification(format!(
                "shell phase '{}' has no 'script' to run",
                data.name
            )));
        }
        Ok(Box::new(Self { scripts }))
    }
}

pub fn strict(script: &str) -> String {
    format!("{STRICT_PREAMBLE}{script}")
}

impl PhasePlugin for ShellPhase {
    fn go(&self, guest: &Guest, ctx: &PhaseContext<'_>) -> Result<()> {
        for script in &self.scripts {
            guest.execute_checked(&ctx.guest, &ExecRequest::new(strict(script)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_is_required() {
        assert!(ShellPhase::create(&PluginData::new("default-0", "shell")).is_err());
        assert!(
            ShellPhase::create(&PluginData::new("default-0", "shell").with_key("script", "true")).is_ok()
        );
    }

    #[test]
    fn strict_mode_stops_on_pipe_failures() {
        let output = std::process::Command::new("sh")
            .arg("-c")
            .arg(strict("false | true\necho reached"))
            .output()
            .expect("sh");
        let stdout = String::from_utf8_lossy(&output.stdout);
        // shells without pipefail still run the rest; with it they stop
        if output.status.success() {
            assert!(stdout.contains("reached"));
        } else {
            assert!(!stdout.contains("reached"));
        }
        let output = std::process::Command::new("sh")
            .arg("-c")
            .arg(strict("false\necho reached"))
            .output()
            .expect("sh");
        assert!(!output.status.success());
        assert!(!String::from_utf8_lossy(&output.stdout).contains("reached"));
    }
}
