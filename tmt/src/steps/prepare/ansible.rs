//! `how: ansible` — apply playbooks stored in the metadata tree.

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use tracing::info;

use crate::error::specification;
use crate::guest::Guest;
use crate::steps::PluginData;
use crate::steps::prepare::{PhaseContext, PhasePlugin};

pub const SCHEMA: &str = crate::phase_schema!(
    r#",
    "playbook": {"type": ["string", "array"], "items": {"type": "string"}},
    "extra-args": {"type": "string"}"#
);

#[derive(Debug, Clone)]
pub struct AnsiblePhase {
    playbooks: Vec<String>,
    extra_args: Vec<String>,
}

impl AnsiblePhase {
    pub fn create(data: &PluginData) -> Result<Box<dyn PhasePlugin>> {
        let playbooks = data.get_list("playbook");
        if playbooks.is_empty() {
            return Err(specification(format!(
                "ansible phase '{}' has no 'playbook'",
                data.name
            )));
        }
        let extra_args = data
            .get_str("extra-args")
            .map(|raw| raw.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        Ok(Box::new(Self { playbooks, extra_args }))
    }

    /// Playbooks are relative to the metadata tree root; URLs are not supported.
    fn playbook_path(&self, ctx: &PhaseContext<'_>, playbook: &str) -> Result<PathBuf> {
        if playbook.contains("://") {
            return Err(anyhow!("remote playbooks are not supported: {playbook}"));
        }
        let path = ctx.plan.tree_root.join(playbook.trim_start_matches('/'));
        if !path.is_file() {
            return Err(anyhow!("playbook not found: {}", path.display()));
        }
        Ok(path)
    }
}

impl PhasePlugin for AnsiblePhase {
    fn go(&self, guest: &Guest, ctx: &PhaseContext<'_>) -> Result<()> {
        for playbook in &self.playbooks {
            let path = self.playbook_path(ctx, playbook)?;
            info!(playbook = %path.display(), guest = %guest.name(), "applying playbook");
            guest.ansible(&ctx.guest, &path, &self.extra_args)?;
        }
        Ok(())
    }
}
