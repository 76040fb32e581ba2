//! `how: multihost` — make guests reachable by name.
//!
//! Role variables (`TMT_ROLE_<role>`) are derived from the provisioned
//! guests whenever an environment is composed; this phase only appends
//! `<address> <name>` lines to `/etc/hosts` on every guest. The host itself
//! is never modified.

use anyhow::Result;
use tracing::debug;

use crate::guest::{ExecRequest, Guest, GuestContext, shell_quote};
use crate::steps::PluginData;
use crate::steps::prepare::{PhaseContext, PhasePlugin};

pub const SCHEMA: &str = crate::phase_schema!("");

const ADDRESS_QUERY: &str = "hostname -I 2>/dev/null | awk '{print $1}'";

#[derive(Debug, Clone, Default)]
pub struct MultihostPhase;

impl MultihostPhase {
    pub fn create(_data: &PluginData) -> Result<Box<dyn PhasePlugin>> {
        Ok(Box::new(Self))
    }
}

/// Address of each guest, as seen from the other guests.
pub fn collect_hosts(guests: &[Guest], ctx: &GuestContext<'_>) -> Vec<(String, String)> {
    let mut hosts = Vec::with_capacity(guests.len());
    for guest in guests {
        if let Some(address) = guest_address(guest, ctx) {
            hosts.push((guest.name().to_string(), address));
        } else {
            debug!(guest = %guest.name(), "no address known");
        }
    }
    hosts
}

fn guest_address(guest: &Guest, ctx: &GuestContext<'_>) -> Option<String> {
    let queried = guest
        .execute(ctx, &ExecRequest::new(ADDRESS_QUERY))
        .ok()
        .filter(|output| output.success())
        .map(|output| output.stdout_lossy().trim().to_string())
        .filter(|address| !address.is_empty());
    queried.or_else(|| match guest {
        Guest::Connect(g) => Some(g.transport.host.clone()),
        Guest::Artemis(g) => Some(g.transport.host.clone()),
        Guest::Minute(g) => Some(g.transport.host.clone()),
        _ => None,
    })
}

/// Shell snippet appending each `address name` line unless already present.
pub fn hosts_script(hosts: &[(String, String)]) -> String {
    hosts
        .iter()
        .map(|(name, address)| {
            let line = shell_quote(&format!("{address} {name}"));
            format!("grep -qxF {line} /etc/hosts || echo {line} >> /etc/hosts")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

impl PhasePlugin for MultihostPhase {
    fn go(&self, guest: &Guest, ctx: &PhaseContext<'_>) -> Result<()> {
        if guest.is_local() {
            debug!(guest = %guest.name(), "not touching /etc/hosts of the host");
            return Ok(());
        }
        if ctx.hosts.is_empty() {
            return Ok(());
        }
        guest.execute_checked(&ctx.guest, &ExecRequest::new(hosts_script(ctx.hosts)))?;
        Ok(())
    }

    fn needs_hosts(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosts_lines_are_idempotent_appends() {
        let script = hosts_script(&[
            ("server".to_string(), "10.0.0.1".to_string()),
            ("client".to_string(), "10.0.0.2".to_string()),
        ]);
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(
            lines[0],
            "grep -qxF '10.0.0.1 server' /etc/hosts || echo '10.0.0.1 server' >> /etc/hosts"
        );
        assert_eq!(lines.len(), 2);
    }
}
