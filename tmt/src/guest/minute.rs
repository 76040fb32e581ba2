//! 1minutetip OpenStack guests (`how: minute`).
//!
//! OpenStack commands are executed by the 1minutetip service:
//! `GET {api_url}?cmd=<openstack arguments>` answers with the command's
//! stdout followed by a line holding its exit code.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::core::environment::Environment;
use crate::error::{ErrorKind, TmtError};
use crate::guest::{Backend, GuestCommon, GuestContext, SshTransport};
use crate::io::http::HttpClient;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MinuteGuest {
    #[serde(flatten)]
    pub common: GuestCommon,
    pub api_url: String,
    pub image: String,
    pub flavor: String,
    /// OpenStack server name, assigned on start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
    #[serde(flatten)]
    pub transport: SshTransport,
}

/// Split a 1minutetip response into (stdout, exit code).
pub fn parse_response(body: &str) -> Result<(String, i32)> {
    let trimmed = body.trim_end_matches('\n');
    let (stdout, code) = match trimmed.rsplit_once('\n') {
        Some((stdout, code)) => (stdout, code),
        None => ("", trimmed),
    };
    let code = code
        .trim()
        .parse::<i32>()
        .map_err(|_| anyhow!("unexpected 1minutetip response: {body}"))?;
    Ok((stdout.to_string(), code))
}

/// Address from `addresses` output such as `net=10.0.0.7, 2001::1`.
pub fn parse_address(addresses: &str) -> Option<String> {
    addresses
        .split(['=', ',', ';'])
        .map(str::trim)
        .find(|part| part.parse::<std::net::Ipv4Addr>().is_ok())
        .map(str::to_string)
}

impl MinuteGuest {
    pub fn new(common: GuestCommon, api_url: String, image: String, flavor: String) -> Self {
        Self {
            common,
            api_url,
            image,
            flavor,
            instance_name: None,
            transport: SshTransport::new("", "root"),
        }
    }

    fn openstack(&self, client: &HttpClient, args: &str) -> Result<String> {
        let url = format!("{}?cmd={}", self.api_url, encode(args));
        debug!(command = %args, "running openstack command");
        let response = client.get(&url)?.error_for_status("1minutetip request")?;
        let (stdout, code) = parse_response(&response.body)?;
        if code != 0 {
            return Err(anyhow!("openstack {args} failed with exit code {code}: {stdout}"));
        }
        Ok(stdout)
    }

    fn instance(&self, plan_workdir: &Path) -> String {
        self.instance_name.clone().unwrap_or_else(|| {
            let run = plan_workdir
                .iter()
                .filter_map(|part| part.to_str())
                .find(|part| part.starts_with("run-"))
                .unwrap_or("run");
            format!("tmt-{run}-{}", self.common.name)
        })
    }
}

/// Percent-encode a query value.
fn encode(value: &str) -> String {
    let mut out = String::new();
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

impl Backend for MinuteGuest {
    #[instrument(skip_all, fields(guest = %self.common.name))]
    fn start(&mut self, ctx: &GuestContext<'_>) -> Result<()> {
        let client = HttpClient::new(&ctx.config.http);
        let name = self.instance(ctx.plan_workdir);
        if self.instance_name.is_none() {
            self.openstack(
                &client,
                &format!(
                    "server create --wait --flavor {} --image {} {name}",
                    self.flavor, self.image
                ),
            )
            .map_err(|err| TmtError::new(ErrorKind::Provision, format!("provision failed: {err:#}")))?;
            self.instance_name = Some(name.clone());
        }
        let addresses = self.openstack(
            &client,
            &format!("server show -f value -c addresses {name}"),
        )?;
        self.transport.host = parse_address(&addresses)
            .ok_or_else(|| anyhow!("no address assigned to {name}: {addresses}"))?;
        info!(instance = %name, host = %self.transport.host, "1minutetip instance created");
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
        if !hard {
            return self.transport.soft_reboot(ctx, timeout);
        }
        let Some(name) = self.instance_name.clone() else {
            return Ok(false);
        };
        let client = HttpClient::new(&ctx.config.http);
        self.openstack(&client, &format!("server reboot --hard --wait {name}"))?;
        self.transport.wait_ready(timeout)?;
        Ok(true)
    }

    fn ansible_command(&self, playbook: &Path, extra_args: &[String]) -> Command {
        self.transport.ansible_command(playbook, extra_args)
    }

    fn remove(&mut self, ctx: &GuestContext<'_>) -> Result<()> {
        let Some(name) = self.instance_name.clone() else {
            return Ok(());
        };
        let client = HttpClient::new(&ctx.config.http);
        self.openstack(&client, &format!("server delete --wait {name}"))?;
        info!(instance = %name, "1minutetip instance deleted");
        Ok(())
    }
}
