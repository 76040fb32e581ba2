//! Guests provisioned through the Artemis REST API.
//!
//! `POST /guests/` requests a machine, `GET /guests/{name}` is polled every
//! tick until the guest is `ready` (or `error`), `DELETE /guests/{name}`
//! releases it. Requests go through the shared retrying HTTP client.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::core::environment::Environment;
use crate::error::{ErrorKind, TmtError};
use crate::guest::{Backend, GuestCommon, GuestContext, SshTransport};
use crate::io::cancel;
use crate::io::http::HttpClient;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ArtemisGuest {
    #[serde(flatten)]
    pub common: GuestCommon,
    pub api_url: String,
    pub api_version: String,
    /// Assigned by Artemis on creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guestname: Option<String>,
    pub arch: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    pub priority_group: String,
    pub keyname: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub user_data: BTreeMap<String, String>,
    /// Seconds to wait for `ready`.
    pub provision_timeout: u64,
    /// Seconds between state polls.
    pub provision_tick: u64,
    #[serde(flatten)]
    pub transport: SshTransport,
}

/// Relevant part of `GET /guests/{name}`.
#[derive(Debug, Clone, Deserialize)]
pub struct GuestInfo {
    pub guestname: Option<String>,
    pub state: String,
    #[serde(default)]
    pub address: Option<String>,
}

impl ArtemisGuest {
    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/v{}/{}",
            self.api_url.trim_end_matches('/'),
            self.api_version,
            path.trim_start_matches('/')
        )
    }

    /// Guest-creation document.
    pub fn create_request(&self) -> serde_json::Value {
        let mut environment = json!({
            "hw": { "arch": self.arch },
            "os": { "compose": self.image },
        });
        if let Some(pool) = &self.pool {
            environment["pool"] = json!(pool);
        }
        json!({
            "keyname": self.keyname,
            "environment": environment,
            "priority_group": self.priority_group,
            "user_data": self.user_data,
        })
    }

    fn client(&self, ctx: &GuestContext<'_>) -> HttpClient {
        HttpClient::new(&ctx.config.http)
    }

    fn create(&mut self, client: &HttpClient) -> Result<String> {
        let response = client
            .post_json(&self.endpoint("guests/"), &self.create_request())?
            .error_for_status("artemis guest creation")?;
        let info: GuestInfo = response.json()?;
        let name = info
            .guestname
            .ok_or_else(|| anyhow!("artemis did not return a guest name"))?;
        info!(guestname = %name, "artemis guest requested");
        self.guestname = Some(name.clone());
        Ok(name)
    }

    fn wait_ready(&mut self, client: &HttpClient, name: &str) -> Result<()> {
        let started = Instant::now();
        let timeout = Duration::from_secs(self.provision_timeout);
        loop {
            let response = client
                .get(&self.endpoint(&format!("guests/{name}")))?
                .error_for_status("artemis guest lookup")?;
            let info: GuestInfo = response.json()?;
            debug!(state = %info.state, "artemis guest state");
            match info.state.as_str() {
                "ready" => {
                    let address = info
                        .address
                        .ok_or_else(|| anyhow!("artemis guest {name} is ready but has no address"))?;
                    self.transport.host = address;
                    return Ok(());
                }
                "error" => {
                    return Err(TmtError::new(
                        ErrorKind::Provision,
                        format!("provision failed: artemis guest {name} entered error state"),
                    )
                    .into());
                }
                _ => {}
            }
            if started.elapsed() >= timeout {
                return Err(TmtError::new(
                    ErrorKind::Provision,
                    format!(
                        "provision failed: artemis guest {name} not ready after {}s",
                        timeout.as_secs()
                    ),
                )
                .into());
            }
            cancel::sleep(Duration::from_secs(self.provision_tick))?;
        }
    }
}

impl Backend for ArtemisGuest {
    #[instrument(skip_all, fields(guest = %self.common.name))]
    fn start(&mut self, ctx: &GuestContext<'_>) -> Result<()> {
        let client = self.client(ctx);
        let name = match self.guestname.clone() {
            Some(name) => name,
            None => self.create(&client)?,
        };
        self.wait_ready(&client, &name)?;
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

    fn reboot(&mut self, ctx: &GuestContext<'_>, _hard: bool, timeout: Duration) -> Result<bool> {
        self.transport.soft_reboot(ctx, timeout)
    }

    fn ansible_command(&self, playbook: &Path, extra_args: &[String]) -> Command {
        self.transport.ansible_command(playbook, extra_args)
    }

    fn remove(&mut self, ctx: &GuestContext<'_>) -> Result<()> {
        let Some(name) = self.guestname.clone() else {
            return Ok(());
        };
        let response = self
            .client(ctx)
            .delete(&self.endpoint(&format!("guests/{name}")))?;
        if response.status != 404 {
            response.error_for_status("artemis guest removal")?;
        }
        info!(guestname = %name, "artemis guest released");
        Ok(())
    }
}
