//! Local virtual machine guest (`how: virtual`) driven by qemu.
//!
//! The cloud image is downloaded once into the shared image cache, every
//! guest gets a copy-on-write overlay, its own ecdsa keypair and a
//! cloud-init seed. SSH is forwarded from a free localhost port.

use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::environment::Environment;
use crate::guest::{Backend, GuestCommon, GuestContext, SshTransport, run_host};
use crate::io::http::HttpClient;

const FEDORA_IMAGE: &str = "https://download.fedoraproject.org/pub/fedora/linux/releases/40/Cloud/x86_64/images/Fedora-Cloud-Base-Generic.x86_64-40-1.14.qcow2";
const KEY_NAME: &str = "id_ecdsa";
const PID_FILE: &str = "qemu.pid";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VirtualGuest {
    #[serde(flatten)]
    pub common: GuestCommon,
    /// Image URL, local path or alias (`fedora`).
    pub image: String,
    /// Memory in MiB.
    pub memory: u64,
    /// Disk size in GiB.
    pub disk: u64,
    /// Directory holding the overlay disk, keys and seed.
    pub instance_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    #[serde(flatten)]
    pub transport: SshTransport,
}

impl VirtualGuest {
    pub fn new(common: GuestCommon, image: String, memory: u64, disk: u64, instance_dir: PathBuf) -> Self {
        Self {
            common,
            image,
            memory,
            disk,
            instance_dir,
            pid: None,
            transport: SshTransport::new("127.0.0.1", "root"),
        }
    }

    fn key_path(&self) -> PathBuf {
        self.instance_dir.join(KEY_NAME)
    }

    fn disk_path(&self) -> PathBuf {
        self.instance_dir.join("disk.qcow2")
    }

    fn seed_path(&self) -> PathBuf {
        self.instance_dir.join("seed.iso")
    }

    /// Local path of the base image, downloading it into the cache when needed.
    fn base_image(&self, ctx: &GuestContext<'_>) -> Result<PathBuf> {
        let local = Path::new(&self.image);
        if local.is_file() {
            return Ok(local.to_path_buf());
        }
        let url = resolve_image_url(&self.image);
        let file_name = url
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| anyhow!("cannot derive image file name from '{url}'"))?;
        let cached = ctx.config.image_cache().join(file_name);
        if cached.is_file() {
            debug!(image = %cached.display(), "using cached image");
            return Ok(cached);
        }
        info!(url = %url, "downloading image");
        HttpClient::new(&ctx.config.http).download(&url, &cached)?;
        Ok(cached)
    }

    fn prepare_instance(&mut self, ctx: &GuestContext<'_>) -> Result<()> {
        let base = self.base_image(ctx)?;
        fs::create_dir_all(&self.instance_dir)
            .with_context(|| format!("create {}", self.instance_dir.display()))?;

        if !self.key_path().is_file() {
            let mut cmd = Command::new("ssh-keygen");
            cmd.args(["-q", "-t", "ecdsa", "-N", "", "-f"]).arg(self.key_path());
            run_host(ctx, cmd, Some(Duration::from_secs(60)))?;
        }
        self.transport.key = Some(self.key_path());

        let mut cmd = Command::new("qemu-img");
        cmd.args(["create", "-f", "qcow2", "-F", "qcow2", "-b"])
            .arg(&base)
            .arg(self.disk_path())
            .arg(format!("{}G", self.disk));
        run_host(ctx, cmd, Some(Duration::from_secs(120)))?;

        let public_key = fs::read_to_string(self.key_path().with_extension("pub"))
            .context("read generated public key")?;
        let user_data = self.instance_dir.join("user-data");
        let meta_data = self.instance_dir.join("meta-data");
        fs::write(&user_data, cloud_init_user_data(public_key.trim()))
            .with_context(|| format!("write {}", user_data.display()))?;
        fs::write(
            &meta_data,
            format!(
                "instance-id: {0}\nlocal-hostname: {0}\n",
                self.common.name
            ),
        )
        .with_context(|| format!("write {}", meta_data.display()))?;
        let mut cmd = Command::new("cloud-localds");
        cmd.arg(self.seed_path()).arg(&user_data).arg(&meta_data);
        run_host(ctx, cmd, Some(Duration::from_secs(60)))?;
        Ok(())
    }

    fn boot(&mut self, ctx: &GuestContext<'_>) -> Result<()> {
        let port = free_port()?;
        self.transport.port = Some(port);
        let pid_file = self.instance_dir.join(PID_FILE);
        let mut cmd = Command::new("qemu-system-x86_64");
        cmd.args(qemu_args(
            self.memory,
            &self.disk_path(),
            &self.seed_path(),
            port,
            &pid_file,
        ));
        run_host(ctx, cmd, Some(Duration::from_secs(120)))?;
        let pid = fs::read_to_string(&pid_file)
            .with_context(|| format!("read {}", pid_file.display()))?
            .trim()
            .parse::<i32>()
            .context("parse qemu pid")?;
        self.pid = Some(pid);
        info!(pid, port, "virtual machine booted");
        self.transport
            .wait_ready(Duration::from_secs(ctx.config.virtual_machine.ssh_timeout_secs))
    }

    fn kill(&mut self) -> Result<()> {
        if let Some(pid) = self.pid.take() {
            terminate(pid)?;
        }
        Ok(())
    }
}

/// Map aliases to image URLs; anything else is used as given.
pub fn resolve_image_url(image: &str) -> String {
    match image {
        "fedora" => FEDORA_IMAGE.to_string(),
        other => other.to_string(),
    }
}

/// cloud-init user data granting root access with `public_key`.
pub fn cloud_init_user_data(public_key: &str) -> String {
    format!(
        "#cloud-config\n\
         disable_root: false\n\
         ssh_pwauth: false\n\
         users:\n\
         \x20 - name: root\n\
         \x20   ssh_authorized_keys:\n\
         \x20     - {public_key}\n"
    )
}

/// qemu arguments for a daemonized VM with SSH forwarded to `port`.
pub fn qemu_args(memory: u64, disk: &Path, seed: &Path, port: u16, pid_file: &Path) -> Vec<String> {
    vec![
        "-enable-kvm".to_string(),
        "-m".to_string(),
        memory.to_string(),
        "-smp".to_string(),
        "2".to_string(),
        "-display".to_string(),
        "none".to_string(),
        "-daemonize".to_string(),
        "-pidfile".to_string(),
        pid_file.display().to_string(),
        "-drive".to_string(),
        format!("file={},if=virtio,format=qcow2", disk.display()),
        "-drive".to_string(),
        format!("file={},if=virtio,media=cdrom", seed.display()),
        "-netdev".to_string(),
        format!("user,id=net0,hostfwd=tcp:127.0.0.1:{port}-:22"),
        "-device".to_string(),
        "virtio-net-pci,netdev=net0".to_string(),
    ]
}

fn free_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").context("find free port")?;
    Ok(listener.local_addr().context("read local address")?.port())
}

#[cfg(unix)]
fn terminate(pid: i32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(anyhow!("kill qemu pid {pid}: {err}")),
    }
}

#[cfg(not(unix))]
fn terminate(pid: i32) -> Result<()> {
    Err(anyhow!("cannot stop qemu pid {pid} on this platform"))
}

impl Backend for VirtualGuest {
    #[instrument(skip_all, fields(guest = %self.common.name))]
    fn start(&mut self, ctx: &GuestContext<'_>) -> Result<()> {
        if !self.disk_path().is_file() {
            self.prepare_instance(ctx)?;
        }
        self.boot(ctx)
    }

    fn wake(&mut self, _ctx: &GuestContext<'_>) -> Result<()> {
        if self.pid.is_none() {
            warn!(guest = %self.common.name, "no qemu pid recorded for virtual guest");
        }
        Ok(())
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
        info!(guest = %self.common.name, "power cycling virtual machine");
        self.kill()?;
        self.boot(ctx)?;
        Ok(true)
    }

    fn ansible_command(&self, playbook: &Path, extra_args: &[String]) -> Command {
        self.transport.ansible_command(playbook, extra_args)
    }

    fn stop(&mut self, _ctx: &GuestContext<'_>) -> Result<()> {
        self.kill()
    }

    fn remove(&mut self, _ctx: &GuestContext<'_>) -> Result<()> {
        self.kill()?;
        if self.instance_dir.exists() {
            fs::remove_dir_all(&self.instance_dir)
                .with_context(|| format!("remove {}", self.instance_dir.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve_to_urls() {
        assert!(resolve_image_url("fedora").starts_with("https://"));
        assert_eq!(resolve_image_url("https://x/y.qcow2"), "https://x/y.qcow2");
    }

    #[test]
    fn qemu_forwards_ssh_port() {
        let args = qemu_args(
            2048,
            Path::new("/i/disk.qcow2"),
            Path::new("/i/seed.iso"),
            40022,
            Path::new("/i/qemu.pid"),
        );
        assert!(args.contains(&"user,id=net0,hostfwd=tcp:127.0.0.1:40022-:22".to_string()));
        assert!(args.contains(&"2048".to_string()));
        assert!(args.contains(&"-daemonize".to_string()));
    }

    #[test]
    fn user_data_authorizes_key() {
        let data = cloud_init_user_data("ecdsa-sha2-nistp256 AAAA test");
        assert!(data.starts_with("#cloud-config\n"));
        let parsed: serde_yaml::Value = serde_yaml::from_str(&data).expect("yaml");
        let key = &parsed["users"][0]["ssh_authorized_keys"][0];
        assert_eq!(key.as_str(), Some("ecdsa-sha2-nistp256 AAAA test"));
    }

    #[test]
    fn free_port_is_nonzero() {
        assert_ne!(free_port().expect("port"), 0);
    }

    #[test]
    fn virtual_guest_round_trips() {
        let mut guest = VirtualGuest::new(
            GuestCommon::new("vm", None),
            "fedora".to_string(),
            2048,
            40,
            PathBuf::from("/var/tmp/tmt/run-001/plan/provision/vm"),
        );
        guest.pid = Some(4242);
        guest.transport.port = Some(40022);
        let yaml = serde_yaml::to_string(&guest).expect("serialize");
        let back: VirtualGuest = serde_yaml::from_str(&yaml).expect("deserialize");
        assert_eq!(back, guest);
    }
}
