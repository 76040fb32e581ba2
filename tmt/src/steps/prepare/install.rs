//! `how: install` — install packages with the guest's package manager.
//!
//! The manager is probed once per guest (`rpm-ostree` on ostree systems,
//! then `dnf`, then `yum`) and cached for the rest of the step. Packages
//! already provided are not reinstalled. Local `.rpm` files and directories
//! of rpms are copied into the plan workdir and pushed to the guest first.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info};

use crate::guest::{ExecRequest, Guest, shell_quote};
use crate::steps::PluginData;
use crate::steps::prepare::{PhaseContext, PhasePlugin};

pub const SCHEMA: &str = crate::phase_schema!(
    r#",
    "package": {"type": ["string", "array"], "items": {"type": "string"}},
    "directory": {"type": ["string", "array"], "items": {"type": "string"}},
    "copr": {"type": ["string", "array"], "items": {"type": "string"}},
    "exclude": {"type": ["string", "array"], "items": {"type": "string"}},
    "debuginfo": {"type": ["string", "array"], "items": {"type": "string"}},
    "missing": {"enum": ["fail", "skip"]}"#
);

const PROBE: &str = "if [ -e /run/ostree-booted ] && command -v rpm-ostree >/dev/null 2>&1; then echo rpm-ostree; \
     elif command -v dnf >/dev/null 2>&1; then echo dnf; \
     elif command -v yum >/dev/null 2>&1; then echo yum; fi";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    RpmOstree,
    Dnf,
    Yum,
}

impl PackageManager {
    pub fn as_str(self) -> &'static str {
        match self {
            PackageManager::RpmOstree => "rpm-ostree",
            PackageManager::Dnf => "dnf",
            PackageManager::Yum => "yum",
        }
    }

    pub fn parse(probe_output: &str) -> Option<Self> {
        match probe_output.trim() {
            "rpm-ostree" => Some(PackageManager::RpmOstree),
            "dnf" => Some(PackageManager::Dnf),
            "yum" => Some(PackageManager::Yum),
            _ => None,
        }
    }

    /// Commands installing `packages`; each must succeed.
    pub fn install_commands(self, packages: &[String], exclude: &[String], skip_missing: bool) -> Vec<String> {
        if packages.is_empty() {
            return Vec::new();
        }
        let quoted = quote_all(packages);
        let check = format!("rpm -q --whatprovides {quoted} >/dev/null 2>&1");
        match self {
            PackageManager::RpmOstree if skip_missing => packages
                .iter()
                .map(|package| {
                    let package = shell_quote(package);
                    format!(
                        "rpm -q --whatprovides {package} >/dev/null 2>&1 || \
                         rpm-ostree install --apply-live --idempotent --allow-inactive {package} || true"
                    )
                })
                .collect(),
            PackageManager::RpmOstree => vec![format!(
                "{check} || rpm-ostree install --apply-live --idempotent --allow-inactive {quoted}"
            )],
            PackageManager::Dnf | PackageManager::Yum => {
                let mut options = vec!["-y".to_string()];
                if skip_missing {
                    options.push("--skip-broken".to_string());
                    if self == PackageManager::Dnf {
                        options.push("--setopt=strict=0".to_string());
                    }
                }
                for excluded in exclude {
                    options.push(format!("--exclude {}", shell_quote(excluded)));
                }
                vec![format!(
                    "{check} || {} install {} {quoted}",
                    self.as_str(),
                    options.join(" ")
                )]
            }
        }
    }

    /// Install rpm files already present on the guest.
    pub fn install_local_command(self, paths: &[String]) -> String {
        let quoted = quote_all(paths);
        match self {
            PackageManager::RpmOstree => {
                format!("rpm-ostree install --apply-live --idempotent --allow-inactive {quoted}")
            }
            _ => format!("{} install -y {quoted}", self.as_str()),
        }
    }

    pub fn copr_command(self, repository: &str) -> Result<String> {
        match self {
            PackageManager::RpmOstree => Err(anyhow!(
                "copr repositories are not supported on rpm-ostree guests"
            )),
            _ => Ok(format!("{} copr enable -y {}", self.as_str(), shell_quote(repository))),
        }
    }

    pub fn debuginfo_command(self, packages: &[String]) -> Result<String> {
        let quoted = quote_all(packages);
        match self {
            PackageManager::RpmOstree => Err(anyhow!(
                "debuginfo installation is not supported on rpm-ostree guests"
            )),
            PackageManager::Dnf => Ok(format!("dnf debuginfo-install -y {quoted}")),
            PackageManager::Yum => Ok(format!("debuginfo-install -y {quoted}")),
        }
    }
}

fn quote_all(values: &[String]) -> String {
    values
        .iter()
        .map(|value| shell_quote(value))
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone)]
pub struct InstallPhase {
    name: String,
    packages: Vec<String>,
    directories: Vec<String>,
    copr: Vec<String>,
    exclude: Vec<String>,
    debuginfo: Vec<String>,
    skip_missing: bool,
}

impl InstallPhase {
    pub fn create(data: &PluginData) -> Result<Box<dyn PhasePlugin>> {
        Ok(Box::new(Self {
            name: data.name.clone(),
            packages: data.get_list("package"),
            directories: data.get_list("directory"),
            copr: data.get_list("copr"),
            exclude: data.get_list("exclude"),
            debuginfo: data.get_list("debuginfo"),
            skip_missing: data.get_str("missing").as_deref() == Some("skip"),
        }))
    }

    fn package_manager(&self, guest: &Guest, ctx: &PhaseContext<'_>) -> Result<PackageManager> {
        if let Some(manager) = ctx.package_managers.borrow().get(guest.name()) {
            return Ok(*manager);
        }
        let output = guest.execute_checked(&ctx.guest, &ExecRequest::new(PROBE))?;
        let manager = PackageManager::parse(&output.stdout_lossy())
            .ok_or_else(|| anyhow!("no supported package manager found on {}", guest.name()))?;
        debug!(guest = %guest.name(), manager = manager.as_str(), "package manager detected");
        ctx.package_managers
            .borrow_mut()
            .insert(guest.name().to_string(), manager);
        Ok(manager)
    }

    /// Split `packages` into repository names and local rpm files.
    fn local_rpms(&self, tree_root: &Path) -> Result<(Vec<String>, Vec<PathBuf>)> {
        let mut remote = Vec::new();
        let mut local = Vec::new();
        for package in &self.packages {
            let candidate = tree_root.join(package);
            if package.ends_with(".rpm") && candidate.is_file() {
                local.push(candidate);
            } else {
                remote.push(package.clone());
            }
        }
        for directory in &self.directories {
            let dir = tree_root.join(directory);
            let entries = fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))?;
            let mut found: Vec<PathBuf> = Vec::new();
            for entry in entries {
                let path = entry.with_context(|| format!("read {}", dir.display()))?.path();
                if path.extension().is_some_and(|ext| ext == "rpm") {
                    found.push(path);
                }
            }
            found.sort();
            local.extend(found);
        }
        Ok((remote, local))
    }

    /// Copy local rpms into the plan workdir and push them to the guest.
    fn stage_local(&self, guest: &Guest, ctx: &PhaseContext<'_>, rpms: &[PathBuf]) -> Result<Vec<String>> {
        let staging = ctx.plan.plan_workdir.join("prepare").join(&self.name).join("rpms");
        fs::create_dir_all(&staging).with_context(|| format!("create {}", staging.display()))?;
        let mut staged = Vec::with_capacity(rpms.len());
        for rpm in rpms {
            let file_name = rpm
                .file_name()
                .ok_or_else(|| anyhow!("invalid rpm path {}", rpm.display()))?;
            let target = staging.join(file_name);
            fs::copy(rpm, &target)
                .with_context(|| format!("copy {} to {}", rpm.display(), target.display()))?;
            staged.push(target.display().to_string());
        }
        guest.push(&ctx.guest, Some(staging.as_path()), None)?;
        Ok(staged)
    }
}

impl PhasePlugin for InstallPhase {
    fn go(&self, guest: &Guest, ctx: &PhaseContext<'_>) -> Result<()> {
        let (packages, local) = self.local_rpms(&ctx.plan.tree_root)?;
        if packages.is_empty() && local.is_empty() && self.copr.is_empty() && self.debuginfo.is_empty() {
            debug!(phase = %self.name, "nothing to install");
            return Ok(());
        }
        let manager = self.package_manager(guest, ctx)?;
        let run = |script: String| -> Result<()> {
            guest.execute_checked(&ctx.guest, &ExecRequest::new(script))?;
            Ok(())
        };

        for repository in &self.copr {
            run(manager.copr_command(repository)?)?;
        }
        if !local.is_empty() {
            let staged = self.stage_local(guest, ctx, &local)?;
            info!(count = staged.len(), "installing local packages");
            run(manager.install_local_command(&staged))?;
        }
        if !packages.is_empty() {
            info!(packages = %packages.join(" "), manager = manager.as_str(), "installing packages");
            for script in manager.install_commands(&packages, &self.exclude, self.skip_missing) {
                run(script)?;
            }
        }
        if !self.debuginfo.is_empty() {
            run(manager.debuginfo_command(&self.debuginfo)?)?;
        }
        Ok(())
    }
}
