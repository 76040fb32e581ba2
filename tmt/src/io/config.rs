//! Tool configuration stored in `config.toml`.
//!
//! Looked up at `$TMT_CONFIG_DIR/config.toml`, falling back to
//! `~/.config/tmt/config.toml`. A missing file means defaults.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::io::persist::write_atomic;

/// Tool configuration (TOML).
///
/// Missing fields default to the values documented on each field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TmtConfig {
    /// Root under which `run-NNN` workdirs are allocated.
    pub workdir_root: PathBuf,

    /// Provision method used when a plan does not name one.
    pub default_provision: String,

    pub http: HttpConfig,
    pub artemis: ArtemisConfig,
    #[serde(rename = "virtual")]
    pub virtual_machine: VirtualConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    /// Total attempts per request, including the first.
    pub retries: u32,
    pub backoff_factor: f64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            retries: 10,
            backoff_factor: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArtemisConfig {
    pub api_url: Option<String>,
    pub api_version: String,
    /// How long to wait for a guest to become ready.
    pub timeout_secs: u64,
    /// Poll interval while waiting.
    pub tick_secs: u64,
}

impl Default for ArtemisConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_version: "0.0.56".to_string(),
            timeout_secs: 600,
            tick_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VirtualConfig {
    /// Cloud image URL or alias used when a plan gives none.
    pub image: String,
    /// Memory in MiB.
    pub memory: u64,
    /// Disk size in GiB.
    pub disk: u64,
    pub ssh_timeout_secs: u64,
}

impl Default for VirtualConfig {
    fn default() -> Self {
        Self {
            image: "fedora".to_string(),
            memory: 2048,
            disk: 40,
            ssh_timeout_secs: 60,
        }
    }
}

impl Default for TmtConfig {
    fn default() -> Self {
        Self {
            workdir_root: PathBuf::from("/var/tmp/tmt"),
            default_provision: "virtual".to_string(),
            http: HttpConfig::default(),
            artemis: ArtemisConfig::default(),
            virtual_machine: VirtualConfig::default(),
        }
    }
}

impl TmtConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workdir_root.as_os_str().is_empty() {
            return Err(anyhow!("workdir_root must not be empty"));
        }
        if self.default_provision.trim().is_empty() {
            return Err(anyhow!("default_provision must not be empty"));
        }
        if self.http.timeout_secs == 0 {
            return Err(anyhow!("http.timeout_secs must be > 0"));
        }
        if self.http.retries == 0 {
            return Err(anyhow!("http.retries must be > 0"));
        }
        if self.http.backoff_factor < 0.0 {
            return Err(anyhow!("http.backoff_factor must be >= 0"));
        }
        if self.artemis.tick_secs == 0 {
            return Err(anyhow!("artemis.tick_secs must be > 0"));
        }
        if self.virtual_machine.memory == 0 || self.virtual_machine.disk == 0 {
            return Err(anyhow!("virtual.memory and virtual.disk must be > 0"));
        }
        Ok(())
    }

    /// Images downloaded by the virtual provisioner are cached here.
    pub fn image_cache(&self) -> PathBuf {
        self.workdir_root.join("images")
    }
}

/// Default config file location.
pub fn default_config_path() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("TMT_CONFIG_DIR") {
        return Some(PathBuf::from(dir).join("config.toml"));
    }
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config/tmt/config.toml"))
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `TmtConfig::default()`.
pub fn load_config(path: &Path) -> Result<TmtConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let cfg = TmtConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: TmtConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Load from the default location, or defaults when there is none.
pub fn load_default() -> Result<TmtConfig> {
    match default_config_path() {
        Some(path) => load_config(&path),
        None => Ok(TmtConfig::default()),
    }
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &TmtConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
