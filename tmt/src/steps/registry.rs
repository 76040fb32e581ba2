//! Plugin registry shared by all steps.
//!
//! Each step keeps a table of methods (`how` values) mapping to a factory,
//! a default order and a JSON schema for the phase keys. `how` may be any
//! unique prefix of a method name. Plugins are compiled in; directories
//! listed in `TMT_PLUGINS` are checked but their files are not loaded.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use jsonschema::Draft;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::step_name::StepName;
use crate::error::specification;
use crate::steps::PluginData;

pub const PLUGINS_ENV: &str = "TMT_PLUGINS";

/// One registered method.
#[derive(Debug, Clone)]
pub struct PluginInfo<F> {
    pub method: &'static str,
    pub order: i64,
    /// JSON schema for the phase data (name/how/order/where included).
    pub schema: &'static str,
    pub factory: F,
}

#[derive(Debug, Clone)]
pub struct Registry<F> {
    step: StepName,
    plugins: Vec<PluginInfo<F>>,
}

impl<F> Registry<F> {
    pub fn new(step: StepName) -> Self {
        Self {
            step,
            plugins: Vec::new(),
        }
    }

    pub fn register(mut self, info: PluginInfo<F>) -> Self {
        self.plugins.push(info);
        self
    }

    pub fn methods(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|info| info.method).collect()
    }

    /// Exact method match, otherwise a unique prefix.
    pub fn find(&self, how: &str) -> Result<&PluginInfo<F>> {
        if let Some(info) = self.plugins.iter().find(|info| info.method == how) {
            return Ok(info);
        }
        let candidates: Vec<&PluginInfo<F>> = self
            .plugins
            .iter()
            .filter(|info| info.method.starts_with(how))
            .collect();
        match candidates.as_slice() {
            [info] => Ok(info),
            [] => Err(specification(format!(
                "unsupported {} method '{how}' (available: {})",
                self.step,
                self.methods().join(", ")
            ))),
            many => Err(specification(format!(
                "ambiguous {} method '{how}' matches {}",
                self.step,
                many.iter().map(|info| info.method).collect::<Vec<_>>().join(", ")
            ))),
        }
    }

    /// Resolve `data.how`, validate the phase keys and return the plugin.
    pub fn resolve(&self, data: &PluginData) -> Result<&PluginInfo<F>> {
        let info = self.find(&data.how)?;
        validate(info.schema, data)
            .map_err(|err| specification(format!("invalid {} phase '{}': {err:#}", self.step, data.name)))?;
        Ok(info)
    }
}

/// Validate phase data against a plugin schema.
pub fn validate(schema: &str, data: &PluginData) -> Result<()> {
    let schema: Value = serde_json::from_str(schema).context("parse plugin schema")?;
    let instance = serde_json::to_value(data).context("convert phase data")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile plugin schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(&instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!("{}", messages.join("; ")));
    }
    Ok(())
}

/// Check the directories listed in `TMT_PLUGINS`.
///
/// Every listed directory must exist. Plugin files found there cannot be
/// loaded into a compiled binary and are reported and skipped.
pub fn scan_plugin_dirs(raw: Option<&str>) -> Result<Vec<PathBuf>> {
    let Some(raw) = raw.filter(|raw| !raw.trim().is_empty()) else {
        return Ok(Vec::new());
    };
    let mut ignored = Vec::new();
    for dir in raw.split(':').filter(|part| !part.is_empty()) {
        let dir = Path::new(dir);
        if !dir.is_dir() {
            return Err(specification(format!(
                "plugin directory '{}' from {PLUGINS_ENV} does not exist",
                dir.display()
            )));
        }
        debug!(dir = %dir.display(), "scanning plugin directory");
        let entries = fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))?;
        for entry in entries {
            let path = entry.with_context(|| format!("read {}", dir.display()))?.path();
            warn!(plugin = %path.display(), "external plugins are not supported, ignoring");
            ignored.push(path);
        }
    }
    ignored.sort();
    Ok(ignored)
}

/// Schema fragment accepted by every phase; plugin schemas extend it.
#[macro_export]
#[doc(hidden)]
macro_rules! phase_schema {
    ($properties:literal) => {
        concat!(
            r#"{
  "type": "object",
  "required": ["name", "how"],
  "properties": {
    "name": {"type": "string"},
    "how": {"type": "string"},
    "order": {"type": "integer"},
    "where": {"type": "array", "items": {"type": "string"}},
    "summary": {"type": "string"}"#,
            $properties,
            r#"
  }
}"#
        )
    };
}
