//! Environment variable maps and their precedence rules.
//!
//! Layers are applied lowest to highest priority: caller-provided values,
//! test environment, plan environment, run-level (command line) environment.
//! A key present in a higher layer always wins.

use std::collections::BTreeMap;

use anyhow::{Result, anyhow};

/// Ordered map of environment variables.
pub type Environment = BTreeMap<String, String>;

/// Overlay `layers` in order; later layers override earlier ones.
pub fn compose<'a>(layers: impl IntoIterator<Item = &'a Environment>) -> Environment {
    let mut merged = Environment::new();
    for layer in layers {
        for (key, value) in layer {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Parse a `KEY=VALUE` assignment as given on the command line.
pub fn parse_assignment(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("invalid environment assignment '{raw}' (expected KEY=VALUE)"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow!("invalid environment assignment '{raw}' (empty key)"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Convert a metadata mapping into an environment, stringifying scalars.
pub fn from_yaml(value: &serde_yaml::Value) -> Result<Environment> {
    let mut env = Environment::new();
    let serde_yaml::Value::Mapping(map) = value else {
        if value.is_null() {
            return Ok(env);
        }
        return Err(anyhow!("environment must be a mapping"));
    };
    for (key, value) in map {
        let key = key
            .as_str()
            .ok_or_else(|| anyhow!("environment keys must be strings"))?;
        env.insert(key.to_string(), scalar_to_string(value)?);
    }
    Ok(env)
}

pub(crate) fn scalar_to_string(value: &serde_yaml::Value) -> Result<String> {
    Ok(match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Null => String::new(),
        other => return Err(anyhow!("expected a scalar value, got {other:?}")),
    })
}

/// Build `TMT_ROLE_<role>` variables from `(guest name, role)` pairs.
///
/// Each variable holds the comma-separated names of guests with that role,
/// in provisioning order.
pub fn role_variables<'a>(guests: impl IntoIterator<Item = (&'a str, Option<&'a str>)>) -> Environment {
    let mut roles: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, role) in guests {
        if let Some(role) = role {
            roles.entry(role.to_string()).or_default().push(name.to_string());
        }
    }
    roles
        .into_iter()
        .map(|(role, names)| (format!("TMT_ROLE_{role}"), names.join(",")))
        .collect()
}
