//! YAML documents persisted inside the run workdir.
//!
//! Every write goes through a temp file plus rename so an interrupted run
//! never leaves a half-written `step.yaml` behind.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Load a YAML document, returning `None` when the file does not exist.
pub fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    debug!(path = %path.display(), "loading yaml");
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value = serde_yaml::from_str(&contents)
        .with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(value))
}

/// Atomically write `value` as YAML (temp file + rename).
pub fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    debug!(path = %path.display(), "writing yaml");
    let buf = serde_yaml::to_string(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    write_atomic(path, &buf)
}

/// Write text through a sibling temp file so readers see old or new content only.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn missing_file_loads_as_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let loaded: Option<BTreeMap<String, String>> =
            load_yaml(&temp.path().join("absent.yaml")).expect("load");
        assert!(loaded.is_none());
    }

    #[test]
    fn write_creates_parents_and_leaves_no_temp_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plan/discover/step.yaml");
        let mut doc = BTreeMap::new();
        doc.insert("status".to_string(), "done".to_string());
        write_yaml(&path, &doc).expect("write");

        let loaded: BTreeMap<String, String> = load_yaml(&path).expect("load").expect("present");
        assert_eq!(loaded, doc);
        assert!(!temp.path().join("plan/discover/step.yaml.tmp").exists());
    }

    #[test]
    fn malformed_yaml_reports_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("broken.yaml");
        fs::write(&path, "a: [unclosed").expect("write");
        let err = load_yaml::<BTreeMap<String, String>>(&path).expect_err("should fail");
        assert!(format!("{err:#}").contains("broken.yaml"));
    }
}
