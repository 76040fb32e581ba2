//! Run workdir allocation: `run-NNN` directories under a shared root.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument};

/// Highest run id probed before giving up.
pub const MAX_RUN_ID: u32 = 1000;

/// How the caller asked for a workdir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkdirRequest {
    /// Allocate the first free `run-NNN`.
    Next,
    /// `run-NNN` for an explicit number.
    Id(u32),
    /// Use this path verbatim.
    Path(PathBuf),
}

impl WorkdirRequest {
    /// Interpret an `--id` value: digits select `run-NNN`, anything else is a path.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            None => WorkdirRequest::Next,
            Some(value) => match value.parse::<u32>() {
                Ok(id) => WorkdirRequest::Id(id),
                Err(_) => WorkdirRequest::Path(PathBuf::from(value)),
            },
        }
    }
}

/// Directory name for a numeric run id.
pub fn run_dir_name(id: u32) -> String {
    format!("run-{id:03}")
}

/// Resolve (and create) the run workdir. Returns the path and whether it existed.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn resolve(root: &Path, request: &WorkdirRequest) -> Result<(PathBuf, bool)> {
    let path = match request {
        WorkdirRequest::Next => next_free(root)?,
        WorkdirRequest::Id(id) => root.join(run_dir_name(*id)),
        WorkdirRequest::Path(path) => path.clone(),
    };
    let existed = path.is_dir();
    fs::create_dir_all(&path).with_context(|| format!("create workdir {}", path.display()))?;
    if existed {
        info!(workdir = %path.display(), "reusing existing workdir");
    } else {
        debug!(workdir = %path.display(), "created workdir");
    }
    Ok((path, existed))
}

fn next_free(root: &Path) -> Result<PathBuf> {
    for id in 1..=MAX_RUN_ID {
        let candidate = root.join(run_dir_name(id));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(anyhow!(
        "workdir exhausted: all of run-001..{} exist under {}",
        run_dir_name(MAX_RUN_ID),
        root.display()
    ))
}

/// Remove and recreate a directory so it is empty.
pub fn clean(path: &Path) -> Result<()> {
    if path.exists() {
        debug!(path = %path.display(), "cleaning directory");
        fs::remove_dir_all(path).with_context(|| format!("remove {}", path.display()))?;
    }
    fs::create_dir_all(path).with_context(|| format!("create {}", path.display()))
}

/// Relative directory for a metadata path (`/plans/smoke` → `plans/smoke`).
pub fn relative_for(name: &str) -> &str {
    let trimmed = name.trim_start_matches('/');
    if trimmed.is_empty() { "default" } else { trimmed }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_first_free_id() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("run-001")).expect("mkdir");
        fs::create_dir_all(temp.path().join("run-003")).expect("mkdir");
        let (path, existed) = resolve(temp.path(), &WorkdirRequest::Next).expect("resolve");
        assert_eq!(path, temp.path().join("run-002"));
        assert!(!existed);
        assert!(path.is_dir());
    }

    #[test]
    fn refuses_when_all_ids_taken() {
        let temp = tempfile::tempdir().expect("tempdir");
        for id in 1..=MAX_RUN_ID {
            fs::create_dir_all(temp.path().join(run_dir_name(id))).expect("mkdir");
        }
        let err = resolve(temp.path(), &WorkdirRequest::Next).expect_err("should fail");
        assert!(err.to_string().contains("workdir exhausted"));
    }

    #[test]
    fn explicit_id_reuses_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("run-007")).expect("mkdir");
        let (path, existed) = resolve(temp.path(), &WorkdirRequest::Id(7)).expect("resolve");
        assert_eq!(path, temp.path().join("run-007"));
        assert!(existed);
    }

    #[test]
    fn parse_distinguishes_ids_and_paths() {
        assert_eq!(WorkdirRequest::parse(None), WorkdirRequest::Next);
        assert_eq!(WorkdirRequest::parse(Some("12")), WorkdirRequest::Id(12));
        assert_eq!(
            WorkdirRequest::parse(Some("/tmp/x")),
            WorkdirRequest::Path(PathBuf::from("/tmp/x"))
        );
    }

    #[test]
    fn run_dir_name_is_zero_padded() {
        assert_eq!(run_dir_name(1), "run-001");
        assert_eq!(run_dir_name(1000), "run-1000");
    }

    #[test]
    fn clean_empties_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("step");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("stale"), "x").expect("write");
        clean(&dir).expect("clean");
        assert!(dir.is_dir());
        assert!(!dir.join("stale").exists());
    }

    #[test]
    fn relative_for_strips_leading_slash() {
        assert_eq!(relative_for("/plans/smoke"), "plans/smoke");
        assert_eq!(relative_for("/"), "default");
    }
}
