//! Git adapter used by the fmf discover method.
//!
//! Clones never prompt for credentials and every call goes through the
//! cancellable process runner.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::io::process::{CommandOutput, RunOptions, run_command};

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Clone `url` into `dest` and return a wrapper for the clone.
    #[instrument(skip_all, fields(url = %url))]
    pub fn clone_repo(url: &str, dest: &Path) -> Result<Self> {
        let parent = dest
            .parent()
            .ok_or_else(|| anyhow!("clone destination has no parent: {}", dest.display()))?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
        debug!(url, dest = %dest.display(), "cloning repository");
        let dest_arg = dest.to_string_lossy().to_string();
        Git::new(parent).run_checked(&["clone", url, &dest_arg])?;
        Ok(Git::new(dest))
    }

    /// Checkout an existing ref (branch, tag or commit).
    #[instrument(skip_all, fields(reference = %reference))]
    pub fn checkout(&self, reference: &str) -> Result<()> {
        debug!(reference, "checking out ref");
        self.run_checked(&["checkout", "-f", reference])?;
        Ok(())
    }

    /// Fetch `reference` from `url` and return the fetched commit.
    pub fn fetch(&self, url: &str, reference: &str) -> Result<String> {
        self.run_checked(&["fetch", url, reference])?;
        self.rev_parse("FETCH_HEAD")
    }

    pub fn rev_parse(&self, reference: &str) -> Result<String> {
        let out = self.run_capture(&["rev-parse", reference])?;
        Ok(out.trim().to_string())
    }

    /// Top level of the repository containing the workdir.
    pub fn toplevel(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--show-toplevel"])?;
        Ok(PathBuf::from(out.trim()))
    }

    /// Files touched by commits in `reference..HEAD`, relative to the repository root.
    pub fn changed_files(&self, reference: &str) -> Result<Vec<String>> {
        let range = format!("{reference}..HEAD");
        let out = self.run_capture(&["log", "--format=", "--name-only", &range])?;
        Ok(parse_name_only(&out))
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(output.stdout_lossy())
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(args)?;
        if !output.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr_lossy().trim()
            ));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_ASKPASS", "echo");
        run_command(cmd, &RunOptions::default())
    }
}

/// Unique, non-empty lines of `git log --name-only` output, in first-seen order.
fn parse_name_only(out: &str) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    for line in out.lines().map(str::trim).filter(|line| !line.is_empty()) {
        if !files.iter().any(|known| known == line) {
            files.push(line.to_string());
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_NAME", "t")
            .env("GIT_AUTHOR_EMAIL", "t@example.com")
            .env("GIT_COMMITTER_NAME", "t")
            .env("GIT_COMMITTER_EMAIL", "t@example.com")
            .status()
            .expect("git");
        assert!(status.success(), "git {args:?}");
    }

    #[test]
    fn parse_name_only_dedups_and_skips_blanks() {
        let out = "tests/a/main.fmf\n\ntests/b/test.sh\ntests/a/main.fmf\n";
        assert_eq!(
            parse_name_only(out),
            vec!["tests/a/main.fmf".to_string(), "tests/b/test.sh".to_string()]
        );
    }

    #[test]
    fn changed_files_lists_commits_since_ref() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = temp.path();
        git(repo, &["init", "-q"]);
        std::fs::write(repo.join("base.txt"), "base").expect("write");
        git(repo, &["add", "."]);
        git(repo, &["commit", "-q", "-m", "base"]);
        let base = Git::new(repo).rev_parse("HEAD").expect("rev-parse");

        std::fs::create_dir_all(repo.join("tests/new")).expect("mkdir");
        std::fs::write(repo.join("tests/new/main.fmf"), "test: true").expect("write");
        git(repo, &["add", "."]);
        git(repo, &["commit", "-q", "-m", "add test"]);

        let changed = Git::new(repo).changed_files(&base).expect("changed");
        assert_eq!(changed, vec!["tests/new/main.fmf".to_string()]);
    }

    #[test]
    fn clone_failure_reports_git_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let missing = temp.path().join("nope");
        let err = Git::clone_repo(&missing.to_string_lossy(), &temp.path().join("clone"))
            .expect_err("should fail");
        assert!(err.to_string().contains("git clone"));
    }
}
