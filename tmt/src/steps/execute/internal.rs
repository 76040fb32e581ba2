//! `how: tmt` — run tests through the guest's shell.
//!
//! Each test runs in `<discover workdir>/<test path>` with its output
//! streamed into `execute/data/<test>/out.log`. The outcome is derived from
//! the exit code (shell), the `TestResults` file (beakerlib) or a
//! `results.yaml` written by the test (`result: custom`), then rewritten by
//! the test's interpretation directive.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::core::duration::format_hms;
use crate::core::environment::{self, Environment};
use crate::core::result::{Interpretation, Outcome, TestResult};
use crate::core::test::{Framework, Test};
use crate::error::{ErrorKind, kind_of};
use crate::guest::{ExecRequest, Guest, shell_quote};
use crate::io::cancel;
use crate::io::process::CommandOutput;
use crate::steps::PluginData;
use crate::steps::execute::{DATA_DIR, ExecuteContext, ExecutePlugin, print_result};

pub const SCHEMA: &str = crate::phase_schema!(
    r#",
    "exit-first": {"type": "boolean"},
    "interactive": {"type": "boolean"}"#
);

pub const OUTPUT_LOG: &str = "out.log";
pub const REBOOT_REQUEST: &str = "reboot-request";
pub const BEAKERLIB_RESULTS: &str = "TestResults";
pub const BEAKERLIB_JOURNAL: &str = "journal.txt";
pub const CUSTOM_RESULTS: &str = "results.yaml";
/// Reboots a single test may request before it is stopped.
pub const MAX_REBOOTS: u32 = 5;

/// Extra inputs of one pass over the tests (the upgrade method runs several).
#[derive(Debug, Clone, Default)]
pub struct Stage<'a> {
    /// Result name prefix, `old` becomes `/old/<test>`.
    pub prefix: Option<&'a str>,
    /// Overrides the discover workdir as the base of test paths.
    pub tests_root: Option<&'a Path>,
    /// Layered above the plan environment (`IN_PLACE_UPGRADE`, upgrade plan variables).
    pub environment: Environment,
}

#[derive(Debug, Clone, Default)]
pub struct TmtExecute {
    pub exit_first: bool,
    pub interactive: bool,
}

impl TmtExecute {
    pub fn create(data: &PluginData) -> Result<Box<dyn ExecutePlugin>> {
        Ok(Box::new(Self::from_data(data)))
    }

    pub fn from_data(data: &PluginData) -> Self {
        Self {
            exit_first: data.get_bool("exit-first"),
            interactive: data.get_bool("interactive"),
        }
    }

    /// Run all tests guest by guest. Returns false when `exit-first` stopped early.
    #[instrument(skip_all, fields(prefix = stage.prefix.unwrap_or(""), tests = tests.len()))]
    pub fn run_stage(
        &self,
        ctx: &ExecuteContext<'_>,
        guests: &mut [Guest],
        tests: &[Test],
        stage: &Stage<'_>,
        results: &mut Vec<TestResult>,
    ) -> Result<bool> {
        let multihost = guests.len() > 1;
        let plan_data = ctx.plan.plan_workdir.join("data");
        fs::create_dir_all(&plan_data).with_context(|| format!("create {}", plan_data.display()))?;
        for guest in guests.iter_mut() {
            for test in tests {
                cancel::check()?;
                let mut name = match stage.prefix {
                    Some(prefix) => format!("/{prefix}{}", test.name),
                    None => test.name.clone(),
                };
                if multihost {
                    name = format!("{name}@{}", guest.name());
                }
                ctx.plan.printer.detail("test", &name, 2, 2);
                let produced = match self.run_test(ctx, guest, test, stage, &name) {
                    Ok(produced) => produced,
                    Err(err) if kind_of(&err) == ErrorKind::Interrupted => return Err(err),
                    Err(err) => {
                        warn!(test = %name, error = %format!("{err:#}"), "test could not be executed");
                        let mut result = TestResult::new(name.as_str(), Outcome::Error).with_note(format!("{err:#}"));
                        result.guest = Some(guest.name().to_string());
                        vec![result]
                    }
                };
                let failed = produced
                    .iter()
                    .any(|r| matches!(r.result, Outcome::Fail | Outcome::Error));
                for result in produced {
                    print_result(&ctx.plan.printer, &result);
                    results.push(result);
                }
                if failed && self.exit_first {
                    info!(test = %name, "stopping after the first failure");
                    ctx.plan.printer.warn(&format!("exit-first: stopping after '{name}'"));
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn run_test(
        &self,
        ctx: &ExecuteContext<'_>,
        guest: &mut Guest,
        test: &Test,
        stage: &Stage<'_>,
        name: &str,
    ) -> Result<Vec<TestResult>> {
        let data_rel = format!("{DATA_DIR}/{}", name.trim_start_matches('/'));
        let data_dir = ctx.workdir.join(&data_rel);
        fs::create_dir_all(&data_dir).with_context(|| format!("create {}", data_dir.display()))?;
        let tests_root = stage.tests_root.unwrap_or(ctx.tests_root);
        let cwd = tests_root.join(test.path.trim_start_matches('/'));
        let timeout = crate::core::duration::parse_duration(&test.duration)?;
        let stage_environment = environment::compose([ctx.environment, &stage.environment]);
        let gctx = ctx.plan.guest_context(&stage_environment, ctx.log);
        guest.push(&gctx, None, None)?;

        let started = Instant::now();
        let mut reboots = 0;
        let output = loop {
            let env = environment::compose([
                &test.environment,
                &test_variables(ctx, test, tests_root, &data_dir, reboots),
            ]);
            let request = ExecRequest::new(test.test.clone())
                .env(env)
                .cwd(&cwd)
                .timeout(timeout)
                .interactive(self.interactive)
                .output(data_dir.join(OUTPUT_LOG));
            debug!(test = %name, reboots, "running test");
            let output = guest.execute(&gctx, &request)?;
            guest.pull(&gctx, Some(data_dir.as_path()), None)?;

            let request_file = data_dir.join(REBOOT_REQUEST);
            if output.timed_out || !request_file.exists() {
                break output;
            }
            let clear = format!("rm -f {}", shell_quote(&request_file.to_string_lossy()));
            guest.execute_checked(&gctx, &ExecRequest::new(clear))?;
            if request_file.exists() {
                fs::remove_file(&request_file).with_context(|| format!("remove {}", request_file.display()))?;
            }
            if reboots >= MAX_REBOOTS {
                return Err(anyhow!("test requested more than {MAX_REBOOTS} reboots"));
            }
            info!(test = %name, "test requested a reboot");
            if !guest.reboot(&gctx, false, None)? {
                return Err(anyhow!("guest '{}' does not support reboot", guest.name()));
            }
            reboots += 1;
        };
        let duration = format_hms(started.elapsed());

        let mut log = vec![format!("{data_rel}/{OUTPUT_LOG}")];
        let mut produced = match (test.result, test.framework) {
            (Interpretation::Custom, _) if !output.timed_out => custom_results(name, &data_dir, &data_rel),
            (_, Framework::Beakerlib) => {
                if data_dir.join(BEAKERLIB_JOURNAL).is_file() {
                    log.push(format!("{data_rel}/{BEAKERLIB_JOURNAL}"));
                }
                vec![beakerlib_result(name, &output, &data_dir)]
            }
            (_, Framework::Shell) => vec![shell_result(name, &output)],
        };
        for result in &mut produced {
            result.duration = Some(duration.clone());
            result.guest = Some(guest.name().to_string());
            if result.log.is_empty() {
                result.log = log.clone();
            }
            if let Some(id) = &test.id {
                result.ids.insert("id".to_string(), id.clone());
            }
        }
        Ok(produced
            .into_iter()
            .map(|result| result.interpret(test.result))
            .collect())
    }
}

impl ExecutePlugin for TmtExecute {
    fn go(
        &self,
        ctx: &ExecuteContext<'_>,
        guests: &mut [Guest],
        tests: &[Test],
        results: &mut Vec<TestResult>,
    ) -> Result<()> {
        self.run_stage(ctx, guests, tests, &Stage::default(), results)?;
        Ok(())
    }
}

/// Variables every test sees.
fn test_variables(
    ctx: &ExecuteContext<'_>,
    test: &Test,
    tests_root: &Path,
    data_dir: &Path,
    reboots: u32,
) -> Environment {
    let mut env = Environment::new();
    env.insert("TMT_TREE".to_string(), tree_dir(tests_root, &test.path).display().to_string());
    env.insert(
        "TMT_PLAN_DATA".to_string(),
        ctx.plan.plan_workdir.join("data").display().to_string(),
    );
    env.insert("TMT_TEST_NAME".to_string(), test.name.clone());
    env.insert("TMT_TEST_DATA".to_string(), data_dir.display().to_string());
    env.insert("TMT_TEST_SERIAL_NUMBER".to_string(), test.serial_number.to_string());
    env.insert("TMT_REBOOT_COUNT".to_string(), reboots.to_string());
    env.insert(
        "TMT_REBOOT_REQUEST".to_string(),
        data_dir.join(REBOOT_REQUEST).display().to_string(),
    );
    if test.framework == Framework::Beakerlib {
        env.insert("BEAKERLIB_DIR".to_string(), data_dir.display().to_string());
    }
    env
}

/// Copy of the tree a test came from: `<root>/<phase>/tests`.
fn tree_dir(tests_root: &Path, test_path: &str) -> PathBuf {
    test_path
        .trim_start_matches('/')
        .split('/')
        .take(2)
        .fold(tests_root.to_path_buf(), |dir, part| dir.join(part))
}

pub fn shell_result(name: &str, output: &CommandOutput) -> TestResult {
    if output.timed_out {
        return TestResult::new(name, Outcome::Fail).with_note("timeout");
    }
    match output.exit_code {
        Some(0) => TestResult::new(name, Outcome::Pass),
        Some(1) => TestResult::new(name, Outcome::Fail),
        Some(code) => TestResult::new(name, Outcome::Error).with_note(format!("exit code {code}")),
        None => TestResult::new(name, Outcome::Error).with_note("killed by a signal"),
    }
}

pub fn beakerlib_result(name: &str, output: &CommandOutput, data_dir: &Path) -> TestResult {
    if output.timed_out {
        return TestResult::new(name, Outcome::Error).with_note("timeout");
    }
    let Ok(contents) = fs::read_to_string(data_dir.join(BEAKERLIB_RESULTS)) else {
        return TestResult::new(name, Outcome::Error).with_note("no results file");
    };
    let value = contents.lines().find_map(|line| {
        line.trim()
            .strip_prefix("TESTRESULT_RESULT_STRING=")
            .map(|v| v.trim_matches(|c| c == '"' || c == '\'').to_string())
    });
    match value.as_deref() {
        Some("PASS") => TestResult::new(name, Outcome::Pass),
        Some("FAIL") => TestResult::new(name, Outcome::Fail),
        Some("WARN") => TestResult::new(name, Outcome::Warn),
        Some("ERROR") => TestResult::new(name, Outcome::Error),
        Some(other) => TestResult::new(name, Outcome::Error).with_note(format!("unknown beakerlib result '{other}'")),
        None => TestResult::new(name, Outcome::Error).with_note("no result in results file"),
    }
}

#[derive(Debug, Deserialize)]
struct CustomResult {
    name: String,
    result: Outcome,
    #[serde(default)]
    note: Option<String>,
    #[serde(default)]
    log: Vec<String>,
}

/// Results a test wrote into its data directory.
pub fn custom_results(name: &str, data_dir: &Path, data_rel: &str) -> Vec<TestResult> {
    let path = data_dir.join(CUSTOM_RESULTS);
    let Ok(contents) = fs::read_to_string(&path) else {
        return vec![TestResult::new(name, Outcome::Error).with_note("custom results file not found")];
    };
    let entries: Vec<CustomResult> = match serde_yaml::from_str(&contents) {
        Ok(entries) => entries,
        Err(err) => {
            debug!(error = %err, path = %path.display(), "custom results rejected");
            return vec![TestResult::new(name, Outcome::Error).with_note("invalid custom results file")];
        }
    };
    entries
        .into_iter()
        .map(|entry| {
            let suffix = if entry.name == "/" {
                String::new()
            } else if entry.name.starts_with('/') {
                entry.name
            } else {
                format!("/{}", entry.name)
            };
            let mut result = TestResult::new(format!("{name}{suffix}"), entry.result);
            result.note = entry.note;
            result.log = entry
                .log
                .into_iter()
                .map(|log| format!("{data_rel}/{}", log.trim_start_matches('/')))
                .collect();
            result
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(code: Option<i32>, timed_out: bool) -> CommandOutput {
        CommandOutput {
            exit_code: code,
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdout_truncated: 0,
            stderr_truncated: 0,
            timed_out,
        }
    }

    #[test]
    fn shell_exit_codes_map_to_outcomes() {
        assert_eq!(shell_result("/t", &output(Some(0), false)).result, Outcome::Pass);
        assert_eq!(shell_result("/t", &output(Some(1), false)).result, Outcome::Fail);
        assert_eq!(shell_result("/t", &output(Some(2), false)).result, Outcome::Error);
        let timeout = shell_result("/t", &output(None, true));
        assert_eq!(timeout.result, Outcome::Fail);
        assert_eq!(timeout.note.as_deref(), Some("timeout"));
    }

    #[test]
    fn beakerlib_reads_results_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let missing = beakerlib_result("/t", &output(Some(0), false), temp.path());
        assert_eq!(missing.result, Outcome::Error);
        assert_eq!(missing.note.as_deref(), Some("no results file"));

        fs::write(
            temp.path().join(BEAKERLIB_RESULTS),
            "TESTRESULT_STATE=complete\nTESTRESULT_RESULT_STRING=WARN\n",
        )
        .expect("write");
        assert_eq!(beakerlib_result("/t", &output(Some(0), false), temp.path()).result, Outcome::Warn);

        let timeout = beakerlib_result("/t", &output(None, true), temp.path());
        assert_eq!(timeout.result, Outcome::Error);
        assert_eq!(timeout.note.as_deref(), Some("timeout"));
    }

    #[test]
    fn custom_results_are_prefixed_with_the_test_name() {
        let temp = tempfile::tempdir().expect("tempdir");
        let missing = custom_results("/t", temp.path(), "data/t");
        assert_eq!(missing[0].note.as_deref(), Some("custom results file not found"));

        fs::write(temp.path().join(CUSTOM_RESULTS), "not: [a list").expect("write");
        let invalid = custom_results("/t", temp.path(), "data/t");
        assert_eq!(invalid[0].note.as_deref(), Some("invalid custom results file"));

        fs::write(
            temp.path().join(CUSTOM_RESULTS),
            "- name: /first\n  result: pass\n- name: second\n  result: fail\n  note: broken\n  log: [second.log]\n",
        )
        .expect("write");
        let results = custom_results("/t", temp.path(), "data/t");
        assert_eq!(results[0].name, "/t/first");
        assert_eq!(results[1].name, "/t/second");
        assert_eq!(results[1].result, Outcome::Fail);
        assert_eq!(results[1].log, vec!["data/t/second.log".to_string()]);
    }

    #[test]
    fn tree_dir_is_the_phase_copy() {
        assert_eq!(
            tree_dir(Path::new("/w/discover"), "/default-0/tests/sub/test"),
            PathBuf::from("/w/discover/default-0/tests")
        );
    }
}
