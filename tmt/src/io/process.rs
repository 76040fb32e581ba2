//! Helpers for running child processes with timeouts, cancellation and bounded output.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::error;
use crate::io::cancel;

/// Exit code reported for commands killed after exceeding their timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Default bound on captured stdout/stderr kept in memory.
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 10_000_000;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    /// Exit code, `None` when the child was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Exit code with the timeout sentinel substituted for killed commands.
    pub fn code(&self) -> i32 {
        if self.timed_out {
            return TIMEOUT_EXIT_CODE;
        }
        self.exit_code.unwrap_or(-1)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        if self.stdout_truncated > 0 {
            format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            )
        } else {
            String::new()
        }
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }
}

/// Options controlling a single child process run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions<'a> {
    pub stdin: Option<&'a [u8]>,
    /// Kill the process (group) once this elapses.
    pub timeout: Option<Duration>,
    /// Bound for captured output; `0` means [`DEFAULT_OUTPUT_LIMIT_BYTES`].
    pub output_limit_bytes: usize,
    /// Tee stdout and stderr lines into this file as they arrive.
    pub stream_path: Option<&'a Path>,
    /// Inherit the terminal instead of capturing output.
    pub interactive: bool,
}

type SharedWriter = Arc<Option<Mutex<BufWriter<File>>>>;

enum WaitOutcome {
    Exited(ExitStatus),
    TimedOut(ExitStatus),
    Interrupted,
}

/// Run a command, capturing stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. The child is placed in
/// its own process group so a timeout or interruption kills everything it
/// spawned. Interruption returns an `Interrupted` error after the child is
/// reaped.
#[instrument(skip_all, fields(timeout_secs = options.timeout.map(|t| t.as_secs()), streaming = options.stream_path.is_some()))]
pub fn run_command(mut cmd: Command, options: &RunOptions<'_>) -> Result<CommandOutput> {
    if options.interactive {
        return run_interactive(cmd, options);
    }
    let limit = if options.output_limit_bytes == 0 {
        DEFAULT_OUTPUT_LIMIT_BYTES
    } else {
        options.output_limit_bytes
    };

    if options.stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    isolate_process_group(&mut cmd);

    debug!(command = ?cmd, "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, program = ?cmd.get_program(), "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {:?}", cmd.get_program()));
        }
    };

    if let Some(input) = options.stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).context("write stdin")?;
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stream_file: SharedWriter = Arc::new(match options.stream_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create stream dir {}", parent.display()))?;
            }
            let file = File::create(path)
                .with_context(|| format!("create stream file {}", path.display()))?;
            Some(Mutex::new(BufWriter::new(file)))
        }
        None => None,
    });

    let stdout_tee = stream_file.clone();
    let stderr_tee = stream_file.clone();
    let stdout_handle = thread::spawn(move || read_stream_limited_with_tee(stdout, limit, stdout_tee));
    let stderr_handle = thread::spawn(move || read_stream_limited_with_tee(stderr, limit, stderr_tee));

    let outcome = wait_with_deadline(&mut child, options.timeout)?;

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    let (status, timed_out) = match outcome {
        WaitOutcome::Exited(status) => (status, false),
        WaitOutcome::TimedOut(status) => (status, true),
        WaitOutcome::Interrupted => return Err(error::interrupted()),
    };

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        exit_code: status.code(),
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Run a command with a timeout and default limits.
pub fn run_command_with_timeout(cmd: Command, timeout: Duration) -> Result<CommandOutput> {
    run_command(
        cmd,
        &RunOptions {
            timeout: Some(timeout),
            ..RunOptions::default()
        },
    )
}

/// Run a command and fail unless it exits with status 0.
pub fn run_checked(cmd: Command, timeout: Option<Duration>) -> Result<CommandOutput> {
    let program = format!("{:?}", cmd.get_program());
    let output = run_command(
        cmd,
        &RunOptions {
            timeout,
            ..RunOptions::default()
        },
    )?;
    if output.timed_out {
        return Err(anyhow!("{program} timed out"));
    }
    if output.exit_code != Some(0) {
        return Err(anyhow!(
            "{program} failed with status {:?}: {}",
            output.exit_code,
            output.stderr_lossy().trim()
        ));
    }
    Ok(output)
}

fn run_interactive(mut cmd: Command, options: &RunOptions<'_>) -> Result<CommandOutput> {
    cmd.stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {:?}", cmd.get_program()))?;
    let (status, timed_out) = match wait_with_deadline(&mut child, options.timeout)? {
        WaitOutcome::Exited(status) => (status, false),
        WaitOutcome::TimedOut(status) => (status, true),
        WaitOutcome::Interrupted => return Err(error::interrupted()),
    };
    Ok(CommandOutput {
        exit_code: status.code(),
        stdout: Vec::new(),
        stderr: Vec::new(),
        stdout_truncated: 0,
        stderr_truncated: 0,
        timed_out,
    })
}

fn wait_with_deadline(child: &mut Child, timeout: Option<Duration>) -> Result<WaitOutcome> {
    let started = Instant::now();
    loop {
        if cancel::is_interrupted() {
            warn!("interrupted, killing child process");
            kill_tree(child)?;
            child.wait().context("wait command after kill")?;
            return Ok(WaitOutcome::Interrupted);
        }
        let mut slice = POLL_INTERVAL;
        if let Some(timeout) = timeout {
            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
                kill_tree(child)?;
                let status = child.wait().context("wait command after kill")?;
                return Ok(WaitOutcome::TimedOut(status));
            }
            slice = slice.min(remaining);
        }
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            return Ok(WaitOutcome::Exited(status));
        }
    }
}

#[cfg(unix)]
fn isolate_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn kill_tree(child: &mut Child) -> Result<()> {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(child.id() as i32);
    if let Err(err) = killpg(pgid, Signal::SIGKILL) {
        debug!(err = %err, "killpg failed, killing child only");
        child.kill().context("kill command")?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) -> Result<()> {
    child.kill().context("kill command")
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Read a stream with a size limit, optionally tee-ing each line to a file.
fn read_stream_limited_with_tee<R: Read>(
    reader: R,
    limit: usize,
    stream_file: SharedWriter,
) -> Result<(Vec<u8>, usize)> {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        if let Some(ref mutex) = *stream_file
            && let Ok(mut writer) = mutex.lock()
        {
            // Flush per line so logs can be followed while the test runs.
            if let Err(e) = writer.write_all(&line) {
                warn!(err = %e, "failed to write to stream file");
            } else if let Err(e) = writer.flush() {
                warn!(err = %e, "failed to flush stream file");
            }
        }

        let remaining = limit.saturating_sub(collected.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            collected.extend_from_slice(&line[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((collected, truncated))
}

/// Append a command transcript to a step log (`log.txt`).
pub fn append_log(path: &Path, label: &str, output: &CommandOutput) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log {}", path.display()))?;
    let mut buf = String::new();
    buf.push_str(&format!("=== {label} (exit {}) ===\n", output.code()));
    buf.push_str("--- stdout ---\n");
    buf.push_str(&String::from_utf8_lossy(&output.stdout));
    buf.push_str(&output.stdout_truncated_notice(label));
    buf.push_str("\n--- stderr ---\n");
    buf.push_str(&String::from_utf8_lossy(&output.stderr));
    buf.push_str(&output.stderr_truncated_notice(label));
    if output.timed_out {
        buf.push_str("\n[timed out]\n");
    }
    buf.push('\n');
    file.write_all(buf.as_bytes())
        .with_context(|| format!("write log {}", path.display()))
}
