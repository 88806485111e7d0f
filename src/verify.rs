//! Running the verification commands against a working directory.

use crate::mutant::Status;
use crate::BoxFuture;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

/// What one verification run concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The test command exited with status 0.
    Passed,
    /// The test command exited non-zero.
    Failed { exit_code: Option<i32> },
    /// The deadline expired; the process was killed.
    TimedOut,
    /// The build command failed, or a command could not be started.
    BuildFailed { output: String },
}

impl Verdict {
    /// Classification of a mutant that produced this verdict.
    pub fn status(&self) -> Status {
        match self {
            Verdict::Passed => Status::Lived,
            Verdict::Failed { .. } => Status::Killed,
            Verdict::TimedOut => Status::TimedOut,
            Verdict::BuildFailed { .. } => Status::NotViable,
        }
    }
}

/// Runs the test suite inside a directory.
pub trait Verifier: Send + Sync {
    fn verify<'a>(&'a self, dir: &'a Path, timeout: Duration) -> BoxFuture<'a, Verdict>;
}

/// How a shell command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Exited { success: bool, code: Option<i32> },
    TimedOut,
    SpawnFailed,
}

/// Result of running a shell command.
#[derive(Debug)]
pub struct CommandResult {
    pub outcome: CommandOutcome,
    /// Combined stdout and stderr output.
    pub output: String,
    /// How long the command took to run in milliseconds.
    pub duration_ms: u64,
}

/// Process group led by a spawned shell. Dropping it kills every member.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid {
            kill_process_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!("Failed to kill process group {}: {}", pgid, e),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

/// Run a shell command with a timeout.
///
/// The command is executed via `sh -c` to support shell features like pipes.
/// The shell leads its own process group; the whole group is killed once the
/// command finishes, times out, or this future is dropped, so no test binary
/// outlives the call.
pub async fn run_command_with_timeout(
    working_dir: &Path,
    command: &str,
    timeout: Duration,
) -> CommandResult {
    let start = Instant::now();

    let mut shell = tokio::process::Command::new("sh");
    shell
        .arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    shell.process_group(0);

    let child = match shell.spawn() {
        Ok(c) => c,
        Err(e) => {
            return CommandResult {
                outcome: CommandOutcome::SpawnFailed,
                output: format!("Failed to spawn command: {}", e),
                duration_ms: start.elapsed().as_millis() as u64,
            };
        }
    };
    let _group = ProcessGroup { pgid: child.id() };

    let result = tokio::time::timeout(timeout, child.wait_with_output()).await;

    let duration_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(Ok(output)) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let combined = format!("{}{}", stdout, stderr);

            CommandResult {
                outcome: CommandOutcome::Exited {
                    success: output.status.success(),
                    code: output.status.code(),
                },
                output: combined,
                duration_ms,
            }
        }
        Ok(Err(e)) => CommandResult {
            outcome: CommandOutcome::SpawnFailed,
            output: format!("Command execution error: {}", e),
            duration_ms,
        },
        Err(_) => CommandResult {
            outcome: CommandOutcome::TimedOut,
            output: format!("Command timed out after {:?}", timeout),
            duration_ms,
        },
    }
}

/// Verifier backed by an optional build command and a test command.
#[derive(Debug, Clone)]
pub struct CommandVerifier {
    build_command: Option<String>,
    test_command: String,
    max_output_bytes: usize,
}

impl CommandVerifier {
    pub fn new(build_command: Option<String>, test_command: impl Into<String>) -> Self {
        Self {
            build_command,
            test_command: test_command.into(),
            max_output_bytes: 10_000,
        }
    }

    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    async fn run(&self, dir: &Path, timeout: Duration) -> Verdict {
        let deadline = Instant::now() + timeout;

        if let Some(build_command) = &self.build_command {
            let build = run_command_with_timeout(dir, build_command, timeout).await;
            log_finished(build_command, dir, &build);
            match build.outcome {
                CommandOutcome::Exited { success: true, .. } => {}
                CommandOutcome::TimedOut => return Verdict::TimedOut,
                _ => {
                    tracing::debug!("Build command '{}' failed in {}", build_command, dir.display());
                    return Verdict::BuildFailed {
                        output: truncate_output(&build.output, self.max_output_bytes),
                    };
                }
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Verdict::TimedOut;
        }

        let test = run_command_with_timeout(dir, &self.test_command, remaining).await;
        log_finished(&self.test_command, dir, &test);
        match test.outcome {
            CommandOutcome::Exited { success: true, .. } => Verdict::Passed,
            CommandOutcome::Exited { code, .. } => Verdict::Failed { exit_code: code },
            CommandOutcome::TimedOut => Verdict::TimedOut,
            CommandOutcome::SpawnFailed => Verdict::BuildFailed {
                output: truncate_output(&test.output, self.max_output_bytes),
            },
        }
    }
}

impl Verifier for CommandVerifier {
    fn verify<'a>(&'a self, dir: &'a Path, timeout: Duration) -> BoxFuture<'a, Verdict> {
        Box::pin(self.run(dir, timeout))
    }
}

fn log_finished(command: &str, dir: &Path, result: &CommandResult) {
    tracing::debug!(
        "'{}' in {} finished after {}ms: {:?}",
        command,
        dir.display(),
        result.duration_ms,
        result.outcome
    );
}

fn truncate_output(output: &str, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }
    let mut end = max_bytes;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(truncated)", &output[..end])
}
