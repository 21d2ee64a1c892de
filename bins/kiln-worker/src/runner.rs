/// Process Runner - Subprocess Execution Primitive
///
/// **Core Responsibility:**
/// Start an external command in a working directory, drain stdout and stderr
/// concurrently, wait for exit and report a `ProcessOutcome`.
///
/// **Outcome Classification:**
/// - Failure to start (missing binary, bad working dir) → `RunnerError`
/// - Nonzero exit → normal outcome with `exit_code != 0`
/// - Deadline expiry → child killed, outcome with `timed_out = true`
///
/// Every other component drives the toolchain through the `CommandRunner`
/// trait so tests can substitute a scripted fake.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long to wait for the output readers after a timed-out child is killed.
/// Grandchildren can keep the pipes open past the kill.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Exit code reported when the process did not exit on its own
pub const NO_EXIT_CODE: i32 = -1;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to launch `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting on `{program}`: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// A fully described subprocess invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, working_dir: impl AsRef<Path>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.as_ref().to_path_buf(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Shell-ish rendering for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of one subprocess
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock from spawn request to exit, start latency included
    pub elapsed_ms: u64,
    pub timed_out: bool,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// stdout followed by stderr
    pub fn combined_output(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &CommandSpec) -> Result<ProcessOutcome, RunnerError>;
}

/// Production runner backed by `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, command: &CommandSpec) -> Result<ProcessOutcome, RunnerError> {
        debug!(command = %command.display(), dir = %command.working_dir.display(), "Spawning process");
        let start = Instant::now();

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&command.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::Launch {
                program: command.program.clone(),
                source,
            })?;

        // Both pipes drain while we wait, so a chatty child never blocks on a full buffer
        let stdout = child.stdout.take().map(OutputReader::spawn);
        let stderr = child.stderr.take().map(OutputReader::spawn);

        let wait = |source| RunnerError::Wait {
            program: command.program.clone(),
            source,
        };

        let (exit_code, timed_out) = match command.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => (status.map_err(wait)?.code().unwrap_or(NO_EXIT_CODE), false),
                Err(_) => {
                    warn!(
                        command = %command.display(),
                        timeout_ms = limit.as_millis() as u64,
                        "Process exceeded its deadline, killing"
                    );
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Failed to kill timed-out process");
                    }
                    (NO_EXIT_CODE, true)
                }
            },
            None => (child.wait().await.map_err(wait)?.code().unwrap_or(NO_EXIT_CODE), false),
        };

        let grace = timed_out.then_some(DRAIN_GRACE);
        let stdout = collect(stdout, grace).await;
        let stderr = collect(stderr, grace).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        debug!(
            command = %command.display(),
            exit_code,
            elapsed_ms,
            timed_out,
            "Process finished"
        );

        Ok(ProcessOutcome {
            exit_code,
            stdout,
            stderr,
            elapsed_ms,
            timed_out,
        })
    }
}

/// Background reader for one pipe. Bytes land in a shared buffer as they
/// arrive, so aborting the task keeps everything read so far.
struct OutputReader {
    task: JoinHandle<()>,
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl OutputReader {
    fn spawn<R: AsyncRead + Unpin + Send + 'static>(pipe: R) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(drain(pipe, Arc::clone(&buffer)));
        Self { task, buffer }
    }

    fn contents(&self) -> String {
        let buffer = self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R, buffer: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => buffer
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .extend_from_slice(&chunk[..n]),
            Err(e) => {
                warn!(error = %e, "Error reading process output");
                break;
            }
        }
    }
}

/// Wait for a reader to hit end of stream. With a grace period the reader is
/// abandoned once it expires, keeping the partial output.
async fn collect(reader: Option<OutputReader>, grace: Option<Duration>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    match grace {
        None => {
            let _ = (&mut reader.task).await;
        }
        Some(grace) => {
            if tokio::time::timeout(grace, &mut reader.task).await.is_err() {
                debug!("Output pipe still open after kill, keeping partial output");
                reader.task.abort();
            }
        }
    }
    reader.contents()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str, dir: &Path) -> CommandSpec {
        CommandSpec::new("sh", dir).arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_captures_exit_code_and_both_streams() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = ProcessRunner
            .run(&sh("echo out; echo err 1>&2; exit 3", dir.path()))
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.stdout, "out\n");
        assert_eq!(outcome.stderr, "err\n");
        assert!(!outcome.timed_out);
        assert!(!outcome.success());
        assert_eq!(outcome.combined_output(), "out\nerr\n");
    }

    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = ProcessRunner.run(&sh("pwd -P", dir.path())).await.unwrap();

        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(outcome.stdout.trim(), expected.to_string_lossy());
        assert!(outcome.success());
    }

    #[tokio::test]
    async fn test_large_output_on_both_pipes_does_not_deadlock() {
        let dir = tempfile::tempdir().unwrap();
        let script = "i=0; while [ $i -lt 4000 ]; do \
                      echo 'stdout line padding padding padding padding padding'; \
                      echo 'stderr line padding padding padding padding padding' 1>&2; \
                      i=$((i+1)); done";
        let outcome = ProcessRunner
            .run(&sh(script, dir.path()).timeout(Some(Duration::from_secs(30))))
            .await
            .unwrap();

        assert!(outcome.success());
        assert_eq!(outcome.stdout.lines().count(), 4000);
        assert_eq!(outcome.stderr.lines().count(), 4000);
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProcessRunner
            .run(&CommandSpec::new("kiln-no-such-binary-on-path", dir.path()))
            .await
            .unwrap_err();

        assert!(matches!(err, RunnerError::Launch { .. }));
        assert!(err.to_string().contains("kiln-no-such-binary-on-path"));
    }

    #[tokio::test]
    async fn test_deadline_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = ProcessRunner
            .run(&sh("exec sleep 10", dir.path()).timeout(Some(Duration::from_millis(200))))
            .await
            .unwrap();

        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, NO_EXIT_CODE);
        assert!(outcome.elapsed_ms < 5000);
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn test_timeout_keeps_output_when_grandchild_holds_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = ProcessRunner
            .run(
                &sh("echo partial; sleep 10 & wait", dir.path())
                    .timeout(Some(Duration::from_millis(300))),
            )
            .await
            .unwrap();

        assert!(outcome.timed_out);
        assert_eq!(outcome.stdout, "partial\n");
        assert!(outcome.elapsed_ms < 5000);
    }

    #[test]
    fn test_command_display() {
        let spec = CommandSpec::new("javac", "/p").arg("-d").args(["out", "Main.java"]);
        assert_eq!(spec.display(), "javac -d out Main.java");
        assert_eq!(spec.working_dir, PathBuf::from("/p"));
        assert_eq!(spec.timeout, None);
    }
}
