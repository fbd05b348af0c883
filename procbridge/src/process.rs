//! Worker process handles and spawn strategies.
//!
//! A [`WorkerProcess`] is the supervisor's view of one worker incarnation: its
//! stdin/stdout pipes and a notification that fires once when it exits. The
//! OS-backed variant is produced by [`CommandSpawner`]; tests build one from
//! in-memory pipes with [`WorkerProcess::from_parts`].

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::oneshot;

use crate::error::SpawnError;

pub type WorkerStdin = Box<dyn AsyncWrite + Send + Unpin>;
pub type WorkerStdout = Box<dyn AsyncRead + Send + Unpin>;

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitReport {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitReport {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// One incarnation of the worker. Never reused after it exits.
pub struct WorkerProcess {
    pub(crate) executable: String,
    pub(crate) pid: Option<u32>,
    pub(crate) stdin: WorkerStdin,
    pub(crate) stdout: WorkerStdout,
    pub(crate) exited: oneshot::Receiver<ExitReport>,
    /// Ask the reaper to terminate the process, with the grace period before SIGKILL.
    pub(crate) terminate: Option<oneshot::Sender<Duration>>,
}

impl WorkerProcess {
    /// Wrap a spawned child whose stdin/stdout (and optionally stderr) are piped.
    pub fn from_child(executable: impl Into<String>, mut child: Child) -> Result<Self, SpawnError> {
        let executable = executable.into();
        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(stderr, pid));
        }

        let (exit_tx, exited) = oneshot::channel();
        let (terminate, terminate_rx) = oneshot::channel();
        tokio::spawn(reap(child, pid, terminate_rx, exit_tx));

        Ok(Self {
            executable,
            pid,
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            exited,
            terminate: Some(terminate),
        })
    }

    /// Assemble a worker from arbitrary pipes; the process counts as exited
    /// when `exited` fires or its sender is dropped.
    pub fn from_parts(
        executable: impl Into<String>,
        stdin: impl AsyncWrite + Send + Unpin + 'static,
        stdout: impl AsyncRead + Send + Unpin + 'static,
        exited: oneshot::Receiver<ExitReport>,
    ) -> Self {
        Self {
            executable: executable.into(),
            pid: None,
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            exited,
            terminate: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }
}

async fn reap(
    mut child: Child,
    pid: Option<u32>,
    mut terminate_rx: oneshot::Receiver<Duration>,
    exit_tx: oneshot::Sender<ExitReport>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(grace) = &mut terminate_rx => {
            send_sigterm(pid);
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    tracing::warn!(?pid, "Worker ignored SIGTERM, killing");
                    if let Err(e) = child.start_kill() {
                        tracing::error!(?pid, error = %e, "Failed to kill worker");
                    }
                    child.wait().await
                }
            }
        }
    };

    let report = match status {
        Ok(status) => ExitReport::from(status),
        Err(e) => {
            tracing::error!(?pid, error = %e, "Failed to wait for worker");
            ExitReport::unknown()
        }
    };
    let _ = exit_tx.send(report);
}

#[cfg(unix)]
fn send_sigterm(pid: Option<u32>) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(raw) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        tracing::debug!(pid = raw, error = %e, "SIGTERM not delivered");
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: Option<u32>) {}

/// Worker diagnostics are logged, never parsed.
async fn log_stderr(stderr: ChildStderr, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim_end();
                if !trimmed.is_empty() {
                    tracing::warn!(target: "procbridge::worker", ?pid, "{}", trimmed);
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(?pid, error = %e, "Worker stderr read failed");
                break;
            }
        }
    }
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<WorkerProcess, SpawnError>;

    /// Name used in logs.
    fn describe(&self) -> String;
}

/// Spawns the configured executable with piped stdio.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    executable: PathBuf,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
}

impl CommandSpawner {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self) -> Result<WorkerProcess, SpawnError> {
        let child = Command::new(&self.executable)
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        WorkerProcess::from_child(self.describe(), child)
    }

    fn describe(&self) -> String {
        self.executable.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_report_display() {
        assert_eq!(ExitReport::code(3).to_string(), "exit code 3");
        assert_eq!(
            ExitReport {
                code: None,
                signal: Some(9)
            }
            .to_string(),
            "signal 9"
        );
        assert_eq!(ExitReport::unknown().to_string(), "unknown exit status");
        assert!(ExitReport::code(0).success());
    }

    #[tokio::test]
    async fn missing_executable_fails_to_spawn() {
        let spawner = CommandSpawner::new("/nonexistent/procbridge-worker");
        assert!(matches!(spawner.spawn(), Err(SpawnError::Spawn(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_code_is_reported() {
        let spawner = CommandSpawner::new("sh").with_args(["-c", "exit 7"]);
        let worker = spawner.spawn().unwrap();
        assert!(worker.pid().is_some());
        assert_eq!(worker.exited.await.unwrap(), ExitReport::code(7));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_stops_worker() {
        let spawner = CommandSpawner::new("sleep").with_args(["30"]);
        let mut worker = spawner.spawn().unwrap();
        worker
            .terminate
            .take()
            .unwrap()
            .send(Duration::from_secs(2))
            .unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), worker.exited)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.signal, Some(15));
    }
}
