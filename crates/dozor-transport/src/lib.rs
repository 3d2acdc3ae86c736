//! Shell command execution for the dozor engine.
//!
//! Every collector that needs host state (disk pressure, systemd units,
//! security audit) goes through [`Transport`], so the same code path serves
//! a local host and a `user@host` SSH target. Commands run under a deadline
//! and are killed when the caller's cancellation token fires.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Grace period between the kill signal and giving up on reaping.
const KILL_GRACE: Duration = Duration::from_secs(3);

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("command cancelled")]
    Cancelled,

    #[error("failed to spawn command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;

// ─── Output ───────────────────────────────────────────────────────────────────

/// Captured output of one command execution.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout, falling back to stderr when stdout is empty.
    pub fn text(&self) -> &str {
        if self.stdout.trim().is_empty() {
            &self.stderr
        } else {
            &self.stdout
        }
    }
}

// ─── Transport trait ──────────────────────────────────────────────────────────

/// Executes one shell fragment on the target host.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn exec(&self, command: &str, cancel: &CancellationToken) -> TransportResult<ExecOutput>;

    /// Human-readable target description for log records.
    fn target(&self) -> String;
}

/// Build a transport for the configured host: `local` (or empty) executes
/// directly, `user@host` goes over SSH.
pub fn for_host(host: &str, ssh_port: u16, timeout: Duration) -> Arc<dyn Transport> {
    let trimmed = host.trim();
    if trimmed.is_empty() || trimmed == "local" {
        Arc::new(LocalShell::new(timeout))
    } else {
        Arc::new(RemoteShell::new(trimmed, ssh_port, timeout))
    }
}

// ─── Local shell ──────────────────────────────────────────────────────────────

/// Runs commands with `sh -c` on the local host.
pub struct LocalShell {
    timeout: Duration,
}

impl LocalShell {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Transport for LocalShell {
    async fn exec(&self, command: &str, cancel: &CancellationToken) -> TransportResult<ExecOutput> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        run_command(cmd, command, self.timeout, cancel).await
    }

    fn target(&self) -> String {
        "local".to_string()
    }
}

// ─── Remote shell ─────────────────────────────────────────────────────────────

/// Runs commands on `user@host` through the local `ssh` binary, so timeout
/// and kill semantics are identical to local execution.
pub struct RemoteShell {
    target: String,
    port: u16,
    timeout: Duration,
}

impl RemoteShell {
    pub fn new(target: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            target: target.into(),
            port,
            timeout,
        }
    }

    fn build_args(&self, command: &str) -> Vec<String> {
        vec![
            "-p".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
            self.target.clone(),
            "--".to_string(),
            format!("sh -c {}", shell_quote(command)),
        ]
    }
}

#[async_trait]
impl Transport for RemoteShell {
    async fn exec(&self, command: &str, cancel: &CancellationToken) -> TransportResult<ExecOutput> {
        let mut cmd = Command::new("ssh");
        cmd.args(self.build_args(command));
        run_command(cmd, command, self.timeout, cancel).await
    }

    fn target(&self) -> String {
        format!("{}:{}", self.target, self.port)
    }
}

/// Single-quote a fragment for transport inside another shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

// ─── Execution core ───────────────────────────────────────────────────────────

async fn run_command(
    mut cmd: Command,
    display_str: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> TransportResult<ExecOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(TransportError::Spawn)?;
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    // The read/wait future borrows the child; scope it so the borrow ends
    // before the kill path needs the child back.
    let result = {
        let finished = async {
            let mut stdout = String::new();
            let mut stderr = String::new();
            let read_out = async {
                if let Some(pipe) = stdout_pipe.as_mut() {
                    let _ = pipe.read_to_string(&mut stdout).await;
                }
            };
            let read_err = async {
                if let Some(pipe) = stderr_pipe.as_mut() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
            };
            futures_util::join!(read_out, read_err);
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((stdout, stderr, status))
        };
        tokio::pin!(finished);

        tokio::select! {
            res = &mut finished => match res {
                Ok((stdout, stderr, status)) => Ok(ExecOutput {
                    stdout,
                    stderr,
                    exit_code: status.code().unwrap_or(-1),
                }),
                Err(e) => Err(TransportError::Io(e)),
            },
            _ = tokio::time::sleep(timeout) => Err(TransportError::Timeout(timeout)),
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
        }
    };

    match result {
        Ok(output) => Ok(output),
        Err(err) => {
            kill_with_grace(&mut child, display_str).await;
            Err(err)
        }
    }
}

async fn kill_with_grace(child: &mut Child, display_str: &str) {
    if let Err(e) = child.start_kill() {
        warn!(command = display_str, error = %e, "failed to signal command");
        return;
    }
    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(_) => debug!(command = display_str, "killed command"),
        Err(_) => warn!(command = display_str, "command did not exit within kill grace"),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn local_exec_captures_stdout() {
        let shell = LocalShell::new(Duration::from_secs(5));
        let out = shell.exec("printf hello", &token()).await.unwrap();
        assert_eq!(out.stdout, "hello");
        assert_eq!(out.exit_code, 0);
        assert!(out.success());
    }

    #[tokio::test]
    async fn local_exec_captures_stderr_and_exit_code() {
        let shell = LocalShell::new(Duration::from_secs(5));
        let out = shell
            .exec("printf oops >&2; exit 3", &token())
            .await
            .unwrap();
        assert_eq!(out.stderr, "oops");
        assert_eq!(out.exit_code, 3);
        assert!(!out.success());
        assert_eq!(out.text(), "oops");
    }

    #[tokio::test]
    async fn local_exec_times_out() {
        let shell = LocalShell::new(Duration::from_millis(100));
        let err = shell.exec("sleep 5", &token()).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn local_exec_returns_on_cancellation() {
        let shell = LocalShell::new(Duration::from_secs(30));
        let cancel = token();
        let child_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            child_cancel.cancel();
        });
        let err = shell.exec("sleep 5", &cancel).await.unwrap_err();
        assert!(matches!(err, TransportError::Cancelled), "got {err:?}");
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn remote_shell_builds_ssh_invocation() {
        let shell = RemoteShell::new("ops@db1", 2222, Duration::from_secs(5));
        let args = shell.build_args("df -P");
        assert_eq!(args[0], "-p");
        assert_eq!(args[1], "2222");
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ops@db1".to_string()));
        assert_eq!(args.last().unwrap(), "sh -c 'df -P'");
    }

    #[test]
    fn for_host_picks_backend() {
        let t = for_host("local", 22, Duration::from_secs(1));
        assert_eq!(t.target(), "local");
        let t = for_host("", 22, Duration::from_secs(1));
        assert_eq!(t.target(), "local");
        let t = for_host("ops@web1", 2200, Duration::from_secs(1));
        assert_eq!(t.target(), "ops@web1:2200");
    }
}
