//! Process launching and the remote shell executor
//!
//! [`Launcher`] is the only place local processes get started. Production
//! code uses [`TokioLauncher`]; tests substitute a fake that interprets the
//! ssh commands it is handed.

use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::watch;

use cp_core::error::RemoteError;
use cp_core::shell;
use cp_core::SshOptions;

/// ssh's own exit status for transport and authentication failures
pub const SSH_TRANSPORT_FAILURE: i32 = 255;

/// How the child's stdio is wired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioMode {
    /// stdout/stderr captured, stdin closed
    Capture,
    /// Shares the caller's terminal
    Inherit,
    /// Everything to /dev/null
    Null,
}

/// A local command line, always held as an argument vector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdio: StdioMode,
    /// Start the child in its own process group so it outlives the caller
    pub detach: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdio: StdioMode::Capture,
            detach: false,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdio(mut self, stdio: StdioMode) -> Self {
        self.stdio = stdio;
        self
    }

    pub fn detached(mut self) -> Self {
        self.detach = true;
        self
    }

    /// `program arg arg ...`, for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        match self.stdio {
            StdioMode::Capture => {
                cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
            }
            StdioMode::Inherit => {
                cmd.stdin(Stdio::inherit()).stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
            StdioMode::Null => {
                cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
        #[cfg(unix)]
        {
            if self.detach {
                cmd.process_group(0);
            }
        }
        cmd
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` if killed by a signal or timed out
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// How a spawned child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
}

/// A running child whose exit can be observed from anywhere
///
/// The launcher reaps the child on a background task and publishes its exit
/// through a watch channel, so clones of this handle can check or await the
/// exit independently.
#[derive(Debug, Clone)]
pub struct SpawnedChild {
    pub pid: u32,
    exit: watch::Receiver<Option<ExitInfo>>,
}

impl SpawnedChild {
    pub fn new(pid: u32, exit: watch::Receiver<Option<ExitInfo>>) -> Self {
        Self { pid, exit }
    }

    /// The exit, if it has already happened
    pub fn exited(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    /// Wait for the child to exit
    pub async fn wait(&mut self) -> ExitInfo {
        loop {
            if let Some(info) = *self.exit.borrow_and_update() {
                return info;
            }
            if self.exit.changed().await.is_err() {
                return self.exited().unwrap_or(ExitInfo { code: None });
            }
        }
    }
}

/// Starts local processes
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Run to completion with captured output, killing the child after
    /// `timeout`
    async fn output(&self, spec: &CommandSpec, timeout: Option<Duration>) -> io::Result<CommandOutput>;

    /// Run to completion with the caller's stdio
    async fn status(&self, spec: &CommandSpec) -> io::Result<ExitInfo>;

    /// Start without waiting
    fn spawn(&self, spec: &CommandSpec) -> io::Result<SpawnedChild>;
}

/// [`Launcher`] backed by `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioLauncher;

#[async_trait]
impl Launcher for TokioLauncher {
    async fn output(&self, spec: &CommandSpec, timeout: Option<Duration>) -> io::Result<CommandOutput> {
        let mut cmd = spec.to_command();
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        tracing::trace!(command = %spec.display(), "Running command");
        let child = cmd.spawn()?;
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::debug!(command = %spec.program, timeout_ms = limit.as_millis() as u64, "Command timed out");
                    return Ok(CommandOutput {
                        timed_out: true,
                        ..CommandOutput::default()
                    });
                }
            },
            None => child.wait_with_output().await,
        };

        let output = result?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            timed_out: false,
        })
    }

    async fn status(&self, spec: &CommandSpec) -> io::Result<ExitInfo> {
        let mut cmd = spec.to_command();
        let status = cmd.status().await?;
        Ok(ExitInfo { code: status.code() })
    }

    fn spawn(&self, spec: &CommandSpec) -> io::Result<SpawnedChild> {
        let mut cmd = spec.to_command();
        let mut child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "child exited before its pid was read"))?;

        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(pid, "Failed to wait for child: {}", e);
                    None
                }
            };
            let _ = tx.send(Some(ExitInfo { code }));
        });

        tracing::debug!(pid, command = %spec.display(), "Spawned child");
        Ok(SpawnedChild::new(pid, rx))
    }
}

/// Runs scripts on a target through the local `ssh` executable
#[derive(Clone)]
pub struct RemoteShell {
    launcher: Arc<dyn Launcher>,
    program: String,
}

impl RemoteShell {
    pub fn new(launcher: Arc<dyn Launcher>) -> Self {
        Self {
            launcher,
            program: "ssh".to_string(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run `script` remotely under `sh -lc` and capture its output
    ///
    /// An ssh transport failure (exit 255), a signal or the timeout all map
    /// to [`RemoteError::Unreachable`]; any other exit code is returned to
    /// the caller to interpret.
    pub async fn capture(&self, opts: &SshOptions, script: &str, timeout: Duration) -> Result<CommandOutput, RemoteError> {
        let spec = CommandSpec::new(&self.program).args(opts.exec_args(&shell::login_shell(script), Some(timeout)));
        let output = self.launcher.output(&spec, Some(timeout)).await?;

        if output.timed_out {
            return Err(RemoteError::Unreachable {
                target: opts.target.to_string(),
                message: format!("no response within {:?}", timeout),
            });
        }
        match output.code {
            Some(SSH_TRANSPORT_FAILURE) | None => Err(RemoteError::Unreachable {
                target: opts.target.to_string(),
                message: first_line(&output.stderr).unwrap_or("ssh exited abnormally").to_string(),
            }),
            Some(_) => Ok(output),
        }
    }

    /// Like [`capture`](Self::capture) but a non-zero remote exit is an error
    pub async fn run_checked(&self, opts: &SshOptions, script: &str, timeout: Duration) -> Result<CommandOutput, RemoteError> {
        let output = self.capture(opts, script, timeout).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(RemoteError::CommandFailed {
                target: opts.target.to_string(),
                code: output.code.unwrap_or(-1),
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    /// Run `script` remotely with the caller's terminal attached, returning
    /// the remote exit code
    pub async fn run_inherit(&self, opts: &SshOptions, script: &str) -> Result<i32, RemoteError> {
        let spec = CommandSpec::new(&self.program)
            .args(opts.interactive_args(&shell::login_shell(script)))
            .stdio(StdioMode::Inherit);
        let exit = self.launcher.status(&spec).await?;

        match exit.code {
            Some(SSH_TRANSPORT_FAILURE) | None => Err(RemoteError::Unreachable {
                target: opts.target.to_string(),
                message: "ssh exited abnormally".to_string(),
            }),
            Some(code) => Ok(code),
        }
    }
}

fn first_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|line| !line.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_spec_builder() {
        let spec = CommandSpec::new("ssh")
            .args(["-N", "-L"])
            .env("A", "b")
            .stdio(StdioMode::Null)
            .detached();
        assert_eq!(spec.display(), "ssh -N -L");
        assert_eq!(spec.env, vec![("A".to_string(), "b".to_string())]);
        assert!(spec.detach);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_launcher_output() {
        let spec = CommandSpec::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]);
        let output = TokioLauncher.output(&spec, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert!(!output.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_launcher_timeout() {
        let spec = CommandSpec::new("sleep").args(["5"]);
        let output = TokioLauncher.output(&spec, Some(Duration::from_millis(50))).await.unwrap();
        assert!(output.timed_out);
        assert_eq!(output.code, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawned_child_reports_exit() {
        let spec = CommandSpec::new("sh").args(["-c", "exit 7"]).stdio(StdioMode::Null);
        let mut child = TokioLauncher.spawn(&spec).unwrap();
        assert!(child.pid > 0);
        assert_eq!(child.wait().await, ExitInfo { code: Some(7) });
        assert_eq!(child.exited(), Some(ExitInfo { code: Some(7) }));
    }

    #[test]
    fn test_first_line() {
        assert_eq!(first_line("\n  ssh: connect refused \nmore"), Some("ssh: connect refused"));
        assert_eq!(first_line(""), None);
    }
}
