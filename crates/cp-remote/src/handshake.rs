//! Daemon start and the `connection.json` handshake
//!
//! The daemon is launched detached on the remote host with environment
//! variables naming a connection-info file, a pid file and a log file inside
//! the target's remote state directory. Once listening it writes
//! `{"port": .., "token": ..}` to the connection-info file, which we poll for.

use serde::{Deserialize, Serialize};
use std::fmt;

use cp_core::config::RemoteConfig;
use cp_core::error::RemoteError;
use cp_core::paths::RemoteStateDir;
use cp_core::poll::{poll_until, PollOutcome};
use cp_core::{shell, SshOptions};

use crate::exec::RemoteShell;

/// What the daemon advertises once it is listening
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Anything else the daemon chose to write
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Liveness of the remote daemon according to its pid file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonStatus {
    Running { pid: u32 },
    Stopped,
    Unreachable { message: String },
}

impl DaemonStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonStatus::Running { .. } => "running",
            DaemonStatus::Stopped => "stopped",
            DaemonStatus::Unreachable { .. } => "unreachable",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, DaemonStatus::Running { .. })
    }
}

impl fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse the body of `connection.json`
pub fn parse_connection_info(target: &str, raw: &str) -> Result<ConnectionInfo, RemoteError> {
    serde_json::from_str(raw.trim()).map_err(|e| RemoteError::Parse {
        what: format!("connection info from {}", target),
        message: e.to_string(),
    })
}

/// Remote script that launches the daemon in the background
///
/// Removes any stale connection info first so the poll only sees what this
/// start writes.
pub fn start_script(
    remote: &RemoteConfig,
    state: &RemoteStateDir,
    binary: &str,
    token: &str,
    remote_port: Option<u16>,
) -> String {
    let data_dir = state.file("data");
    let env = shell::env_prefix(&[
        ("COCALC_WRITE_CONNECTION_INFO", state.connection_info()),
        ("COCALC_DAEMON_PIDFILE", state.pid_file()),
        ("COCALC_DAEMON_LOG", state.log_file()),
        ("COCALC_DATA_DIR", data_dir.clone()),
        ("COCALC_AUTH_TOKEN", shell::quote(token)),
        ("PORT", shell::quote(&remote_port.unwrap_or(0).to_string())),
    ]);
    let args = remote
        .daemon_args
        .iter()
        .map(|a| shell::quote(a))
        .collect::<Vec<_>>()
        .join(" ");

    format!(
        "mkdir -p {data} && rm -f {conn} || exit 1; {env} nohup {bin} {args} >> {log} 2>&1 < /dev/null & echo $! > {pid}",
        data = data_dir,
        conn = state.connection_info(),
        env = env,
        bin = binary,
        args = args,
        log = state.log_file(),
        pid = state.pid_file(),
    )
}

/// Remote script printing `running <pid>` or `stopped`
pub fn status_script(state: &RemoteStateDir) -> String {
    format!(
        "pid=$(cat {pidfile} 2>/dev/null); if [ -n \"$pid\" ] && kill -0 \"$pid\" 2>/dev/null; then echo \"running $pid\"; else echo stopped; fi",
        pidfile = state.pid_file()
    )
}

/// Remote script that stops the daemon with TERM, then KILL after ~3s
pub fn stop_script(state: &RemoteStateDir) -> String {
    format!(
        "pid=$(cat {pidfile} 2>/dev/null); \
         if [ -n \"$pid\" ] && kill -0 \"$pid\" 2>/dev/null; then \
         kill \"$pid\"; i=0; \
         while kill -0 \"$pid\" 2>/dev/null && [ $i -lt 3 ]; do sleep 1; i=$((i+1)); done; \
         kill -9 \"$pid\" 2>/dev/null; echo stopped; \
         else echo absent; fi; \
         rm -f {pidfile} {conn}",
        pidfile = state.pid_file(),
        conn = state.connection_info(),
    )
}

fn parse_status_line(stdout: &str) -> DaemonStatus {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    match line.strip_prefix("running ") {
        Some(pid) => match pid.trim().parse() {
            Ok(pid) => DaemonStatus::Running { pid },
            Err(_) => DaemonStatus::Stopped,
        },
        None => DaemonStatus::Stopped,
    }
}

/// Ask the remote host whether the daemon recorded in its pid file is alive
pub async fn daemon_status(
    shell: &RemoteShell,
    opts: &SshOptions,
    remote: &RemoteConfig,
) -> Result<DaemonStatus, RemoteError> {
    let state = RemoteStateDir::for_target(opts.target.as_str());
    match shell.capture(opts, &status_script(&state), remote.probe_timeout).await {
        Ok(output) => Ok(parse_status_line(&output.stdout)),
        Err(RemoteError::Unreachable { message, .. }) => Ok(DaemonStatus::Unreachable { message }),
        Err(e) => Err(e),
    }
}

/// Read `connection.json` once; `None` if it is absent or empty
pub async fn read_connection_info(
    shell: &RemoteShell,
    opts: &SshOptions,
    remote: &RemoteConfig,
) -> Result<Option<ConnectionInfo>, RemoteError> {
    let state = RemoteStateDir::for_target(opts.target.as_str());
    let script = format!("cat {} 2>/dev/null || true", state.connection_info());
    let output = shell.capture(opts, &script, remote.probe_timeout).await?;
    if output.stdout.trim().is_empty() {
        return Ok(None);
    }
    parse_connection_info(opts.target.as_str(), &output.stdout).map(Some)
}

/// Launch the daemon; returns once the remote shell has backgrounded it
pub async fn start_daemon(
    shell: &RemoteShell,
    opts: &SshOptions,
    remote: &RemoteConfig,
    binary: &str,
    token: &str,
    remote_port: Option<u16>,
) -> Result<(), RemoteError> {
    let state = RemoteStateDir::for_target(opts.target.as_str());
    let script = start_script(remote, &state, binary, token, remote_port);

    tracing::info!(remote = %opts.target, "Starting remote daemon");
    let code = shell.run_inherit(opts, &script).await?;
    if code != 0 {
        return Err(RemoteError::CommandFailed {
            target: opts.target.to_string(),
            code,
            stderr: "daemon launch failed".to_string(),
        });
    }
    Ok(())
}

/// Poll for `connection.json` until it appears or the handshake times out
///
/// Transient ssh failures while polling are retried; a malformed file is
/// fatal.
pub async fn wait_for_connection_info(
    shell: &RemoteShell,
    opts: &SshOptions,
    remote: &RemoteConfig,
) -> Result<ConnectionInfo, RemoteError> {
    let outcome = poll_until(remote.handshake_interval, remote.handshake_timeout, move || async move {
        match read_connection_info(shell, opts, remote).await {
            Ok(Some(info)) => Some(Ok(info)),
            Ok(None) => None,
            Err(RemoteError::Unreachable { message, .. }) => {
                tracing::debug!(remote = %opts.target, "Handshake poll failed: {}", message);
                None
            }
            Err(e) => Some(Err(e)),
        }
    })
    .await;

    match outcome {
        PollOutcome::Ready(result) => {
            let info = result?;
            tracing::info!(remote = %opts.target, port = info.port, "Daemon advertised connection info");
            Ok(info)
        }
        PollOutcome::TimedOut { waited, attempts } => {
            tracing::warn!(remote = %opts.target, attempts, "Handshake timed out");
            Err(RemoteError::HandshakeTimeout {
                target: opts.target.to_string(),
                waited,
            })
        }
    }
}

/// Stop the daemon; true if one was running
pub async fn stop_daemon(shell: &RemoteShell, opts: &SshOptions, remote: &RemoteConfig) -> Result<bool, RemoteError> {
    let state = RemoteStateDir::for_target(opts.target.as_str());
    let grace = remote.probe_timeout + std::time::Duration::from_secs(2);
    let output = shell.run_checked(opts, &stop_script(&state), grace).await?;
    let stopped = output.stdout.lines().any(|l| l.trim() == "stopped");
    if stopped {
        tracing::info!(remote = %opts.target, "Stopped remote daemon");
    }
    Ok(stopped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connection_info_tolerates_extra_fields() {
        let info = parse_connection_info("box", r#"{"port": 43211, "token": "abc", "pid": 99}"#).unwrap();
        assert_eq!(info.port, 43211);
        assert_eq!(info.token.as_deref(), Some("abc"));
        assert_eq!(info.extra["pid"], 99);
    }

    #[test]
    fn test_parse_connection_info_without_token() {
        let info = parse_connection_info("box", "{\"port\": 1}\n").unwrap();
        assert_eq!(info.token, None);
    }

    #[test]
    fn test_parse_connection_info_rejects_garbage() {
        assert!(matches!(
            parse_connection_info("box", "{\"port\":"),
            Err(RemoteError::Parse { .. })
        ));
        assert!(parse_connection_info("box", "{\"token\": \"x\"}").is_err());
    }

    #[test]
    fn test_start_script_sets_handshake_env() {
        let state = RemoteStateDir::for_target("box");
        let script = start_script(&RemoteConfig::default(), &state, "'/usr/bin/cocalc-plus'", "t0k'", Some(8000));

        assert!(script.starts_with(&format!("mkdir -p {}", state.file("data"))));
        assert!(script.contains(&format!("rm -f {}", state.connection_info())));
        assert!(script.contains(&format!("COCALC_WRITE_CONNECTION_INFO={}", state.connection_info())));
        assert!(script.contains(&format!("COCALC_DAEMON_PIDFILE={}", state.pid_file())));
        assert!(script.contains(&format!("COCALC_DAEMON_LOG={}", state.log_file())));
        assert!(script.contains("COCALC_AUTH_TOKEN='t0k'\\'''"));
        assert!(script.contains("PORT='8000'"));
        assert!(script.contains("nohup '/usr/bin/cocalc-plus' 'daemon'"));
        assert!(script.ends_with(&format!("echo $! > {}", state.pid_file())));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_script_kills_daemon_ignoring_term() {
        let home = tempfile::TempDir::new().unwrap();
        let state = RemoteStateDir::for_target("box");
        let mut daemon = tokio::process::Command::new("sh")
            .args(["-c", "trap '' TERM; while :; do sleep 1; done"])
            .spawn()
            .unwrap();
        let pid = daemon.id().unwrap();

        let script = format!(
            "mkdir -p {dir}; echo {pid} > {pidfile}; {stop}",
            dir = state.dir(),
            pidfile = state.pid_file(),
            stop = stop_script(&state)
        );
        let output = tokio::process::Command::new("sh")
            .args(["-c", &script])
            .env("HOME", home.path())
            .output()
            .await
            .unwrap();

        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "stopped");
        let status = daemon.wait().await.unwrap();
        assert!(!status.success());
    }

    #[test]
    fn test_parse_status_line() {
        assert_eq!(parse_status_line("running 123\n"), DaemonStatus::Running { pid: 123 });
        assert_eq!(parse_status_line("stopped\n"), DaemonStatus::Stopped);
        assert_eq!(parse_status_line(""), DaemonStatus::Stopped);
    }
}
