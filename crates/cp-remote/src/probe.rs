//! Remote binary probe and bootstrap

use std::time::Instant;

use serde::Serialize;

use cp_core::config::RemoteConfig;
use cp_core::error::RemoteError;
use cp_core::{shell, SshOptions};

use crate::exec::RemoteShell;

/// Outcome of looking for the remote binary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    /// Binary resolved on the remote host
    Found,
    /// ssh works but the binary is absent
    Missing,
    /// ssh itself failed or timed out
    Unreachable,
}

/// Result of [`probe`]; `path` is the resolved binary when found, or the
/// ssh error when unreachable
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub status: ProbeStatus,
    pub path: String,
}

impl ProbeResult {
    fn found(path: impl Into<String>) -> Self {
        Self {
            status: ProbeStatus::Found,
            path: path.into(),
        }
    }

    fn missing() -> Self {
        Self {
            status: ProbeStatus::Missing,
            path: String::new(),
        }
    }

    fn unreachable(message: impl Into<String>) -> Self {
        Self {
            status: ProbeStatus::Unreachable,
            path: message.into(),
        }
    }

    pub fn is_found(&self) -> bool {
        self.status == ProbeStatus::Found
    }
}

/// Shell expression for the binary inside the fallback install dir
pub fn fallback_binary_path(remote: &RemoteConfig) -> String {
    let dir = remote.install_dir.trim_end_matches('/');
    let joined = format!("{}/{}", dir, remote.binary);
    if dir.starts_with('/') {
        shell::quote(&joined)
    } else {
        shell::remote_path(&format!("~/{}", joined.trim_start_matches("~/")))
    }
}

/// Shell expression that runs the binary, preferring whatever `probe` found
pub fn binary_command(remote: &RemoteConfig, probed: Option<&ProbeResult>) -> String {
    match probed {
        Some(result) if result.is_found() && !result.path.is_empty() => shell::quote(&result.path),
        _ => fallback_binary_path(remote),
    }
}

/// Look for the remote binary: `command -v` first, then the fallback
/// install dir. Never errors for expected states.
pub async fn probe(shell: &RemoteShell, opts: &SshOptions, remote: &RemoteConfig) -> Result<ProbeResult, RemoteError> {
    let lookup = format!("command -v {}", shell::quote(&remote.binary));
    let output = match shell.capture(opts, &lookup, remote.probe_timeout).await {
        Ok(output) => output,
        Err(RemoteError::Unreachable { message, .. }) => return Ok(ProbeResult::unreachable(message)),
        Err(e) => return Err(e),
    };

    if output.success() {
        if let Some(path) = output.stdout.lines().map(str::trim).find(|l| !l.is_empty()) {
            tracing::debug!(remote = %opts.target, path, "Found remote binary in PATH");
            return Ok(ProbeResult::found(path));
        }
    }

    let fallback = fallback_binary_path(remote);
    let check = format!("test -x {0} && echo {0}", fallback);
    let output = match shell.capture(opts, &check, remote.probe_timeout).await {
        Ok(output) => output,
        Err(RemoteError::Unreachable { message, .. }) => return Ok(ProbeResult::unreachable(message)),
        Err(e) => return Err(e),
    };

    match output.stdout.lines().map(str::trim).find(|l| !l.is_empty()) {
        Some(path) if output.success() => {
            tracing::debug!(remote = %opts.target, path, "Found remote binary in install dir");
            Ok(ProbeResult::found(path))
        }
        _ => Ok(ProbeResult::missing()),
    }
}

/// Make sure the remote binary is usable, installing it if asked to
///
/// Found and not upgrading is a no-op. Unreachable always fails. Missing
/// fails unless `install` is set. Otherwise the installer runs once with
/// output streamed to the terminal.
pub async fn ensure_remote_ready(
    shell: &RemoteShell,
    opts: &SshOptions,
    remote: &RemoteConfig,
    install: bool,
    upgrade: bool,
) -> Result<ProbeResult, RemoteError> {
    let probed = probe(shell, opts, remote).await?;
    match probed.status {
        ProbeStatus::Found if !upgrade => return Ok(probed),
        ProbeStatus::Unreachable => {
            return Err(RemoteError::Unreachable {
                target: opts.target.to_string(),
                message: probed.path,
            })
        }
        ProbeStatus::Missing if !install => {
            return Err(RemoteError::MissingBinary {
                target: opts.target.to_string(),
                binary: remote.binary.clone(),
            })
        }
        _ => {}
    }

    bootstrap(shell, opts, remote).await?;

    let probed = probe(shell, opts, remote).await?;
    match probed.status {
        ProbeStatus::Found => Ok(probed),
        ProbeStatus::Unreachable => Err(RemoteError::Unreachable {
            target: opts.target.to_string(),
            message: probed.path,
        }),
        ProbeStatus::Missing => Err(RemoteError::MissingBinary {
            target: opts.target.to_string(),
            binary: remote.binary.clone(),
        }),
    }
}

/// The installer pipeline run on the remote host
pub fn install_script(remote: &RemoteConfig) -> String {
    format!("curl -fsSL {} | bash", shell::quote(&remote.install_url))
}

/// Run the installer on the target, streaming its output
pub async fn bootstrap(shell: &RemoteShell, opts: &SshOptions, remote: &RemoteConfig) -> Result<(), RemoteError> {
    tracing::info!(remote = %opts.target, "Installing {} on remote host", remote.binary);
    let started = Instant::now();

    let code = shell.run_inherit(opts, &install_script(remote)).await?;
    let elapsed = started.elapsed().as_secs_f64();

    if code != 0 {
        tracing::error!(remote = %opts.target, code, elapsed_secs = elapsed, "Install failed");
        return Err(RemoteError::BootstrapFailed {
            target: opts.target.to_string(),
            code,
        });
    }

    tracing::info!(remote = %opts.target, "Install finished in {:.1}s", elapsed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_binary_path() {
        let remote = RemoteConfig::default();
        assert_eq!(fallback_binary_path(&remote), "\"$HOME\"/'.local/bin/cocalc-plus'");

        let absolute = RemoteConfig {
            install_dir: "/opt/bin/".to_string(),
            ..RemoteConfig::default()
        };
        assert_eq!(fallback_binary_path(&absolute), "'/opt/bin/cocalc-plus'");
    }

    #[test]
    fn test_binary_command_prefers_probe() {
        let remote = RemoteConfig::default();
        let found = ProbeResult::found("/usr/bin/cocalc-plus");
        assert_eq!(binary_command(&remote, Some(&found)), "'/usr/bin/cocalc-plus'");
        assert_eq!(binary_command(&remote, Some(&ProbeResult::missing())), fallback_binary_path(&remote));
        assert_eq!(binary_command(&remote, None), fallback_binary_path(&remote));
    }

    #[test]
    fn test_install_script_quotes_url() {
        let remote = RemoteConfig {
            install_url: "https://example.com/i.sh?a='b'".to_string(),
            ..RemoteConfig::default()
        };
        assert_eq!(install_script(&remote), "curl -fsSL 'https://example.com/i.sh?a='\\''b'\\''' | bash");
    }
}
