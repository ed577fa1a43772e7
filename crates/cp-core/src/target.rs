//! SSH target parsing and ssh argument construction
//!
//! A target is the raw `user@host[:port]` string the operator typed. The raw
//! string (not a normalized form) is the identity used for registry keys and
//! state-directory hashes, so `host` and `host:22` are distinct targets.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::RemoteError;

fn target_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^((?:[^\s@:]+@)?[^\s@:]+)(?::(\d+))?$").expect("valid target regex")
    })
}

/// A parsed SSH destination
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// The string as given, used as the registry key
    raw: String,
    /// Host, including any `user@` prefix
    pub host: String,
    /// Explicit port; `None` means the ssh default
    pub port: Option<u16>,
}

impl Target {
    /// Parse `user@host[:port]`
    pub fn parse(raw: &str) -> Result<Self, RemoteError> {
        let captures = target_pattern()
            .captures(raw)
            .ok_or_else(|| RemoteError::InvalidTarget(raw.to_string()))?;

        let host = captures[1].to_string();
        let port = match captures.get(2) {
            Some(m) => Some(
                m.as_str()
                    .parse::<u16>()
                    .map_err(|_| RemoteError::InvalidTarget(raw.to_string()))?,
            ),
            None => None,
        };

        Ok(Self {
            raw: raw.to_string(),
            host,
            port,
        })
    }

    /// The raw target string
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Options for every ssh invocation made on behalf of one command
///
/// Built once per command and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshOptions {
    pub target: Target,
    pub identity: Option<PathBuf>,
    pub proxy_jump: Option<String>,
    pub extra_args: Vec<String>,
}

impl SshOptions {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            identity: None,
            proxy_jump: None,
            extra_args: Vec::new(),
        }
    }

    pub fn with_identity(mut self, identity: Option<PathBuf>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_proxy_jump(mut self, proxy_jump: Option<String>) -> Self {
        self.proxy_jump = proxy_jump;
        self
    }

    pub fn with_extra_args(mut self, extra_args: Vec<String>) -> Self {
        self.extra_args = extra_args;
        self
    }

    /// Host as passed to ssh
    pub fn host(&self) -> &str {
        &self.target.host
    }

    /// Connection flags shared by every invocation (port, identity, jump host,
    /// operator-supplied extras)
    pub fn connection_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(port) = self.target.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(identity) = &self.identity {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        if let Some(jump) = &self.proxy_jump {
            args.push("-J".to_string());
            args.push(jump.clone());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Arguments for running `remote_command` non-interactively
    ///
    /// `BatchMode` keeps a failed key exchange from hanging on a password
    /// prompt.
    pub fn exec_args(&self, remote_command: &str, connect_timeout: Option<Duration>) -> Vec<String> {
        let mut args = vec!["-o".to_string(), "BatchMode=yes".to_string()];
        if let Some(timeout) = connect_timeout {
            args.push("-o".to_string());
            args.push(format!("ConnectTimeout={}", timeout.as_secs().max(1)));
        }
        args.extend(self.connection_args());
        args.push(self.host().to_string());
        args.push(remote_command.to_string());
        args
    }

    /// Arguments for running `remote_command` with the operator's terminal
    /// attached (installers, daemon launch)
    pub fn interactive_args(&self, remote_command: &str) -> Vec<String> {
        let mut args = self.connection_args();
        args.push(self.host().to_string());
        args.push(remote_command.to_string());
        args
    }

    /// Arguments for `ssh -N -L <local>:127.0.0.1:<remote>`
    pub fn forward_args(&self, local_port: u16, remote_port: u16) -> Vec<String> {
        let mut args = vec![
            "-N".to_string(),
            "-L".to_string(),
            forward_spec(local_port, remote_port),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=30".to_string(),
        ];
        args.extend(self.connection_args());
        args.push(self.host().to_string());
        args
    }
}

/// The `-L` argument for a local forward; also used to recognise our own
/// tunnel processes by command line
pub fn forward_spec(local_port: u16, remote_port: u16) -> String {
    format!("{}:127.0.0.1:{}", local_port, remote_port)
}
