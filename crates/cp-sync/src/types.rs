//! Sync-session and forward rows

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use cp_core::error::{RemoteError, StoreError};
use cp_core::{SshOptions, Target};

/// Operator intent for a row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Running,
    Stopped,
}

impl DesiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredState::Running => "running",
            DesiredState::Stopped => "stopped",
        }
    }
}

impl FromStr for DesiredState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(DesiredState::Running),
            "stopped" => Ok(DesiredState::Stopped),
            other => Err(StoreError::Invalid {
                field: "desired_state",
                message: format!("unknown state '{}'", other),
            }),
        }
    }
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last observed state of a row's child process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActualState {
    Running,
    Stopped,
    Error,
}

impl ActualState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActualState::Running => "running",
            ActualState::Stopped => "stopped",
            ActualState::Error => "error",
        }
    }
}

impl FromStr for ActualState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ActualState::Running),
            "stopped" => Ok(ActualState::Stopped),
            "error" => Ok(ActualState::Error),
            other => Err(StoreError::Invalid {
                field: "actual_state",
                message: format!("unknown state '{}'", other),
            }),
        }
    }
}

impl fmt::Display for ActualState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side wins a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Prefer {
    #[default]
    Alpha,
    Beta,
}

impl Prefer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Prefer::Alpha => "alpha",
            Prefer::Beta => "beta",
        }
    }
}

impl FromStr for Prefer {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "alpha" => Ok(Prefer::Alpha),
            "beta" => Ok(Prefer::Beta),
            other => Err(StoreError::Invalid {
                field: "prefer",
                message: format!("expected alpha or beta, got '{}'", other),
            }),
        }
    }
}

impl fmt::Display for Prefer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One side of a sync session: a local path or `host[:port]:path`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub root: String,
}

impl Endpoint {
    pub fn local(root: impl Into<String>) -> Self {
        Self {
            host: None,
            port: None,
            root: root.into(),
        }
    }

    /// Parse `path` or `host[:port]:path`
    ///
    /// Anything starting with `/`, `.` or `~`, or whose part before the first
    /// colon contains a `/`, is a local path.
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let invalid = |message: &str| StoreError::Invalid {
            field: "endpoint",
            message: format!("'{}': {}", raw, message),
        };

        let raw_trimmed = raw.trim();
        if raw_trimmed.is_empty() {
            return Err(invalid("empty"));
        }
        if raw_trimmed.starts_with(['/', '.', '~']) {
            return Ok(Self::local(raw_trimmed));
        }
        let Some((host, rest)) = raw_trimmed.split_once(':') else {
            return Ok(Self::local(raw_trimmed));
        };
        if host.contains('/') {
            return Ok(Self::local(raw_trimmed));
        }
        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        let (port, root) = match rest.split_once(':') {
            Some((port, root)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
                let port = port.parse::<u16>().map_err(|_| invalid("port out of range"))?;
                (Some(port), root)
            }
            _ => (None, rest),
        };
        if root.is_empty() {
            return Err(invalid("missing path"));
        }

        Ok(Self {
            host: Some(host.to_string()),
            port,
            root: root.to_string(),
        })
    }

    pub fn is_remote(&self) -> bool {
        self.host.is_some()
    }

    /// ssh target for a remote endpoint
    pub fn ssh_options(&self) -> Option<Result<SshOptions, RemoteError>> {
        let host = self.host.as_ref()?;
        let raw = match self.port {
            Some(port) => format!("{}:{}", host, port),
            None => host.clone(),
        };
        Some(Target::parse(&raw).map(SshOptions::new))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.host, self.port) {
            (Some(host), Some(port)) => write!(f, "{}:{}:{}", host, port, self.root),
            (Some(host), None) => write!(f, "{}:{}", host, self.root),
            _ => f.write_str(&self.root),
        }
    }
}

/// A persisted sync session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSessionRow {
    pub id: i64,
    pub name: String,
    pub alpha: Endpoint,
    pub beta: Endpoint,
    pub prefer: Prefer,
    pub desired_state: DesiredState,
    pub actual_state: ActualState,
    pub scheduler_pid: Option<u32>,
    pub ignore_rules: Vec<String>,
    pub merge_strategy: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub last_heartbeat: Option<u64>,
    pub created_at: u64,
}

/// Fields for `sync create`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSession {
    pub name: String,
    pub alpha: Endpoint,
    pub beta: Endpoint,
    pub prefer: Prefer,
    pub ignore_rules: Vec<String>,
    pub merge_strategy: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub desired_state: DesiredState,
}

impl NewSession {
    pub fn new(name: impl Into<String>, alpha: Endpoint, beta: Endpoint) -> Self {
        Self {
            name: name.into(),
            alpha,
            beta,
            prefer: Prefer::Alpha,
            ignore_rules: Vec::new(),
            merge_strategy: None,
            labels: BTreeMap::new(),
            desired_state: DesiredState::Running,
        }
    }
}

/// Changes applied by `sync edit`; `None` leaves a field alone
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPatch {
    pub name: Option<String>,
    pub prefer: Option<Prefer>,
    pub ignore_rules: Option<Vec<String>>,
    pub merge_strategy: Option<String>,
    pub set_labels: BTreeMap<String, String>,
    pub remove_labels: Vec<String>,
}

impl SessionPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.prefer.is_none()
            && self.ignore_rules.is_none()
            && self.merge_strategy.is_none()
            && self.set_labels.is_empty()
            && self.remove_labels.is_empty()
    }

    /// Whether the change alters what the scheduler is started with
    pub fn affects_scheduler(&self) -> bool {
        self.prefer.is_some() || self.ignore_rules.is_some() || self.merge_strategy.is_some()
    }
}

/// A persisted standalone port forward
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRow {
    pub id: i64,
    pub name: String,
    /// Raw ssh target
    pub target: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub desired_state: DesiredState,
    pub actual_state: ActualState,
    pub monitor_pid: Option<u32>,
    pub last_heartbeat: Option<u64>,
    pub created_at: u64,
}

impl ForwardRow {
    pub fn ssh_options(&self) -> Result<SshOptions, RemoteError> {
        Ok(SshOptions::new(Target::parse(&self.target)?))
    }
}

/// Fields for `forward create`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewForward {
    pub name: String,
    pub target: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub desired_state: DesiredState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_endpoints() {
        for raw in ["/srv/data", "./work", "~/notes", "plain", "dir/with:colon"] {
            let endpoint = Endpoint::parse(raw).unwrap();
            assert!(!endpoint.is_remote(), "{}", raw);
            assert_eq!(endpoint.root, raw);
            assert!(endpoint.ssh_options().is_none());
        }
    }

    #[test]
    fn test_remote_endpoints() {
        let endpoint = Endpoint::parse("me@box:projects/a").unwrap();
        assert_eq!(endpoint.host.as_deref(), Some("me@box"));
        assert_eq!(endpoint.port, None);
        assert_eq!(endpoint.root, "projects/a");

        let endpoint = Endpoint::parse("me@box:2222:/srv/a").unwrap();
        assert_eq!(endpoint.port, Some(2222));
        assert_eq!(endpoint.root, "/srv/a");
        assert_eq!(endpoint.to_string(), "me@box:2222:/srv/a");

        let opts = endpoint.ssh_options().unwrap().unwrap();
        assert_eq!(opts.target.as_str(), "me@box:2222");
        assert_eq!(opts.target.port, Some(2222));
    }

    #[test]
    fn test_invalid_endpoints() {
        assert!(Endpoint::parse("").is_err());
        assert!(Endpoint::parse(":path").is_err());
        assert!(Endpoint::parse("box:").is_err());
        assert!(Endpoint::parse("box:99999:/x").is_err());
    }

    #[test]
    fn test_state_strings() {
        assert_eq!("running".parse::<DesiredState>().unwrap(), DesiredState::Running);
        assert_eq!("error".parse::<ActualState>().unwrap(), ActualState::Error);
        assert!("error".parse::<DesiredState>().is_err());
        assert_eq!("beta".parse::<Prefer>().unwrap(), Prefer::Beta);
        assert_eq!(ActualState::Stopped.to_string(), "stopped");
    }

    #[test]
    fn test_patch_scheduler_fields() {
        let mut patch = SessionPatch::default();
        assert!(patch.is_empty());
        patch.set_labels.insert("env".into(), "prod".into());
        assert!(!patch.is_empty());
        assert!(!patch.affects_scheduler());
        patch.prefer = Some(Prefer::Beta);
        assert!(patch.affects_scheduler());
    }
}
