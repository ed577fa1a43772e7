//! Per-target state directories
//!
//! Local and remote state live at the same relative location,
//! `~/.local/share/cocalc-plus/ssh/<sha1(target)>`, so either side can derive
//! the other's path from the raw target string without a round trip.

use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};

use crate::config::PRODUCT;
use crate::shell;

/// Connection info file written by the daemon
pub const CONNECTION_INFO_FILE: &str = "connection.json";
/// Daemon pid file
pub const DAEMON_PID_FILE: &str = "daemon.pid";
/// Daemon log file
pub const DAEMON_LOG_FILE: &str = "daemon.log";
/// Local tunnel ownership pid file
pub const TUNNEL_PID_FILE: &str = "tunnel.pid";

/// Hex SHA-1 of the raw target string
pub fn target_hash(raw_target: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(raw_target.as_bytes());
    hex::encode(hasher.finalize())
}

/// State directory relative to a home directory
pub fn relative_state_dir(raw_target: &str) -> String {
    format!(".local/share/{}/ssh/{}", PRODUCT, target_hash(raw_target))
}

/// Root of local state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    /// Use `root` as the data directory (tests point this at a temp dir)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `~/.local/share/cocalc-plus`
    pub fn default_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".local")
            .join("share")
            .join(PRODUCT)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local state directory for a target
    pub fn target_dir(&self, raw_target: &str) -> PathBuf {
        self.root.join("ssh").join(target_hash(raw_target))
    }

    /// The registry document
    pub fn registry_file(&self) -> PathBuf {
        self.root.join("ssh").join("registry.json")
    }

    /// Default sync session database
    pub fn sync_db(&self) -> PathBuf {
        self.root.join("sync").join("sessions.db")
    }

    /// State directory for one sync session
    pub fn session_dir(&self, id: i64) -> PathBuf {
        self.root.join("sync").join("sessions").join(id.to_string())
    }

    /// State directory for one forward
    pub fn forward_dir(&self, id: i64) -> PathBuf {
        self.root.join("sync").join("forwards").join(id.to_string())
    }
}

impl Default for StatePaths {
    fn default() -> Self {
        Self::new(Self::default_root())
    }
}

/// State directory of a target on the remote host, as shell expressions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStateDir {
    relative: String,
}

impl RemoteStateDir {
    pub fn for_target(raw_target: &str) -> Self {
        Self {
            relative: relative_state_dir(raw_target),
        }
    }

    /// The directory itself
    pub fn dir(&self) -> String {
        shell::home_path(&self.relative)
    }

    /// A file inside the directory
    pub fn file(&self, name: &str) -> String {
        shell::home_path(&format!("{}/{}", self.relative, name))
    }

    pub fn connection_info(&self) -> String {
        self.file(CONNECTION_INFO_FILE)
    }

    pub fn pid_file(&self) -> String {
        self.file(DAEMON_PID_FILE)
    }

    pub fn log_file(&self) -> String {
        self.file(DAEMON_LOG_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_hash_is_sha1_hex() {
        assert_eq!(target_hash("abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(target_hash("host").len(), 40);
        assert!(target_hash("host").chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_raw_targets_hash_differently() {
        assert_ne!(target_hash("host"), target_hash("host:22"));
    }

    #[test]
    fn test_local_and_remote_share_relative_path() {
        let paths = StatePaths::new("/home/me/.local/share/cocalc-plus");
        let local = paths.target_dir("me@box");
        let remote = RemoteStateDir::for_target("me@box");
        let relative = relative_state_dir("me@box");

        assert!(local.ends_with(relative.trim_start_matches(".local/share/cocalc-plus/")));
        assert_eq!(remote.dir(), format!("\"$HOME\"/'{}'", relative));
        assert_eq!(
            remote.connection_info(),
            format!("\"$HOME\"/'{}/connection.json'", relative)
        );
    }
}
