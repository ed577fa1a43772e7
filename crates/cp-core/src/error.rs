//! Core error types for cocalc-plus

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for the cocalc-plus crates
#[derive(Error, Debug)]
pub enum CpError {
    /// Remote orchestration error
    #[error("{0}")]
    Remote(#[from] RemoteError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Session store error
    #[error("Session store error: {0}")]
    Store(#[from] StoreError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while talking to a remote target
///
/// Expected non-ready states (`missing`, `stopped`, `unreachable`) are
/// returned as values by probes and status checks; these variants are
/// for the cases where a caller required the remote to be ready.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// Target string does not look like `user@host[:port]`
    #[error("Invalid target '{0}': expected [user@]host[:port]")]
    InvalidTarget(String),

    /// SSH transport or authentication failure
    #[error("Unable to reach {target} over ssh: {message}")]
    Unreachable { target: String, message: String },

    /// SSH works but the remote binary is absent
    #[error("{binary} is not installed on {target} (rerun without --no-install to install it)")]
    MissingBinary { target: String, binary: String },

    /// The installer ran but did not succeed
    #[error("Installing on {target} failed with exit code {code}")]
    BootstrapFailed { target: String, code: i32 },

    /// The daemon never wrote its connection info
    #[error("Timed out after {waited:?} waiting for the daemon on {target} to write connection info")]
    HandshakeTimeout { target: String, waited: Duration },

    /// Forward-only connect without any known remote port
    #[error("No connection info found on {target}; start the daemon first or pass --remote-port")]
    ConnectionInfoMissing { target: String },

    /// The local ssh child could not be started
    #[error("Failed to start ssh tunnel: {0}")]
    TunnelSpawnFailure(String),

    /// The forwarded endpoint never answered
    #[error("Tunnel came up but {url} did not answer within {waited:?}")]
    ReadinessTimeout { url: String, waited: Duration },

    /// Requested local port is already taken
    #[error("Local port {0} is not available")]
    PortUnavailable(u16),

    /// A remote command exited non-zero where success was required
    #[error("Remote command on {target} failed (exit {code}): {stderr}")]
    CommandFailed {
        target: String,
        code: i32,
        stderr: String,
    },

    /// Malformed JSON in a file that is supposed to be well-formed
    #[error("Failed to parse {what}: {message}")]
    Parse { what: String, message: String },

    /// Local process spawning or signalling failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Session store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// No row matches the given id or name
    #[error("No {kind} matches '{key}'")]
    NotFound { kind: &'static str, key: String },

    /// Name already taken
    #[error("A {kind} named '{name}' already exists")]
    Duplicate { kind: &'static str, name: String },

    /// Invalid field value
    #[error("Invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },

    /// Underlying database failure
    #[error("Database error: {0}")]
    Database(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_umbrella_conversions() {
        let err: CpError = RemoteError::InvalidTarget("".to_string()).into();
        assert!(matches!(err, CpError::Remote(RemoteError::InvalidTarget(_))));
        assert_eq!(err.to_string(), "Invalid target '': expected [user@]host[:port]");

        let err: CpError = StoreError::NotFound {
            kind: "session",
            key: "docs".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "Session store error: No session matches 'docs'");
    }

    #[test]
    fn test_handshake_timeout_names_the_wait() {
        let err = RemoteError::HandshakeTimeout {
            target: "me@box".to_string(),
            waited: Duration::from_secs(20),
        };
        assert!(err.to_string().contains("20s"));
        assert!(err.to_string().contains("me@box"));
    }
}
