//! Configuration sections

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};

/// Contents of `config.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// Remote daemon bootstrap, handshake and caching
    pub remote: RemoteConfig,
    /// Local port forwarding
    pub tunnel: TunnelConfig,
    /// Sync session reconciliation
    pub sync: SyncConfig,
}

/// Settings for the remote side of a connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Name of the orchestrated binary on the remote host
    pub binary: String,

    /// Fallback install directory, relative to the remote `$HOME`
    pub install_dir: String,

    /// Installer script fetched and piped to bash on the remote host
    pub install_url: String,

    /// Arguments passed to the remote binary to run the daemon
    pub daemon_args: Vec<String>,

    /// Version manifest (`{"url", "sha256", "version"?}`)
    pub manifest_url: String,

    /// Timeout for probes and status checks
    #[serde(with = "duration_secs")]
    pub probe_timeout: Duration,

    /// How long to wait for the daemon to write `connection.json`
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,

    /// Interval between `connection.json` reads
    #[serde(with = "duration_millis")]
    pub handshake_interval: Duration,

    /// How long a remote status result stays fresh
    #[serde(with = "duration_secs")]
    pub status_ttl: Duration,

    /// How long a version manifest stays fresh
    #[serde(with = "duration_secs")]
    pub manifest_ttl: Duration,

    /// Maximum simultaneous SSH connections during batch checks
    pub upgrade_concurrency: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            binary: super::PRODUCT.to_string(),
            install_dir: ".local/bin".to_string(),
            install_url: "https://software.cocalc.ai/software/cocalc-plus/install.sh".to_string(),
            daemon_args: vec!["daemon".to_string()],
            manifest_url: "https://software.cocalc.ai/software/cocalc-plus/latest.json"
                .to_string(),
            probe_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(20),
            handshake_interval: Duration::from_millis(250),
            status_ttl: Duration::from_secs(10),
            manifest_ttl: Duration::from_secs(24 * 60 * 60),
            upgrade_concurrency: 4,
        }
    }
}

/// Settings for local SSH port forwards
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Wait for the forwarded HTTP endpoint to answer before returning
    pub wait_ready: bool,

    /// Overall readiness timeout
    #[serde(with = "duration_secs")]
    pub ready_timeout: Duration,

    /// Timeout of a single readiness request
    #[serde(with = "duration_millis")]
    pub ready_attempt_timeout: Duration,

    /// Interval between readiness requests
    #[serde(with = "duration_millis")]
    pub ready_interval: Duration,

    /// Grace period between SIGTERM and SIGKILL
    #[serde(with = "duration_millis")]
    pub stop_grace: Duration,

    /// Aliveness poll interval while stopping
    #[serde(with = "duration_millis")]
    pub stop_poll: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            wait_ready: true,
            ready_timeout: Duration::from_secs(30),
            ready_attempt_timeout: Duration::from_millis(1000),
            ready_interval: Duration::from_millis(250),
            stop_grace: Duration::from_millis(1500),
            stop_poll: Duration::from_millis(100),
        }
    }
}

/// Settings for the sync-session reconciler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Scheduler program spawned once per running session
    pub scheduler: String,

    /// Hash algorithm handed to the scheduler
    pub hash: String,

    /// Compression handed to the scheduler
    pub compress: String,

    /// Session database (defaults to the local data dir)
    pub db_path: Option<PathBuf>,

    /// A scheduler that exits within this window is marked as errored
    #[serde(with = "duration_millis")]
    pub startup_grace: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            scheduler: "reflect-sync".to_string(),
            hash: "sha256".to_string(),
            compress: "auto".to_string(),
            db_path: None,
            startup_grace: Duration::from_millis(200),
        }
    }
}
