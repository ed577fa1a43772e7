//! cp-remote: Remote daemon orchestration over ssh
//!
//! Everything that touches a remote target goes through here: running
//! commands over ssh, probing for and installing the remote binary, the
//! `connection.json` handshake with the daemon, the persisted target
//! registry, local port-forward tunnels and the cached status/upgrade checks.
//! [`Orchestrator`] ties these together for the CLI.

pub mod exec;
pub mod handshake;
pub mod orchestrator;
pub mod probe;
pub mod registry;
pub mod status;
pub mod tunnel;

pub use exec::{CommandOutput, CommandSpec, ExitInfo, Launcher, RemoteShell, SpawnedChild, StdioMode, TokioLauncher};
pub use handshake::{ConnectionInfo, DaemonStatus};
pub use orchestrator::{ConnectOptions, ConnectOutcome, Orchestrator, StopOutcome};
pub use probe::{ProbeResult, ProbeStatus};
pub use registry::{Registry, RegistryEntry};
pub use status::{Manifest, TargetStatus, UpgradeInfo};
pub use tunnel::{OsPorts, PortAllocator, PortChoice};
