//! The remote-session orchestrator
//!
//! One [`Orchestrator`] is built per process. It owns the registry handle,
//! the status caches and the tunnel map, and is handed its clock, launcher
//! and port allocator at construction so tests can swap them out.

use std::sync::Arc;

use futures::stream::{self, StreamExt};

use cp_core::config::{ConfigFile, RemoteConfig};
use cp_core::error::RemoteError;
use cp_core::paths::StatePaths;
use cp_core::{token, Clock, SshOptions, SystemClock, Target};

use crate::exec::{ExitInfo, Launcher, RemoteShell, TokioLauncher};
use crate::handshake::{self, ConnectionInfo, DaemonStatus};
use crate::probe;
use crate::registry::{self, Registry, RegistryEntry};
use crate::status::{StatusChecker, TargetStatus, UpgradeInfo};
use crate::tunnel::{local_url, OsPorts, PortAllocator, TunnelSupervisor};

pub use crate::tunnel::PortChoice;

/// Flags for one `connect`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub local_port: PortChoice,
    pub remote_port: PortChoice,
    /// Install the remote binary when missing
    pub install: bool,
    /// Reinstall and restart even if the daemon is running
    pub upgrade: bool,
    /// Only open the tunnel; never probe, install or start anything
    pub forward_only: bool,
    /// Override the configured readiness gate
    pub wait_ready: Option<bool>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            local_port: PortChoice::Auto,
            remote_port: PortChoice::Auto,
            install: true,
            upgrade: false,
            forward_only: false,
            wait_ready: None,
        }
    }
}

/// Result of a successful `connect`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOutcome {
    pub target: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub url: String,
    pub tunnel_pid: u32,
    /// An existing tunnel from an earlier invocation was reused
    pub reused_tunnel: bool,
    /// The daemon was (re)started by this call
    pub started_daemon: bool,
}

/// Result of `stop`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopOutcome {
    pub tunnel_stopped: bool,
    /// `None` if the remote could not be reached
    pub daemon_stopped: Option<bool>,
}

/// Coordinates registry, remote daemon and local tunnels
pub struct Orchestrator {
    remote: RemoteConfig,
    shell: RemoteShell,
    clock: Arc<dyn Clock>,
    registry: Registry,
    status: StatusChecker,
    tunnels: TunnelSupervisor,
}

impl Orchestrator {
    /// Production orchestrator: real processes, system clock, OS ports
    pub fn new(config: &ConfigFile, paths: StatePaths) -> Self {
        Self::with_parts(config, paths, Arc::new(TokioLauncher), Arc::new(SystemClock), Arc::new(OsPorts))
    }

    pub fn with_parts(
        config: &ConfigFile,
        paths: StatePaths,
        launcher: Arc<dyn Launcher>,
        clock: Arc<dyn Clock>,
        ports: Arc<dyn PortAllocator>,
    ) -> Self {
        let shell = RemoteShell::new(launcher.clone());
        let registry = Registry::new(paths.clone());
        let status = StatusChecker::new(shell.clone(), config.remote.clone(), clock.clone());
        let tunnels = TunnelSupervisor::new(launcher, ports, clock.clone(), registry.clone(), paths, config.tunnel.clone());
        Self {
            remote: config.remote.clone(),
            shell,
            clock,
            registry,
            status,
            tunnels,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Rebuild the ssh options recorded for a registry entry
    pub fn options_for(entry: &RegistryEntry) -> Result<SshOptions, RemoteError> {
        let target = Target::parse(&entry.target)?;
        Ok(SshOptions::new(target)
            .with_identity(entry.identity.as_ref().map(Into::into))
            .with_proxy_jump(entry.proxy_jump.clone())
            .with_extra_args(entry.ssh_args.clone().unwrap_or_default()))
    }

    fn record_target(&self, opts: &SshOptions, touch: bool) -> Result<RegistryEntry, RemoteError> {
        let now = self.clock.now_millis();
        self.registry.update(opts.target.as_str(), |entry| {
            entry.host = Some(opts.target.host.clone());
            entry.port = opts.target.port;
            entry.identity = opts.identity.as_ref().map(|p| p.display().to_string());
            entry.proxy_jump = opts.proxy_jump.clone();
            entry.ssh_args = (!opts.extra_args.is_empty()).then(|| opts.extra_args.clone());
            if touch {
                entry.last_used = Some(now);
            }
        })
    }

    /// Bring the remote daemon up (or find it running) and open a local
    /// tunnel to it
    pub async fn connect(&self, opts: &SshOptions, options: &ConnectOptions) -> Result<ConnectOutcome, RemoteError> {
        let target = opts.target.as_str();
        let entry = self.registry.get(target)?;

        let (info, started_daemon) = if options.forward_only {
            (self.advertised_port(opts, options.remote_port).await?, false)
        } else {
            self.ensure_daemon(opts, options).await?
        };
        let remote_port = info.port;

        let reuse = entry
            .as_ref()
            .and_then(|entry| self.tunnels.reusable(entry, remote_port))
            .filter(|(local, _)| match options.local_port {
                PortChoice::Auto => true,
                PortChoice::Fixed(port) => port == *local,
            });

        let (local_port, tunnel_pid, reused_tunnel) = match reuse {
            Some((local_port, pid)) => {
                tracing::info!(remote = %target, pid, local_port, "Reusing existing tunnel");
                (local_port, pid, true)
            }
            None => {
                let recorded = entry.as_ref().and_then(|e| e.local_port);
                let local_port = self.tunnels.choose_port(options.local_port, recorded)?;
                let tunnel = self.tunnels.open(opts, local_port, remote_port)?;
                if options.wait_ready.unwrap_or(self.tunnels.config().wait_ready) {
                    self.tunnels.wait_ready(&tunnel, &local_url(local_port, None)).await?;
                }
                (local_port, tunnel.pid(), false)
            }
        };

        self.record_target(opts, true)?;

        Ok(ConnectOutcome {
            target: target.to_string(),
            local_port,
            remote_port,
            url: local_url(local_port, info.token.as_deref()),
            tunnel_pid,
            reused_tunnel,
            started_daemon,
        })
    }

    /// Forward-only: use an explicit remote port or whatever the daemon last
    /// advertised
    async fn advertised_port(&self, opts: &SshOptions, remote_port: PortChoice) -> Result<ConnectionInfo, RemoteError> {
        if let PortChoice::Fixed(port) = remote_port {
            return Ok(ConnectionInfo {
                port,
                token: None,
                extra: Default::default(),
            });
        }
        handshake::read_connection_info(&self.shell, opts, &self.remote)
            .await?
            .ok_or_else(|| RemoteError::ConnectionInfoMissing {
                target: opts.target.to_string(),
            })
    }

    /// Reuse a running daemon or install/start one
    async fn ensure_daemon(&self, opts: &SshOptions, options: &ConnectOptions) -> Result<(ConnectionInfo, bool), RemoteError> {
        let target = opts.target.as_str();

        let status = self.status.status(opts, true).await?;
        if let DaemonStatus::Unreachable { message } = status {
            return Err(RemoteError::Unreachable {
                target: target.to_string(),
                message,
            });
        }

        if status.is_running() && options.upgrade {
            tracing::info!(remote = %target, "Stopping daemon for upgrade");
            handshake::stop_daemon(&self.shell, opts, &self.remote).await?;
        }

        if status.is_running() && !options.upgrade {
            match handshake::read_connection_info(&self.shell, opts, &self.remote).await? {
                Some(info) => {
                    tracing::info!(remote = %target, port = info.port, "Daemon already running");
                    if let PortChoice::Fixed(port) = options.remote_port {
                        if port != info.port {
                            tracing::warn!(remote = %target, requested = port, actual = info.port, "Running daemon listens on a different port");
                        }
                    }
                    return Ok((info, false));
                }
                None => tracing::warn!(remote = %target, "Daemon running without connection info, restarting"),
            }
        }

        let probed = probe::ensure_remote_ready(&self.shell, opts, &self.remote, options.install, options.upgrade).await?;
        let auth_token = token::generate_token();
        let requested_port = match options.remote_port {
            PortChoice::Fixed(port) => Some(port),
            PortChoice::Auto => None,
        };
        let binary = probe::binary_command(&self.remote, Some(&probed));
        handshake::start_daemon(&self.shell, opts, &self.remote, &binary, &auth_token, requested_port).await?;
        self.status.forget(target);

        let mut info = handshake::wait_for_connection_info(&self.shell, opts, &self.remote).await?;
        if info.token.is_none() {
            info.token = Some(auth_token);
        }
        Ok((info, true))
    }

    /// Daemon status for a target; unreachable hosts are reported, not raised
    pub async fn status(&self, opts: &SshOptions, force: bool) -> Result<DaemonStatus, RemoteError> {
        let status = self.status.status(opts, force).await?;
        if !matches!(status, DaemonStatus::Unreachable { .. }) {
            self.record_target(opts, false)?;
        }
        Ok(status)
    }

    /// Stop the local tunnel and the remote daemon
    pub async fn stop(&self, opts: &SshOptions) -> Result<StopOutcome, RemoteError> {
        let target = opts.target.as_str();
        let tunnel_stopped = self.tunnels.stop(target).await?;

        let daemon_stopped = match handshake::stop_daemon(&self.shell, opts, &self.remote).await {
            Ok(stopped) => {
                self.status.remember_status(target, DaemonStatus::Stopped);
                Some(stopped)
            }
            Err(RemoteError::Unreachable { message, .. }) => {
                tracing::warn!(remote = %target, "Could not reach remote to stop daemon: {}", message);
                None
            }
            Err(e) => return Err(e),
        };

        let now = self.clock.now_millis();
        self.registry.update_existing(target, |entry| {
            entry.last_stopped = Some(now);
        })?;

        Ok(StopOutcome {
            tunnel_stopped,
            daemon_stopped,
        })
    }

    /// Registry entries in display order with local tunnel liveness; the
    /// remote is not contacted
    pub fn list(&self) -> Result<Vec<TargetStatus>, RemoteError> {
        let mut entries = self.registry.list()?;
        registry::sort_for_display(&mut entries);
        Ok(entries
            .into_iter()
            .map(|entry| TargetStatus {
                tunnel_alive: self.tunnels.is_alive(&entry),
                entry,
                daemon: None,
            })
            .collect())
    }

    /// Like [`list`](Self::list), plus a (cached) daemon status per target
    pub async fn list_with_status(&self, force: bool) -> Result<Vec<TargetStatus>, RemoteError> {
        let concurrency = self.remote.upgrade_concurrency.max(1);
        let mut rows: Vec<(usize, TargetStatus)> = stream::iter(self.list()?.into_iter().enumerate())
            .map(|(i, mut row)| async move {
                row.daemon = match Self::options_for(&row.entry) {
                    Ok(opts) => match self.status.status(&opts, force).await {
                        Ok(status) => Some(status),
                        Err(e) => Some(DaemonStatus::Unreachable { message: e.to_string() }),
                    },
                    Err(e) => Some(DaemonStatus::Unreachable { message: e.to_string() }),
                };
                (i, row)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        rows.sort_by_key(|(i, _)| *i);
        Ok(rows.into_iter().map(|(_, row)| row).collect())
    }

    /// Installed vs published version for every registered target
    pub async fn check_upgrades(&self, force: bool) -> Result<Vec<Result<UpgradeInfo, RemoteError>>, RemoteError> {
        let mut entries = self.registry.list()?;
        registry::sort_for_display(&mut entries);
        let targets = entries
            .iter()
            .map(Self::options_for)
            .collect::<Result<Vec<_>, _>>()?;
        self.status.check_many(&targets, force).await
    }

    /// Stop the tunnel and drop the target from the registry
    pub async fn forget(&self, target: &str) -> Result<bool, RemoteError> {
        self.tunnels.stop(target).await?;
        self.status.forget(target);
        Ok(self.registry.delete(target)?.is_some())
    }

    /// Set or clear the starred flag
    pub fn star(&self, target: &str, starred: bool) -> Result<Option<RegistryEntry>, RemoteError> {
        self.registry.update_existing(target, |entry| {
            entry.starred = starred.then_some(true);
        })
    }

    /// Wait for a tunnel started by this process to exit
    pub async fn wait_tunnel(&self, target: &str) -> Option<ExitInfo> {
        let mut tunnel = self.tunnels.live(target)?;
        Some(tunnel.child.wait().await)
    }

    /// Stop every tunnel this process started
    pub async fn shutdown(&self) {
        self.tunnels.shutdown().await;
    }
}
