//! Local port-forward tunnels
//!
//! A tunnel is an `ssh -N -L <local>:127.0.0.1:<remote>` child. Its pid is
//! written to the registry and to `tunnel.pid` in the target's local state
//! dir; a background task clears both when the child exits.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::sync::Arc;

use dashmap::DashMap;

use cp_core::config::TunnelConfig;
use cp_core::error::RemoteError;
use cp_core::paths::{StatePaths, TUNNEL_PID_FILE};
use cp_core::poll::{poll_until, PollOutcome};
use cp_core::process;
use cp_core::target::forward_spec;
use cp_core::{Clock, SshOptions};

use crate::exec::{CommandSpec, Launcher, SpawnedChild, StdioMode};
use crate::registry::{Registry, RegistryEntry};

/// How the operator asked for a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortChoice {
    /// Reuse the recorded port if possible, else any free port
    #[default]
    Auto,
    Fixed(u16),
}

impl std::str::FromStr for PortChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(PortChoice::Auto);
        }
        match s.parse::<u16>() {
            Ok(0) | Err(_) => Err(format!("expected a port number or 'auto', got '{}'", s)),
            Ok(port) => Ok(PortChoice::Fixed(port)),
        }
    }
}

/// Local port availability checks
pub trait PortAllocator: Send + Sync {
    /// True if `port` can be bound on loopback right now
    fn is_bindable(&self, port: u16) -> bool;

    /// A free port chosen by the OS
    fn ephemeral(&self) -> io::Result<u16>;
}

/// [`PortAllocator`] that asks the OS
#[derive(Debug, Clone, Copy, Default)]
pub struct OsPorts;

impl PortAllocator for OsPorts {
    fn is_bindable(&self, port: u16) -> bool {
        TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).is_ok()
    }

    fn ephemeral(&self) -> io::Result<u16> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))?;
        Ok(listener.local_addr()?.port())
    }
}

/// A tunnel started by this process
#[derive(Debug, Clone)]
pub struct Tunnel {
    pub target: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub child: SpawnedChild,
}

impl Tunnel {
    pub fn pid(&self) -> u32 {
        self.child.pid
    }
}

/// Starts, tracks and stops tunnels
pub struct TunnelSupervisor {
    launcher: Arc<dyn Launcher>,
    ports: Arc<dyn PortAllocator>,
    clock: Arc<dyn Clock>,
    registry: Registry,
    paths: StatePaths,
    config: TunnelConfig,
    live: DashMap<String, Tunnel>,
}

impl TunnelSupervisor {
    pub fn new(
        launcher: Arc<dyn Launcher>,
        ports: Arc<dyn PortAllocator>,
        clock: Arc<dyn Clock>,
        registry: Registry,
        paths: StatePaths,
        config: TunnelConfig,
    ) -> Self {
        Self {
            launcher,
            ports,
            clock,
            registry,
            paths,
            config,
            live: DashMap::new(),
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Pick the local port: an explicit port must be bindable; otherwise the
    /// recorded port is reused when bindable, else the OS picks one
    pub fn choose_port(&self, choice: PortChoice, recorded: Option<u16>) -> Result<u16, RemoteError> {
        match choice {
            PortChoice::Fixed(port) => {
                if self.ports.is_bindable(port) {
                    Ok(port)
                } else {
                    Err(RemoteError::PortUnavailable(port))
                }
            }
            PortChoice::Auto => {
                if let Some(port) = recorded {
                    if self.ports.is_bindable(port) {
                        tracing::debug!(port, "Reusing recorded local port");
                        return Ok(port);
                    }
                    tracing::debug!(port, "Recorded local port is busy");
                }
                Ok(self.ports.ephemeral()?)
            }
        }
    }

    fn pid_file(&self, target: &str) -> std::path::PathBuf {
        self.paths.target_dir(target).join(TUNNEL_PID_FILE)
    }

    /// A recorded tunnel that is still ours and forwards to `remote_port`
    pub fn reusable(&self, entry: &RegistryEntry, remote_port: u16) -> Option<(u16, u32)> {
        let pid = entry.tunnel_pid?;
        let local_port = entry.local_port?;
        if entry.remote_port != Some(remote_port) {
            return None;
        }
        let marker = forward_spec(local_port, remote_port);
        if process::is_owned(pid, &self.pid_file(&entry.target), &marker) {
            Some((local_port, pid))
        } else {
            None
        }
    }

    /// Whether the tunnel recorded in `entry` is alive and ours
    pub fn is_alive(&self, entry: &RegistryEntry) -> bool {
        match entry.remote_port {
            Some(remote_port) => self.reusable(entry, remote_port).is_some(),
            None => false,
        }
    }

    /// Spawn the forward and start watching it
    pub fn open(&self, opts: &SshOptions, local_port: u16, remote_port: u16) -> Result<Tunnel, RemoteError> {
        let target = opts.target.as_str().to_string();
        let spec = CommandSpec::new("ssh")
            .args(opts.forward_args(local_port, remote_port))
            .stdio(StdioMode::Inherit);

        let child = self
            .launcher
            .spawn(&spec)
            .map_err(|e| RemoteError::TunnelSpawnFailure(e.to_string()))?;
        let pid = child.pid;
        tracing::info!(remote = %target, pid, local_port, remote_port, "Tunnel started");

        let pid_file = self.pid_file(&target);
        if let Err(e) = process::write_pid_file(&pid_file, pid) {
            tracing::warn!("Failed to write tunnel pid file {:?}: {}", pid_file, e);
        }

        let now = self.clock.now_millis();
        self.registry.update(&target, |entry| {
            entry.local_port = Some(local_port);
            entry.remote_port = Some(remote_port);
            entry.tunnel_pid = Some(pid);
            entry.last_used = Some(now);
        })?;

        self.watch_exit(target.clone(), child.clone(), pid_file);

        let tunnel = Tunnel {
            target: target.clone(),
            local_port,
            remote_port,
            child,
        };
        self.live.insert(target, tunnel.clone());
        Ok(tunnel)
    }

    fn watch_exit(&self, target: String, mut child: SpawnedChild, pid_file: std::path::PathBuf) {
        let registry = self.registry.clone();
        let clock = self.clock.clone();
        tokio::spawn(async move {
            let exit = child.wait().await;
            let pid = child.pid;
            tracing::info!(remote = %target, pid, code = ?exit.code, "Tunnel exited");

            let now = clock.now_millis();
            let cleared = registry.update_existing(&target, |entry| {
                if entry.tunnel_pid == Some(pid) {
                    entry.tunnel_pid = None;
                    entry.last_stopped = Some(now);
                }
            });
            if let Err(e) = cleared {
                tracing::warn!(remote = %target, "Failed to clear tunnel pid: {}", e);
            }
            if matches!(process::read_pid_file(&pid_file), Ok(Some(recorded)) if recorded == pid) {
                if let Err(e) = process::remove_pid_file(&pid_file) {
                    tracing::debug!(remote = %target, "Failed to remove tunnel pid file: {}", e);
                }
            }
        });
    }

    /// Wait until `url` answers through the tunnel
    ///
    /// Any HTTP response counts. On failure the tunnel is stopped before the
    /// error is returned.
    pub async fn wait_ready(&self, tunnel: &Tunnel, url: &str) -> Result<(), RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(self.config.ready_attempt_timeout)
            .build()
            .map_err(|e| RemoteError::Io(io::Error::new(io::ErrorKind::Other, e)))?;

        let outcome = poll_until(self.config.ready_interval, self.config.ready_timeout, || {
            let client = client.clone();
            let child = tunnel.child.clone();
            async move {
                if let Some(exit) = child.exited() {
                    return Some(Err(RemoteError::TunnelSpawnFailure(format!(
                        "ssh exited with code {:?} before the tunnel was ready",
                        exit.code
                    ))));
                }
                match client.get(url).send().await {
                    Ok(response) => {
                        tracing::debug!(url, status = %response.status(), "Tunnel endpoint answered");
                        Some(Ok(()))
                    }
                    Err(e) => {
                        tracing::trace!(url, "Tunnel not ready: {}", e);
                        None
                    }
                }
            }
        })
        .await;

        let failure = match outcome {
            PollOutcome::Ready(Ok(())) => return Ok(()),
            PollOutcome::Ready(Err(e)) => e,
            PollOutcome::TimedOut { waited, .. } => RemoteError::ReadinessTimeout {
                url: url.to_string(),
                waited,
            },
        };

        self.stop(&tunnel.target).await?;
        Err(failure)
    }

    /// The tunnel this process started for `target`, if still tracked
    pub fn live(&self, target: &str) -> Option<Tunnel> {
        self.live.get(target).map(|t| t.value().clone())
    }

    /// Stop the tunnel for `target`, whether started by this process or a
    /// previous one. Returns true if a process was signalled.
    pub async fn stop(&self, target: &str) -> Result<bool, RemoteError> {
        let entry = self.registry.get(target)?;
        let mut stopped = false;

        if let Some((_, tunnel)) = self.live.remove(target) {
            stopped = process::terminate(tunnel.pid(), self.config.stop_grace, self.config.stop_poll).await;
        } else if let Some(entry) = &entry {
            if let (Some(pid), Some(local), Some(remote)) = (entry.tunnel_pid, entry.local_port, entry.remote_port) {
                if process::is_owned(pid, &self.pid_file(target), &forward_spec(local, remote)) {
                    stopped = process::terminate(pid, self.config.stop_grace, self.config.stop_poll).await;
                } else {
                    tracing::debug!(remote = %target, pid, "Recorded tunnel pid is stale or not ours");
                }
            }
        }

        if entry.is_some() {
            let now = self.clock.now_millis();
            self.registry.update_existing(target, |entry| {
                if entry.tunnel_pid.take().is_some() {
                    entry.last_stopped = Some(now);
                }
            })?;
        }
        if let Err(e) = process::remove_pid_file(&self.pid_file(target)) {
            tracing::debug!(remote = %target, "Failed to remove tunnel pid file: {}", e);
        }
        Ok(stopped)
    }

    /// Stop every tunnel this process started
    pub async fn shutdown(&self) {
        let targets: Vec<String> = self.live.iter().map(|t| t.key().clone()).collect();
        for target in targets {
            if let Err(e) = self.stop(&target).await {
                tracing::warn!(remote = %target, "Failed to stop tunnel: {}", e);
            }
        }
    }
}

/// Local URL of the forwarded daemon
pub fn local_url(local_port: u16, token: Option<&str>) -> String {
    match token {
        Some(token) if !token.is_empty() => format!("http://127.0.0.1:{}/?auth_token={}", local_port, token),
        _ => format!("http://127.0.0.1:{}/", local_port),
    }
}
