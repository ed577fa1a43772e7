//! Desired/actual state reconciliation
//!
//! One pass looks at each row once:
//!
//! | desired | live child | action |
//! |---------|------------|--------|
//! | running | yes        | record pid, heartbeat |
//! | running | no         | provision roots, spawn, startup check |
//! | stopped | yes        | TERM, then KILL after the grace window |
//! | stopped | no         | correct `actual_state` if needed |
//!
//! A child is live if this process is tracking it and it has not exited, or
//! if the row's recorded pid is running and passes the ownership check.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use cp_core::config::{ConfigFile, SyncConfig, TunnelConfig};
use cp_core::paths::StatePaths;
use cp_core::poll::{poll_until, PollOutcome};
use cp_core::process;
use cp_core::shell;
use cp_core::target::forward_spec;
use cp_remote::{CommandSpec, Launcher, RemoteShell, SpawnedChild, StdioMode};

use crate::error::SyncError;
use crate::scheduler::{self, MONITOR_PID_FILE};
use crate::store::SessionStore;
use crate::types::{ActualState, DesiredState, Endpoint, ForwardRow, SyncSessionRow};

const STARTUP_POLL: Duration = Duration::from_millis(25);

/// What one reconcile pass did to a row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// A new child was spawned
    Started { pid: u32 },
    /// Already running; pid and heartbeat refreshed
    Running { pid: u32 },
    /// A live child was terminated
    Stopped { pid: u32 },
    /// Only the stored state was wrong
    Corrected { state: ActualState },
    Unchanged,
    /// Starting or stopping failed; the row is now `error`
    Failed { message: String },
}

impl fmt::Display for ReconcileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileAction::Started { pid } => write!(f, "started (pid {})", pid),
            ReconcileAction::Running { pid } => write!(f, "running (pid {})", pid),
            ReconcileAction::Stopped { pid } => write!(f, "stopped (pid {})", pid),
            ReconcileAction::Corrected { state } => write!(f, "marked {}", state),
            ReconcileAction::Unchanged => f.write_str("unchanged"),
            ReconcileAction::Failed { message } => write!(f, "failed: {}", message),
        }
    }
}

/// Drives sync sessions and forwards toward their desired state
pub struct Reconciler {
    store: Arc<SessionStore>,
    launcher: Arc<dyn Launcher>,
    shell: RemoteShell,
    paths: StatePaths,
    sync: SyncConfig,
    stop: TunnelConfig,
    probe_timeout: Duration,
    schedulers: DashMap<i64, SpawnedChild>,
    monitors: DashMap<i64, SpawnedChild>,
}

impl Reconciler {
    pub fn new(store: Arc<SessionStore>, config: &ConfigFile, paths: StatePaths, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            store,
            shell: RemoteShell::new(launcher.clone()),
            launcher,
            paths,
            sync: config.sync.clone(),
            stop: config.tunnel.clone(),
            probe_timeout: config.remote.probe_timeout,
            schedulers: DashMap::new(),
            monitors: DashMap::new(),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    // Sessions

    pub async fn reconcile_sessions(&self, rows: &[SyncSessionRow]) -> Result<Vec<(i64, ReconcileAction)>, SyncError> {
        let mut actions = Vec::with_capacity(rows.len());
        for row in rows {
            let action = self.reconcile_session(row).await?;
            if action != ReconcileAction::Unchanged {
                tracing::info!(session = row.id, name = %row.name, "Reconciled: {}", action);
            }
            actions.push((row.id, action));
        }
        Ok(actions)
    }

    /// Converge one session. Only store failures are returned as errors;
    /// start and stop failures are recorded on the row.
    pub async fn reconcile_session(&self, row: &SyncSessionRow) -> Result<ReconcileAction, SyncError> {
        let pid_file = scheduler::pid_file(&self.paths, row.id);
        let marker = pid_file.display().to_string();
        let live = live_pid(&self.schedulers, row.id, row.scheduler_pid, &pid_file, &marker);

        match (row.desired_state, live) {
            (DesiredState::Running, Some(pid)) => {
                if row.scheduler_pid != Some(pid) {
                    self.store.set_scheduler_pid(row.id, Some(pid))?;
                }
                if row.actual_state != ActualState::Running {
                    self.store.set_session_actual(row.id, ActualState::Running)?;
                }
                self.store.session_heartbeat(row.id)?;
                Ok(ReconcileAction::Running { pid })
            }
            (DesiredState::Running, None) => match self.start_scheduler(row, &pid_file).await {
                Ok(pid) => {
                    self.store.set_scheduler_pid(row.id, Some(pid))?;
                    self.store.set_session_desired(row.id, DesiredState::Running)?;
                    self.store.set_session_actual(row.id, ActualState::Running)?;
                    self.store.session_heartbeat(row.id)?;
                    Ok(ReconcileAction::Started { pid })
                }
                Err(SyncError::Store(e)) => Err(e.into()),
                Err(e) => {
                    tracing::warn!(session = row.id, name = %row.name, "Failed to start scheduler: {}", e);
                    self.store.set_scheduler_pid(row.id, None)?;
                    self.store.set_session_actual(row.id, ActualState::Error)?;
                    Ok(ReconcileAction::Failed { message: e.to_string() })
                }
            },
            (DesiredState::Stopped, Some(pid)) => {
                self.schedulers.remove(&row.id);
                match self.stop_pid(pid, &pid_file).await {
                    Ok(()) => {
                        self.store.set_scheduler_pid(row.id, None)?;
                        self.store.set_session_actual(row.id, ActualState::Stopped)?;
                        Ok(ReconcileAction::Stopped { pid })
                    }
                    Err(e) => {
                        self.store.set_session_actual(row.id, ActualState::Error)?;
                        Ok(ReconcileAction::Failed { message: e.to_string() })
                    }
                }
            }
            (DesiredState::Stopped, None) => {
                if row.scheduler_pid.is_some() {
                    self.store.set_scheduler_pid(row.id, None)?;
                }
                if row.actual_state != ActualState::Stopped {
                    self.store.set_session_actual(row.id, ActualState::Stopped)?;
                    Ok(ReconcileAction::Corrected {
                        state: ActualState::Stopped,
                    })
                } else {
                    Ok(ReconcileAction::Unchanged)
                }
            }
        }
    }

    async fn start_scheduler(&self, row: &SyncSessionRow, pid_file: &Path) -> Result<u32, SyncError> {
        self.provision(&row.alpha).await?;
        self.provision(&row.beta).await?;

        let spec = scheduler::scheduler_command(&self.sync, &self.paths, row);
        let what = format!("scheduler for '{}'", row.name);
        let child = self.spawn_checked(&spec, &what, pid_file).await?;
        let pid = child.pid;
        self.schedulers.insert(row.id, child);
        Ok(pid)
    }

    /// Set the desired state of a session and converge it right away
    pub async fn set_session_desired(&self, key: &str, state: DesiredState) -> Result<(SyncSessionRow, ReconcileAction), SyncError> {
        let row = self.store.session(key)?;
        self.store.set_session_desired(row.id, state)?;
        let row = self.store.session(&row.id.to_string())?;
        let action = self.reconcile_session(&row).await?;
        Ok((self.store.session(&row.id.to_string())?, action))
    }

    /// Stop a running scheduler and start it again with the row's current
    /// options
    pub async fn restart_session(&self, id: i64) -> Result<ReconcileAction, SyncError> {
        let row = self.store.session(&id.to_string())?;
        if row.desired_state != DesiredState::Running {
            return Ok(ReconcileAction::Unchanged);
        }
        let pid_file = scheduler::pid_file(&self.paths, id);
        let marker = pid_file.display().to_string();
        if let Some(pid) = live_pid(&self.schedulers, id, row.scheduler_pid, &pid_file, &marker) {
            tracing::info!(session = id, pid, "Restarting scheduler");
            self.schedulers.remove(&id);
            self.stop_pid(pid, &pid_file).await?;
            self.store.set_scheduler_pid(id, None)?;
        }
        let row = self.store.session(&id.to_string())?;
        self.reconcile_session(&row).await
    }

    /// Stop the scheduler if needed, then delete the row and its state dir
    pub async fn remove_session(&self, key: &str) -> Result<SyncSessionRow, SyncError> {
        let row = self.store.session(key)?;
        let pid_file = scheduler::pid_file(&self.paths, row.id);
        let marker = pid_file.display().to_string();
        if let Some(pid) = live_pid(&self.schedulers, row.id, row.scheduler_pid, &pid_file, &marker) {
            self.schedulers.remove(&row.id);
            self.stop_pid(pid, &pid_file).await?;
        }
        self.store.remove_session(row.id)?;
        remove_state_dir(&self.paths.session_dir(row.id));
        Ok(row)
    }

    // Forwards

    pub async fn reconcile_forwards(&self, rows: &[ForwardRow]) -> Result<Vec<(i64, ReconcileAction)>, SyncError> {
        let mut actions = Vec::with_capacity(rows.len());
        for row in rows {
            let action = self.reconcile_forward(row).await?;
            if action != ReconcileAction::Unchanged {
                tracing::info!(forward = row.id, name = %row.name, "Reconciled: {}", action);
            }
            actions.push((row.id, action));
        }
        Ok(actions)
    }

    pub async fn reconcile_forward(&self, row: &ForwardRow) -> Result<ReconcileAction, SyncError> {
        let pid_file = self.paths.forward_dir(row.id).join(MONITOR_PID_FILE);
        let marker = forward_spec(row.local_port, row.remote_port);
        let live = live_pid(&self.monitors, row.id, row.monitor_pid, &pid_file, &marker);

        match (row.desired_state, live) {
            (DesiredState::Running, Some(pid)) => {
                if row.monitor_pid != Some(pid) {
                    self.store.set_monitor_pid(row.id, Some(pid))?;
                }
                if row.actual_state != ActualState::Running {
                    self.store.set_forward_actual(row.id, ActualState::Running)?;
                }
                self.store.forward_heartbeat(row.id)?;
                Ok(ReconcileAction::Running { pid })
            }
            (DesiredState::Running, None) => match self.start_monitor(row, &pid_file).await {
                Ok(pid) => {
                    self.store.set_monitor_pid(row.id, Some(pid))?;
                    self.store.set_forward_actual(row.id, ActualState::Running)?;
                    self.store.forward_heartbeat(row.id)?;
                    Ok(ReconcileAction::Started { pid })
                }
                Err(SyncError::Store(e)) => Err(e.into()),
                Err(e) => {
                    tracing::warn!(forward = row.id, name = %row.name, "Failed to start forward: {}", e);
                    self.store.set_monitor_pid(row.id, None)?;
                    self.store.set_forward_actual(row.id, ActualState::Error)?;
                    Ok(ReconcileAction::Failed { message: e.to_string() })
                }
            },
            (DesiredState::Stopped, Some(pid)) => {
                self.monitors.remove(&row.id);
                match self.stop_pid(pid, &pid_file).await {
                    Ok(()) => {
                        self.store.set_monitor_pid(row.id, None)?;
                        self.store.set_forward_actual(row.id, ActualState::Stopped)?;
                        Ok(ReconcileAction::Stopped { pid })
                    }
                    Err(e) => {
                        self.store.set_forward_actual(row.id, ActualState::Error)?;
                        Ok(ReconcileAction::Failed { message: e.to_string() })
                    }
                }
            }
            (DesiredState::Stopped, None) => {
                if row.monitor_pid.is_some() {
                    self.store.set_monitor_pid(row.id, None)?;
                }
                if row.actual_state != ActualState::Stopped {
                    self.store.set_forward_actual(row.id, ActualState::Stopped)?;
                    Ok(ReconcileAction::Corrected {
                        state: ActualState::Stopped,
                    })
                } else {
                    Ok(ReconcileAction::Unchanged)
                }
            }
        }
    }

    async fn start_monitor(&self, row: &ForwardRow, pid_file: &Path) -> Result<u32, SyncError> {
        let opts = row.ssh_options()?;
        let spec = CommandSpec::new(self.shell.program())
            .args(opts.forward_args(row.local_port, row.remote_port))
            .stdio(StdioMode::Null)
            .detached();
        let what = format!("forward '{}'", row.name);
        let child = self.spawn_checked(&spec, &what, pid_file).await?;
        let pid = child.pid;
        self.monitors.insert(row.id, child);
        Ok(pid)
    }

    pub async fn set_forward_desired(&self, key: &str, state: DesiredState) -> Result<(ForwardRow, ReconcileAction), SyncError> {
        let row = self.store.forward(key)?;
        self.store.set_forward_desired(row.id, state)?;
        let row = self.store.forward(&row.id.to_string())?;
        let action = self.reconcile_forward(&row).await?;
        Ok((self.store.forward(&row.id.to_string())?, action))
    }

    pub async fn remove_forward(&self, key: &str) -> Result<ForwardRow, SyncError> {
        let row = self.store.forward(key)?;
        let pid_file = self.paths.forward_dir(row.id).join(MONITOR_PID_FILE);
        let marker = forward_spec(row.local_port, row.remote_port);
        if let Some(pid) = live_pid(&self.monitors, row.id, row.monitor_pid, &pid_file, &marker) {
            self.monitors.remove(&row.id);
            self.stop_pid(pid, &pid_file).await?;
        }
        self.store.remove_forward(row.id)?;
        remove_state_dir(&self.paths.forward_dir(row.id));
        Ok(row)
    }

    // Shared

    /// Create a root locally, or over ssh for a remote endpoint
    async fn provision(&self, endpoint: &Endpoint) -> Result<(), SyncError> {
        match endpoint.ssh_options() {
            Some(opts) => {
                let opts = opts?;
                let script = format!("mkdir -p {}", shell::remote_path(&endpoint.root));
                self.shell.run_checked(&opts, &script, self.probe_timeout).await?;
                tracing::debug!(remote = %opts.target, root = %endpoint.root, "Provisioned remote root");
            }
            None => {
                let path = expand_home(&endpoint.root);
                tokio::fs::create_dir_all(&path)
                    .await
                    .map_err(|source| SyncError::Provision { path: path.clone(), source })?;
                tracing::debug!(root = ?path, "Provisioned local root");
            }
        }
        Ok(())
    }

    /// Spawn `spec`, write its pid file and make sure it survives the
    /// startup grace window
    async fn spawn_checked(&self, spec: &CommandSpec, what: &str, pid_file: &Path) -> Result<SpawnedChild, SyncError> {
        let child = self.launcher.spawn(spec).map_err(|source| SyncError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        if let Err(e) = process::write_pid_file(pid_file, child.pid) {
            tracing::warn!("Failed to write pid file {:?}: {}", pid_file, e);
        }

        let watched = child.clone();
        let early_exit = poll_until(STARTUP_POLL, self.sync.startup_grace, move || {
            let watched = watched.clone();
            async move { watched.exited() }
        })
        .await;

        match early_exit {
            PollOutcome::Ready(exit) => {
                if let Err(e) = process::remove_pid_file(pid_file) {
                    tracing::debug!("Failed to remove pid file {:?}: {}", pid_file, e);
                }
                Err(SyncError::EarlyExit {
                    what: what.to_string(),
                    code: exit.code,
                })
            }
            PollOutcome::TimedOut { .. } => {
                tracing::debug!(pid = child.pid, "{} passed startup check", what);
                Ok(child)
            }
        }
    }

    async fn stop_pid(&self, pid: u32, pid_file: &Path) -> Result<(), SyncError> {
        if !process::terminate(pid, self.stop.stop_grace, self.stop.stop_poll).await {
            return Err(SyncError::StopFailed { pid });
        }
        if let Err(e) = process::remove_pid_file(pid_file) {
            tracing::debug!("Failed to remove pid file {:?}: {}", pid_file, e);
        }
        Ok(())
    }
}

/// Pid of the row's child if it is alive and ours
fn live_pid(
    tracked: &DashMap<i64, SpawnedChild>,
    id: i64,
    recorded: Option<u32>,
    pid_file: &Path,
    marker: &str,
) -> Option<u32> {
    let tracked_pid = tracked
        .get(&id)
        .map(|child| (child.pid, child.exited().is_none()));
    match tracked_pid {
        Some((pid, true)) if process::is_running(pid) => return Some(pid),
        Some(_) => {
            tracked.remove(&id);
        }
        None => {}
    }

    let pid = recorded?;
    if process::is_owned(pid, pid_file, marker) {
        Some(pid)
    } else {
        tracing::debug!(id, pid, "Recorded pid is stale or not ours");
        None
    }
}

fn expand_home(root: &str) -> PathBuf {
    match root.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().unwrap_or_default().join(rest),
        None if root == "~" => dirs::home_dir().unwrap_or_default(),
        None => PathBuf::from(root),
    }
}

fn remove_state_dir(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove state dir {:?}: {}", dir, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/srv/a"), PathBuf::from("/srv/a"));
        assert_eq!(expand_home("rel"), PathBuf::from("rel"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/x"), home.join("x"));
        }
    }

    #[test]
    fn test_action_display() {
        assert_eq!(ReconcileAction::Started { pid: 5 }.to_string(), "started (pid 5)");
        assert_eq!(
            ReconcileAction::Corrected {
                state: ActualState::Stopped
            }
            .to_string(),
            "marked stopped"
        );
    }
}
