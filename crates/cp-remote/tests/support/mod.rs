//! Test doubles: a fake remote host behind a fake `ssh`, and a port allocator
//! that never touches the OS

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use cp_remote::{CommandOutput, CommandSpec, ExitInfo, Launcher, PortAllocator, SpawnedChild, StdioMode, TokioLauncher};

pub const DAEMON_PORT: u16 = 43211;
pub const DAEMON_PID: u32 = 4242;

/// State of the pretend remote machine
#[derive(Debug, Clone)]
pub struct Remote {
    pub reachable: bool,
    pub installed: bool,
    pub daemon_running: bool,
    pub connection_info: Option<String>,
    /// Whether the daemon writes connection info when started
    pub writes_connection_info: bool,
    pub version: String,
}

impl Default for Remote {
    fn default() -> Self {
        Self {
            reachable: true,
            installed: false,
            daemon_running: false,
            connection_info: None,
            writes_connection_info: true,
            version: "1.0.0".to_string(),
        }
    }
}

impl Remote {
    pub fn running() -> Self {
        Self {
            installed: true,
            daemon_running: true,
            connection_info: Some(format!(r#"{{"port": {}, "token": "existing"}}"#, DAEMON_PORT)),
            ..Self::default()
        }
    }
}

/// Call counters
#[derive(Debug, Default)]
pub struct Calls {
    pub status_checks: AtomicU32,
    pub probes: AtomicU32,
    pub installs: AtomicU32,
    pub starts: AtomicU32,
    pub stops: AtomicU32,
    pub reads: AtomicU32,
    pub version_checks: AtomicU32,
    pub spawns: AtomicU32,
}

impl Calls {
    pub fn get(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }
}

/// Interprets the `sh -lc` payloads the orchestrator sends over ssh
#[derive(Default)]
pub struct FakeSsh {
    pub remote: Mutex<Remote>,
    pub calls: Calls,
    pub spawned: Mutex<Vec<CommandSpec>>,
}

impl FakeSsh {
    pub fn new(remote: Remote) -> Arc<Self> {
        Arc::new(Self {
            remote: Mutex::new(remote),
            ..Self::default()
        })
    }

    pub fn set<F: FnOnce(&mut Remote)>(&self, f: F) {
        f(&mut self.remote.lock().unwrap());
    }

    fn remote_command(spec: &CommandSpec) -> String {
        spec.args.last().cloned().unwrap_or_default()
    }

    fn reply(code: i32, stdout: &str) -> CommandOutput {
        CommandOutput {
            code: Some(code),
            stdout: stdout.to_string(),
            stderr: String::new(),
            timed_out: false,
        }
    }
}

#[async_trait]
impl Launcher for FakeSsh {
    async fn output(&self, spec: &CommandSpec, _timeout: Option<Duration>) -> io::Result<CommandOutput> {
        let script = Self::remote_command(spec);
        let mut remote = self.remote.lock().unwrap();

        if !remote.reachable {
            return Ok(CommandOutput {
                code: Some(255),
                stdout: String::new(),
                stderr: "ssh: connect to host box port 22: Connection refused\n".to_string(),
                timed_out: false,
            });
        }

        if script.contains("--version") {
            self.calls.version_checks.fetch_add(1, Ordering::SeqCst);
            return Ok(if remote.installed {
                Self::reply(0, &format!("cocalc-plus {}\n", remote.version))
            } else {
                Self::reply(127, "")
            });
        }
        if script.contains("command -v") {
            self.calls.probes.fetch_add(1, Ordering::SeqCst);
            return Ok(if remote.installed {
                Self::reply(0, "/home/me/.local/bin/cocalc-plus\n")
            } else {
                Self::reply(1, "")
            });
        }
        if script.contains("test -x") {
            return Ok(Self::reply(1, ""));
        }
        if script.contains("echo absent") {
            self.calls.stops.fetch_add(1, Ordering::SeqCst);
            let was_running = remote.daemon_running;
            remote.daemon_running = false;
            remote.connection_info = None;
            return Ok(Self::reply(0, if was_running { "stopped\n" } else { "absent\n" }));
        }
        if script.contains("kill -0") {
            self.calls.status_checks.fetch_add(1, Ordering::SeqCst);
            return Ok(if remote.daemon_running {
                Self::reply(0, &format!("running {}\n", DAEMON_PID))
            } else {
                Self::reply(0, "stopped\n")
            });
        }
        if script.contains("cat ") && script.contains("connection.json") {
            self.calls.reads.fetch_add(1, Ordering::SeqCst);
            return Ok(Self::reply(0, remote.connection_info.as_deref().unwrap_or("")));
        }

        Ok(Self::reply(0, ""))
    }

    async fn status(&self, spec: &CommandSpec) -> io::Result<ExitInfo> {
        let script = Self::remote_command(spec);
        let mut remote = self.remote.lock().unwrap();

        if !remote.reachable {
            return Ok(ExitInfo { code: Some(255) });
        }
        if script.contains("curl -fsSL") {
            self.calls.installs.fetch_add(1, Ordering::SeqCst);
            remote.installed = true;
            return Ok(ExitInfo { code: Some(0) });
        }
        if script.contains("COCALC_WRITE_CONNECTION_INFO") {
            self.calls.starts.fetch_add(1, Ordering::SeqCst);
            remote.daemon_running = true;
            if remote.writes_connection_info {
                remote.connection_info = Some(format!(r#"{{"port": {}}}"#, DAEMON_PORT));
            }
            return Ok(ExitInfo { code: Some(0) });
        }
        Ok(ExitInfo { code: Some(0) })
    }

    fn spawn(&self, spec: &CommandSpec) -> io::Result<SpawnedChild> {
        self.calls.spawns.fetch_add(1, Ordering::SeqCst);
        self.spawned.lock().unwrap().push(spec.clone());
        TokioLauncher.spawn(&stand_in(spec))
    }
}

/// A harmless `sleep` whose command line still carries `spec`'s argv, so
/// ownership checks see the same marker a real `ssh -N -L` would have
pub fn stand_in(spec: &CommandSpec) -> CommandSpec {
    CommandSpec::new("sh")
        .args(["-c", "sleep 30; :"])
        .args(std::iter::once(spec.program.clone()).chain(spec.args.iter().cloned()))
        .stdio(StdioMode::Null)
}

/// Hands out ports from a counter and treats everything as bindable unless
/// marked busy
pub struct FakePorts {
    next: AtomicU16,
    pub busy: Mutex<Vec<u16>>,
    pub ephemeral_calls: AtomicU32,
}

impl Default for FakePorts {
    fn default() -> Self {
        Self {
            next: AtomicU16::new(41000),
            busy: Mutex::new(Vec::new()),
            ephemeral_calls: AtomicU32::new(0),
        }
    }
}

impl PortAllocator for FakePorts {
    fn is_bindable(&self, port: u16) -> bool {
        !self.busy.lock().unwrap().contains(&port)
    }

    fn ephemeral(&self) -> io::Result<u16> {
        self.ephemeral_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.next.fetch_add(1, Ordering::SeqCst))
    }
}
