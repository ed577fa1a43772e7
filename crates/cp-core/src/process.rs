//! Local process bookkeeping
//!
//! Pid files, liveness checks, command-line inspection and the TERM-then-KILL
//! escalation shared by tunnels, forward monitors and sync schedulers.

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};

use crate::poll::{poll_until, PollOutcome};

/// Signals the orchestrator sends to its children
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

/// Read the PID from a PID file
///
/// Returns `Ok(Some(pid))` if the file exists and contains a valid PID,
/// `Ok(None)` if the file doesn't exist, or an error if the file is malformed.
pub fn read_pid_file(path: &Path) -> io::Result<Option<u32>> {
    match fs::File::open(path) {
        Ok(mut file) => {
            let mut contents = String::new();
            file.read_to_string(&mut contents)?;
            let pid = contents
                .trim()
                .parse::<u32>()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            Ok(Some(pid))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Write a PID file, creating parent directories as needed
pub fn write_pid_file(path: &Path, pid: u32) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = fs::File::create(path)?;
    writeln!(file, "{}", pid)?;
    Ok(())
}

/// Remove a PID file; a missing file is not an error
pub fn remove_pid_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Check if a process with the given PID exists
///
/// Uses kill(pid, 0). EPERM means the process exists but belongs to someone
/// else.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    unsafe {
        let result = libc::kill(pid as libc::pid_t, 0);
        if result == 0 {
            return true;
        }
        let err = io::Error::last_os_error();
        err.raw_os_error() == Some(libc::EPERM)
    }
}

#[cfg(not(unix))]
pub fn is_process_alive(pid: u32) -> bool {
    lookup(pid, ProcessRefreshKind::nothing(), |_| ()).is_some()
}

/// Alive and not a zombie waiting to be reaped
pub fn is_running(pid: u32) -> bool {
    if !is_process_alive(pid) {
        return false;
    }
    let status = lookup(pid, ProcessRefreshKind::nothing(), |process| process.status());
    !matches!(status, Some(ProcessStatus::Zombie) | Some(ProcessStatus::Dead))
}

/// Command line of a live process joined with spaces
pub fn process_cmdline(pid: u32) -> Option<String> {
    let refresh = ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always);
    lookup(pid, refresh, |process| {
        process
            .cmd()
            .iter()
            .map(|arg| arg.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    })
    .filter(|cmdline| !cmdline.is_empty())
}

fn lookup<T>(pid: u32, refresh: ProcessRefreshKind, f: impl FnOnce(&sysinfo::Process) -> T) -> Option<T> {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, refresh);
    system.process(pid).map(f)
}

/// Decide whether a recorded pid still belongs to us
///
/// The pid must be running and its command line must contain `marker`. A pid
/// file that names a different pid vetoes the match; a missing one does not.
pub fn is_owned(pid: u32, pid_file: &Path, marker: &str) -> bool {
    if marker.is_empty() || !is_running(pid) {
        return false;
    }
    let cmdline_matches = process_cmdline(pid).is_some_and(|cmdline| cmdline.contains(marker));
    if !cmdline_matches {
        return false;
    }
    !matches!(read_pid_file(pid_file), Ok(Some(recorded)) if recorded != pid)
}

/// Send a signal; returns false if the process could not be signalled
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: Signal) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    let signo = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    unsafe { libc::kill(pid as libc::pid_t, signo) == 0 }
}

#[cfg(not(unix))]
pub fn send_signal(pid: u32, _signal: Signal) -> bool {
    lookup(pid, ProcessRefreshKind::nothing(), |process| process.kill()).unwrap_or(false)
}

/// Stop a process: SIGTERM, wait up to `grace` polling every `poll`, then
/// SIGKILL. Returns true once the process is gone.
pub async fn terminate(pid: u32, grace: Duration, poll: Duration) -> bool {
    if !is_running(pid) {
        return true;
    }

    tracing::debug!(pid, "Sending SIGTERM");
    send_signal(pid, Signal::Terminate);

    let exited = poll_until(poll, grace, || async move { (!is_running(pid)).then_some(()) }).await;
    if let PollOutcome::Ready(()) = exited {
        return true;
    }

    tracing::warn!(pid, grace_ms = grace.as_millis() as u64, "Process ignored SIGTERM, sending SIGKILL");
    send_signal(pid, Signal::Kill);

    poll_until(poll, grace, || async move { (!is_running(pid)).then_some(()) })
        .await
        .is_ready()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_nonexistent_pid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.pid");
        assert!(read_pid_file(&path).unwrap().is_none());
    }

    #[test]
    fn test_write_and_read_pid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("test.pid");

        write_pid_file(&path, 12345).unwrap();
        assert_eq!(read_pid_file(&path).unwrap(), Some(12345));

        remove_pid_file(&path).unwrap();
        remove_pid_file(&path).unwrap();
        assert!(read_pid_file(&path).unwrap().is_none());
    }

    #[test]
    fn test_malformed_pid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.pid");
        fs::write(&path, "not-a-pid").unwrap();
        assert!(read_pid_file(&path).is_err());
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
        assert!(is_running(std::process::id()));
    }

    #[test]
    fn test_invalid_pid_not_alive() {
        assert!(!is_process_alive(999_999_999));
        assert!(!is_process_alive(0));
    }

    #[test]
    fn test_matching_pid_file_alone_is_not_ownership() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("owner.pid");
        let me = std::process::id();

        write_pid_file(&path, me).unwrap();
        assert!(!is_owned(me, &path, "L:127.0.0.1:43000"));
        assert!(!is_owned(me, &path, ""));
        assert!(!is_owned(999_999_999, &path, "L:127.0.0.1:43000"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ownership_requires_cmdline_marker() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("owner.pid");
        let marker = "8000:127.0.0.1:43000";

        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "sleep 30; :", "ssh", "-N", "-L", marker])
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        assert!(is_owned(pid, &path, marker));
        write_pid_file(&path, pid).unwrap();
        assert!(is_owned(pid, &path, marker));
        assert!(!is_owned(pid, &path, "8001:127.0.0.1:43000"));

        write_pid_file(&path, pid + 1).unwrap();
        assert!(!is_owned(pid, &path, marker));

        child.kill().await.unwrap();
        child.wait().await.unwrap();
        assert!(!is_owned(pid, &path, marker));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_child() {
        let mut child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();
        let reaper = tokio::spawn(async move { child.wait().await });

        assert!(is_running(pid));
        assert!(process_cmdline(pid).unwrap().contains("sleep"));
        assert!(terminate(pid, Duration::from_millis(1500), Duration::from_millis(100)).await);
        reaper.await.unwrap().unwrap();
        assert!(!is_process_alive(pid));
    }
}
