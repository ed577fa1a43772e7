//! Scheduler command line
//!
//! The scheduler is an external program; all it gets from us is argv. The
//! `--pid-file` path is unique per session and doubles as the marker used to
//! recognise a scheduler after this process has gone away.

use std::path::PathBuf;

use cp_core::config::SyncConfig;
use cp_core::paths::StatePaths;
use cp_remote::{CommandSpec, StdioMode};

use crate::types::{Endpoint, SyncSessionRow};

pub const SCHEDULER_PID_FILE: &str = "scheduler.pid";
pub const MONITOR_PID_FILE: &str = "monitor.pid";

/// Pid file, and command-line marker, for a session's scheduler
pub fn pid_file(paths: &StatePaths, session_id: i64) -> PathBuf {
    paths.session_dir(session_id).join(SCHEDULER_PID_FILE)
}

fn endpoint_args(args: &mut Vec<String>, side: &str, endpoint: &Endpoint) {
    args.push(format!("--{}-root", side));
    args.push(endpoint.root.clone());
    if let Some(host) = &endpoint.host {
        args.push(format!("--{}-host", side));
        args.push(host.clone());
    }
    if let Some(port) = endpoint.port {
        args.push(format!("--{}-port", side));
        args.push(port.to_string());
    }
}

/// Arguments for one session's scheduler
pub fn scheduler_args(config: &SyncConfig, paths: &StatePaths, row: &SyncSessionRow) -> Vec<String> {
    let mut args = vec![
        "scheduler".to_string(),
        "--session-id".to_string(),
        row.id.to_string(),
    ];
    endpoint_args(&mut args, "alpha", &row.alpha);
    endpoint_args(&mut args, "beta", &row.beta);

    args.extend([
        "--prefer".to_string(),
        row.prefer.as_str().to_string(),
        "--hash".to_string(),
        config.hash.clone(),
        "--compress".to_string(),
        config.compress.clone(),
    ]);
    if let Some(strategy) = &row.merge_strategy {
        args.push("--merge-strategy".to_string());
        args.push(strategy.clone());
    }
    for rule in &row.ignore_rules {
        args.push("--ignore".to_string());
        args.push(rule.clone());
    }
    args.push("--pid-file".to_string());
    args.push(pid_file(paths, row.id).display().to_string());
    args
}

/// The detached child spec for a session's scheduler
pub fn scheduler_command(config: &SyncConfig, paths: &StatePaths, row: &SyncSessionRow) -> CommandSpec {
    CommandSpec::new(&config.scheduler)
        .args(scheduler_args(config, paths, row))
        .stdio(StdioMode::Null)
        .detached()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActualState, DesiredState, Prefer};
    use std::collections::BTreeMap;

    fn row() -> SyncSessionRow {
        SyncSessionRow {
            id: 7,
            name: "docs".to_string(),
            alpha: Endpoint::local("/home/me/docs"),
            beta: Endpoint::parse("me@box:2222:docs").unwrap(),
            prefer: Prefer::Beta,
            desired_state: DesiredState::Running,
            actual_state: ActualState::Stopped,
            scheduler_pid: None,
            ignore_rules: vec!["*.tmp".to_string(), "build/".to_string()],
            merge_strategy: Some("lww".to_string()),
            labels: BTreeMap::new(),
            last_heartbeat: None,
            created_at: 0,
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_scheduler_args() {
        let paths = StatePaths::new("/state");
        let args = scheduler_args(&SyncConfig::default(), &paths, &row());

        assert_eq!(args[0], "scheduler");
        assert_eq!(value_after(&args, "--session-id"), Some("7"));
        assert_eq!(value_after(&args, "--alpha-root"), Some("/home/me/docs"));
        assert_eq!(value_after(&args, "--alpha-host"), None);
        assert_eq!(value_after(&args, "--beta-host"), Some("me@box"));
        assert_eq!(value_after(&args, "--beta-port"), Some("2222"));
        assert_eq!(value_after(&args, "--prefer"), Some("beta"));
        assert_eq!(value_after(&args, "--hash"), Some("sha256"));
        assert_eq!(value_after(&args, "--merge-strategy"), Some("lww"));
        assert_eq!(args.iter().filter(|a| *a == "--ignore").count(), 2);
        assert_eq!(
            value_after(&args, "--pid-file"),
            Some("/state/sync/sessions/7/scheduler.pid")
        );
    }

    #[test]
    fn test_scheduler_command_is_detached() {
        let config = SyncConfig {
            scheduler: "/opt/reflect-sync".to_string(),
            ..SyncConfig::default()
        };
        let spec = scheduler_command(&config, &StatePaths::new("/state"), &row());
        assert_eq!(spec.program, "/opt/reflect-sync");
        assert!(spec.detach);
        assert_eq!(spec.stdio, StdioMode::Null);
    }
}
