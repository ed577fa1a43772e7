//! Output formatting utilities for the CLI
//!
//! Tables for ssh targets, upgrade checks, sync sessions and forwards, plus
//! the coloured status lines every command uses.

use tabled::{
    settings::{Style, Width},
    Table, Tabled,
};

use cp_core::time::format_age;
use cp_core::Clock;
use cp_remote::{ConnectOutcome, TargetStatus, UpgradeInfo};
use cp_sync::{ForwardRow, SyncSessionRow};

fn or_dash<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

fn age(clock: &dyn Clock, timestamp: Option<u64>) -> String {
    match timestamp {
        Some(ts) => format_age(clock, ts),
        None => "never".to_string(),
    }
}

/// Format registered ssh targets as a table
///
/// The DAEMON column is only filled when the remote was contacted.
pub fn format_targets(targets: &[TargetStatus], clock: &dyn Clock) -> String {
    if targets.is_empty() {
        return "No ssh targets yet (run 'cocalc-plus ssh <target>')".to_string();
    }

    #[derive(Tabled)]
    struct TargetRow {
        #[tabled(rename = "")]
        star: &'static str,
        #[tabled(rename = "TARGET")]
        target: String,
        #[tabled(rename = "LOCAL PORT")]
        local_port: String,
        #[tabled(rename = "TUNNEL")]
        tunnel: String,
        #[tabled(rename = "DAEMON")]
        daemon: String,
        #[tabled(rename = "LAST USED")]
        last_used: String,
    }

    let rows: Vec<TargetRow> = targets
        .iter()
        .map(|t| TargetRow {
            star: if t.entry.is_starred() { "*" } else { "" },
            target: t.entry.target.clone(),
            local_port: or_dash(t.entry.local_port),
            tunnel: match (t.tunnel_alive, t.entry.tunnel_pid) {
                (true, Some(pid)) => format!("up (pid {})", pid),
                _ => "down".to_string(),
            },
            daemon: or_dash(t.daemon.as_ref()),
            last_used: age(clock, t.entry.last_used),
        })
        .collect();

    Table::new(rows).with(Style::rounded()).to_string()
}

/// Format upgrade checks; failed checks show their error
pub fn format_upgrades(results: &[(String, Result<UpgradeInfo, String>)]) -> String {
    if results.is_empty() {
        return "No ssh targets yet".to_string();
    }

    #[derive(Tabled)]
    struct UpgradeRow {
        #[tabled(rename = "TARGET")]
        target: String,
        #[tabled(rename = "INSTALLED")]
        current: String,
        #[tabled(rename = "LATEST")]
        latest: String,
        #[tabled(rename = "UPGRADE")]
        upgrade: String,
    }

    let rows: Vec<UpgradeRow> = results
        .iter()
        .map(|(target, result)| match result {
            Ok(info) => UpgradeRow {
                target: target.clone(),
                current: or_dash(info.current.as_ref()),
                latest: or_dash(info.latest.as_ref()),
                upgrade: if info.upgrade_available { "available" } else { "-" }.to_string(),
            },
            Err(e) => UpgradeRow {
                target: target.clone(),
                current: "?".to_string(),
                latest: "?".to_string(),
                upgrade: truncate(e, 40),
            },
        })
        .collect();

    Table::new(rows)
        .with(Style::rounded())
        .with(Width::wrap(100))
        .to_string()
}

/// Summary printed after a successful connect
pub fn format_connect(outcome: &ConnectOutcome) -> String {
    let mut output = String::new();
    output.push_str(&format!("Target: {}\n", outcome.target));
    output.push_str(&format!(
        "Tunnel: 127.0.0.1:{} -> remote 127.0.0.1:{} (pid {}{})\n",
        outcome.local_port,
        outcome.remote_port,
        outcome.tunnel_pid,
        if outcome.reused_tunnel { ", reused" } else { "" }
    ));
    output.push_str(&format!("URL: {}\n", outcome.url));
    output
}

fn labels(row: &SyncSessionRow) -> String {
    if row.labels.is_empty() {
        return "-".to_string();
    }
    row.labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Format sync sessions as a table
pub fn format_sessions(sessions: &[SyncSessionRow], clock: &dyn Clock, detailed: bool) -> String {
    if sessions.is_empty() {
        return "No sync sessions".to_string();
    }

    #[derive(Tabled)]
    struct SessionRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "NAME")]
        name: String,
        #[tabled(rename = "ALPHA")]
        alpha: String,
        #[tabled(rename = "BETA")]
        beta: String,
        #[tabled(rename = "DESIRED")]
        desired: String,
        #[tabled(rename = "ACTUAL")]
        actual: String,
        #[tabled(rename = "PID")]
        pid: String,
    }

    #[derive(Tabled)]
    struct SessionRowDetailed {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "NAME")]
        name: String,
        #[tabled(rename = "ALPHA")]
        alpha: String,
        #[tabled(rename = "BETA")]
        beta: String,
        #[tabled(rename = "PREFER")]
        prefer: String,
        #[tabled(rename = "DESIRED")]
        desired: String,
        #[tabled(rename = "ACTUAL")]
        actual: String,
        #[tabled(rename = "PID")]
        pid: String,
        #[tabled(rename = "HEARTBEAT")]
        heartbeat: String,
        #[tabled(rename = "LABELS")]
        labels: String,
    }

    if detailed {
        let rows: Vec<SessionRowDetailed> = sessions
            .iter()
            .map(|s| SessionRowDetailed {
                id: s.id,
                name: s.name.clone(),
                alpha: truncate(&s.alpha.to_string(), 30),
                beta: truncate(&s.beta.to_string(), 30),
                prefer: s.prefer.to_string(),
                desired: s.desired_state.to_string(),
                actual: s.actual_state.to_string(),
                pid: or_dash(s.scheduler_pid),
                heartbeat: age(clock, s.last_heartbeat),
                labels: labels(s),
            })
            .collect();

        Table::new(rows)
            .with(Style::rounded())
            .with(Width::wrap(140))
            .to_string()
    } else {
        let rows: Vec<SessionRow> = sessions
            .iter()
            .map(|s| SessionRow {
                id: s.id,
                name: s.name.clone(),
                alpha: truncate(&s.alpha.to_string(), 30),
                beta: truncate(&s.beta.to_string(), 30),
                desired: s.desired_state.to_string(),
                actual: s.actual_state.to_string(),
                pid: or_dash(s.scheduler_pid),
            })
            .collect();

        Table::new(rows).with(Style::rounded()).to_string()
    }
}

/// Everything we know about one session
pub fn format_session_detail(session: &SyncSessionRow, clock: &dyn Clock) -> String {
    let mut output = String::new();
    output.push_str(&format!("Session: {} (id {})\n", session.name, session.id));
    output.push_str(&format!("Alpha: {}\n", session.alpha));
    output.push_str(&format!("Beta: {}\n", session.beta));
    output.push_str(&format!("Prefer: {}\n", session.prefer));
    output.push_str(&format!(
        "State: desired {}, actual {}\n",
        session.desired_state, session.actual_state
    ));
    output.push_str(&format!("Scheduler PID: {}\n", or_dash(session.scheduler_pid)));
    output.push_str(&format!("Last heartbeat: {}\n", age(clock, session.last_heartbeat)));
    output.push_str(&format!(
        "Merge strategy: {}\n",
        or_dash(session.merge_strategy.as_ref())
    ));
    if !session.ignore_rules.is_empty() {
        output.push_str(&format!("Ignore: {}\n", session.ignore_rules.join(", ")));
    }
    output.push_str(&format!("Labels: {}\n", labels(session)));
    output
}

/// Format forwards as a table
pub fn format_forwards(forwards: &[ForwardRow], clock: &dyn Clock) -> String {
    if forwards.is_empty() {
        return "No forwards".to_string();
    }

    #[derive(Tabled)]
    struct ForwardTableRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "NAME")]
        name: String,
        #[tabled(rename = "TARGET")]
        target: String,
        #[tabled(rename = "FORWARD")]
        forward: String,
        #[tabled(rename = "DESIRED")]
        desired: String,
        #[tabled(rename = "ACTUAL")]
        actual: String,
        #[tabled(rename = "PID")]
        pid: String,
        #[tabled(rename = "HEARTBEAT")]
        heartbeat: String,
    }

    let rows: Vec<ForwardTableRow> = forwards
        .iter()
        .map(|f| ForwardTableRow {
            id: f.id,
            name: f.name.clone(),
            target: f.target.clone(),
            forward: format!("{} -> {}", f.local_port, f.remote_port),
            desired: f.desired_state.to_string(),
            actual: f.actual_state.to_string(),
            pid: or_dash(f.monitor_pid),
            heartbeat: age(clock, f.last_heartbeat),
        })
        .collect();

    Table::new(rows).with(Style::rounded()).to_string()
}

/// Truncate a string with ellipsis if too long
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Print a success message in green with a checkmark prefix
pub fn print_success(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Green),
        Print("✓ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an error message in red with an X prefix
///
/// Outputs to stderr.
pub fn print_error(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a warning message in yellow with a warning symbol prefix
///
/// Outputs to stderr.
pub fn print_warning(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Yellow),
        Print("⚠ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an informational message in cyan with an info symbol prefix
pub fn print_info(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Cyan),
        Print("ℹ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use cp_core::time::ManualClock;
    use cp_remote::{DaemonStatus, RegistryEntry};
    use cp_sync::{ActualState, DesiredState, Endpoint, Prefer};
    use std::collections::BTreeMap;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a-much-longer-value", 10), "a-much-...");
    }

    #[test]
    fn test_format_targets() {
        let clock = ManualClock::new(120_000);
        let targets = vec![TargetStatus {
            entry: RegistryEntry {
                local_port: Some(41000),
                tunnel_pid: Some(99),
                last_used: Some(60_000),
                starred: Some(true),
                ..RegistryEntry::new("me@box:2222")
            },
            daemon: Some(DaemonStatus::Running { pid: 7 }),
            tunnel_alive: true,
        }];
        let table = format_targets(&targets, &clock);
        assert!(table.contains("me@box:2222"));
        assert!(table.contains("41000"));
        assert!(table.contains("up (pid 99)"));
        assert!(table.contains("running"));
        assert!(table.contains("1m ago"));

        assert!(format_targets(&[], &clock).contains("No ssh targets"));
    }

    #[test]
    fn test_format_sessions() {
        let clock = ManualClock::new(0);
        let mut labels = BTreeMap::new();
        labels.insert("env".to_string(), "prod".to_string());
        let session = SyncSessionRow {
            id: 3,
            name: "docs".to_string(),
            alpha: Endpoint::local("/a"),
            beta: Endpoint::parse("box:/b").unwrap(),
            prefer: Prefer::Alpha,
            desired_state: DesiredState::Running,
            actual_state: ActualState::Error,
            scheduler_pid: None,
            ignore_rules: vec![],
            merge_strategy: None,
            labels,
            last_heartbeat: None,
            created_at: 0,
        };
        let table = format_sessions(std::slice::from_ref(&session), &clock, true);
        assert!(table.contains("docs"));
        assert!(table.contains("box:/b"));
        assert!(table.contains("error"));
        assert!(table.contains("env=prod"));

        let detail = format_session_detail(&session, &clock);
        assert!(detail.contains("desired running, actual error"));
        assert!(detail.contains("Last heartbeat: never"));
    }
}
