//! `ssh` command implementations

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use tokio_util::sync::CancellationToken;

use cp_core::{SshOptions, SystemClock, Target};
use cp_remote::{ConnectOptions, DaemonStatus, Orchestrator, PortChoice};

use super::Context;
use crate::output::{
    format_connect, format_targets, format_upgrades, print_error, print_info, print_success,
    print_warning,
};

/// Flags for `ssh <target>`
#[derive(Debug, Clone, Default)]
pub struct ConnectArgs {
    pub target: String,
    pub local_port: PortChoice,
    pub remote_port: PortChoice,
    pub no_open: bool,
    pub no_install: bool,
    pub upgrade: bool,
    pub forward_only: bool,
    pub identity: Option<PathBuf>,
    pub proxy_jump: Option<String>,
    pub ssh_args: Vec<String>,
}

/// Ssh options for a target: explicit flags win, then whatever was recorded
/// the last time we connected
fn resolve_options(
    orchestrator: &Orchestrator,
    target: &str,
    identity: Option<PathBuf>,
    proxy_jump: Option<String>,
    ssh_args: Vec<String>,
) -> Result<SshOptions> {
    let recorded = match orchestrator.registry().get(target)? {
        Some(entry) => Orchestrator::options_for(&entry)?,
        None => SshOptions::new(Target::parse(target)?),
    };
    Ok(SshOptions {
        identity: identity.or(recorded.identity),
        proxy_jump: proxy_jump.or(recorded.proxy_jump),
        extra_args: if ssh_args.is_empty() {
            recorded.extra_args
        } else {
            ssh_args
        },
        target: recorded.target,
    })
}

/// Start (or reuse) the remote daemon, forward a local port to it and keep
/// the tunnel open until interrupted
pub async fn ssh_connect(ctx: &Context, args: ConnectArgs, cancel: CancellationToken) -> Result<()> {
    let orchestrator = ctx.orchestrator();
    let opts = resolve_options(
        &orchestrator,
        &args.target,
        args.identity,
        args.proxy_jump,
        args.ssh_args,
    )?;
    let options = ConnectOptions {
        local_port: args.local_port,
        remote_port: args.remote_port,
        install: !args.no_install,
        upgrade: args.upgrade,
        forward_only: args.forward_only,
        wait_ready: None,
    };

    if !args.forward_only {
        print_info(&format!("Connecting to {}...", opts.target.as_str()));
    }
    let outcome = orchestrator.connect(&opts, &options).await?;

    if outcome.started_daemon {
        print_success(&format!("Started daemon on {}", outcome.target));
    }
    print!("{}", format_connect(&outcome));

    if !args.no_open {
        open_browser(&outcome.url);
    }

    if outcome.reused_tunnel {
        print_info(&format!(
            "Tunnel is held by an earlier session (pid {}); use 'cocalc-plus ssh stop {}' to close it",
            outcome.tunnel_pid, outcome.target
        ));
        return Ok(());
    }

    print_info("Press Ctrl+C to close the tunnel");
    tokio::select! {
        _ = cancel.cancelled() => {
            tracing::info!("Closing tunnel to {}", outcome.target);
        }
        exit = orchestrator.wait_tunnel(&outcome.target) => {
            let code = exit.and_then(|e| e.code);
            print_warning(&format!("Tunnel to {} exited (code {:?})", outcome.target, code));
        }
    }
    orchestrator.shutdown().await;
    Ok(())
}

/// Best-effort: open `url` with the platform opener
fn open_browser(url: &str) {
    let opener = if cfg!(target_os = "macos") {
        "open"
    } else {
        "xdg-open"
    };
    let spawned = std::process::Command::new(opener)
        .arg(url)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn();
    if let Err(e) = spawned {
        tracing::debug!("Could not run {}: {}", opener, e);
        print_info(&format!("Open {} in your browser", url));
    }
}

/// Registered targets, optionally with a (cached) daemon status for each
pub async fn ssh_list(ctx: &Context, offline: bool, force: bool) -> Result<()> {
    let orchestrator = ctx.orchestrator();
    let rows = if offline {
        orchestrator.list()?
    } else {
        orchestrator.list_with_status(force).await?
    };
    println!("{}", format_targets(&rows, &SystemClock));
    Ok(())
}

/// Daemon status on one target
pub async fn ssh_status(ctx: &Context, target: &str, force: bool) -> Result<()> {
    let orchestrator = ctx.orchestrator();
    let opts = resolve_options(&orchestrator, target, None, None, Vec::new())?;
    match orchestrator.status(&opts, force).await? {
        DaemonStatus::Running { pid } => print_success(&format!("{}: daemon running (pid {})", target, pid)),
        DaemonStatus::Stopped => print_warning(&format!("{}: daemon stopped", target)),
        DaemonStatus::Unreachable { message } => {
            print_error(&format!("{}: unreachable: {}", target, message))
        }
    }

    if let Some(entry) = orchestrator.registry().get(opts.target.as_str())? {
        if let (Some(local), Some(remote)) = (entry.local_port, entry.remote_port) {
            println!("Forward: 127.0.0.1:{} -> remote 127.0.0.1:{}", local, remote);
        }
    }
    Ok(())
}

/// Close the tunnel and stop the remote daemon
pub async fn ssh_stop(ctx: &Context, target: &str) -> Result<()> {
    let orchestrator = ctx.orchestrator();
    let opts = resolve_options(&orchestrator, target, None, None, Vec::new())?;
    let outcome = orchestrator.stop(&opts).await?;

    if outcome.tunnel_stopped {
        print_success("Tunnel closed");
    }
    match outcome.daemon_stopped {
        Some(true) => print_success(&format!("Stopped daemon on {}", target)),
        Some(false) => print_info(&format!("Daemon on {} was not running", target)),
        None => print_warning(&format!("Could not reach {}; daemon may still be running", target)),
    }
    Ok(())
}

/// Stop the tunnel and drop the target from the registry
pub async fn ssh_forget(ctx: &Context, target: &str) -> Result<()> {
    if ctx.orchestrator().forget(target).await? {
        print_success(&format!("Forgot {}", target));
    } else {
        print_warning(&format!("{} is not registered", target));
    }
    Ok(())
}

pub fn ssh_star(ctx: &Context, target: &str, starred: bool) -> Result<()> {
    match ctx.orchestrator().star(target, starred)? {
        Some(_) if starred => print_success(&format!("Starred {}", target)),
        Some(_) => print_success(&format!("Unstarred {}", target)),
        None => anyhow::bail!("{} is not registered", target),
    }
    Ok(())
}

/// Installed vs published version for every registered target
pub async fn ssh_upgrades(ctx: &Context, force: bool) -> Result<()> {
    let orchestrator = ctx.orchestrator();
    let targets: Vec<String> = orchestrator
        .list()?
        .into_iter()
        .map(|row| row.entry.target)
        .collect();
    let results = orchestrator
        .check_upgrades(force)
        .await
        .context("Failed to check for upgrades")?;

    let rows: Vec<(String, Result<_, String>)> = targets
        .into_iter()
        .zip(results)
        .map(|(target, result)| (target, result.map_err(|e| e.to_string())))
        .collect();
    println!("{}", format_upgrades(&rows));

    let available = rows
        .iter()
        .filter(|(_, r)| matches!(r, Ok(info) if info.upgrade_available))
        .count();
    if available > 0 {
        print_info("Run 'cocalc-plus ssh <target> --upgrade' to upgrade");
    }
    Ok(())
}
