//! `forward` command implementations

use anyhow::Result;

use cp_core::{SystemClock, Target};
use cp_sync::{DesiredState, NewForward};

use super::{report_action, Context};
use crate::output::{format_forwards, print_success};

/// Flags for `forward create`
#[derive(Debug, Clone)]
pub struct ForwardCreateArgs {
    pub name: String,
    pub target: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub stopped: bool,
}

pub async fn forward_create(ctx: &Context, args: ForwardCreateArgs) -> Result<()> {
    Target::parse(&args.target)?;
    let reconciler = ctx.reconciler()?;

    let row = reconciler.store().create_forward(&NewForward {
        name: args.name,
        target: args.target,
        local_port: args.local_port,
        remote_port: args.remote_port,
        desired_state: if args.stopped {
            DesiredState::Stopped
        } else {
            DesiredState::Running
        },
    })?;
    print_success(&format!(
        "Created forward {} (id {}): {} -> {}:{}",
        row.name, row.id, row.local_port, row.target, row.remote_port
    ));

    let action = reconciler.reconcile_forward(&row).await?;
    report_action(&row.name, &action);
    Ok(())
}

pub async fn forward_list(ctx: &Context) -> Result<()> {
    let reconciler = ctx.reconciler()?;

    let rows = reconciler.store().list_forwards()?;
    for (id, action) in reconciler.reconcile_forwards(&rows).await? {
        tracing::debug!(forward = id, "{}", action);
    }

    let rows = reconciler.store().list_forwards()?;
    println!("{}", format_forwards(&rows, &SystemClock));
    Ok(())
}

/// `forward start` / `forward stop`
pub async fn forward_set_state(ctx: &Context, keys: &[String], state: DesiredState) -> Result<()> {
    let reconciler = ctx.reconciler()?;
    for key in keys {
        let (row, action) = reconciler.set_forward_desired(key, state).await?;
        report_action(&row.name, &action);
    }
    Ok(())
}

pub async fn forward_remove(ctx: &Context, keys: &[String]) -> Result<()> {
    let reconciler = ctx.reconciler()?;
    for key in keys {
        let row = reconciler.remove_forward(key).await?;
        print_success(&format!("Removed forward {} (id {})", row.name, row.id));
    }
    Ok(())
}
