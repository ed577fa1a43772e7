//! `sync` command implementations
//!
//! Every command that shows sessions reconciles them first, so the table
//! reflects live scheduler processes rather than whatever was last stored.

use anyhow::{Context as _, Result};

use cp_core::selector::{parse_labels, LabelSelector};
use cp_core::SystemClock;
use cp_sync::{DesiredState, Endpoint, NewSession, Prefer, SessionPatch};

use super::{report_action, Context};
use crate::output::{format_session_detail, format_sessions, print_success, print_warning};

/// Flags for `sync create`
#[derive(Debug, Clone)]
pub struct SyncCreateArgs {
    pub name: String,
    pub alpha: String,
    pub beta: String,
    pub prefer: Prefer,
    pub ignore: Vec<String>,
    pub merge_strategy: Option<String>,
    pub labels: Vec<String>,
    /// Create the session without starting it
    pub stopped: bool,
}

/// Flags for `sync edit`
#[derive(Debug, Clone, Default)]
pub struct SyncEditArgs {
    pub name: Option<String>,
    pub prefer: Option<Prefer>,
    pub ignore: Vec<String>,
    pub clear_ignore: bool,
    pub merge_strategy: Option<String>,
    pub labels: Vec<String>,
    pub unlabel: Vec<String>,
}

impl SyncEditArgs {
    fn into_patch(self) -> Result<SessionPatch> {
        let ignore_rules = if self.clear_ignore {
            Some(Vec::new())
        } else if self.ignore.is_empty() {
            None
        } else {
            Some(self.ignore)
        };
        Ok(SessionPatch {
            name: self.name,
            prefer: self.prefer,
            ignore_rules,
            merge_strategy: self.merge_strategy,
            set_labels: parse_labels(&self.labels)?,
            remove_labels: self.unlabel,
        })
    }
}

/// Parse an endpoint; relative local roots are made absolute against the
/// current directory because the scheduler runs elsewhere
fn endpoint(raw: &str) -> Result<Endpoint> {
    let mut endpoint = Endpoint::parse(raw)?;
    if !endpoint.is_remote() && !endpoint.root.starts_with('/') && !endpoint.root.starts_with('~') {
        let cwd = std::env::current_dir().context("Failed to resolve current directory")?;
        endpoint.root = cwd.join(&endpoint.root).display().to_string();
    }
    Ok(endpoint)
}

pub async fn sync_create(ctx: &Context, args: SyncCreateArgs) -> Result<()> {
    let reconciler = ctx.reconciler()?;

    let mut new = NewSession::new(args.name, endpoint(&args.alpha)?, endpoint(&args.beta)?);
    new.prefer = args.prefer;
    new.ignore_rules = args.ignore;
    new.merge_strategy = args.merge_strategy;
    new.labels = parse_labels(&args.labels)?;
    if args.stopped {
        new.desired_state = DesiredState::Stopped;
    }

    let row = reconciler.store().create_session(&new)?;
    print_success(&format!("Created sync session {} (id {})", row.name, row.id));

    let action = reconciler.reconcile_session(&row).await?;
    report_action(&row.name, &action);
    Ok(())
}

pub async fn sync_list(ctx: &Context, selector: &[String], long: bool) -> Result<()> {
    let selector = LabelSelector::parse(selector)?;
    let reconciler = ctx.reconciler()?;

    let rows = reconciler.store().list_sessions(&selector)?;
    for (id, action) in reconciler.reconcile_sessions(&rows).await? {
        tracing::debug!(session = id, "{}", action);
    }

    let rows = reconciler.store().list_sessions(&selector)?;
    println!("{}", format_sessions(&rows, &SystemClock, long));
    Ok(())
}

pub async fn sync_status(ctx: &Context, key: &str) -> Result<()> {
    let reconciler = ctx.reconciler()?;
    let row = reconciler.store().session(key)?;
    let action = reconciler.reconcile_session(&row).await?;
    report_action(&row.name, &action);

    let row = reconciler.store().session(&row.id.to_string())?;
    print!("{}", format_session_detail(&row, &SystemClock));
    Ok(())
}

/// Update a session; a running scheduler is restarted when the change
/// affects its command line
pub async fn sync_edit(ctx: &Context, key: &str, args: SyncEditArgs) -> Result<()> {
    let patch = args.into_patch()?;
    if patch.is_empty() {
        print_warning("Nothing to change");
        return Ok(());
    }

    let reconciler = ctx.reconciler()?;
    let row = reconciler.store().session(key)?;
    let row = reconciler.store().update_session(row.id, &patch)?;
    print_success(&format!("Updated sync session {} (id {})", row.name, row.id));

    if patch.affects_scheduler() && row.desired_state == DesiredState::Running {
        let action = reconciler.restart_session(row.id).await?;
        report_action(&row.name, &action);
    }
    Ok(())
}

/// `sync start` / `sync stop`
pub async fn sync_set_state(ctx: &Context, keys: &[String], state: DesiredState) -> Result<()> {
    let reconciler = ctx.reconciler()?;
    for key in keys {
        let (row, action) = reconciler.set_session_desired(key, state).await?;
        report_action(&row.name, &action);
    }
    Ok(())
}

pub async fn sync_remove(ctx: &Context, keys: &[String]) -> Result<()> {
    let reconciler = ctx.reconciler()?;
    for key in keys {
        let row = reconciler.remove_session(key).await?;
        print_success(&format!("Removed sync session {} (id {})", row.name, row.id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_local_root_is_absolute() {
        let local = endpoint("docs").unwrap();
        assert!(local.root.starts_with('/'));
        assert!(local.root.ends_with("docs"));

        let home = endpoint("~/docs").unwrap();
        assert_eq!(home.root, "~/docs");

        let remote = endpoint("box:2222:docs").unwrap();
        assert_eq!(remote.root, "docs");
        assert_eq!(remote.port, Some(2222));
    }

    #[test]
    fn test_edit_patch() {
        let patch = SyncEditArgs {
            ignore: vec!["*.log".to_string()],
            labels: vec!["env=dev".to_string()],
            ..SyncEditArgs::default()
        }
        .into_patch()
        .unwrap();
        assert_eq!(patch.ignore_rules, Some(vec!["*.log".to_string()]));
        assert_eq!(patch.set_labels["env"], "dev");
        assert!(patch.affects_scheduler());

        let patch = SyncEditArgs {
            clear_ignore: true,
            ..SyncEditArgs::default()
        }
        .into_patch()
        .unwrap();
        assert_eq!(patch.ignore_rules, Some(Vec::new()));

        assert!(SyncEditArgs::default().into_patch().unwrap().is_empty());
        let bad = SyncEditArgs {
            labels: vec!["nolabel".to_string()],
            ..SyncEditArgs::default()
        };
        assert!(bad.into_patch().is_err());
    }
}
