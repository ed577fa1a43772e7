//! CLI command implementations

mod config;
mod forward;
mod ssh;
mod sync;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};

use cp_core::config::{self as core_config, ConfigFile};
use cp_core::paths::StatePaths;
use cp_remote::{Orchestrator, TokioLauncher};
use cp_sync::{ReconcileAction, Reconciler, SessionStore};

use crate::output::{print_success, print_warning};

pub use config::{config_get, config_init, config_path, config_set, config_show};
pub use forward::{forward_create, forward_list, forward_remove, forward_set_state, ForwardCreateArgs};
pub use ssh::{
    ssh_connect, ssh_forget, ssh_list, ssh_star, ssh_status, ssh_stop, ssh_upgrades, ConnectArgs,
};
pub use sync::{
    sync_create, sync_edit, sync_list, sync_remove, sync_set_state, sync_status, SyncCreateArgs,
    SyncEditArgs,
};

/// Settings shared by every command
pub struct Context {
    pub config: ConfigFile,
    pub config_path: Option<PathBuf>,
    pub paths: StatePaths,
}

impl Context {
    /// Load the config file (or defaults) and resolve the data directory
    pub fn load(config_path: Option<PathBuf>, data_dir: Option<PathBuf>) -> Result<Self> {
        let config = core_config::load_or_default(config_path.as_deref())
            .context("Failed to load configuration")?;
        let paths = data_dir.map(StatePaths::new).unwrap_or_default();
        tracing::debug!("Data directory: {:?}", paths.root());
        Ok(Self {
            config,
            config_path,
            paths,
        })
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(&self.config, self.paths.clone())
    }

    /// Open the session database and build a reconciler over it
    pub fn reconciler(&self) -> Result<Reconciler> {
        let db = self
            .config
            .sync
            .db_path
            .clone()
            .unwrap_or_else(|| self.paths.sync_db());
        let store = SessionStore::open(&db)
            .with_context(|| format!("Failed to open session database {:?}", db))?;
        Ok(Reconciler::new(
            Arc::new(store),
            &self.config,
            self.paths.clone(),
            Arc::new(TokioLauncher),
        ))
    }
}

/// Report what a reconcile pass did to one row
fn report_action(what: &str, action: &ReconcileAction) {
    match action {
        ReconcileAction::Failed { .. } => print_warning(&format!("{}: {}", what, action)),
        ReconcileAction::Unchanged | ReconcileAction::Running { .. } => {
            tracing::info!("{}: {}", what, action)
        }
        _ => print_success(&format!("{}: {}", what, action)),
    }
}
