//! cp-sync: Sync sessions and standalone port forwards
//!
//! Rows live in a SQLite [`SessionStore`]. Each row carries an operator
//! `desired_state` and an observed `actual_state`; the [`Reconciler`] starts
//! and stops one child per row (a sync scheduler or an `ssh -N -L` monitor)
//! until the two agree.

pub mod error;
pub mod reconcile;
pub mod scheduler;
pub mod store;
pub mod types;

pub use error::SyncError;
pub use reconcile::{ReconcileAction, Reconciler};
pub use store::SessionStore;
pub use types::{
    ActualState, DesiredState, Endpoint, ForwardRow, NewForward, NewSession, Prefer, SessionPatch, SyncSessionRow,
};
