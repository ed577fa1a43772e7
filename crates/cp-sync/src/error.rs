//! Errors raised while reconciling sessions and forwards

use std::path::PathBuf;

use thiserror::Error;

use cp_core::error::{RemoteError, StoreError};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// A local root could not be created
    #[error("Failed to create {path:?}: {source}")]
    Provision {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The child program could not be started at all
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The child exited inside the startup grace window
    #[error("{what} exited during startup (exit code {code:?})")]
    EarlyExit { what: String, code: Option<i32> },

    /// SIGTERM and SIGKILL both failed to remove the process
    #[error("Process {pid} is still running after SIGKILL")]
    StopFailed { pid: u32 },
}
