//! cp-core: Core abstractions and configuration for cocalc-plus remote sessions
//!
//! This crate provides the shared building blocks used by the remote
//! orchestrator, the sync reconciler, and the CLI: target parsing, SSH
//! argument construction, shell quoting, per-target state paths, process
//! liveness helpers, polling, TTL caching and configuration.

pub mod cache;
pub mod config;
pub mod error;
pub mod paths;
pub mod poll;
pub mod process;
pub mod selector;
pub mod shell;
pub mod target;
pub mod time;
pub mod token;

pub use error::{ConfigError, CpError, RemoteError, StoreError};
pub use target::{SshOptions, Target};
pub use time::{Clock, SystemClock};
