//! cocalc-plus CLI library
//!
//! Command implementations and output formatting shared by the
//! `cocalc-plus` binary.

pub mod commands;
pub mod output;
