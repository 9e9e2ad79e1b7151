//! CLI-specific functionality for the LXD build host provisioner
//!
//! This module contains all CLI-related code including argument parsing
//! and configuration discovery.

pub mod args;
pub mod config;

pub use args::{Args, ExecConfig, ExecutionMode, TransferConfig};
pub use config::ConfigDiscovery;
