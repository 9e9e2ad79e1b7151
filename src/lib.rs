//! # LXD Build Host
//!
//! Ephemeral LXD containers as isolated CI build hosts, with remote command
//! execution that streams live, sanitized output into a build log.
//!
//! ## Architecture Overview
//!
//! The system consists of several key components organized into modules:
//!
//! - **[`lxd`]**: LXD REST API client and the WebSocket output channel, behind
//!   the [`lxd::LxdApi`] and [`lxd::ChannelConnector`] traits
//! - **[`builder`]**: image resolution, container lifecycle and the
//!   acquire/release provisioner
//! - **[`transport`]**: command execution with live output streaming
//! - **[`config`]**: TOML configuration and validation
//!
//! ## Features
//!
//! ### Build Hosts
//! - **Image Resolution**: local alias lookup first, fetch and register from an
//!   image server otherwise, single-flight per alias
//! - **Confirmed Startup**: containers are polled until running and probed
//!   until they execute commands
//! - **Rollback**: a failed acquisition removes the container it created
//! - **Structured Release**: teardown failures are reported, never raised
//!
//! ### Execution
//! - **Live Output**: combined stdout/stderr streamed over a WebSocket
//! - **Clean Logs**: `\r` normalization and ANSI/XTerm escape removal,
//!   correct across chunk boundaries
//! - **Deadlines and Cancellation**: per-command timeout and cancellation token
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lxd_buildhost::builder::{BuildRequest, Provisioner};
//! use lxd_buildhost::config::LxdConfig;
//! use lxd_buildhost::lxd::{LxdClient, WebSocketConnector};
//! use lxd_buildhost::transport::{LogSink, LxdTransport};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = LxdConfig::from_toml_file("lxd-buildhost.toml")?;
//!     let client = Arc::new(LxdClient::from_config(&config)?);
//!     let connector = Arc::new(WebSocketConnector::from_config(&config)?);
//!
//!     let provisioner = Provisioner::new(client.clone(), &config);
//!     let host = provisioner.acquire(&BuildRequest::with_os("ubuntu_jammy")).await?;
//!
//!     let log: LogSink = Arc::new(tokio::sync::Mutex::new(tokio::io::stdout()));
//!     let mut transport = LxdTransport::new(client, connector, &host, log)
//!         .with_exec_timeout(config.timing.exec_timeout);
//!     transport.exec("uname -a", None).await?;
//!
//!     provisioner.release(&host).await;
//!     Ok(())
//! }
//! ```

/// LXD remote API client and output channel.
///
/// The REST operations and stream channel the builder and transport consume,
/// with `reqwest` and `tokio-tungstenite` implementations.
pub mod lxd;

/// Build host provisioning.
///
/// Image resolution, container lifecycle management and the provisioner
/// tying them into `acquire` / `release`.
pub mod builder;

/// Command execution transport.
pub mod transport;

/// Configuration loading and validation.
pub mod config;

/// Environment constants and path utilities.
///
/// Centralizes all hardcoded paths and directory names used throughout
/// the application for easier maintenance and consistency.
pub mod env;

// Re-export main builder types
pub use builder::{BuildHost, BuildRequest, Provisioner, ReleaseOutcome};

// Re-export main transport types
pub use transport::{ExecutionError, LogSink, LxdTransport};

pub use config::{ConfigError, LxdConfig};

// CLI module for command-line interface
pub mod cli;
