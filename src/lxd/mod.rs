//! LXD remote API layer.
//!
//! This module defines the contract the provisioning core consumes from the
//! LXD REST API and provides the production implementations of it.
//!
//! ## Architecture
//!
//! - [`LxdApi`]: the REST operations the builder and transport need, as an
//!   object-safe async trait so tests can substitute an in-memory server
//! - [`client`]: [`LxdClient`], a `reqwest` implementation of [`LxdApi`]
//! - [`channel`]: [`ChannelConnector`] / [`ExecChannel`], the live output stream
//!   of an interactive exec, with a WebSocket implementation
//!
//! ## Usage
//!
//! ```rust,no_run
//! use lxd_buildhost::config::LxdConfig;
//! use lxd_buildhost::lxd::{LxdApi, LxdClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = LxdConfig::new("https://lxd.example.com:8443")?;
//!     let client = LxdClient::from_config(&config)?;
//!
//!     let alias = client.image_by_alias("ubuntu/jammy").await?;
//!     println!("fingerprint: {}", alias.target);
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod client;

pub use channel::{ChannelConnector, ChannelEvent, ExecChannel, WebSocketConnector};
pub use client::LxdClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use url::Url;

/// LXD API errors.
#[derive(Debug, thiserror::Error)]
pub enum LxdError {
    /// Requested object does not exist (HTTP 404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Server rejected the request
    #[error("LXD API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Background operation finished unsuccessfully
    #[error("Operation {id} failed: {message}")]
    OperationFailed { id: String, message: String },

    /// API URL cannot have REST paths appended to it
    #[error("Invalid API endpoint: {0}")]
    InvalidEndpoint(String),

    /// Response did not have the expected shape
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// TLS setup error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Client certificate or key cannot be parsed
    #[error("Invalid client identity {path:?}: {message}")]
    Identity { path: PathBuf, message: String },

    /// URL construction error
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// JSON decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LxdError {
    /// Whether the error means the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, LxdError::NotFound(_))
    }
}

/// Result type for LXD API operations.
pub type Result<T> = std::result::Result<T, LxdError>;

/// An image alias entry from the server's alias index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAlias {
    /// Alias name, e.g. `ubuntu/trusty`
    pub name: String,
    /// Fingerprint of the image the alias points at
    pub target: String,
}

/// An image present on the LXD host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Content fingerprint
    pub fingerprint: String,
}

/// Remote image server an image can be fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSource {
    /// Server URL
    pub server: Url,
    /// Protocol spoken by the server (`simplestreams` or `lxd`)
    pub protocol: String,
}

/// Container status as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Stopped,
    Frozen,
    /// Any status this crate does not act on (`Starting`, `Error`, ...)
    Other(String),
}

impl ContainerStatus {
    /// Parse the server's status string.
    pub fn parse(status: &str) -> Self {
        match status {
            "Running" => ContainerStatus::Running,
            "Stopped" => ContainerStatus::Stopped,
            "Frozen" => ContainerStatus::Frozen,
            other => ContainerStatus::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Running => write!(f, "Running"),
            ContainerStatus::Stopped => write!(f, "Stopped"),
            ContainerStatus::Frozen => write!(f, "Frozen"),
            ContainerStatus::Other(status) => write!(f, "{}", status),
        }
    }
}

/// A command execution request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    /// Argument vector
    pub command: Vec<String>,
    /// Environment exported to the process
    pub environment: HashMap<String, String>,
    /// Allocate a terminal and merge stdout/stderr into one stream
    pub interactive: bool,
    /// Hold the process until a stream channel connects
    pub wait_for_websocket: bool,
}

impl ExecRequest {
    /// An interactive request whose output is read over a stream channel.
    pub fn streaming(command: Vec<String>, environment: HashMap<String, String>) -> Self {
        Self {
            command,
            environment,
            interactive: true,
            wait_for_websocket: true,
        }
    }

    /// A request that runs without any attached stream.
    pub fn detached(command: Vec<String>) -> Self {
        Self {
            command,
            environment: HashMap::new(),
            interactive: false,
            wait_for_websocket: false,
        }
    }
}

/// Handle to a submitted execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecHandle {
    /// Background operation id
    pub operation_id: String,
    /// Access secret of the combined I/O stream (fd 0 in interactive mode)
    pub stream_secret: Option<String>,
}

/// Final status of a background operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationStatus {
    /// Operation state, e.g. `Success`, `Failure`, `Running`
    pub status: String,
    /// Process exit code for exec operations
    pub exit_code: Option<i64>,
    /// Terminating signal for exec operations, when reported
    pub exit_signal: Option<i64>,
}

/// Operations the provisioning core consumes from the LXD API.
///
/// Implementations must be safe for concurrent use by independent build
/// sessions.
#[async_trait]
pub trait LxdApi: Send + Sync {
    /// API endpoint, used to derive stream channel URLs.
    fn base_url(&self) -> &Url;

    /// Look up an image alias. Fails with [`LxdError::NotFound`] when the
    /// alias is not registered.
    async fn image_by_alias(&self, alias: &str) -> Result<ImageAlias>;

    /// Fetch an image from a remote image server onto the LXD host.
    async fn create_image_from_remote(&self, source: &ImageSource, alias: &str)
    -> Result<ImageInfo>;

    /// Point an alias at an image. An existing alias is retargeted.
    async fn create_image_alias(&self, fingerprint: &str, alias: &str) -> Result<()>;

    /// Create a container from an image.
    async fn create_container(&self, name: &str, fingerprint: &str) -> Result<()>;

    /// Start a container.
    async fn start_container(&self, name: &str) -> Result<()>;

    /// Stop a container.
    async fn stop_container(&self, name: &str) -> Result<()>;

    /// Delete a stopped container.
    async fn delete_container(&self, name: &str) -> Result<()>;

    /// Current status of a container.
    async fn container_status(&self, name: &str) -> Result<ContainerStatus>;

    /// Submit a command for asynchronous execution.
    async fn execute_command(&self, name: &str, request: &ExecRequest) -> Result<ExecHandle>;

    /// Final status of an operation, waiting for it to settle.
    async fn operation_status(&self, operation_id: &str) -> Result<OperationStatus>;

    /// Write a file inside a container.
    async fn push_file(&self, name: &str, path: &str, data: Vec<u8>) -> Result<()>;

    /// Read a file from inside a container.
    async fn pull_file(&self, name: &str, path: &str) -> Result<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_status_parse() {
        assert_eq!(ContainerStatus::parse("Running"), ContainerStatus::Running);
        assert_eq!(ContainerStatus::parse("Stopped"), ContainerStatus::Stopped);
        assert_eq!(ContainerStatus::parse("Frozen"), ContainerStatus::Frozen);
        assert_eq!(
            ContainerStatus::parse("Starting"),
            ContainerStatus::Other("Starting".to_string())
        );
        assert_eq!(ContainerStatus::parse("Error").to_string(), "Error");
    }

    #[test]
    fn test_exec_request_modes() {
        let streaming = ExecRequest::streaming(vec!["true".to_string()], HashMap::new());
        assert!(streaming.interactive);
        assert!(streaming.wait_for_websocket);

        let detached = ExecRequest::detached(vec!["true".to_string()]);
        assert!(!detached.interactive);
        assert!(!detached.wait_for_websocket);
    }

    #[test]
    fn test_not_found_is_distinguished() {
        assert!(LxdError::NotFound("ubuntu/trusty".to_string()).is_not_found());
        assert!(
            !LxdError::Api {
                status: 500,
                message: "boom".to_string()
            }
            .is_not_found()
        );
    }
}
