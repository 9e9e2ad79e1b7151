//! Ephemeral build host provisioning.
//!
//! A build host is a single LXD container created from a resolved OS image,
//! confirmed running and responsive, and destroyed again when the build is
//! done.
//!
//! ## Architecture
//!
//! - [`image`]: maps an OS alias to an image fingerprint, fetching and
//!   registering the image when the LXD host does not have it yet
//! - [`lifecycle`]: creates, starts, polls, stops and deletes containers
//! - [`provisioner`]: `acquire`/`release`, tying the two together and
//!   producing the [`BuildHost`] descriptor
//!
//! ## Usage
//!
//! ```rust,no_run
//! use lxd_buildhost::builder::{BuildRequest, Provisioner};
//! use lxd_buildhost::config::LxdConfig;
//! use lxd_buildhost::lxd::LxdClient;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = LxdConfig::new("https://lxd.example.com:8443")?;
//!     let client = Arc::new(LxdClient::from_config(&config)?);
//!     let provisioner = Provisioner::new(client, &config);
//!
//!     let host = provisioner
//!         .acquire(&BuildRequest::with_os("ubuntu_jammy"))
//!         .await?;
//!     println!("build host {} ready", host.name);
//!
//!     provisioner.release(&host).await;
//!     Ok(())
//! }
//! ```

pub mod image;
pub mod lifecycle;
pub mod provisioner;

pub use image::{ImageReference, ImageResolver, ResolutionError};
pub use lifecycle::{
    Container, ContainerLifecycleManager, ContainerState, LifecycleConfig, LifecycleError,
};
pub use provisioner::Provisioner;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// `<distro>_<release>`, the distro taking the longest word prefix.
static OS_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\w+)_(.+)$").expect("OS pattern is a valid regex"));

/// A request for a build host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Requested OS as `<distro>_<release>`, e.g. `ubuntu_jammy`
    pub os: Option<String>,
}

impl BuildRequest {
    /// Request a host running the configured default OS.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a host running a specific OS.
    pub fn with_os(os: impl Into<String>) -> Self {
        Self { os: Some(os.into()) }
    }
}

/// Descriptor of an acquired build host.
///
/// Everything a transport needs to reach the host, and everything
/// [`Provisioner::release`] needs to destroy it. Releasing the same
/// descriptor twice is not supported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildHost {
    /// Address of the host, the container name on the LXD server
    pub host: String,
    /// Container name
    pub name: String,
    /// User commands run as
    pub username: String,
    /// Working directory for builds
    pub workspace: String,
    pub distro: String,
    pub release: String,
    /// Transports that can reach this host
    pub transports: Vec<String>,
    /// When the host was confirmed ready
    pub acquired_at: DateTime<Utc>,
}

/// Split an OS specifier into distro and release.
///
/// Anything that does not look like `<distro>_<release>` falls back to the
/// given defaults.
pub fn parse_os(os: Option<&str>, default_distro: &str, default_release: &str) -> (String, String) {
    os.and_then(|os| OS_PATTERN.captures(os))
        .map(|captures| (captures[1].to_string(), captures[2].to_string()))
        .unwrap_or_else(|| (default_distro.to_string(), default_release.to_string()))
}

/// Errors that fail an acquisition.
#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    /// The requested image could neither be found nor fetched
    #[error("Image resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    /// The container could not be created or brought up
    #[error("Container lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
}

impl AcquisitionError {
    /// Whether the acquisition gave up waiting for the container.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            AcquisitionError::Lifecycle(LifecycleError::Timeout { .. })
                | AcquisitionError::Lifecycle(LifecycleError::NotReady { .. })
        )
    }

    /// Whether the acquisition was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            AcquisitionError::Lifecycle(LifecycleError::Cancelled { .. })
        )
    }
}

/// Teardown step that failed during release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownStage {
    Stop,
    WaitStopped,
    Delete,
}

impl fmt::Display for TeardownStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownStage::Stop => write!(f, "stop"),
            TeardownStage::WaitStopped => write!(f, "wait for stopped"),
            TeardownStage::Delete => write!(f, "delete"),
        }
    }
}

/// A failed release.
#[derive(Debug, thiserror::Error)]
#[error("Teardown of {host} failed at {stage}: {source}")]
pub struct TeardownError {
    pub host: String,
    pub stage: TeardownStage,
    #[source]
    pub source: LifecycleError,
}

/// Result of [`Provisioner::release`].
#[derive(Debug)]
pub enum ReleaseOutcome {
    /// The container was stopped and deleted
    Released,
    /// Teardown stopped at the named stage. The container may still exist.
    Failed(TeardownError),
}

impl ReleaseOutcome {
    pub fn is_released(&self) -> bool {
        matches!(self, ReleaseOutcome::Released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_os() {
        assert_eq!(
            parse_os(Some("example_test"), "ubuntu", "trusty"),
            ("example".to_string(), "test".to_string())
        );
        assert_eq!(
            parse_os(Some("ubuntu_jammy"), "ubuntu", "trusty"),
            ("ubuntu".to_string(), "jammy".to_string())
        );
    }

    #[test]
    fn test_parse_os_distro_takes_longest_prefix() {
        assert_eq!(
            parse_os(Some("open_suse_15.4"), "ubuntu", "trusty"),
            ("open_suse".to_string(), "15.4".to_string())
        );
    }

    #[test]
    fn test_parse_os_defaults() {
        let defaults = ("ubuntu".to_string(), "trusty".to_string());
        assert_eq!(parse_os(None, "ubuntu", "trusty"), defaults);
        assert_eq!(parse_os(Some("debian"), "ubuntu", "trusty"), defaults);
        assert_eq!(parse_os(Some("_x"), "ubuntu", "trusty"), defaults);
        assert_eq!(parse_os(Some("centos_"), "ubuntu", "trusty"), defaults);
    }

    #[test]
    fn test_build_host_json_round_trip() {
        let host = BuildHost {
            host: "lxd-build-0a1b".to_string(),
            name: "lxd-build-0a1b".to_string(),
            username: "root".to_string(),
            workspace: "/root".to_string(),
            distro: "ubuntu".to_string(),
            release: "jammy".to_string(),
            transports: vec!["lxdapi".to_string()],
            acquired_at: Utc::now(),
        };

        let json = serde_json::to_string(&host).unwrap();
        let parsed: BuildHost = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, host);
    }

    #[test]
    fn test_teardown_error_names_stage() {
        let error = TeardownError {
            host: "lxd-build-1".to_string(),
            stage: TeardownStage::WaitStopped,
            source: LifecycleError::Cancelled {
                name: "lxd-build-1".to_string(),
            },
        };
        assert!(error.to_string().contains("wait for stopped"));
        assert!(!ReleaseOutcome::Failed(error).is_released());
        assert!(ReleaseOutcome::Released.is_released());
    }
}
