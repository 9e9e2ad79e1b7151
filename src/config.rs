//! Builder and transport configuration.
//!
//! The on-disk form ([`ConfigFile`] / [`LxdSettings`]) is plain TOML with every
//! field except the API URL defaulted. [`LxdConfig`] is the validated form the
//! rest of the crate consumes: URLs are parsed and timing values are
//! [`Duration`]s.
//!
//! ```toml
//! [lxd]
//! api = "https://lxd.example.com:8443"
//! verify_ssl = false
//! instance_name = "ci-build"
//!
//! [lxd.timing]
//! poll_attempts = 29
//! poll_interval_secs = 2
//! ```

use crate::env;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Configuration errors. All of them are fatal at construction time.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No API endpoint configured
    #[error("the LXD API URL must be provided")]
    MissingApiUrl,

    /// A URL setting could not be parsed
    #[error("Invalid URL for '{field}': {source}")]
    InvalidUrl {
        field: &'static str,
        #[source]
        source: url::ParseError,
    },

    /// A URL setting uses a scheme the client cannot speak
    #[error("Unsupported scheme '{scheme}' for '{field}' (expected http or https)")]
    UnsupportedScheme { field: &'static str, scheme: String },

    /// A value is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// Configuration file could not be read
    #[error("Failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid TOML for this schema
    #[error("Failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Top-level configuration file layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    /// LXD builder and transport settings
    #[serde(default)]
    pub lxd: LxdSettings,
}

/// LXD settings as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LxdSettings {
    /// LXD API endpoint (required)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,

    /// Verify the server's TLS certificate (default: false)
    #[serde(default)]
    pub verify_ssl: bool,

    /// Client certificate presented to the API
    #[serde(default = "default_client_cert")]
    pub client_cert: PathBuf,

    /// Client private key presented to the API
    #[serde(default = "default_client_key")]
    pub client_key: PathBuf,

    /// Image server used when an image alias is not cached on the LXD host
    #[serde(default = "default_image_server")]
    pub image_server: String,

    /// Protocol spoken by the image server
    #[serde(default = "default_image_protocol")]
    pub image_protocol: String,

    /// Prefix for generated container names
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Distribution used when a request names no OS
    #[serde(default = "default_distro")]
    pub default_distro: String,

    /// Release used when a request names no OS
    #[serde(default = "default_release")]
    pub default_release: String,

    /// Polling, readiness and deadline settings
    #[serde(default)]
    pub timing: TimingSettings,
}

fn default_client_cert() -> PathBuf {
    PathBuf::from(env::lxd::DEFAULT_CLIENT_CERT)
}

fn default_client_key() -> PathBuf {
    PathBuf::from(env::lxd::DEFAULT_CLIENT_KEY)
}

fn default_image_server() -> String {
    env::lxd::DEFAULT_IMAGE_SERVER.to_string()
}

fn default_image_protocol() -> String {
    env::lxd::DEFAULT_IMAGE_PROTOCOL.to_string()
}

fn default_instance_name() -> String {
    env::lxd::DEFAULT_INSTANCE_NAME.to_string()
}

fn default_distro() -> String {
    env::lxd::DEFAULT_DISTRO.to_string()
}

fn default_release() -> String {
    env::lxd::DEFAULT_RELEASE.to_string()
}

impl Default for LxdSettings {
    fn default() -> Self {
        Self {
            api: None,
            verify_ssl: false,
            client_cert: default_client_cert(),
            client_key: default_client_key(),
            image_server: default_image_server(),
            image_protocol: default_image_protocol(),
            instance_name: default_instance_name(),
            default_distro: default_distro(),
            default_release: default_release(),
            timing: TimingSettings::default(),
        }
    }
}

/// Timing settings in whole seconds, as written in the configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingSettings {
    /// Status polls before a state transition is considered stuck
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,

    /// Delay between status polls
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Upper bound on the post-start readiness probe
    #[serde(default = "default_readiness_timeout_secs")]
    pub readiness_timeout_secs: u64,

    /// Delay between readiness probe attempts
    #[serde(default = "default_readiness_interval_secs")]
    pub readiness_interval_secs: u64,

    /// Deadline for a single exec call (0 disables the deadline)
    #[serde(default = "default_exec_timeout_secs")]
    pub exec_timeout_secs: u64,

    /// Server-side wait applied to background API operations
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
}

fn default_poll_attempts() -> u32 {
    29
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_readiness_timeout_secs() -> u64 {
    30
}

fn default_readiness_interval_secs() -> u64 {
    1
}

fn default_exec_timeout_secs() -> u64 {
    3600
}

fn default_operation_timeout_secs() -> u64 {
    600
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            poll_attempts: default_poll_attempts(),
            poll_interval_secs: default_poll_interval_secs(),
            readiness_timeout_secs: default_readiness_timeout_secs(),
            readiness_interval_secs: default_readiness_interval_secs(),
            exec_timeout_secs: default_exec_timeout_secs(),
            operation_timeout_secs: default_operation_timeout_secs(),
        }
    }
}

/// Validated timing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub poll_attempts: u32,
    pub poll_interval: Duration,
    pub readiness_timeout: Duration,
    pub readiness_interval: Duration,
    /// `None` means an exec call may run forever
    pub exec_timeout: Option<Duration>,
    pub operation_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            poll_attempts: default_poll_attempts(),
            poll_interval: Duration::from_secs(default_poll_interval_secs()),
            readiness_timeout: Duration::from_secs(default_readiness_timeout_secs()),
            readiness_interval: Duration::from_secs(default_readiness_interval_secs()),
            exec_timeout: Some(Duration::from_secs(default_exec_timeout_secs())),
            operation_timeout: Duration::from_secs(default_operation_timeout_secs()),
        }
    }
}

impl Timing {
    fn from_settings(settings: &TimingSettings) -> Result<Self, ConfigError> {
        if settings.poll_attempts == 0 {
            return Err(ConfigError::Invalid(
                "timing.poll_attempts must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            poll_attempts: settings.poll_attempts,
            poll_interval: Duration::from_secs(settings.poll_interval_secs),
            readiness_timeout: Duration::from_secs(settings.readiness_timeout_secs),
            readiness_interval: Duration::from_secs(settings.readiness_interval_secs),
            exec_timeout: match settings.exec_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            operation_timeout: Duration::from_secs(settings.operation_timeout_secs),
        })
    }
}

/// Validated LXD configuration shared by the builder and the transport.
#[derive(Debug, Clone)]
pub struct LxdConfig {
    /// LXD API endpoint
    pub api: Url,
    /// Verify the server's TLS certificate
    pub verify_ssl: bool,
    /// Client certificate presented to the API
    pub client_cert: PathBuf,
    /// Client private key presented to the API
    pub client_key: PathBuf,
    /// Image server for cache misses
    pub image_server: Url,
    /// Protocol spoken by the image server
    pub image_protocol: String,
    /// Prefix for generated container names
    pub instance_name: String,
    /// Distribution used when a request names no OS
    pub default_distro: String,
    /// Release used when a request names no OS
    pub default_release: String,
    /// Polling and deadline settings
    pub timing: Timing,
}

impl LxdConfig {
    /// Create a configuration for the given endpoint with every other setting
    /// defaulted.
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint is not an http(s) URL.
    pub fn new(api: &str) -> Result<Self, ConfigError> {
        Self::from_settings(LxdSettings {
            api: Some(api.to_string()),
            ..LxdSettings::default()
        })
    }

    /// Validate file settings into a usable configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingApiUrl`] when no endpoint is set, or a
    /// validation error for malformed values.
    pub fn from_settings(settings: LxdSettings) -> Result<Self, ConfigError> {
        let api = settings
            .api
            .as_deref()
            .map(str::trim)
            .filter(|api| !api.is_empty())
            .ok_or(ConfigError::MissingApiUrl)?;

        let api = parse_http_url("api", api)?;
        let image_server = parse_http_url("image_server", &settings.image_server)?;

        if settings.instance_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "instance_name must not be empty".to_string(),
            ));
        }

        Ok(Self {
            api,
            verify_ssl: settings.verify_ssl,
            client_cert: settings.client_cert,
            client_key: settings.client_key,
            image_server,
            image_protocol: settings.image_protocol,
            instance_name: settings.instance_name,
            default_distro: settings.default_distro,
            default_release: settings.default_release,
            timing: Timing::from_settings(&settings.timing)?,
        })
    }

    /// Parse configuration from a TOML document with an `[lxd]` table.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Self::from_toml_str_at(content, Path::new("<inline>"))
    }

    /// Load configuration from a TOML file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str_at(&content, path)
    }

    fn from_toml_str_at(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_settings(file.lxd)
    }
}

fn parse_http_url(field: &'static str, raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|source| ConfigError::InvalidUrl { field, source })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(ConfigError::UnsupportedScheme {
            field,
            scheme: scheme.to_string(),
        }),
    }
}
