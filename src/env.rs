//! Environment constants and path utilities for the LXD build host provisioner.
//!
//! This module centralizes the hardcoded paths, names and remote defaults used
//! throughout the crate, making them easier to maintain and modify.

use std::path::{Path, PathBuf};

/// Main application directory name (hidden directory like .git, .vscode)
pub const APP_DIR_NAME: &str = ".lxd-buildhost";

/// Configuration file name inside the application directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration file name when placed directly in a working directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "lxd-buildhost.toml";

/// System-wide configuration directory (Unix-like systems)
pub const SYSTEM_CONFIG_DIR: &str = "/etc/lxd-buildhost";

/// Remote LXD defaults
pub mod lxd {
    /// Default client certificate presented to the LXD API
    pub const DEFAULT_CLIENT_CERT: &str = "/etc/lxd-buildhost/lxd_client.crt";

    /// Default client key presented to the LXD API
    pub const DEFAULT_CLIENT_KEY: &str = "/etc/lxd-buildhost/lxd_client.key";

    /// Public image server images are fetched from when not cached locally
    pub const DEFAULT_IMAGE_SERVER: &str = "https://images.linuxcontainers.org:8443";

    /// Protocol spoken by the image server
    pub const DEFAULT_IMAGE_PROTOCOL: &str = "simplestreams";

    /// Prefix for generated container names
    pub const DEFAULT_INSTANCE_NAME: &str = "lxd-build";

    /// Distribution used when a build request names no OS
    pub const DEFAULT_DISTRO: &str = "ubuntu";

    /// Release used when a build request names no OS
    pub const DEFAULT_RELEASE: &str = "trusty";

    /// API version prefix for every REST path
    pub const API_VERSION: &str = "1.0";
}

/// Build host defaults
pub mod host {
    /// Only transport a build host accepts
    pub const TRANSPORT_KIND: &str = "lxdapi";

    /// User commands run as inside the container
    pub const USERNAME: &str = "root";

    /// Workspace directory inside the container
    pub const WORKSPACE: &str = "/root";

    /// Terminal type exported into every exec session
    pub const TERM: &str = "xterm-mono";
}

/// Build config directory path in user's home directory
pub fn user_config_dir_path(home_dir: &Path) -> PathBuf {
    home_dir.join(APP_DIR_NAME)
}

/// Build config file path in user's home directory
pub fn user_config_file_path(home_dir: &Path) -> PathBuf {
    user_config_dir_path(home_dir).join(CONFIG_FILE_NAME)
}

/// Build local config file path in current directory
pub fn local_config_file_path(current_dir: &Path) -> PathBuf {
    current_dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME)
}

/// Build the system-wide config file path
pub fn system_config_file_path() -> PathBuf {
    Path::new(SYSTEM_CONFIG_DIR).join(CONFIG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_paths() {
        let home = Path::new("/home/ci");
        assert_eq!(
            user_config_file_path(home),
            PathBuf::from("/home/ci/.lxd-buildhost/config.toml")
        );
        assert_eq!(
            local_config_file_path(Path::new("/work")),
            PathBuf::from("/work/.lxd-buildhost/config.toml")
        );
        assert_eq!(
            system_config_file_path(),
            PathBuf::from("/etc/lxd-buildhost/config.toml")
        );
    }
}
