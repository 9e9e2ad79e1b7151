//! Configuration discovery and loading
//!
//! This module handles the configuration discovery hierarchy:
//! 1. Current directory: ./lxd-buildhost.toml or ./.lxd-buildhost/config.toml
//! 2. User config: ~/.lxd-buildhost/config.toml
//! 3. System config: /etc/lxd-buildhost/config.toml
//!
//! Unlike most settings, the LXD API URL has no sensible default, so a
//! configuration file must exist somewhere in the hierarchy.

use crate::config::{ConfigError, LxdConfig};
use crate::env;
use std::env as std_env;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Configuration discovery system
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Load configuration from `override_path`, or discover it.
    pub fn load(override_path: Option<&Path>) -> Result<LxdConfig, ConfigError> {
        if let Some(path) = override_path {
            info!("Loading configuration override from: {:?}", path);
            return LxdConfig::from_toml_file(path);
        }

        Self::discover_config()
    }

    /// Discover and load configuration using the hierarchy
    pub fn discover_config() -> Result<LxdConfig, ConfigError> {
        match Self::find_config_file() {
            Some(config_path) => {
                info!("Loading configuration from: {:?}", config_path);
                LxdConfig::from_toml_file(config_path)
            }
            None => Err(ConfigError::MissingApiUrl),
        }
    }

    /// Find configuration file using discovery hierarchy
    pub fn find_config_file() -> Option<PathBuf> {
        Self::first_existing(Self::get_config_candidates())
    }

    fn first_existing(candidates: Vec<PathBuf>) -> Option<PathBuf> {
        for candidate in candidates {
            debug!("Checking for config file: {:?}", candidate);
            if candidate.is_file() {
                debug!("Found config file: {:?}", candidate);
                return Some(candidate);
            }
        }

        debug!("No config file found in discovery hierarchy");
        None
    }

    /// Get list of configuration file candidates in priority order
    fn get_config_candidates() -> Vec<PathBuf> {
        Self::candidates_for(
            std_env::current_dir().ok().as_deref(),
            Self::get_home_dir().as_deref(),
        )
    }

    fn candidates_for(current_dir: Option<&Path>, home_dir: Option<&Path>) -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        if let Some(current_dir) = current_dir {
            candidates.push(current_dir.join(env::LOCAL_CONFIG_FILE_NAME));
            candidates.push(env::local_config_file_path(current_dir));
        }

        if let Some(home_dir) = home_dir {
            candidates.push(env::user_config_file_path(home_dir));
        }

        candidates.push(env::system_config_file_path());
        candidates
    }

    /// Get home directory path
    fn get_home_dir() -> Option<PathBuf> {
        std_env::var("HOME")
            .ok()
            .or_else(|| std_env::var("USERPROFILE").ok())
            .map(PathBuf::from)
    }

    /// Show configuration discovery information for debugging
    pub fn show_discovery_info() {
        println!("Configuration Discovery Hierarchy:");
        println!();

        let candidates = Self::get_config_candidates();
        for (i, candidate) in candidates.iter().enumerate() {
            let status = if candidate.exists() {
                if candidate.is_file() {
                    "✓ EXISTS"
                } else {
                    "✗ NOT A FILE"
                }
            } else {
                "✗ NOT FOUND"
            };

            println!("  {}. {:?} - {}", i + 1, candidate, status);
        }

        println!();
        match Self::find_config_file() {
            Some(found) => {
                println!("Active configuration: {:?}", found);
                match LxdConfig::from_toml_file(&found) {
                    Ok(config) => {
                        println!("  api: {}", config.api);
                        println!("  image server: {}", config.image_server);
                        println!("  instance name: {}", config.instance_name);
                    }
                    Err(e) => println!("  invalid: {}", e),
                }
            }
            None => println!("Active configuration: none (an [lxd] api URL is required)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_candidates_order() {
        let candidates =
            ConfigDiscovery::candidates_for(Some(Path::new("/work")), Some(Path::new("/home/ci")));

        assert_eq!(
            candidates,
            vec![
                PathBuf::from("/work/lxd-buildhost.toml"),
                PathBuf::from("/work/.lxd-buildhost/config.toml"),
                PathBuf::from("/home/ci/.lxd-buildhost/config.toml"),
                PathBuf::from("/etc/lxd-buildhost/config.toml"),
            ]
        );
    }

    #[test]
    fn test_first_existing_prefers_local() {
        let temp_dir = TempDir::new().unwrap();
        let home = temp_dir.path().join("home");
        std::fs::create_dir_all(env::user_config_dir_path(&home)).unwrap();
        std::fs::write(env::user_config_file_path(&home), "[lxd]\n").unwrap();

        let candidates =
            ConfigDiscovery::candidates_for(Some(temp_dir.path()), Some(home.as_path()));
        assert_eq!(
            ConfigDiscovery::first_existing(candidates.clone()),
            Some(env::user_config_file_path(&home))
        );

        let local = temp_dir.path().join(env::LOCAL_CONFIG_FILE_NAME);
        std::fs::write(&local, "[lxd]\n").unwrap();
        assert_eq!(ConfigDiscovery::first_existing(candidates), Some(local));
    }

    #[test]
    fn test_load_override() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("custom.toml");
        std::fs::write(&path, "[lxd]\napi = \"https://10.0.0.5:8443\"\n").unwrap();

        let config = ConfigDiscovery::load(Some(path.as_path())).unwrap();
        assert_eq!(config.api.as_str(), "https://10.0.0.5:8443/");
    }

    #[test]
    fn test_load_override_missing_file() {
        let result = ConfigDiscovery::load(Some(Path::new("/nonexistent/lxd.toml")));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
