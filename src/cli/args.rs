//! Command line argument parsing
//!
//! This module handles CLI argument parsing with subcommands:
//! - `acquire`: Provision a build host and print its descriptor
//! - `exec`: Run a command inside a build host, streaming its output
//! - `release`: Stop and delete a build host
//! - `push` / `pull`: Copy files into or out of a build host
//! - `show-config`: Show configuration discovery information

use crate::env;
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    Acquire { os: Option<String> },
    Exec(ExecConfig),
    Release { host: String },
    Push(TransferConfig),
    Pull(TransferConfig),
    ShowConfig,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ExecConfig {
    pub host: String,
    pub workspace: String,
    pub working_directory: Option<String>,
    pub env: HashMap<String, String>,
    pub command: String,
}

#[derive(Debug, PartialEq, Eq)]
pub struct TransferConfig {
    pub host: String,
    pub local: PathBuf,
    pub remote: String,
}

#[derive(Debug, Parser)]
#[command(name = "lxd-buildhost")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Ephemeral LXD build hosts with streaming command execution")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    /// Configuration file path (skips discovery)
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Provision a build host and print its descriptor as JSON
    Acquire {
        /// Operating system as <distro>_<release>, e.g. ubuntu_jammy
        #[arg(long = "os")]
        os: Option<String>,
    },
    /// Run a command inside a build host
    Exec {
        /// Container name of the build host
        #[arg(long = "host")]
        host: String,
        /// Workspace directory, exported as HOME
        #[arg(short = 'w', long = "workspace", default_value = env::host::WORKSPACE)]
        workspace: String,
        /// Directory to run the command in
        #[arg(long = "cwd", value_name = "DIR")]
        cwd: Option<String>,
        /// Environment variable to export (can be used multiple times)
        #[arg(short = 'e', long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,
        /// Command line, run through a login shell
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Stop and delete a build host
    Release {
        /// Container name of the build host
        #[arg(long = "host")]
        host: String,
    },
    /// Copy a local file into a build host
    Push {
        #[arg(long = "host")]
        host: String,
        local: PathBuf,
        remote: String,
    },
    /// Copy a file out of a build host
    Pull {
        #[arg(long = "host")]
        host: String,
        remote: String,
        local: PathBuf,
    },
    /// Show configuration discovery information
    ShowConfig,
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }

    pub fn mode(&self) -> Result<ExecutionMode, String> {
        match &self.command {
            Some(Commands::Acquire { os }) => Ok(ExecutionMode::Acquire { os: os.clone() }),
            Some(Commands::Exec {
                host,
                workspace,
                cwd,
                env,
                command,
            }) => Ok(ExecutionMode::Exec(ExecConfig {
                host: host.clone(),
                workspace: workspace.clone(),
                working_directory: cwd.clone(),
                env: env.iter().cloned().collect(),
                command: command.join(" "),
            })),
            Some(Commands::Release { host }) => Ok(ExecutionMode::Release { host: host.clone() }),
            Some(Commands::Push {
                host,
                local,
                remote,
            }) => Ok(ExecutionMode::Push(TransferConfig {
                host: host.clone(),
                local: local.clone(),
                remote: remote.clone(),
            })),
            Some(Commands::Pull {
                host,
                remote,
                local,
            }) => Ok(ExecutionMode::Pull(TransferConfig {
                host: host.clone(),
                local: local.clone(),
                remote: remote.clone(),
            })),
            Some(Commands::ShowConfig) => Ok(ExecutionMode::ShowConfig),
            None => Err(
                "No command specified. Use 'lxd-buildhost --help' to see available commands."
                    .to_string(),
            ),
        }
    }
}

/// Parse a `KEY=VALUE` environment assignment.
fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_acquire_command() {
        let args = parse(&["lxd-buildhost", "acquire", "--os", "ubuntu_jammy"]);
        assert_eq!(
            args.mode().unwrap(),
            ExecutionMode::Acquire {
                os: Some("ubuntu_jammy".to_string())
            }
        );

        let args = parse(&["lxd-buildhost", "acquire"]);
        assert_eq!(args.mode().unwrap(), ExecutionMode::Acquire { os: None });
    }

    #[test]
    fn test_exec_command() {
        let args = parse(&[
            "lxd-buildhost",
            "exec",
            "--host",
            "lxd-build-1",
            "--cwd",
            "/root/src",
            "-e",
            "CI=true",
            "--env",
            "MODE=a=b",
            "--",
            "make",
            "-j4",
            "test",
        ]);

        let ExecutionMode::Exec(config) = args.mode().unwrap() else {
            panic!("Expected Exec mode");
        };
        assert_eq!(config.host, "lxd-build-1");
        assert_eq!(config.workspace, "/root");
        assert_eq!(config.working_directory.as_deref(), Some("/root/src"));
        assert_eq!(config.env["CI"], "true");
        assert_eq!(config.env["MODE"], "a=b");
        assert_eq!(config.command, "make -j4 test");
    }

    #[test]
    fn test_global_config_flag() {
        let args = parse(&[
            "lxd-buildhost",
            "release",
            "--host",
            "lxd-build-1",
            "--config",
            "/tmp/lxd.toml",
        ]);
        assert_eq!(args.config, Some(PathBuf::from("/tmp/lxd.toml")));
        assert_eq!(
            args.mode().unwrap(),
            ExecutionMode::Release {
                host: "lxd-build-1".to_string()
            }
        );
    }

    #[test]
    fn test_transfer_commands() {
        let args = parse(&[
            "lxd-buildhost",
            "push",
            "--host",
            "h",
            "build.sh",
            "/root/build.sh",
        ]);
        assert_eq!(
            args.mode().unwrap(),
            ExecutionMode::Push(TransferConfig {
                host: "h".to_string(),
                local: PathBuf::from("build.sh"),
                remote: "/root/build.sh".to_string(),
            })
        );

        let args = parse(&["lxd-buildhost", "pull", "--host", "h", "/root/out.tar", "out.tar"]);
        assert!(matches!(args.mode().unwrap(), ExecutionMode::Pull(_)));
    }

    #[test]
    fn test_parse_env_pair() {
        assert_eq!(
            parse_env_pair("A=1").unwrap(),
            ("A".to_string(), "1".to_string())
        );
        assert_eq!(parse_env_pair("A=").unwrap(), ("A".to_string(), String::new()));
        assert!(parse_env_pair("A").is_err());
        assert!(parse_env_pair("=1").is_err());
    }

    #[test]
    fn test_no_command() {
        let args = Args {
            config: None,
            command: None,
        };
        assert!(args.mode().is_err());
    }
}
