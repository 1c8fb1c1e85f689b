//! Configuration and CLI argument parsing for devbox-ssh

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::error::{DevboxError, Result};
use crate::ssh::known_hosts::DEFAULT_ALIAS_PATTERN;
use crate::ssh::sanitize::validate_alias_pattern;

/// Default timeout for host identity generation in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000; // 30 seconds

/// Name of the per-user state directory below `$HOME`
pub const DEFAULT_ROOT_DIR: &str = ".devbox";

/// devbox-ssh CLI Arguments
#[derive(Parser, Debug, Clone)]
#[command(name = "devbox-ssh")]
#[command(version)]
#[command(about = "SSH certificate authority and client trust for remote dev containers")]
pub struct Args {
    /// State directory (CA, known_hosts, staged host keys)
    #[arg(long, global = true, env = "DEVBOX_HOME")]
    pub home: Option<PathBuf>,

    /// SSH client config file to manage
    #[arg(long, global = true, env = "DEVBOX_SSH_CONFIG")]
    pub ssh_config: Option<PathBuf>,

    /// Alias pattern trusted alongside the remote host in known_hosts
    #[arg(long, global = true, default_value = DEFAULT_ALIAS_PATTERN, env = "DEVBOX_ALIAS_PATTERN")]
    pub alias_pattern: String,

    /// Host identity generation timeout in milliseconds
    #[arg(long, global = true, default_value = "30000", env = "DEVBOX_TIMEOUT")]
    pub timeout: u64,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Generate the certificate authority (once per installation)
    Init,

    /// Show CA, trust store and SSH config state
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the CA public key line
    PublicKey,

    /// Sign an existing host public key
    Sign {
        /// Host key path (private or `.pub`)
        host_key: PathBuf,

        /// Container alias used as the certificate identity
        #[arg(long)]
        alias: String,

        /// Remote host address, `host` or `host:port`
        #[arg(long)]
        remote: String,
    },

    /// Trust the CA for containers on a remote host
    Trust {
        /// Remote host address, `host` or `host:port`
        remote: String,
    },

    /// Print the SSH config block for a container
    Render {
        /// Container alias
        alias: String,

        /// Remote host address
        #[arg(long)]
        address: String,

        /// SSH port
        #[arg(long, default_value = "22")]
        port: u16,

        /// Login user
        #[arg(long)]
        user: String,

        /// Disable host key checking (accepts any host key)
        #[arg(long, default_value = "false")]
        insecure_no_host_check: bool,
    },

    /// Issue and stage a host identity, then configure the client
    Provision {
        /// Container alias
        alias: String,

        /// Remote host address
        #[arg(long)]
        remote_host: String,

        /// Port the container's SSH daemon is published on
        #[arg(long)]
        ssh_port: u16,

        /// Login user inside the container
        #[arg(long)]
        user: String,
    },

    /// Remove the client configuration of a deleted container
    Deprovision {
        /// Container alias
        alias: String,
    },
}

/// File locations of one installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// State root, `~/.devbox` by default
    pub root: PathBuf,

    /// CA keypair directory
    pub ca_dir: PathBuf,

    /// Trust store
    pub known_hosts: PathBuf,

    /// Staged host identities
    pub hosts_dir: PathBuf,

    /// Multiplexing control sockets
    pub control_dir: PathBuf,

    /// SSH client config
    pub ssh_config: PathBuf,
}

impl Paths {
    /// Layout below `root`, with an explicit SSH config path
    pub fn from_root(root: impl Into<PathBuf>, ssh_config: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            ca_dir: root.join("ca"),
            known_hosts: root.join("known_hosts"),
            hosts_dir: root.join("hosts"),
            control_dir: root.join("cm"),
            ssh_config: ssh_config.into(),
            root,
        }
    }

    /// Resolve overrides against the user's home directory
    pub fn discover(root: Option<&Path>, ssh_config: Option<&Path>) -> Result<Self> {
        let home = dirs::home_dir();
        let missing_home =
            || DevboxError::config("cannot determine home directory; set DEVBOX_HOME and DEVBOX_SSH_CONFIG");

        let root = match root {
            Some(root) => root.to_path_buf(),
            None => home.as_ref().ok_or_else(missing_home)?.join(DEFAULT_ROOT_DIR),
        };
        let ssh_config = match ssh_config {
            Some(path) => path.to_path_buf(),
            None => home.as_ref().ok_or_else(missing_home)?.join(".ssh").join("config"),
        };

        Ok(Self::from_root(root, ssh_config))
    }
}

/// Parsed and validated configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// File locations
    pub paths: Paths,

    /// Alias pattern for trust entries
    pub alias_pattern: String,

    /// Host identity generation timeout in milliseconds
    pub timeout_ms: u64,

    /// Debug logging requested
    pub verbose: bool,
}

impl Config {
    /// Create Config from CLI Args
    pub fn from_args(args: &Args) -> Result<Self> {
        validate_args(args)?;

        let paths = Paths::discover(args.home.as_deref(), args.ssh_config.as_deref())?;

        Ok(Config {
            paths,
            alias_pattern: args.alias_pattern.trim().to_string(),
            timeout_ms: args.timeout,
            verbose: args.verbose,
        })
    }
}

/// Validate CLI arguments
fn validate_args(args: &Args) -> Result<()> {
    let mut errors = Vec::new();

    if let Err(e) = validate_alias_pattern(&args.alias_pattern) {
        errors.push(format!("Invalid --alias-pattern: {}", e));
    }

    if args.timeout == 0 {
        errors.push("--timeout must be greater than 0".to_string());
    }

    if let Some(ref home) = args.home {
        if home.as_os_str().is_empty() {
            errors.push("--home must not be empty".to_string());
        } else if home.exists() && !home.is_dir() {
            errors.push(format!("--home is not a directory: {}", home.display()));
        }
    }

    if let Some(ref ssh_config) = args.ssh_config {
        if ssh_config.as_os_str().is_empty() {
            errors.push("--ssh-config must not be empty".to_string());
        } else if ssh_config.is_dir() {
            errors.push(format!("--ssh-config is a directory: {}", ssh_config.display()));
        }
    }

    if !errors.is_empty() {
        return Err(DevboxError::Config(format!(
            "Configuration error:\n{}",
            errors.join("\n")
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_paths_layout() {
        let paths = Paths::from_root("/home/dev/.devbox", "/home/dev/.ssh/config");
        assert_eq!(paths.ca_dir, PathBuf::from("/home/dev/.devbox/ca"));
        assert_eq!(paths.known_hosts, PathBuf::from("/home/dev/.devbox/known_hosts"));
        assert_eq!(paths.hosts_dir, PathBuf::from("/home/dev/.devbox/hosts"));
        assert_eq!(paths.control_dir, PathBuf::from("/home/dev/.devbox/cm"));
        assert_eq!(paths.ssh_config, PathBuf::from("/home/dev/.ssh/config"));
    }

    #[test]
    fn test_from_args_with_overrides() {
        let dir = TempDir::new().unwrap();
        let home = dir.path().to_str().unwrap();
        let ssh_config = dir.path().join("ssh_config");
        let args = parse(&[
            "devbox-ssh",
            "--home",
            home,
            "--ssh-config",
            ssh_config.to_str().unwrap(),
            "init",
        ]);

        let config = Config::from_args(&args).unwrap();
        assert_eq!(config.paths.root, dir.path());
        assert_eq!(config.paths.ssh_config, ssh_config);
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.alias_pattern, "dev-*");
        assert_eq!(args.command, Command::Init);
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let dir = TempDir::new().unwrap();
        let args = parse(&[
            "devbox-ssh",
            "--alias-pattern",
            "dev *",
            "--timeout",
            "0",
            "--ssh-config",
            dir.path().to_str().unwrap(),
            "public-key",
        ]);

        let msg = Config::from_args(&args).unwrap_err().to_string();
        assert!(msg.contains("--alias-pattern"));
        assert!(msg.contains("--timeout"));
        assert!(msg.contains("--ssh-config is a directory"));
    }

    #[test]
    fn test_render_defaults() {
        let args = parse(&[
            "devbox-ssh",
            "render",
            "dev-sample",
            "--address",
            "10.0.0.5",
            "--user",
            "dev",
        ]);

        assert_eq!(
            args.command,
            Command::Render {
                alias: "dev-sample".to_string(),
                address: "10.0.0.5".to_string(),
                port: 22,
                user: "dev".to_string(),
                insecure_no_host_check: false,
            }
        );
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = parse(&["devbox-ssh", "status", "--json", "-v"]);
        assert!(args.verbose);
        assert_eq!(args.command, Command::Status { json: true });
    }
}
