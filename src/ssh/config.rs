//! SSH client connection profiles
//!
//! Renders the `Host` block written into `~/.ssh/config` for one container.

use std::fmt::Write as _;
use std::path::PathBuf;

use super::address::DEFAULT_SSH_PORT;
use super::sanitize::{quote_config_value, validate_alias, validate_host, validate_user};
use crate::error::Result;

/// Default directory for multiplexing control sockets
pub const DEFAULT_CONTROL_DIR: &str = "~/.devbox/cm";

/// How long an idle master connection is kept open
pub const CONTROL_PERSIST: &str = "1h";

/// Seconds between keepalive probes
pub const SERVER_ALIVE_INTERVAL_SECS: u32 = 30;

/// Missed probes tolerated before the connection is declared dead (~3 min)
pub const SERVER_ALIVE_COUNT_MAX: u32 = 6;

/// Initial connect timeout in seconds
pub const CONNECT_TIMEOUT_SECS: u32 = 10;

/// How the client verifies the container's host key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustMode {
    /// Strict checking against `@cert-authority` lines in this known_hosts file
    CertAuthority(PathBuf),
    /// No host key checking at all; only for explicit opt-in
    Disabled,
}

/// Connection profile for one container
#[derive(Debug, Clone)]
pub struct SshProfile {
    /// Host alias used on the command line (`ssh <alias>`)
    pub alias: String,

    /// Remote hostname or IP address
    pub address: String,

    /// SSH port (default: 22)
    pub port: u16,

    /// Login user
    pub user: Option<String>,

    /// Host key verification mode
    pub trust: TrustMode,

    /// Directory for `ControlPath` sockets
    pub control_dir: String,
}

impl SshProfile {
    /// Profile with the minimal required fields
    ///
    /// The trust mode has no default: turning host key checking off must be
    /// spelled out as [`TrustMode::Disabled`].
    pub fn new(alias: impl Into<String>, address: impl Into<String>, trust: TrustMode) -> Self {
        Self {
            alias: alias.into(),
            address: address.into(),
            port: DEFAULT_SSH_PORT,
            user: None,
            trust,
            control_dir: DEFAULT_CONTROL_DIR.to_string(),
        }
    }

    /// Set the SSH port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the login user
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the directory holding multiplexing sockets
    pub fn with_control_dir(mut self, dir: impl Into<String>) -> Self {
        self.control_dir = dir.into();
        self
    }

    /// Render the `Host` block, newline-terminated
    pub fn render(&self) -> Result<String> {
        let alias = validate_alias(&self.alias)?;
        let address = validate_host(&self.address)?;

        let mut block = String::new();
        // Writing to a String cannot fail.
        let _ = writeln!(block, "Host {}", alias);
        let _ = writeln!(block, "  HostName {}", address);
        let _ = writeln!(block, "  Port {}", self.port);
        if let Some(user) = &self.user {
            let _ = writeln!(block, "  User {}", validate_user(user)?);
        }

        match &self.trust {
            TrustMode::CertAuthority(known_hosts) => {
                let _ = writeln!(block, "  StrictHostKeyChecking yes");
                let _ = writeln!(
                    block,
                    "  UserKnownHostsFile {}",
                    quote_config_value(&known_hosts.to_string_lossy())
                );
            }
            TrustMode::Disabled => {
                let _ = writeln!(block, "  StrictHostKeyChecking no");
                let _ = writeln!(block, "  UserKnownHostsFile /dev/null");
            }
        }

        let control_path = format!("{}/%r@%h:%p", self.control_dir.trim_end_matches('/'));
        let _ = writeln!(block, "  ControlMaster auto");
        let _ = writeln!(block, "  ControlPath {}", quote_config_value(&control_path));
        let _ = writeln!(block, "  ControlPersist {}", CONTROL_PERSIST);
        let _ = writeln!(block, "  ServerAliveInterval {}", SERVER_ALIVE_INTERVAL_SECS);
        let _ = writeln!(block, "  ServerAliveCountMax {}", SERVER_ALIVE_COUNT_MAX);
        let _ = writeln!(block, "  ConnectTimeout {}", CONNECT_TIMEOUT_SECS);
        let _ = writeln!(block, "  TCPKeepAlive yes");

        Ok(block)
    }
}

/// Render a container `Host` block
///
/// An empty-string trust store is not accepted; pass
/// [`TrustMode::Disabled`] explicitly to turn host key checking off.
pub fn render_block(
    alias: &str,
    address: &str,
    port: u16,
    user: &str,
    trust: TrustMode,
) -> Result<String> {
    SshProfile::new(alias, address, trust)
        .with_port(port)
        .with_user(user)
        .render()
}
