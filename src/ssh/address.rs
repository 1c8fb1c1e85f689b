//! Remote host addresses
//!
//! Containers on one remote machine share its address and differ only by
//! SSH port, so the port decides how trust patterns are written.

use std::fmt;
use std::str::FromStr;

use super::sanitize::validate_host;
use crate::error::{DevboxError, Result};

/// Standard SSH port; addresses on it need no bracketed known_hosts form
pub const DEFAULT_SSH_PORT: u16 = 22;

/// A remote server address: host plus optional SSH port
///
/// Parses `host`, `host:port`, `[host]:port` and bare IPv6 literals.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteHost {
    host: String,
    port: Option<u16>,
}

impl RemoteHost {
    /// Create a remote host from its parts
    pub fn new(host: &str, port: Option<u16>) -> Result<Self> {
        let host = validate_host(host)?.to_string();
        // IPv6 literals have at least two colons; one means a stray port.
        if host.matches(':').count() == 1 {
            return Err(DevboxError::invalid_params(format!(
                "Host {:?} must not include a port",
                host
            )));
        }
        if port == Some(0) {
            return Err(DevboxError::invalid_params("SSH port cannot be 0"));
        }
        Ok(Self { host, port })
    }

    /// Host name or IP address, without port
    pub fn host(&self) -> &str {
        &self.host
    }

    /// SSH port, if one was given
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Whether the address uses a port other than 22
    pub fn has_custom_port(&self) -> bool {
        self.port.is_some_and(|port| port != DEFAULT_SSH_PORT)
    }

    /// known_hosts pattern matching this host
    ///
    /// With a non-standard port this is `[host]:*` so that one trust line
    /// covers every container port on the machine.
    pub fn known_hosts_pattern(&self) -> String {
        if self.has_custom_port() {
            format!("[{}]:*", self.host)
        } else {
            self.host.clone()
        }
    }
}

impl FromStr for RemoteHost {
    type Err = DevboxError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();

        if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or_else(|| {
                DevboxError::invalid_params(format!("Unterminated '[' in address {:?}", s))
            })?;
            let port = match after {
                "" => None,
                _ => {
                    let port = after.strip_prefix(':').ok_or_else(|| {
                        DevboxError::invalid_params(format!("Invalid address {:?}", s))
                    })?;
                    Some(parse_port(port)?)
                }
            };
            return Self::new(host, port);
        }

        match s.matches(':').count() {
            0 => Self::new(s, None),
            1 => {
                let (host, port) = s.split_once(':').unwrap_or((s, ""));
                Self::new(host, Some(parse_port(port)?))
            }
            // Bare IPv6 literal
            _ => Self::new(s, None),
        }
    }
}

impl fmt::Display for RemoteHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) if self.host.contains(':') => write!(f, "[{}]:{}", self.host, port),
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => f.write_str(&self.host),
        }
    }
}

fn parse_port(port: &str) -> Result<u16> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(DevboxError::invalid_params(format!(
            "Invalid SSH port {:?}",
            port
        ))),
        Ok(port) => Ok(port),
    }
}
