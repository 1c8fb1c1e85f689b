//! Installation status report for `devbox-ssh status`

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::ca::{CaState, CertificateAuthority};
use crate::config::Paths;
use crate::error::Result;
use crate::ssh::{SshConfigFile, TrustStore};

/// CA state as reported to users
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaReadiness {
    /// `init` has not run
    Absent,
    /// Both key files are present
    Ready,
    /// One key file is missing
    Partial,
}

/// Snapshot of the CA, trust store and SSH config
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    /// CA state
    pub ca: CaReadiness,

    /// Directory holding the CA key files
    pub ca_dir: PathBuf,

    /// Key file absent from a partial CA
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing: Option<PathBuf>,

    /// SHA-256 fingerprint of the CA public key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,

    /// CA public key line
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,

    /// Trust store path
    pub known_hosts: PathBuf,

    /// Host patterns the CA is trusted for
    pub trusted_hosts: Vec<String>,

    /// SSH client config path
    pub ssh_config: PathBuf,

    /// Aliases with a `Host` block in the SSH config
    pub configured_hosts: Vec<String>,
}

impl Status {
    /// Collect the status of the installation at `paths`
    ///
    /// Trust lines of other CAs are ignored. A CA key that cannot be read
    /// is reported as missing fingerprint rather than failing the report.
    pub fn collect(paths: &Paths, alias_pattern: &str) -> Result<Self> {
        let ca = CertificateAuthority::new(&paths.ca_dir);
        let (readiness, missing) = match ca.state() {
            CaState::Absent => (CaReadiness::Absent, None),
            CaState::Ready => (CaReadiness::Ready, None),
            CaState::Partial { missing } => (CaReadiness::Partial, Some(missing)),
        };

        let public_key = match readiness {
            CaReadiness::Ready => ca.public_key().ok(),
            _ => None,
        };
        let fingerprint = match readiness {
            CaReadiness::Ready => ca.fingerprint().ok(),
            _ => None,
        };

        let store = TrustStore::new(&paths.known_hosts).with_alias_pattern(alias_pattern);
        let trusted_hosts = match &public_key {
            Some(key) => store
                .entries()?
                .into_iter()
                .filter(|entry| same_key(entry.ca_public_key(), key))
                .flat_map(|entry| entry.patterns().to_vec())
                .filter(|pattern| pattern != alias_pattern)
                .collect(),
            None => Vec::new(),
        };

        let configured_hosts = if paths.ssh_config.exists() {
            let config = SshConfigFile::load(&paths.ssh_config)?;
            config
                .blocks()
                .iter()
                .filter(|block| !block.is_catch_all())
                .flat_map(|block| block.patterns.iter().cloned())
                .filter(|pattern| glob_match(alias_pattern, pattern))
                .collect()
        } else {
            Vec::new()
        };

        Ok(Self {
            ca: readiness,
            ca_dir: paths.ca_dir.clone(),
            missing,
            fingerprint,
            public_key,
            known_hosts: paths.known_hosts.clone(),
            trusted_hosts,
            ssh_config: paths.ssh_config.clone(),
            configured_hosts,
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ca {
            CaReadiness::Ready => writeln!(f, "CA:            ready ({})", self.ca_dir.display())?,
            CaReadiness::Absent => writeln!(f, "CA:            not initialized")?,
            CaReadiness::Partial => writeln!(f, "CA:            incomplete ({})", self.ca_dir.display())?,
        }
        if let Some(missing) = &self.missing {
            writeln!(f, "  missing:     {}", missing.display())?;
        }
        if let Some(fp) = &self.fingerprint {
            writeln!(f, "  fingerprint: {}", fp)?;
        }
        writeln!(f, "known_hosts:   {}", self.known_hosts.display())?;
        for host in &self.trusted_hosts {
            writeln!(f, "  trusted:     {}", host)?;
        }
        writeln!(f, "ssh config:    {}", self.ssh_config.display())?;
        for alias in &self.configured_hosts {
            writeln!(f, "  host:        {}", alias)?;
        }
        Ok(())
    }
}

/// Compare key lines ignoring the comment
fn same_key(a: &str, b: &str) -> bool {
    let mut a = a.split_whitespace();
    let mut b = b.split_whitespace();
    a.next() == b.next() && a.next() == b.next()
}

/// `*`/`?` wildcard match as used in ssh `Host` patterns
fn glob_match(pattern: &str, name: &str) -> bool {
    fn go(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => go(&p[1..], n) || (!n.is_empty() && go(p, &n[1..])),
            (Some(b'?'), Some(_)) => go(&p[1..], &n[1..]),
            (Some(a), Some(b)) if a == b => go(&p[1..], &n[1..]),
            _ => false,
        }
    }
    go(pattern.as_bytes(), name.as_bytes())
}
