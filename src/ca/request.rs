//! Host certificate requests
//!
//! A request pins down everything a host certificate asserts: who it is
//! (key id), which names it is valid for (principals) and when.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{DevboxError, Result};
use crate::ssh::sanitize::validate_alias;
use crate::ssh::RemoteHost;

/// Lifetime of a host certificate: ten years from signing
pub const CERT_VALIDITY_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Backdating applied to `valid_after` to tolerate clock skew between the
/// signing machine and the client
pub const CLOCK_SKEW_SECS: u64 = 5 * 60;

/// Everything needed to issue one container host certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCertRequest {
    key_id: String,
    principals: Vec<String>,
    valid_after: u64,
    valid_before: u64,
}

impl HostCertRequest {
    /// Request a certificate for container `alias` on `remote`
    ///
    /// Principals are the alias and the remote host (without port), so the
    /// certificate cannot be replayed against an unrelated host name.
    pub fn for_container(alias: &str, remote: &RemoteHost) -> Result<Self> {
        let alias = validate_alias(alias)?;

        let mut principals = vec![alias.to_string()];
        if remote.host() != alias {
            principals.push(remote.host().to_string());
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| DevboxError::signing(format!("system clock before 1970: {}", e)))?
            .as_secs();

        Ok(Self {
            key_id: host_key_id(alias),
            principals,
            valid_after: now.saturating_sub(CLOCK_SKEW_SECS),
            valid_before: now.saturating_add(CERT_VALIDITY_SECS),
        })
    }

    /// Override the signing time (unix seconds)
    pub fn issued_at(mut self, unix_secs: u64) -> Self {
        self.valid_after = unix_secs.saturating_sub(CLOCK_SKEW_SECS);
        self.valid_before = unix_secs.saturating_add(CERT_VALIDITY_SECS);
        self
    }

    /// Certificate key id
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Host names the certificate is valid for
    pub fn principals(&self) -> &[String] {
        &self.principals
    }

    /// Start of the validity window (unix seconds)
    pub fn valid_after(&self) -> u64 {
        self.valid_after
    }

    /// End of the validity window (unix seconds)
    pub fn valid_before(&self) -> u64 {
        self.valid_before
    }
}

/// Key id recorded in a container's host certificate
pub fn host_key_id(alias: &str) -> String {
    format!("devbox-host:{}", alias)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_principals_are_alias_and_host() {
        let remote: RemoteHost = "10.0.0.5:2201".parse().unwrap();
        let request = HostCertRequest::for_container("dev-sample", &remote).unwrap();

        assert_eq!(request.key_id(), "devbox-host:dev-sample");
        assert_eq!(request.principals(), ["dev-sample", "10.0.0.5"]);
    }

    #[test]
    fn test_validity_is_ten_years() {
        let remote: RemoteHost = "10.0.0.5".parse().unwrap();
        let request = HostCertRequest::for_container("dev-sample", &remote)
            .unwrap()
            .issued_at(1_700_000_000);

        assert_eq!(request.valid_after(), 1_700_000_000 - CLOCK_SKEW_SECS);
        assert_eq!(request.valid_before(), 1_700_000_000 + CERT_VALIDITY_SECS);
    }

    #[test]
    fn test_valid_after_is_backdated_for_clock_skew() {
        let remote: RemoteHost = "10.0.0.5".parse().unwrap();
        let before = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let request = HostCertRequest::for_container("dev-sample", &remote).unwrap();
        let after = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();

        assert!(request.valid_after() >= before - CLOCK_SKEW_SECS);
        assert!(request.valid_after() <= after - CLOCK_SKEW_SECS);
        assert_eq!(
            request.valid_before() - request.valid_after(),
            CERT_VALIDITY_SECS + CLOCK_SKEW_SECS
        );
    }

    #[test]
    fn test_rejects_bad_alias() {
        let remote: RemoteHost = "10.0.0.5".parse().unwrap();
        assert!(HostCertRequest::for_container("dev *", &remote).is_err());
    }
}
