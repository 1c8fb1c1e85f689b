//! devbox-ssh - SSH trust for remote development containers
//!
//! This crate issues the SSH trust material that lets a client connect to
//! freshly created containers without ever being asked to accept an unknown
//! host key. One certificate authority per user installation signs an
//! ephemeral host key for every container; the client trusts the CA once per
//! remote host through an `@cert-authority` line in its known_hosts file.
//!
//! # Features
//!
//! - Generate-once Ed25519 certificate authority (`init`)
//! - Host certificates with a 10-year validity window
//! - Idempotent, lock-protected known_hosts trust entries
//! - Surgical upsert/removal of per-container `Host` blocks in `~/.ssh/config`
//!   with connection multiplexing and keepalive settings
//! - Provisioning pipeline that installs the host identity before the
//!   container's SSH daemon starts, and writes nothing if signing fails
//!
//! # Example Usage (CLI)
//!
//! ```bash
//! devbox-ssh init
//! devbox-ssh provision dev-sample --remote-host=10.0.0.5 --ssh-port=2201 --user=dev
//! ssh dev-sample
//! ```

pub mod ca;
pub mod config;
pub mod error;
pub mod files;
pub mod provision;
pub mod ssh;
pub mod status;

// Re-exports for convenience
pub use ca::{CaState, CertificateAuthority, HostCertRequest};
pub use config::{Args, Command, Config, Paths};
pub use error::{DevboxError, Result};
pub use provision::{
    ContainerEndpoint, DirectoryInstaller, HostIdentity, HostKeyInstaller, ProvisionOutcome,
    Provisioner,
};
pub use ssh::{
    render_block, RemoteHost, SshConfigFile, SshProfile, TrustEntry, TrustMode, TrustStore,
};
pub use status::Status;
