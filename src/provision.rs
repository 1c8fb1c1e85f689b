//! Host identity provisioning
//!
//! Gives a container a CA-signed SSH host identity before its SSH daemon
//! starts. The order is fixed:
//!
//! 1. generate a fresh Ed25519 host keypair
//! 2. sign it with the installation CA
//! 3. hand key, public key and certificate to the container boot sequence
//! 4. trust the CA for the remote host and write the container's `Host` block
//!
//! Any failure stops the sequence. In particular a missing CA fails step 2,
//! so nothing is installed and the caller must not start the container.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand_core::OsRng;
use ssh_key::{Algorithm, Certificate, HashAlg, LineEnding, PrivateKey, PublicKey};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ca::{CertificateAuthority, HostCertRequest};
use crate::config::Config;
use crate::error::{DevboxError, Result};
use crate::files::{self, PRIVATE_FILE_MODE, PUBLIC_FILE_MODE};
use crate::ssh::{config_file, validate_alias, RemoteHost, SshProfile, TrustMode, TrustStore};

/// Default bound on key generation + signing
pub const DEFAULT_PROVISION_TIMEOUT_MS: u64 = 30_000;

/// Host key file name inside a staged identity directory
pub const HOST_KEY_FILE: &str = "ssh_host_ed25519_key";

/// What the container lifecycle passes in for each container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEndpoint {
    /// Container alias, e.g. `dev-sample`
    pub alias: String,

    /// Address of the remote machine running the container
    pub remote_host: String,

    /// Login user inside the container
    pub user: String,

    /// Port the container's SSH daemon is published on
    pub ssh_port: u16,
}

impl ContainerEndpoint {
    /// Create an endpoint description
    pub fn new(
        alias: impl Into<String>,
        remote_host: impl Into<String>,
        user: impl Into<String>,
        ssh_port: u16,
    ) -> Self {
        Self {
            alias: alias.into(),
            remote_host: remote_host.into(),
            user: user.into(),
            ssh_port,
        }
    }

    /// The remote machine address including the container's port
    ///
    /// `remote_host` must be a bare host; the port comes from `ssh_port`.
    pub fn remote(&self) -> Result<RemoteHost> {
        let parsed: RemoteHost = self.remote_host.parse()?;
        if let Some(port) = parsed.port() {
            return Err(DevboxError::invalid_params(format!(
                "remote host {:?} includes port {}; pass the port as the SSH port instead",
                self.remote_host, port
            )));
        }
        RemoteHost::new(parsed.host(), Some(self.ssh_port))
    }
}

/// A freshly generated, CA-signed host identity
///
/// Only ever held in memory until the installer persists it.
#[derive(Clone)]
pub struct HostIdentity {
    private_key: PrivateKey,
    certificate: Certificate,
}

impl HostIdentity {
    /// Generate a new host keypair for `alias` and have `ca` sign it
    pub fn generate(ca: &CertificateAuthority, alias: &str, remote: &RemoteHost) -> Result<Self> {
        let request = HostCertRequest::for_container(alias, remote)?;

        let mut private_key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .map_err(|e| DevboxError::ssh_key(format!("host key generation failed: {}", e)))?;
        private_key.set_comment(format!("root@{}", alias));

        let certificate = ca.certify(private_key.public_key(), &request)?;

        Ok(Self {
            private_key,
            certificate,
        })
    }

    /// The host public key
    pub fn public_key(&self) -> &PublicKey {
        self.private_key.public_key()
    }

    /// The host certificate
    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// SHA-256 fingerprint of the host key
    pub fn fingerprint(&self) -> String {
        self.public_key().fingerprint(HashAlg::Sha256).to_string()
    }

    /// OpenSSH PEM encoding of the private key
    pub fn private_key_openssh(&self) -> Result<String> {
        Ok(self.private_key.to_openssh(LineEnding::LF)?.to_string())
    }

    /// `ssh-ed25519 ...` line of the public key
    pub fn public_key_openssh(&self) -> Result<String> {
        Ok(self.public_key().to_openssh()?)
    }

    /// `ssh-ed25519-cert-v01@openssh.com ...` line of the certificate
    pub fn certificate_openssh(&self) -> Result<String> {
        Ok(self.certificate.to_openssh()?)
    }
}

impl std::fmt::Debug for HostIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostIdentity")
            .field("fingerprint", &self.fingerprint())
            .field("key_id", &self.certificate.key_id())
            .field("principals", &self.certificate.valid_principals())
            .finish()
    }
}

/// Container boot collaborator that places a host identity into the
/// container filesystem before its SSH daemon starts
#[async_trait]
pub trait HostKeyInstaller: Send + Sync {
    /// Install the key, public key and certificate for `alias`
    async fn install(&self, alias: &str, identity: &HostIdentity) -> Result<()>;

    /// Forget the identity of a deleted container
    async fn uninstall(&self, _alias: &str) -> Result<()> {
        Ok(())
    }
}

/// Installer that stages identities under `<root>/<alias>/` for the boot
/// sequence to copy into the container
#[derive(Debug, Clone)]
pub struct DirectoryInstaller {
    root: PathBuf,
}

impl DirectoryInstaller {
    /// Stage identities below `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the identity of `alias`
    pub fn dir_for(&self, alias: &str) -> Result<PathBuf> {
        Ok(self.root.join(validate_alias(alias)?))
    }

    /// Path of the staged host private key for `alias`
    pub fn host_key_path(&self, alias: &str) -> Result<PathBuf> {
        Ok(self.dir_for(alias)?.join(HOST_KEY_FILE))
    }
}

#[async_trait]
impl HostKeyInstaller for DirectoryInstaller {
    async fn install(&self, alias: &str, identity: &HostIdentity) -> Result<()> {
        let dir = self.dir_for(alias)?;
        files::create_private_dir(&dir)?;

        let key_path = dir.join(HOST_KEY_FILE);
        let (public_path, cert_path) = crate::ca::host_key_paths(&key_path);

        // Certificate last: a staged certificate implies a complete triple.
        files::write_atomic(
            &key_path,
            identity.private_key_openssh()?.as_bytes(),
            Some(PRIVATE_FILE_MODE),
        )?;
        files::write_atomic(
            &public_path,
            format!("{}\n", identity.public_key_openssh()?).as_bytes(),
            Some(PUBLIC_FILE_MODE),
        )?;
        files::write_atomic(
            &cert_path,
            format!("{}\n", identity.certificate_openssh()?).as_bytes(),
            Some(PUBLIC_FILE_MODE),
        )?;

        debug!("Staged host identity for {} in {}", alias, dir.display());
        Ok(())
    }

    async fn uninstall(&self, alias: &str) -> Result<()> {
        let dir = self.dir_for(alias)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!("Removed staged host identity {}", dir.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Result of a successful provisioning run
#[derive(Debug, Clone)]
pub struct ProvisionOutcome {
    /// Container alias
    pub alias: String,

    /// SHA-256 fingerprint of the new host key
    pub host_key_fingerprint: String,

    /// Principals in the issued certificate
    pub principals: Vec<String>,

    /// Whether a new known_hosts line was written
    pub trust_entry_added: bool,

    /// Whether the SSH config changed
    pub ssh_config_changed: bool,
}

/// Produces a signed host identity; runs on a blocking worker
pub type IssueFn = fn(&CertificateAuthority, &str, &RemoteHost) -> Result<HostIdentity>;

/// Runs the provisioning sequence for containers of one installation
pub struct Provisioner<I> {
    ca: Arc<CertificateAuthority>,
    trust_store: TrustStore,
    ssh_config: PathBuf,
    control_dir: PathBuf,
    installer: I,
    timeout: Duration,
    issue: IssueFn,
}

impl<I: HostKeyInstaller> Provisioner<I> {
    /// Create a provisioner
    pub fn new(
        ca: CertificateAuthority,
        trust_store: TrustStore,
        ssh_config: impl Into<PathBuf>,
        installer: I,
    ) -> Self {
        Self {
            ca: Arc::new(ca),
            trust_store,
            ssh_config: ssh_config.into(),
            control_dir: PathBuf::from(crate::ssh::config::DEFAULT_CONTROL_DIR),
            installer,
            timeout: Duration::from_millis(DEFAULT_PROVISION_TIMEOUT_MS),
            issue: HostIdentity::generate,
        }
    }

    /// Provisioner wired to the paths of `config`
    pub fn from_config(config: &Config, installer: I) -> Self {
        let trust_store = TrustStore::new(&config.paths.known_hosts)
            .with_alias_pattern(config.alias_pattern.clone());
        Self::new(
            CertificateAuthority::new(&config.paths.ca_dir),
            trust_store,
            &config.paths.ssh_config,
            installer,
        )
        .with_control_dir(&config.paths.control_dir)
        .with_timeout(Duration::from_millis(config.timeout_ms))
    }

    /// Set the multiplexing socket directory
    pub fn with_control_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.control_dir = dir.into();
        self
    }

    /// Set the bound on key generation + signing
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace how host identities are generated and signed
    pub fn with_issuer(mut self, issue: IssueFn) -> Self {
        self.issue = issue;
        self
    }

    /// The installer
    pub fn installer(&self) -> &I {
        &self.installer
    }

    /// Give the container described by `endpoint` a signed host identity
    ///
    /// Returns only after the identity is installed and the client side
    /// (known_hosts + SSH config) is ready.
    pub async fn provision(
        &self,
        endpoint: &ContainerEndpoint,
        cancel: &CancellationToken,
    ) -> Result<ProvisionOutcome> {
        let alias = validate_alias(&endpoint.alias)?.to_string();
        let remote = endpoint.remote()?;
        let user = crate::ssh::sanitize::validate_user(&endpoint.user)?.to_string();

        info!("Provisioning host identity for {} on {}", alias, remote);

        // Steps 1 + 2
        let identity = self.issue_identity(&alias, &remote, cancel).await?;
        info!(
            "Issued host certificate for {} (host key {})",
            alias,
            identity.fingerprint()
        );

        if cancel.is_cancelled() {
            warn!("Provisioning of {} cancelled before install", alias);
            return Err(DevboxError::Cancelled);
        }

        // Step 3
        self.installer
            .install(&alias, &identity)
            .await
            .map_err(|e| {
                error!("Installing host identity for {} failed: {}", alias, e);
                match e {
                    DevboxError::Install(_) => e,
                    other => DevboxError::install(other.to_string()),
                }
            })?;

        // Step 4
        let ca_public_key = self.ca.public_key()?;
        let trust_entry_added = self.trust_store.write_entry(&ca_public_key, &remote)?;

        // `~` paths are expanded by ssh itself, not by us.
        if !self.control_dir.starts_with("~") {
            files::create_private_dir(&self.control_dir)?;
        }
        let trust = TrustMode::CertAuthority(self.trust_store.path().to_path_buf());
        let block = SshProfile::new(&alias, remote.host(), trust)
            .with_port(endpoint.ssh_port)
            .with_user(user)
            .with_control_dir(self.control_dir.to_string_lossy())
            .render()?;
        let ssh_config_changed = config_file::upsert(&self.ssh_config, &alias, &block)?;

        info!("Container {} is ready for `ssh {}`", alias, alias);

        Ok(ProvisionOutcome {
            alias,
            host_key_fingerprint: identity.fingerprint(),
            principals: identity.certificate().valid_principals().to_vec(),
            trust_entry_added,
            ssh_config_changed,
        })
    }

    /// Generate and sign off the async runtime, bounded by the timeout and
    /// the cancellation token. Nothing is written here.
    async fn issue_identity(
        &self,
        alias: &str,
        remote: &RemoteHost,
        cancel: &CancellationToken,
    ) -> Result<HostIdentity> {
        // Fail fast with the precise CA error before spawning work.
        self.ca.ensure_ready()?;

        let ca = Arc::clone(&self.ca);
        let task_alias = alias.to_string();
        let task_remote = remote.clone();
        let issue = self.issue;
        let work = tokio::task::spawn_blocking(move || issue(&ca, &task_alias, &task_remote));

        let timeout_ms = self.timeout.as_millis() as u64;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Host identity generation for {} cancelled", alias);
                Err(DevboxError::Cancelled)
            }
            result = timeout(self.timeout, work) => match result {
                Ok(Ok(identity)) => identity,
                Ok(Err(join_err)) => {
                    error!("Host identity task for {} failed: {}", alias, join_err);
                    Err(DevboxError::signing(join_err.to_string()))
                }
                Err(_) => {
                    error!("Host identity generation for {} timed out after {}ms", alias, timeout_ms);
                    Err(DevboxError::Timeout(timeout_ms))
                }
            },
        }
    }

    /// Remove the client-side traces of a deleted container
    ///
    /// The known_hosts entry stays: it covers every container on the remote
    /// host and is harmless once nothing matches it.
    pub async fn deprovision(&self, alias: &str) -> Result<bool> {
        let alias = validate_alias(alias)?;
        let removed = config_file::remove(&self.ssh_config, alias)?;
        self.installer.uninstall(alias).await?;
        info!("Deprovisioned {}", alias);
        Ok(removed)
    }
}
