//! SSH certificate authority
//!
//! One CA per installation signs the host keys of every container. The CA is
//! only ever created by an explicit `init`; every other operation fails with
//! [`DevboxError::CaNotFound`] rather than bootstrapping one, so an unsigned
//! or self-certified container is never handed out.

pub mod request;

use std::fs;
use std::path::{Path, PathBuf};

use rand_core::{OsRng, RngCore};
use ssh_key::certificate::{self, CertType};
use ssh_key::{Algorithm, Certificate, HashAlg, LineEnding, PrivateKey, PublicKey};
use tracing::{debug, info, warn};

use crate::error::{DevboxError, Result};
use crate::files::{self, PRIVATE_FILE_MODE, PUBLIC_FILE_MODE};
use crate::ssh::RemoteHost;

pub use request::{HostCertRequest, CERT_VALIDITY_SECS};

/// File name of the CA private key inside the CA directory
pub const CA_KEY_FILE: &str = "ca_ed25519";

/// File name of the CA public key inside the CA directory
pub const CA_PUBLIC_KEY_FILE: &str = "ca_ed25519.pub";

/// Presence of the CA key files on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaState {
    /// Neither key file exists; `init` has not run
    Absent,
    /// Both key files exist
    Ready,
    /// Exactly one key file exists
    Partial {
        /// The key file that is missing
        missing: PathBuf,
    },
}

/// The installation's SSH certificate authority
#[derive(Debug, Clone)]
pub struct CertificateAuthority {
    private_key_path: PathBuf,
    public_key_path: PathBuf,
}

impl CertificateAuthority {
    /// CA whose key files live in `ca_dir`
    pub fn new(ca_dir: impl AsRef<Path>) -> Self {
        let ca_dir = ca_dir.as_ref();
        Self {
            private_key_path: ca_dir.join(CA_KEY_FILE),
            public_key_path: ca_dir.join(CA_PUBLIC_KEY_FILE),
        }
    }

    /// CA with explicit key file locations
    pub fn with_paths(
        private_key_path: impl Into<PathBuf>,
        public_key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            private_key_path: private_key_path.into(),
            public_key_path: public_key_path.into(),
        }
    }

    /// Path of the CA private key
    pub fn private_key_path(&self) -> &Path {
        &self.private_key_path
    }

    /// Path of the CA public key
    pub fn public_key_path(&self) -> &Path {
        &self.public_key_path
    }

    /// Directory holding the key files
    pub fn dir(&self) -> &Path {
        self.private_key_path.parent().unwrap_or(Path::new("."))
    }

    /// Which of the two key files are present
    pub fn state(&self) -> CaState {
        match (self.private_key_path.exists(), self.public_key_path.exists()) {
            (true, true) => CaState::Ready,
            (false, false) => CaState::Absent,
            (true, false) => CaState::Partial {
                missing: self.public_key_path.clone(),
            },
            (false, true) => CaState::Partial {
                missing: self.private_key_path.clone(),
            },
        }
    }

    /// True only when both halves of the keypair are present
    pub fn exists(&self) -> bool {
        self.state() == CaState::Ready
    }

    /// Create the CA keypair
    ///
    /// Fails with [`DevboxError::CaAlreadyExists`] if either key file is
    /// already present; existing key material is never touched. Returns the
    /// new public key line.
    pub fn generate(&self) -> Result<String> {
        if self.state() != CaState::Absent {
            return Err(DevboxError::CaAlreadyExists(self.dir().to_path_buf()));
        }

        files::create_private_dir(self.dir())?;

        let mut key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .map_err(|e| DevboxError::ssh_key(format!("CA key generation failed: {}", e)))?;
        key.set_comment(ca_comment());

        let private_pem = key.to_openssh(LineEnding::LF)?;
        let public_line = key.public_key().to_openssh()?;

        // No-clobber writes: a concurrent `init` loses instead of overwriting.
        if !files::write_new(&self.private_key_path, private_pem.as_bytes(), PRIVATE_FILE_MODE)? {
            return Err(DevboxError::CaAlreadyExists(self.dir().to_path_buf()));
        }

        // The pair is created together or not at all.
        let public_written = files::write_new(
            &self.public_key_path,
            format!("{}\n", public_line).as_bytes(),
            PUBLIC_FILE_MODE,
        );
        if !matches!(public_written, Ok(true)) {
            if let Err(e) = fs::remove_file(&self.private_key_path) {
                warn!(
                    "Failed to remove {} after incomplete CA generation: {}",
                    self.private_key_path.display(),
                    e
                );
            }
            return match public_written {
                Err(e) => Err(e),
                _ => Err(DevboxError::CaAlreadyExists(self.dir().to_path_buf())),
            };
        }

        info!(
            "Generated SSH certificate authority {} in {}",
            key.public_key().fingerprint(HashAlg::Sha256),
            self.dir().display()
        );

        Ok(public_line)
    }

    /// Fail with the right "not ready" error unless both key files exist
    pub fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            CaState::Ready => Ok(()),
            CaState::Absent => Err(DevboxError::CaNotFound(self.dir().to_path_buf())),
            CaState::Partial { missing } => Err(DevboxError::PartialCa { missing }),
        }
    }

    /// The CA public key as a single OpenSSH line, without trailing newline
    pub fn public_key(&self) -> Result<String> {
        Ok(self.read_public_key()?.to_openssh()?)
    }

    /// SHA-256 fingerprint of the CA public key
    pub fn fingerprint(&self) -> Result<String> {
        Ok(self
            .read_public_key()?
            .fingerprint(HashAlg::Sha256)
            .to_string())
    }

    fn read_public_key(&self) -> Result<PublicKey> {
        self.ensure_ready()?;
        let line = fs::read_to_string(&self.public_key_path)?;
        PublicKey::from_openssh(line.trim()).map_err(|e| {
            DevboxError::ssh_key(format!(
                "failed to parse CA public key {}: {}",
                self.public_key_path.display(),
                e
            ))
        })
    }

    /// Load the signing key, checking it against the public key file
    fn load_signing_key(&self) -> Result<PrivateKey> {
        let public = self.read_public_key()?;

        let pem = fs::read_to_string(&self.private_key_path)?;
        let key = PrivateKey::from_openssh(pem.as_bytes()).map_err(|e| {
            DevboxError::ssh_key(format!(
                "failed to parse CA private key {}: {}",
                self.private_key_path.display(),
                e
            ))
        })?;

        if key.is_encrypted() {
            return Err(DevboxError::ssh_key(format!(
                "CA private key {} is passphrase-protected, which is not supported",
                self.private_key_path.display()
            )));
        }

        if key.public_key().key_data() != public.key_data() {
            return Err(DevboxError::CaMismatch(self.public_key_path.clone()));
        }

        Ok(key)
    }

    /// Sign `host_key` as a host certificate described by `request`
    ///
    /// Purely in-memory; the CA key is only read, so concurrent callers are
    /// safe.
    pub fn certify(&self, host_key: &PublicKey, request: &HostCertRequest) -> Result<Certificate> {
        let ca_key = self.load_signing_key()?;

        let mut builder = certificate::Builder::new_with_random_nonce(
            &mut OsRng,
            host_key.key_data().clone(),
            request.valid_after(),
            request.valid_before(),
        )
        .map_err(|e| DevboxError::signing(e.to_string()))?;

        builder
            .serial(OsRng.next_u64())
            .and_then(|b| b.key_id(request.key_id()))
            .and_then(|b| b.cert_type(CertType::Host))
            .and_then(|b| b.comment(request.key_id()))
            .map_err(|e| DevboxError::signing(e.to_string()))?;

        for principal in request.principals() {
            builder
                .valid_principal(principal.as_str())
                .map_err(|e| DevboxError::signing(e.to_string()))?;
        }

        let cert = builder
            .sign(&ca_key)
            .map_err(|e| DevboxError::signing(e.to_string()))?;

        debug!(
            "Signed host certificate {} for principals {:?}",
            request.key_id(),
            request.principals()
        );

        Ok(cert)
    }

    /// Sign the host public key at `host_key_path`
    ///
    /// `host_key_path` may name the private key (`X`, public key read from
    /// `X.pub`) or the public key (`X.pub`). The certificate is written to
    /// `X-cert.pub`, the name OpenSSH expects. Returns the certificate path.
    pub fn sign_host_key(
        &self,
        host_key_path: &Path,
        identity: &str,
        remote_host_address: &str,
    ) -> Result<PathBuf> {
        // Checked before touching the host key so a missing CA never leaves
        // anything behind.
        self.ensure_ready()?;

        let remote: RemoteHost = remote_host_address.parse()?;
        let request = HostCertRequest::for_container(identity, &remote)?;

        let (public_path, cert_path) = host_key_paths(host_key_path);
        let public_line = fs::read_to_string(&public_path)?;
        let host_key = PublicKey::from_openssh(public_line.trim()).map_err(|e| {
            DevboxError::ssh_key(format!(
                "failed to parse host public key {}: {}",
                public_path.display(),
                e
            ))
        })?;

        let cert = self.certify(&host_key, &request)?;
        let encoded = cert.to_openssh()?;
        files::write_atomic(
            &cert_path,
            format!("{}\n", encoded).as_bytes(),
            Some(PUBLIC_FILE_MODE),
        )?;

        info!(
            "Issued host certificate {} for {} ({})",
            cert_path.display(),
            identity,
            remote
        );

        Ok(cert_path)
    }
}

/// `(public key path, certificate path)` for a host key path
pub fn host_key_paths(host_key_path: &Path) -> (PathBuf, PathBuf) {
    let raw = host_key_path.as_os_str().to_string_lossy();
    let stem = raw.strip_suffix(".pub").unwrap_or(&raw);
    (
        PathBuf::from(format!("{}.pub", stem)),
        PathBuf::from(format!("{}-cert.pub", stem)),
    )
}

/// Comment stored on the CA public key
fn ca_comment() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("devbox-ca@{}", host)
}
