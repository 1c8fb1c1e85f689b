//! Error types for devbox-ssh

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the SSH trust subsystem
#[derive(Debug, Error)]
pub enum DevboxError {
    /// Signing or key lookup attempted before `init` created a CA
    #[error("SSH certificate authority not found in {0}")]
    CaNotFound(PathBuf),

    /// `init` attempted while CA key material is already present
    #[error("SSH certificate authority already exists at {0}")]
    CaAlreadyExists(PathBuf),

    /// Only one half of the CA keypair is on disk
    #[error("SSH certificate authority is incomplete: missing {missing}")]
    PartialCa {
        /// The key file that is missing
        missing: PathBuf,
    },

    /// The CA public key file does not belong to the CA private key
    #[error("CA public key {0} does not match the CA private key")]
    CaMismatch(PathBuf),

    /// Certificate signing failed
    #[error("Signing failed: {0}")]
    Signing(String),

    /// SSH key parsing or encoding error
    #[error("SSH key error: {0}")]
    SshKey(String),

    /// known_hosts update failed
    #[error("Trust store error: {0}")]
    TrustStore(String),

    /// Existing SSH config cannot be split into blocks safely
    #[error("Malformed SSH config {path}: {reason}")]
    ConfigMalformed {
        /// The config file that failed to parse
        path: PathBuf,
        /// Why the block boundaries are ambiguous
        reason: String,
    },

    /// Invalid parameters provided
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Host identity generation timed out
    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    /// Host identity generation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// The container boot collaborator rejected the host identity
    #[error("Host identity installation failed: {0}")]
    Install(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using DevboxError
pub type Result<T> = std::result::Result<T, DevboxError>;

impl DevboxError {
    /// Create a signing error from a string
    pub fn signing(msg: impl Into<String>) -> Self {
        DevboxError::Signing(msg.into())
    }

    /// Create an SSH key error from a string
    pub fn ssh_key(msg: impl Into<String>) -> Self {
        DevboxError::SshKey(msg.into())
    }

    /// Create a trust store error from a string
    pub fn trust_store(msg: impl Into<String>) -> Self {
        DevboxError::TrustStore(msg.into())
    }

    /// Create a malformed config error
    pub fn config_malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        DevboxError::ConfigMalformed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid params error from a string
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        DevboxError::InvalidParams(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        DevboxError::Config(msg.into())
    }

    /// Create an installer error from a string
    pub fn install(msg: impl Into<String>) -> Self {
        DevboxError::Install(msg.into())
    }

    /// Whether this error means the CA still has to be created with `init`
    pub fn needs_init(&self) -> bool {
        matches!(
            self,
            DevboxError::CaNotFound(_) | DevboxError::PartialCa { .. }
        )
    }

    /// Actionable guidance for the CLI to print below the error
    pub fn hint(&self) -> Option<String> {
        match self {
            DevboxError::CaNotFound(_) => {
                Some("run `devbox-ssh init` to generate the certificate authority".to_string())
            }
            DevboxError::PartialCa { missing } => Some(format!(
                "restore {} from backup, or delete the CA directory and run `devbox-ssh init` \
                 (existing containers must then be re-provisioned)",
                missing.display()
            )),
            DevboxError::CaAlreadyExists(path) => Some(format!(
                "the existing CA at {} is kept; delete it manually to rotate \
                 (this invalidates every issued host certificate)",
                path.display()
            )),
            DevboxError::CaMismatch(_) => Some(
                "the CA key files were modified; regenerate the CA and re-provision containers"
                    .to_string(),
            ),
            DevboxError::ConfigMalformed { path, .. } => Some(format!(
                "fix the Host blocks in {} by hand; nothing was changed",
                path.display()
            )),
            _ => None,
        }
    }
}

impl From<ssh_key::Error> for DevboxError {
    fn from(err: ssh_key::Error) -> Self {
        DevboxError::SshKey(err.to_string())
    }
}
